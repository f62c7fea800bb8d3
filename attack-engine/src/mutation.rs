//! Request mutations for the injection sweeps.
//!
//! Query mutations work on decoded parameters and re-encode them sorted by
//! key. Body mutations work on the raw text: the body is split on every `=`
//! and the payload is spliced in after the value that follows fragment `i`.
//! Splitting on `=` is naive on purpose. Values that themselves contain `=`
//! shift the fragment boundaries and the reported fragment names with them.

use std::collections::BTreeMap;
use url::form_urlencoded;

/// Query parameters grouped by key, keys sorted.
pub type QueryParams = BTreeMap<String, Vec<String>>;

/// Decode a raw query string. Malformed escapes are passed through as-is.
pub fn parse_query(raw: &str) -> QueryParams {
    let mut params = QueryParams::new();
    for (key, value) in form_urlencoded::parse(raw.as_bytes()).into_owned() {
        params.entry(key).or_default().push(value);
    }
    params
}

/// Encode `params` with `key` replaced by a single value: its first value
/// with `payload` appended. Every other key keeps its original values.
pub fn mutate_query(params: &QueryParams, key: &str, payload: &str) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, values) in params {
        if name == key {
            let first = values.first().map(String::as_str).unwrap_or("");
            serializer.append_pair(name, &format!("{}{}", first, payload));
        } else {
            for value in values {
                serializer.append_pair(name, value);
            }
        }
    }
    serializer.finish()
}

/// Split a body on `=`.
pub fn body_fragments(body: &str) -> Vec<&str> {
    body.split('=').collect()
}

/// Rebuild the body with `payload` injected after fragment `index`.
///
/// The fragment after `index` is split once on `&`; the payload goes between
/// its value part and the remainder. Requires `index + 1 < fragments.len()`.
pub fn mutate_body(fragments: &[&str], index: usize, payload: &str) -> String {
    let mut body = fragments[..=index].join("=");
    body.push('=');

    let mut divided = fragments[index + 1].splitn(2, '&');
    body.push_str(divided.next().unwrap_or(""));
    body.push_str(payload);
    if let Some(rest) = divided.next() {
        body.push('&');
        body.push_str(rest);
    }

    for fragment in &fragments[index + 2..] {
        body.push('=');
        body.push_str(fragment);
    }
    body
}

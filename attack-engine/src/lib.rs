//! Attack Engine - request replay and command-injection scanning
//!
//! This crate replays captured requests against their origin and sweeps
//! shell-injection payloads through their query parameters and bodies.

pub mod error;
pub mod mutation;
pub mod payload;
pub mod replayer;
pub mod scanner;

pub use error::{AttackError, AttackResult};
pub use payload::{MARKER, PAYLOADS};
pub use replayer::{ReplayConfig, ReplayResponse, Replayer, RequestSender};
pub use scanner::{ScanResult, ScanStatus, VulnerabilityScanner};

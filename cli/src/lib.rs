//! Library half of `autonomicd`, split out from the binary so `runtime` wiring is
//! reachable from integration tests without spawning the process.

pub mod log_format;
pub mod logging;
pub mod runtime;

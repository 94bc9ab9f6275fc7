//! Timestamp and identifier helpers.

use ulid::Ulid;

/// Current wall time as whole unix-epoch seconds, suffixed with `Z`
/// (`"1754102400Z"` style). Coarse but totally ordered and stable across
/// platforms, which is all the event log needs.
pub fn now_epoch_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

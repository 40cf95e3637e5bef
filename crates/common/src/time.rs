use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional seconds since the Unix epoch.
///
/// All deadlines and value timestamps in the tree are absolute epoch seconds,
/// so every component derives its remaining budget from `deadline - now_ts()`.
pub fn now_ts() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        // Clock before 1970; report zero rather than panic.
        Err(_) => 0.0,
    }
}

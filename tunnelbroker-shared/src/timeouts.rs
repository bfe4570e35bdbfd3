//! Timeout and threshold constants, with validation that their
//! relationships stay sane as the defaults are tuned.

use std::time::Duration;

/// How long a Tunnel waits, after writing `CONN_ID`, for the agent to open
/// the matching data connection before cancelling the pairing slot.
///
/// Spec boundary: a data socket that arrives exactly at this deadline is
/// accepted (`<=`, not `<`) — see [`crate::protocol`] callers.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default age beyond which a session still marked `active` at broker
/// startup is considered stale and swept to `inactive` before restoration
/// runs. Operators may override this (it is exposed as a CLI/env knob by
/// the binary); this is only the default.
pub const STALE_SESSION_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_timeout_is_ten_seconds() {
        assert_eq!(PAIRING_TIMEOUT, Duration::from_secs(10));
    }

    #[test]
    fn stale_threshold_is_five_minutes() {
        assert_eq!(STALE_SESSION_THRESHOLD, Duration::from_secs(300));
    }
}

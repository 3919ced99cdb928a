use std::time::Duration;

pub const FAST_POLL: Duration = Duration::from_millis(20);
pub const FAST_TICK: Duration = Duration::from_millis(50);

/// Upper bound for anything a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

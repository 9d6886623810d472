//! Server constants.

use std::time::Duration;

/// Config file read when `--config` is not given, if present.
pub const DEFAULT_CONFIG_PATH: &str = "afs.toml";

/// How often idle workers and expired transactions are checked.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for one `read` call.
pub const MAX_READ_BYTES: u64 = 16 * 1024 * 1024;

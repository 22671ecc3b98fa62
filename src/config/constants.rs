// Protocol-wide constants
//
// Centralised here so thresholds shared by peers have one source of truth.
// Import via `use crate::config::constants::*;`.

/// A peer is online while its last heartbeat is younger than this.
pub const ONLINE_THRESHOLD_SECS: i64 = 120;

/// How often each device upserts its heartbeat record.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default lease for a relay-held leader lock.
pub const LOCK_LEASE_SECS: i64 = 60;

/// Failures a task may accumulate before it is terminally failed.
pub const MAX_TASK_RETRIES: u32 = 3;

/// Time-to-live applied to outgoing messages sent without an explicit TTL.
pub const DEFAULT_MESSAGE_TTL_SECS: i64 = 300;

/// How long terminal tasks and messages are kept before purging.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Directory under $HOME holding identity and config.
pub const DATA_DIR_NAME: &str = ".devicemesh";

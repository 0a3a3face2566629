/// Process-unique, monotonically increasing hook execution id.
pub type HookId = u64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

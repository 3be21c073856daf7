pub const DIAGNOSTICS_FILE_NAME: &str = "diagnostics.log";
pub const CANCELLED_MSG: &str = "cancelled";
pub const ARTIFACT_CHUNK_SIZE: usize = 64 * 1024;
pub const QUEUE_TX_ERR: &str = "Failed to send job id to queue_tx";

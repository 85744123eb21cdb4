//! Identifier aliases shared across the crate.

use uuid::Uuid;

/// Identifier of the job (memo) whose files are analysed.
pub type JobId = i64;
/// Identifier of the user who triggered a job.
pub type ActorId = i64;
/// Identifier of one analysis run.
pub type RunId = Uuid;

/// Origin tag for files attached to memos.
pub const FILE_FROM_MEMO: &str = "MEMO";

/// Shortened UUID for log fields.
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

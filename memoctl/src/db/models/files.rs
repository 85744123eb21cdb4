//! Database models for the file catalog.

use crate::types::{ActorId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Database request for registering a file
#[derive(Debug, Clone)]
pub struct FileCreateDBRequest {
    pub file_from: String,
    pub job_id: JobId,
    pub file_name: String,
    pub remote_id: Option<String>,
    pub created_by: ActorId,
}

/// Database request for updating a file
#[derive(Debug, Clone, Default)]
pub struct FileUpdateDBRequest {
    pub remote_id: Option<String>,
}

/// Database response for a catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDBResponse {
    pub id: Uuid,
    pub file_from: String,
    pub job_id: JobId,
    /// Stored name relative to the source directory
    pub file_name: String,
    /// Identifier in blob storage, once uploaded
    pub remote_id: Option<String>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
}

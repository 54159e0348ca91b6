use crate::types::BackupId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A backup artifact previously produced for this datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub id: BackupId,
    /// Object-storage URL of the artifact.
    #[serde(alias = "storage_location")]
    pub location: String,
    pub checksum: String,
}

/// Per-request caller identity forwarded to the backup tool.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub auth_token: String,
    pub project_id: String,
}

impl RequestContext {
    pub fn new(auth_token: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            project_id: project_id.into(),
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("auth_token", &"***")
            .field("project_id", &self.project_id)
            .finish()
    }
}

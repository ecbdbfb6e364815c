//! JSON bodies exchanged between the orchestrator and the stage services.

use crate::core::model::{ImageHash, ModifiedImage, SourceImage, StageState};
use serde::{Deserialize, Serialize};

/// `GET /<stage>/health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
}

impl Health {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// `POST /load/next`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadNext {
    pub limit: usize,
}

/// `POST /modify/next`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyNext {
    pub image: SourceImage,
    pub limit: usize,
}

/// `POST /hash/next`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashNext {
    pub modified_image: ModifiedImage,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Images {
    pub images: Vec<SourceImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifiedImages {
    pub modified_images: Vec<ModifiedImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hashes {
    pub hashes: Vec<ImageHash>,
}

/// `POST /admin/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: StageState,
    /// Hashes relayed plus match rows persisted so far
    pub processed: u64,
    /// Message of the failure that ended the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error body returned by every service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable code, e.g. `bad_request`
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn next_request_carries_parent_record() {
        let body = ModifyNext {
            image: SourceImage {
                id: 4,
                path: PathBuf::from("/in/a/x.png"),
                owner_id: 1,
            },
            limit: 10,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["image"]["id"], 4);
        assert_eq!(json["limit"], 10);
    }

    #[test]
    fn run_status_omits_missing_error() {
        let status = RunStatus {
            state: StageState::Done,
            processed: 3,
            error: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"state":"done","processed":3}"#);
    }

    #[test]
    fn health_requires_ok() {
        let health: Health = serde_json::from_str(r#"{"status":"starting"}"#).unwrap();
        assert!(!health.is_ok());
        assert!(Health::ok().is_ok());
    }
}

use serde::{Deserialize, Serialize};

/// Lifecycle status of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive fields attached when an upload is finalized.
///
/// Not part of the content hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

/// Progress snapshot for an upload, measured in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: String,
    pub status: SessionStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub completed_chunks: u32,
    pub total_chunks: u32,
}

impl UploadProgress {
    /// Returns the upload progress as a percentage (0-100).
    ///
    /// An empty file is complete by definition.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(total: u64, transferred: u64) -> UploadProgress {
        UploadProgress {
            upload_id: "u1".into(),
            status: SessionStatus::Uploading,
            total_bytes: total,
            transferred_bytes: transferred,
            completed_chunks: 0,
            total_chunks: 0,
        }
    }

    #[test]
    fn session_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Uploading).unwrap(),
            "\"uploading\""
        );
        let s: SessionStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(s, SessionStatus::Failed);
        assert_eq!(SessionStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn metadata_omit_empty() {
        let json = serde_json::to_string(&UploadMetadata::default()).unwrap();
        assert_eq!(json, "{}");

        let parsed: UploadMetadata =
            serde_json::from_str(r#"{"title":"Vol. 1","tags":["a","b"]}"#).unwrap();
        assert_eq!(parsed.title, "Vol. 1");
        assert_eq!(parsed.tags.len(), 2);
        assert!(parsed.category.is_empty());
    }

    #[test]
    fn upload_progress_percentage() {
        assert!((progress(1000, 500).percentage() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn upload_progress_percentage_zero_total() {
        assert!((progress(0, 0).percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn upload_progress_percentage_clamped() {
        assert!((progress(100, 250).percentage() - 100.0).abs() < f64::EPSILON);
    }
}

//! Local advisory record of unfinished uploads.
//!
//! One JSON file per upload id remembers what was being uploaded so a
//! restarted client can resume without re-hashing the source. The record
//! is only a hint: the server's status always wins, and every failure to
//! read or write it is logged and ignored.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use chunkdrop_transfer::validate_upload_id;

/// What the client remembers about one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorEntry {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_hash: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub source_path: PathBuf,
    /// Last completed set seen from the server.
    #[serde(default)]
    pub completed_hint: Vec<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Directory of [`MirrorEntry`] files named `<uploadId>.json`.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    dir: PathBuf,
}

impl LocalMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.config/chunkdrop/uploads` (or the platform equivalent).
    pub fn default_dir() -> Option<PathBuf> {
        config_dir().map(|d| d.join("chunkdrop").join("uploads"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, upload_id: &str) -> Option<PathBuf> {
        validate_upload_id(upload_id).ok()?;
        Some(self.dir.join(format!("{upload_id}.json")))
    }

    /// Reads the entry for `upload_id`, if there is a readable one.
    pub fn load(&self, upload_id: &str) -> Option<MirrorEntry> {
        let path = self.entry_path(upload_id)?;
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read upload mirror");
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt upload mirror");
                None
            }
        }
    }

    /// Writes `entry`, replacing any previous one.
    pub fn save(&self, entry: &MirrorEntry) {
        if let Err(e) = self.try_save(entry) {
            warn!(upload_id = %entry.upload_id, error = %e, "cannot write upload mirror");
        }
    }

    fn try_save(&self, entry: &MirrorEntry) -> std::io::Result<()> {
        let path = self
            .entry_path(&entry.upload_id)
            .ok_or_else(|| std::io::Error::other("invalid upload id"))?;
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(entry)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(upload_id = %entry.upload_id, "upload mirror saved");
        Ok(())
    }

    /// Records the latest completed set seen for `upload_id`.
    pub fn update_hint(&self, upload_id: &str, completed: &[u32]) {
        if let Some(mut entry) = self.load(upload_id) {
            entry.completed_hint = completed.to_vec();
            entry.updated_at = Utc::now();
            self.save(&entry);
        }
    }

    /// Forgets `upload_id`.
    pub fn remove(&self, upload_id: &str) {
        let Some(path) = self.entry_path(upload_id) else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(upload_id, "upload mirror removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(upload_id, error = %e, "cannot remove upload mirror"),
        }
    }

    /// All readable entries.
    pub fn entries(&self) -> Vec<MirrorEntry> {
        let dir = match std::fs::read_dir(&self.dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot list upload mirror");
                return Vec::new();
            }
        };
        dir.filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                let id = name.strip_suffix(".json")?;
                self.load(id)
            })
            .collect()
    }

    /// Most recent unfinished upload of `source_path` with `file_size` bytes.
    pub fn find_resumable(&self, source_path: &Path, file_size: u64) -> Option<MirrorEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.source_path == source_path && e.file_size == file_size)
            .max_by_key(|e| e.updated_at)
    }
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

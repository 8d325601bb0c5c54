//! Session metadata files and discovery
//!
//! The creator of a session writes `cfa_<name>.meta` (JSON) next to the region
//! file in `/dev/shm`. Discovery scans those files and skips sessions whose
//! creator process is gone.

use crate::error::{PipelineError, PipelineResult};
use crate::platform::is_process_alive;
use cfa_common::shm::consts::{METADATA_SUFFIX, SEGMENT_PREFIX, SHM_DIR};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Session metadata information
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Session name
    pub name: String,
    /// Ring capacity in records
    pub capacity: u32,
    /// Creator process ID
    pub creator_pid: u32,
    /// Baseline generation at the last update
    pub generation: u32,
    /// Creation timestamp
    pub created_at: SystemTime,
}

impl SessionInfo {
    /// Metadata for a session created now.
    pub fn new(name: &str, capacity: u32, creator_pid: u32, generation: u32) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            creator_pid,
            generation,
            created_at: SystemTime::now(),
        }
    }
}

/// Path of the region file for session `name`.
pub fn segment_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(format!("{SEGMENT_PREFIX}{name}"))
}

/// Path of the metadata file for session `name`.
pub fn metadata_path(name: &str) -> PathBuf {
    metadata_path_in(Path::new(SHM_DIR), name)
}

fn metadata_path_in(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{name}{METADATA_SUFFIX}"))
}

/// Write (or overwrite) the metadata file for `info.name`.
pub fn write_metadata(info: &SessionInfo) -> PipelineResult<()> {
    write_metadata_in(Path::new(SHM_DIR), info)
}

/// `write_metadata` against an arbitrary directory.
pub fn write_metadata_in(dir: &Path, info: &SessionInfo) -> PipelineResult<()> {
    let json = serde_json::to_string_pretty(info)?;
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(metadata_path_in(dir, &info.name))?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Read the metadata file for session `name`.
pub fn read_metadata(name: &str) -> PipelineResult<SessionInfo> {
    read_metadata_in(Path::new(SHM_DIR), name)
}

/// `read_metadata` against an arbitrary directory.
pub fn read_metadata_in(dir: &Path, name: &str) -> PipelineResult<SessionInfo> {
    let content = std::fs::read_to_string(metadata_path_in(dir, name)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::NotFound {
                name: name.to_string(),
            }
        } else {
            PipelineError::Io { source: e }
        }
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Remove the metadata file for session `name`, if any.
pub fn remove_metadata(name: &str) {
    let _ = std::fs::remove_file(metadata_path(name));
}

/// Sessions whose creator is still alive, newest first.
pub fn list_sessions() -> PipelineResult<Vec<SessionInfo>> {
    list_sessions_in(Path::new(SHM_DIR))
}

/// `list_sessions` against an arbitrary directory.
pub fn list_sessions_in(dir: &Path) -> PipelineResult<Vec<SessionInfo>> {
    let mut sessions = Vec::new();
    if !dir.exists() {
        return Ok(sessions);
    }

    for entry in std::fs::read_dir(dir)?.flatten() {
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(name) = file_name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(METADATA_SUFFIX))
        else {
            continue;
        };

        // Unreadable or foreign files are not sessions.
        let Ok(info) = read_metadata_in(dir, name) else {
            continue;
        };
        if is_process_alive(info.creator_pid) {
            sessions.push(info);
        }
    }

    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(sessions)
}

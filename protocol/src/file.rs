//! Monitoring-file descriptors and their processing lifecycle.

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Processing state of a monitoring file.
///
/// Transitions are monotonic: `Discovered → Queued → Processing →
/// {Indexed, Failed}`. A file never moves backward, and `Indexed`
/// files are never deleted (append-only provenance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileState {
    Discovered,
    Queued,
    Processing,
    Indexed,
    Failed,
}

impl FileState {
    /// Whether this state is terminal (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Indexed | FileState::Failed)
    }

    /// Position in the lifecycle, used to enforce monotonic transitions.
    pub fn rank(self) -> u8 {
        match self {
            FileState::Discovered => 0,
            FileState::Queued => 1,
            FileState::Processing => 2,
            FileState::Indexed | FileState::Failed => 3,
        }
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// Forward-only, and terminal states accept nothing. Re-asserting
    /// the current state is allowed (idempotent writes).
    pub fn can_transition_to(self, next: FileState) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Parse the snake_case form produced by `Display`.
    pub fn parse(s: &str) -> Option<FileState> {
        match s {
            "discovered" => Some(FileState::Discovered),
            "queued" => Some(FileState::Queued),
            "processing" => Some(FileState::Processing),
            "indexed" => Some(FileState::Indexed),
            "failed" => Some(FileState::Failed),
            _ => None,
        }
    }
}

/// A discovered nanoDQMIO file, tracked through the pipeline.
///
/// Identity is the content hash, not the path, so renames and
/// retransfers of the same bytes dedupe to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringFile {
    /// Row id in the index store; assigned at discovery.
    pub id: i64,
    pub path: String,
    /// Lowercase hex sha256 of the file contents.
    pub content_hash: String,
    pub run_number: u32,
    pub size_bytes: u64,
    /// RFC3339 discovery timestamp.
    pub discovered_at: String,
    pub state: FileState,
    /// Last error message, set when `state` is `Failed`.
    pub last_error: Option<String>,
}

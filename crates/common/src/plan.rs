//! Plan wire types and checksum calculation.
//!
//! A plan is a declarative bundle of files, one-time instructions, periodic
//! instructions, and probes, delivered as UTF-8 JSON. Unknown top-level keys
//! are ignored; malformed JSON fails the decode. The checksum that gates
//! re-application is computed over the *exact raw bytes* the plan was decoded
//! from, never over a re-serialisation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::probe::Probe;

/// Default period for periodic instructions that do not set one.
pub const DEFAULT_PERIOD_SECONDS: i64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("file entry {path:?} has unknown action {action:?}")]
    UnknownFileAction { path: String, action: String },
}

// ════════════════════════════════════════════════════════════════════════════
// CHECKSUM
// ════════════════════════════════════════════════════════════════════════════

/// Lowercase hex SHA-256 of `input`. Pure function of the bytes.
pub fn checksum(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

// ════════════════════════════════════════════════════════════════════════════
// PLAN
// ════════════════════════════════════════════════════════════════════════════

/// The desired state delivered by a plan source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,
    /// One-time instructions, run once per successful application of a
    /// plan checksum.
    #[serde(default, rename = "instructions", skip_serializing_if = "Vec::is_empty")]
    pub one_time_instructions: Vec<OneTimeInstruction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probes: BTreeMap<String, Probe>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub periodic_instructions: Vec<PeriodicInstruction>,
}

/// A plan paired with the checksum of the raw bytes it was decoded from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalculatedPlan {
    pub plan: Plan,
    pub checksum: String,
}

impl CalculatedPlan {
    /// Decode `raw` as a plan and record the checksum of `raw` itself.
    pub fn from_raw(raw: &[u8]) -> Result<Self, PlanError> {
        let plan: Plan = serde_json::from_slice(raw)?;
        Ok(CalculatedPlan {
            plan,
            checksum: checksum(raw),
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FILES
// ════════════════════════════════════════════════════════════════════════════

/// What a [`File`] entry asks the applier to do.
///
/// The wire encoding carries `content`, `directory` and `action` fields; they
/// collapse to this tagged union on decode. `action: "delete"` wins over the
/// other two, `directory: true` selects a directory, anything else is a file
/// create with base64 content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    /// Write a file whose content is the base64-decoded `content` field.
    CreateFile { content: String },
    /// Ensure a directory exists.
    CreateDirectory,
    /// Remove the path recursively; a missing path is not an error.
    Delete,
}

/// A single file-system entry in a plan.
///
/// `uid`/`gid` default to 0 (owned by root); negative values mean "do not
/// change ownership". `permissions` is an octal string; empty selects the
/// per-action default (0600 for files, 0755 for directories).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFile", into = "RawFile")]
pub struct File {
    pub path: String,
    pub permissions: String,
    pub uid: i32,
    pub gid: i32,
    pub action: FileAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawFile {
    #[serde(skip_serializing_if = "String::is_empty")]
    content: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    directory: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    action: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    permissions: String,
    uid: i32,
    gid: i32,
}

impl TryFrom<RawFile> for File {
    type Error = PlanError;

    fn try_from(raw: RawFile) -> Result<Self, Self::Error> {
        let action = match raw.action.as_str() {
            "delete" => FileAction::Delete,
            "" => {
                if raw.directory {
                    FileAction::CreateDirectory
                } else {
                    FileAction::CreateFile {
                        content: raw.content,
                    }
                }
            }
            other => {
                return Err(PlanError::UnknownFileAction {
                    path: raw.path,
                    action: other.to_string(),
                })
            }
        };
        Ok(File {
            path: raw.path,
            permissions: raw.permissions,
            uid: raw.uid,
            gid: raw.gid,
            action,
        })
    }
}

impl From<File> for RawFile {
    fn from(file: File) -> Self {
        let mut raw = RawFile {
            path: file.path,
            permissions: file.permissions,
            uid: file.uid,
            gid: file.gid,
            ..RawFile::default()
        };
        match file.action {
            FileAction::CreateFile { content } => raw.content = content,
            FileAction::CreateDirectory => raw.directory = true,
            FileAction::Delete => raw.action = "delete".to_string(),
        }
        raw
    }
}

// ════════════════════════════════════════════════════════════════════════════
// INSTRUCTIONS
// ════════════════════════════════════════════════════════════════════════════

/// Fields shared by one-time and periodic instructions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommonInstruction {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// OCI reference staged into the execution directory. Empty means the
    /// execution directory is created empty.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Command to run; empty defaults to `<execution dir>/run.sh`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeInstruction {
    #[serde(flatten)]
    pub common: CommonInstruction,
    #[serde(default)]
    pub save_output: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicInstruction {
    #[serde(flatten)]
    pub common: CommonInstruction,
    /// Minimum wall-clock gap between runs, seconds. Values below 1 are
    /// treated as 1.
    #[serde(default = "default_period_seconds")]
    pub period_seconds: i64,
    #[serde(default)]
    pub save_stderr_output: bool,
}

impl PeriodicInstruction {
    pub fn effective_period_seconds(&self) -> i64 {
        self.period_seconds.max(1)
    }
}

fn default_period_seconds() -> i64 {
    DEFAULT_PERIOD_SECONDS
}

impl Default for PeriodicInstruction {
    fn default() -> Self {
        PeriodicInstruction {
            common: CommonInstruction::default(),
            period_seconds: DEFAULT_PERIOD_SECONDS,
            save_stderr_output: false,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

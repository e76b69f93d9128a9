use crate::error::{Result, ZenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub type FieldMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// SyncDirection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Pull,
    Push,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = ZenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pull" => Ok(SyncDirection::Pull),
            "push" => Ok(SyncDirection::Push),
            "bidirectional" | "both" => Ok(SyncDirection::Bidirectional),
            _ => Err(ZenError::invalid_data(format!(
                "invalid sync direction '{s}': expected pull, push or bidirectional"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ConflictStrategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    ManualReview,
    Timestamp,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::LocalWins => "local_wins",
            ConflictStrategy::RemoteWins => "remote_wins",
            ConflictStrategy::ManualReview => "manual_review",
            ConflictStrategy::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = ZenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local_wins" => Ok(ConflictStrategy::LocalWins),
            "remote_wins" => Ok(ConflictStrategy::RemoteWins),
            "manual_review" => Ok(ConflictStrategy::ManualReview),
            "timestamp" => Ok(ConflictStrategy::Timestamp),
            _ => Err(ZenError::invalid_data(format!(
                "invalid conflict strategy '{s}': expected local_wins, remote_wins, manual_review or timestamp"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Active,
    Paused,
    Error,
    Conflict,
    Disabled,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Active => "active",
            SyncStatus::Paused => "paused",
            SyncStatus::Error => "error",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SyncRecord
// ---------------------------------------------------------------------------

/// Persisted link between a local task and its external counterpart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRecord {
    pub task_id: String,
    #[serde(default)]
    pub external_id: String,
    pub external_system: String,
    pub sync_direction: SyncDirection,
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
    pub conflict_strategy: ConflictStrategy,
    pub status: SyncStatus,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data_hash: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SyncRecord {
    pub fn new(
        task_id: impl Into<String>,
        external_id: impl Into<String>,
        external_system: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            external_id: external_id.into(),
            external_system: external_system.into(),
            sync_direction: SyncDirection::Bidirectional,
            field_mappings: BTreeMap::new(),
            conflict_strategy: ConflictStrategy::Timestamp,
            status: SyncStatus::Active,
            last_sync_time: None,
            created_at: now,
            updated_at: now,
            version: 1,
            error_count: 0,
            last_error: None,
            retry_after: None,
            data_hash: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Bump `version` and `updated_at`. Every mutation goes through here.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_success(&mut self, data_hash: Option<String>) {
        let now = Utc::now();
        self.last_sync_time = Some(now);
        self.error_count = 0;
        self.last_error = None;
        self.retry_after = None;
        self.status = SyncStatus::Active;
        if data_hash.is_some() {
            self.data_hash = data_hash;
        }
        self.touch();
    }

    pub fn mark_failure(&mut self, error: &str, retry_after: DateTime<Utc>) {
        self.error_count += 1;
        self.last_error = Some(if error.is_empty() {
            "unknown error".to_string()
        } else {
            error.to_string()
        });
        self.status = SyncStatus::Error;
        self.retry_after = Some(retry_after);
        self.touch();
    }

    pub fn mark_conflict(&mut self) {
        self.status = SyncStatus::Conflict;
        self.touch();
    }
}

// ---------------------------------------------------------------------------
// Task payloads
// ---------------------------------------------------------------------------

/// A task as reported by an external system. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExternalTaskData {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: FieldMap,
}

/// Fields compared and copied between local and external representations.
pub const SYNC_FIELDS: &[&str] = &["title", "description", "status", "priority", "owner", "team"];

pub const DEFAULT_STATUS: &str = "not_started";
pub const DEFAULT_PRIORITY: &str = "P2";

/// A task in the internal, normalized schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InternalTaskData {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Normalized lowercase token (`not_started`, `in_progress`, ...).
    pub status: String,
    /// Normalized `P0`..`P3`.
    pub priority: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub team: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl InternalTaskData {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: DEFAULT_STATUS.to_string(),
            priority: DEFAULT_PRIORITY.to_string(),
            owner: String::new(),
            team: String::new(),
            created: now,
            updated: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Give unreported status and priority their defaults. Applied when a
    /// task is first created from an external one.
    pub fn fill_defaults(&mut self) {
        if self.status.is_empty() {
            self.status = DEFAULT_STATUS.to_string();
        }
        if self.priority.is_empty() {
            self.priority = DEFAULT_PRIORITY.to_string();
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "title" => Some(&self.title),
            "description" => Some(&self.description),
            "status" => Some(&self.status),
            "priority" => Some(&self.priority),
            "owner" => Some(&self.owner),
            "team" => Some(&self.team),
            _ => None,
        }
    }

    /// Set one of [`SYNC_FIELDS`]. Returns false for unknown names.
    pub fn set_field(&mut self, name: &str, value: &str) -> bool {
        let slot = match name {
            "title" => &mut self.title,
            "description" => &mut self.description,
            "status" => &mut self.status,
            "priority" => &mut self.priority,
            "owner" => &mut self.owner,
            "team" => &mut self.team,
            _ => return false,
        };
        *slot = value.to_string();
        true
    }

    /// SHA-256 over the synchronized fields. Timestamps and metadata are
    /// excluded so a re-fetch of unchanged content hashes identically.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for name in SYNC_FIELDS {
            hasher.update(name.as_bytes());
            hasher.update([0]);
            hasher.update(self.field(name).unwrap_or("").as_bytes());
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Local,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldConflict {
    pub field: String,
    pub local_value: String,
    pub external_value: String,
    pub local_timestamp: DateTime<Utc>,
    pub external_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Ignored => "ignored",
        })
    }
}

/// Conflicts parked for a human decision (`manual_review`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub id: String,
    pub task_id: String,
    pub conflicts: Vec<FieldConflict>,
    pub created_at: DateTime<Utc>,
    pub status: ConflictStatus,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn pending(task_id: impl Into<String>, conflicts: Vec<FieldConflict>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            task_id: task_id.into(),
            conflicts,
            created_at: Utc::now(),
            status: ConflictStatus::Pending,
            resolved_by: None,
            resolved_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Cli,
    Api,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Cli => "cli",
            ProviderKind::Api => "api",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderInfo {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub version: Option<String>,
    pub available: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderInfo {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            version: None,
            available: false,
            reason: None,
            capabilities: BTreeMap::new(),
            binary_path: None,
            base_url: None,
        }
    }

    pub fn with_capabilities(mut self, ops: &[&str]) -> Self {
        self.capabilities = ops.iter().map(|op| (op.to_string(), true)).collect();
        self
    }

    pub fn unavailable(mut self, reason: impl Into<String>) -> Self {
        self.available = false;
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderHealth {
    pub provider: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub latency_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

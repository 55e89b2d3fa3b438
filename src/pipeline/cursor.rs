//! Pipeline cursor — server-side record of how far provisioning got.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the four ordered provisioning steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    CreateProfile,
    AttachMedia,
    AttachDocuments,
    Finalize,
}

impl PipelineStep {
    /// Execution order.
    pub const ALL: [PipelineStep; 4] = [
        Self::CreateProfile,
        Self::AttachMedia,
        Self::AttachDocuments,
        Self::Finalize,
    ];
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProfile => "create_profile",
            Self::AttachMedia => "attach_media",
            Self::AttachDocuments => "attach_documents",
            Self::Finalize => "finalize",
        }
    }

    /// Cursor position reached once this step succeeds.
    pub fn completes_to(&self) -> PipelineCursor {
        match self {
            Self::CreateProfile => PipelineCursor::Created,
            Self::AttachMedia => PipelineCursor::MediaAttached,
            Self::AttachDocuments => PipelineCursor::DocumentsAttached,
            Self::Finalize => PipelineCursor::Finalized,
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_profile" => Ok(Self::CreateProfile),
            "attach_media" => Ok(Self::AttachMedia),
            "attach_documents" => Ok(Self::AttachDocuments),
            "finalize" => Ok(Self::Finalize),
            other => Err(format!("unknown pipeline step: {other}")),
        }
    }
}

/// Last successfully completed provisioning step.
///
/// Progresses linearly: Absent → Created → MediaAttached →
/// DocumentsAttached → Finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineCursor {
    /// No business profile exists yet.
    Absent,
    Created,
    MediaAttached,
    DocumentsAttached,
    Finalized,
}

impl PipelineCursor {
    /// First step that has not executed yet, or `None` once finalized.
    pub fn next_step(&self) -> Option<PipelineStep> {
        match self {
            Self::Absent => Some(PipelineStep::CreateProfile),
            Self::Created => Some(PipelineStep::AttachMedia),
            Self::MediaAttached => Some(PipelineStep::AttachDocuments),
            Self::DocumentsAttached => Some(PipelineStep::Finalize),
            Self::Finalized => None,
        }
    }

    pub fn can_transition_to(&self, target: PipelineCursor) -> bool {
        self.next_step().map(|s| s.completes_to()) == Some(target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::MediaAttached => "media_attached",
            Self::DocumentsAttached => "documents_attached",
            Self::Finalized => "finalized",
        }
    }
}

impl Default for PipelineCursor {
    fn default() -> Self {
        Self::Absent
    }
}

impl std::fmt::Display for PipelineCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineCursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(Self::Absent),
            "created" => Ok(Self::Created),
            "media_attached" => Ok(Self::MediaAttached),
            "documents_attached" => Ok(Self::DocumentsAttached),
            "finalized" => Ok(Self::Finalized),
            other => Err(format!("unknown pipeline cursor: {other}")),
        }
    }
}

/// The gym provisioning record, keyed by (owner_id, session_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRecord {
    pub owner_id: Uuid,
    pub session_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gym_id: Option<String>,
    pub state: PipelineCursor,
    pub verified: bool,
    /// Number of pipeline runs that touched this record.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<PipelineStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningRecord {
    pub fn new(owner_id: Uuid, session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            owner_id,
            session_id,
            gym_id: None,
            state: PipelineCursor::Absent,
            verified: false,
            attempts: 0,
            failed_step: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key shared by the idempotency header and the run lease.
    pub fn idempotency_key(&self) -> String {
        idempotency_key(self.owner_id, self.session_id)
    }

    /// Record a successful step and advance the cursor.
    pub fn advance(&mut self, step: PipelineStep) -> Result<PipelineCursor, String> {
        let target = step.completes_to();
        if !self.state.can_transition_to(target) {
            return Err(format!("Cannot complete {step} from {}", self.state));
        }
        self.state = target;
        self.failed_step = None;
        self.last_error = None;
        self.updated_at = Utc::now();
        Ok(target)
    }

    pub fn record_failure(&mut self, step: PipelineStep, error: impl Into<String>) {
        self.failed_step = Some(step);
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }
}

pub fn idempotency_key(owner_id: Uuid, session_id: Uuid) -> String {
    format!("{owner_id}:{session_id}")
}

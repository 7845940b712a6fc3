//! Session and Interaction type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::{GantryError, GantryResult, ModelName, SessionFilterModel};

/// What a session asks the model to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Inference,
    Finetune,
}

impl SessionMode {
    /// Parse a mode where an empty string means "any"
    pub fn parse_optional(value: &str) -> GantryResult<Option<SessionMode>> {
        if value.is_empty() {
            Ok(None)
        } else {
            value.parse().map(Some)
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Inference => write!(f, "inference"),
            SessionMode::Finetune => write!(f, "finetune"),
        }
    }
}

impl FromStr for SessionMode {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inference" => Ok(SessionMode::Inference),
            "finetune" => Ok(SessionMode::Finetune),
            other => Err(GantryError::Validation(format!(
                "invalid session mode: {}",
                other
            ))),
        }
    }
}

/// Kind of output a session produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Image,
    Text,
}

impl SessionType {
    /// Parse a type where an empty string means "any"
    pub fn parse_optional(value: &str) -> GantryResult<Option<SessionType>> {
        if value.is_empty() {
            Ok(None)
        } else {
            value.parse().map(Some)
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Image => write!(f, "image"),
            SessionType::Text => write!(f, "text"),
        }
    }
}

impl FromStr for SessionType {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(SessionType::Image),
            "text" => Ok(SessionType::Text),
            other => Err(GantryError::Validation(format!(
                "invalid session type: {}",
                other
            ))),
        }
    }
}

/// Kind of principal owning a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    User,
    System,
}

impl FromStr for OwnerType {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(OwnerType::User),
            "system" => Ok(OwnerType::System),
            other => Err(GantryError::Validation(format!("invalid owner type: {}", other))),
        }
    }
}

/// Who authored an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatorType {
    User,
    System,
}

/// Completion state of an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionState {
    Waiting,
    Editing,
    Complete,
    Error,
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Queued,
    Assigned,
    Complete,
    Error,
}

impl SessionStatus {
    /// Whether a session may move from `self` to `next`
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Assigned)
                | (Assigned, Queued)
                | (Assigned, Complete)
                | (Assigned, Error)
                | (Complete, Queued)
                | (Error, Queued)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Created => write!(f, "created"),
            SessionStatus::Queued => write!(f, "queued"),
            SessionStatus::Assigned => write!(f, "assigned"),
            SessionStatus::Complete => write!(f, "complete"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// One turn within a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub creator: CreatorType,
    #[serde(default)]
    pub message: String,
    /// Uploaded or produced file references
    #[serde(default)]
    pub files: Vec<String>,
    pub state: InteractionState,
    #[serde(default)]
    pub finished: bool,
    /// Percentage (0-100) reported by the runner
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
    /// Adapter directory produced by a finetune
    #[serde(default)]
    pub lora_dir: String,
    /// Per-file labels for image finetunes
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Interaction {
    /// A finished user turn
    pub fn user(message: String, files: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created: now,
            updated: now,
            creator: CreatorType::User,
            message,
            files,
            state: InteractionState::Complete,
            finished: true,
            progress: 0,
            status: String::new(),
            error: String::new(),
            lora_dir: String::new(),
            metadata: HashMap::new(),
        }
    }

    /// An empty system turn waiting for a runner to fill it in
    pub fn system_waiting() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created: now,
            updated: now,
            creator: CreatorType::System,
            message: String::new(),
            files: Vec::new(),
            state: InteractionState::Waiting,
            finished: false,
            progress: 0,
            status: String::new(),
            error: String::new(),
            lora_dir: String::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A unit of requested work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub model_name: ModelName,
    /// Adapter the session runs against; empty for the base model
    #[serde(default)]
    pub finetune_file: String,
    /// Adapter produced by a completed finetune
    #[serde(default)]
    pub lora_dir: String,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    pub owner: String,
    pub owner_type: OwnerType,
    pub status: SessionStatus,
}

impl Session {
    /// Create a new session in the `created` state
    pub fn new(
        mode: SessionMode,
        session_type: SessionType,
        model_name: ModelName,
        owner: String,
        owner_type: OwnerType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            created: now,
            updated: now,
            mode,
            session_type,
            model_name,
            finetune_file: String::new(),
            lora_dir: String::new(),
            interactions: Vec::new(),
            owner,
            owner_type,
            status: SessionStatus::Created,
        }
    }

    /// Move to a new lifecycle status
    pub fn transition(&mut self, next: SessionStatus) -> GantryResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(GantryError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated = Utc::now();
        Ok(())
    }

    /// Whether the given caller owns this session
    pub fn is_owned_by(&self, ctx: &RequestContext) -> bool {
        self.owner == ctx.owner && self.owner_type == ctx.owner_type
    }

    /// The most recent system turn
    pub fn system_interaction(&self) -> GantryResult<&Interaction> {
        self.interactions
            .iter()
            .rev()
            .find(|i| i.creator == CreatorType::System)
            .ok_or_else(|| {
                GantryError::Validation(format!("session {} has no system interaction", self.id))
            })
    }

    pub fn system_interaction_mut(&mut self) -> GantryResult<&mut Interaction> {
        let id = self.id.clone();
        self.interactions
            .iter_mut()
            .rev()
            .find(|i| i.creator == CreatorType::System)
            .ok_or_else(|| {
                GantryError::Validation(format!("session {} has no system interaction", id))
            })
    }

    /// Estimated bytes needed to run this session
    pub fn memory_requirement(&self) -> u64 {
        self.model_name.memory_requirement(self.mode)
    }

    /// Time since creation; zero if the clock went backwards
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created).to_std().unwrap_or_default()
    }

    /// The (model, mode, adapter) triple used by reject lists
    pub fn filter_model(&self) -> SessionFilterModel {
        SessionFilterModel {
            model_name: self.model_name,
            mode: self.mode,
            finetune_file: self.finetune_file.clone(),
        }
    }
}

/// Body of a new session submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    /// Defaults to the catalog model for the session type
    #[serde(default)]
    pub model_name: Option<ModelName>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub finetune_file: String,
}

impl CreateSessionRequest {
    pub fn validate(&self) -> GantryResult<()> {
        if self.message.trim().is_empty() && self.files.is_empty() {
            return Err(GantryError::Validation(
                "a session needs a message or at least one file".to_string(),
            ));
        }
        if let Some(model) = self.model_name {
            if model.descriptor().session_type != self.session_type {
                return Err(GantryError::Validation(format!(
                    "model {} does not serve {} sessions",
                    model, self.session_type
                )));
            }
        }
        Ok(())
    }
}

/// A follow-up user turn on an existing session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Compact view of a session for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub model_name: ModelName,
    pub finetune_file: String,
    pub owner: String,
    pub status: SessionStatus,
    pub interactions: usize,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            created: session.created,
            mode: session.mode,
            session_type: session.session_type,
            model_name: session.model_name,
            finetune_file: session.finetune_file.clone(),
            owner: session.owner.clone(),
            status: session.status,
            interactions: session.interactions.len(),
        }
    }
}

/// Identity of the caller, supplied by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub owner: String,
    pub owner_type: OwnerType,
}

impl RequestContext {
    pub fn new(owner: impl Into<String>, owner_type: OwnerType) -> Self {
        Self {
            owner: owner.into(),
            owner_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_session() -> Session {
        Session::new(
            SessionMode::Inference,
            SessionType::Image,
            ModelName::Sdxl,
            "alice".to_string(),
            OwnerType::User,
        )
    }

    #[test]
    fn test_session_new() {
        let session = image_session();
        assert_eq!(session.status, SessionStatus::Created);
        assert!(session.finetune_file.is_empty());
        assert_eq!(session.memory_requirement(), ModelName::Sdxl.memory_requirement(SessionMode::Inference));
    }

    #[test]
    fn test_mode_and_type_parse() {
        assert_eq!("finetune".parse::<SessionMode>().unwrap(), SessionMode::Finetune);
        assert_eq!("text".parse::<SessionType>().unwrap(), SessionType::Text);
        assert!("video".parse::<SessionType>().is_err());
        assert_eq!(SessionMode::parse_optional("").unwrap(), None);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut session = image_session();
        session.transition(SessionStatus::Queued).unwrap();
        session.transition(SessionStatus::Assigned).unwrap();
        session.transition(SessionStatus::Complete).unwrap();
        session.transition(SessionStatus::Queued).unwrap();

        let err = session.transition(SessionStatus::Complete).unwrap_err();
        assert!(matches!(err, GantryError::InvalidTransition { .. }));
        assert_eq!(session.status, SessionStatus::Queued);
    }

    #[test]
    fn test_system_interaction_is_last_system_turn() {
        let mut session = image_session();
        assert!(session.system_interaction().is_err());

        session.interactions.push(Interaction::user("a cat".into(), vec![]));
        let first = Interaction::system_waiting();
        session.interactions.push(first);
        session.interactions.push(Interaction::user("a dog".into(), vec![]));
        let second = Interaction::system_waiting();
        let second_id = second.id.clone();
        session.interactions.push(second);

        assert_eq!(session.system_interaction().unwrap().id, second_id);
    }

    #[test]
    fn test_create_request_validation() {
        let mut req = CreateSessionRequest {
            mode: SessionMode::Inference,
            session_type: SessionType::Text,
            model_name: None,
            name: String::new(),
            message: "  ".to_string(),
            files: vec![],
            finetune_file: String::new(),
        };
        assert!(req.validate().is_err());

        req.message = "hello".to_string();
        assert!(req.validate().is_ok());

        req.model_name = Some(ModelName::Sdxl);
        assert!(matches!(req.validate(), Err(GantryError::Validation(_))));
    }

    #[test]
    fn test_summary_counts_interactions() {
        let mut session = image_session();
        session.interactions.push(Interaction::user("a cat".into(), vec![]));
        session.interactions.push(Interaction::system_waiting());
        let summary = SessionSummary::from(&session);
        assert_eq!(summary.interactions, 2);
        assert_eq!(summary.id, session.id);
    }

    #[test]
    fn test_ownership() {
        let session = image_session();
        assert!(session.is_owned_by(&RequestContext::new("alice", OwnerType::User)));
        assert!(!session.is_owned_by(&RequestContext::new("alice", OwnerType::System)));
        assert!(!session.is_owned_by(&RequestContext::new("bob", OwnerType::User)));
    }

    #[test]
    fn test_session_serializes_type_field() {
        let session = image_session();
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["type"], "image");
        assert_eq!(value["mode"], "inference");
        assert_eq!(value["status"], "created");
    }

    #[test]
    fn test_age_never_negative() {
        let session = image_session();
        let before = session.created - chrono::Duration::seconds(5);
        assert_eq!(session.age(before), Duration::ZERO);
        let later = session.created + chrono::Duration::seconds(5);
        assert_eq!(session.age(later), Duration::from_secs(5));
    }
}

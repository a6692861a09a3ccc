use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure a hub operation can answer with.
///
/// Errors travel back to callers as values, in-process and over the wire alike.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum HubError {
    #[error("Work item {item_id} is already claimed by {held_by}")]
    ClaimConflict { item_id: String, held_by: String },

    #[error("{claimant} does not own {item_id}")]
    NotOwner { item_id: String, claimant: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Identity {name} is already taken in project {project}")]
    NameTaken { project: String, name: String },

    #[error("Review of {item_id} is already claimed by {by}")]
    AlreadyClaimed { item_id: String, by: String },

    #[error("Transition {from} -> {to} is not allowed")]
    InvalidTransition { from: String, to: String },

    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },

    #[error("Hub connection closed")]
    Disconnected,

    #[error("Unexpected reply for {operation}")]
    UnexpectedReply { operation: String },
}

impl HubError {
    pub fn not_found(what: impl Into<String>) -> Self {
        HubError::NotFound { what: what.into() }
    }

    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        HubError::MalformedRequest {
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable name, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::ClaimConflict { .. } => "claim_conflict",
            HubError::NotOwner { .. } => "not_owner",
            HubError::NotFound { .. } => "not_found",
            HubError::NameTaken { .. } => "name_taken",
            HubError::AlreadyClaimed { .. } => "already_claimed",
            HubError::InvalidTransition { .. } => "invalid_transition",
            HubError::MalformedRequest { .. } => "malformed_request",
            HubError::Disconnected => "disconnected",
            HubError::UnexpectedReply { .. } => "unexpected_reply",
        }
    }
}

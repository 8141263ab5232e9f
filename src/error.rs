//! Error taxonomy for the dispatch engine.
//!
//! Validation, not-found and permission failures resolve at the triggering
//! action with a single ephemeral acknowledgment. Provider failures are
//! handled at each gateway call site. `MentionFailed` is the one error that
//! propagates through a fan-out and can force the caller to undo a
//! just-persisted state change.

use crate::gateway::GatewayError;
use crate::types::UserId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(NotFound),

    #[error("permission denied: {0}")]
    Permission(Permission),

    #[error("gateway error: {0}")]
    Provider(#[from] GatewayError),

    /// The rendered reference to `user` did not survive delivery. Affects
    /// every render of that user, so fan-outs abort on it.
    #[error("mention of user {user} did not render")]
    MentionFailed { user: UserId },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Malformed input: short text, missing caption, bad action parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("submission text is too short")]
    TooShort,

    #[error("submission has no caption")]
    MissingText,

    #[error("action token is missing parameters")]
    MissingActionParams,

    #[error("action parameter `{0}` is missing or not numeric")]
    BadActionParam(&'static str),

    #[error("unknown action `{0}`")]
    UnknownAction(String),
}

/// Referenced entity absent, or not visible to the caller. Ownership
/// mismatches surface as not-found because lookups are scoped to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotFound {
    #[error("task")]
    Task,

    #[error("response")]
    Response,

    #[error("payment option")]
    PaymentOption,

    #[error("user")]
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Permission {
    #[error("user has no publish permission")]
    CannotPublish,

    #[error("creator cannot respond to their own task")]
    SelfResponse,

    #[error("user already responded to this task")]
    DuplicateResponse,
}

impl Error {
    /// Short text shown to the acting user as an ephemeral acknowledgment.
    pub fn user_facing_text(&self) -> String {
        match self {
            Error::Validation(ValidationError::TooShort) => {
                "The request text is too short.".into()
            }
            Error::Validation(ValidationError::MissingText) => {
                "Please add a description to your request.".into()
            }
            Error::Validation(_) => "Error: malformed action.".into(),
            Error::NotFound(what) => format!("Error: {what} not found."),
            Error::Permission(Permission::CannotPublish) => {
                "You are not allowed to publish requests yet.".into()
            }
            Error::Permission(Permission::SelfResponse) => {
                "You cannot respond to your own request.".into()
            }
            Error::Permission(Permission::DuplicateResponse) => {
                "You already responded to this request.".into()
            }
            Error::MentionFailed { .. } => {
                "Your offer could not be announced. Check the private message from the bot.".into()
            }
            Error::Provider(_) | Error::Other(_) => "Something went wrong, try again.".into(),
        }
    }
}

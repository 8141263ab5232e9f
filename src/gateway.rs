//! Messaging gateway surface consumed by the engine.
//!
//! The transport (long polling, webhooks) lives outside this crate; the
//! engine only needs the operations below plus the echoed message metadata
//! used for mention verification.

use crate::markup::Markup;
use crate::types::{AttachmentKind, MessageId, UserId};
use async_trait::async_trait;
use thiserror::Error;

/// Chat to deliver into. For direct chats this is the user's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatRef(pub i64);

impl From<UserId> for ChatRef {
    fn from(user: UserId) -> Self {
        ChatRef(user.0)
    }
}

impl std::fmt::Display for ChatRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque token identifying an inline-control press, used to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionToken(pub String);

/// Rich-text entity echoed back by the provider on a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEntity {
    /// `@handle` mention. Resolves through the public handle, never degrades.
    Handle { offset: usize, len: usize },
    /// Display-name mention bound to a user id. The provider drops this
    /// silently when the target's privacy settings forbid it.
    TextMention { user: UserId, offset: usize, len: usize },
}

/// Provider's echo of a just-sent message.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: MessageId,
    pub entities: Vec<MessageEntity>,
}

/// Optional knobs for a text send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub markup: Option<Markup>,
    pub reply_to: Option<MessageId>,
    pub entities: Vec<MessageEntity>,
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The edit would not change anything. Treated as silent success.
    #[error("message is not modified")]
    NotModified,

    /// The target message is gone, too old, or otherwise unreachable.
    #[error("message unavailable: {0}")]
    MessageUnavailable(String),

    #[error("gateway request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_text(
        &self,
        chat: ChatRef,
        text: &str,
        opts: SendOptions,
    ) -> Result<SentMessage, GatewayError>;

    async fn edit_text(
        &self,
        chat: ChatRef,
        message: MessageId,
        text: &str,
        markup: Option<Markup>,
    ) -> Result<(), GatewayError>;

    async fn delete_message(&self, chat: ChatRef, message: MessageId)
        -> Result<(), GatewayError>;

    async fn send_attachment(
        &self,
        chat: ChatRef,
        file_ref: &str,
        kind: AttachmentKind,
        reply_to: Option<MessageId>,
    ) -> Result<SentMessage, GatewayError>;

    /// Send several photo/video files as one media group. Returns one echo
    /// per file, in order.
    async fn send_attachment_group(
        &self,
        chat: ChatRef,
        files: &[(String, AttachmentKind)],
    ) -> Result<Vec<SentMessage>, GatewayError>;

    /// Acknowledge an inline-control press with short feedback text.
    async fn answer_action(&self, token: &ActionToken, text: &str) -> Result<(), GatewayError>;
}

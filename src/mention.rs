//! Mention rendering and post-send privacy verification.
//!
//! A public handle renders as `@handle` and can never degrade. Without one
//! the mention is a display-name entity bound to the user's identity, which
//! the provider silently drops when the target's privacy settings forbid
//! it — so after sending we check the echoed entities and, when the mention
//! did not take, retract the message and tell the user how to fix it.

use crate::error::{Error, Result};
use crate::gateway::{Gateway, MessageEntity, SendOptions, SentMessage};
use crate::render::PRIVACY_INSTRUCTION_TEXT;
use crate::types::{UserId, UserProfile};
use std::sync::Arc;

/// A rendered reference to an actor, ready to embed in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mention {
    Handle(String),
    DisplayName { user: UserId, name: String },
}

impl Mention {
    pub fn render(actor: &UserProfile) -> Mention {
        match &actor.handle {
            Some(handle) if !handle.is_empty() => Mention::Handle(format!("@{handle}")),
            _ => {
                let name = actor.display_name();
                let name = if name.trim().is_empty() {
                    actor.id.to_string()
                } else {
                    name
                };
                Mention::DisplayName {
                    user: actor.id,
                    name,
                }
            }
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Mention::Handle(handle) => handle,
            Mention::DisplayName { name, .. } => name,
        }
    }

    /// Entity to attach when the mention sits at `offset` (in characters)
    /// inside the outbound text. Handle mentions need no explicit entity.
    pub fn entity_at(&self, offset: usize) -> Option<MessageEntity> {
        match self {
            Mention::Handle(_) => None,
            Mention::DisplayName { user, name } => Some(MessageEntity::TextMention {
                user: *user,
                offset,
                len: name.chars().count(),
            }),
        }
    }
}

pub struct MentionVerifier {
    gateway: Arc<dyn Gateway>,
}

impl MentionVerifier {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// Check that the just-sent message actually carries the mention of
    /// `actor`. On degradation: retract the message, privately instruct the
    /// actor to relax their forwarding-privacy setting, and fail. The broken
    /// reference is not recipient-specific, so callers must stop the whole
    /// operation.
    pub async fn verify_and_notify(
        &self,
        sent_in: crate::gateway::ChatRef,
        sent: &SentMessage,
        actor: &UserProfile,
    ) -> Result<()> {
        if actor.handle.as_deref().is_some_and(|h| !h.is_empty()) {
            return Ok(());
        }

        let took_effect = sent.entities.iter().any(
            |entity| matches!(entity, MessageEntity::TextMention { user, .. } if *user == actor.id),
        );
        if took_effect {
            return Ok(());
        }

        tracing::warn!(user = %actor.id, message = %sent.id, "mention degraded to plain text");

        if let Err(error) = self.gateway.delete_message(sent_in, sent.id).await {
            tracing::warn!(message = %sent.id, %error, "failed to retract degraded mention message");
        }
        if let Err(error) = self
            .gateway
            .send_text(actor.id.into(), PRIVACY_INSTRUCTION_TEXT, SendOptions::default())
            .await
        {
            tracing::warn!(user = %actor.id, %error, "failed to deliver privacy instruction");
        }

        Err(Error::MentionFailed { user: actor.id })
    }
}

//! Per-recipient message-state tracking with edit-or-resend semantics.
//!
//! Bindings are a cache of where the last rendering was sent, never a
//! source of truth for content. `send_or_bind` always issues a new message
//! and a new binding; `edit_or_resend` tries an in-place edit of the most
//! recent binding and degrades to a fresh send when the provider refuses.

use crate::error::Result;
use crate::gateway::{Gateway, GatewayError, SendOptions, SentMessage};
use crate::markup::Markup;
use crate::store::{BindingStore, TaskStore};
use crate::types::{AttachmentKind, MessageId, Subject, Task, UserId};
use anyhow::Context as _;
use std::sync::Arc;

/// Which path `edit_or_resend` took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// In-place edit succeeded.
    Edited,
    /// Provider reported nothing would change. Silent success, no new
    /// binding.
    Unchanged,
    /// Edit failed; a new message was sent and bound.
    Resent(MessageId),
}

pub struct MessageTracker {
    gateway: Arc<dyn Gateway>,
    bindings: BindingStore,
    tasks: TaskStore,
}

impl MessageTracker {
    pub fn new(gateway: Arc<dyn Gateway>, bindings: BindingStore, tasks: TaskStore) -> Self {
        Self {
            gateway,
            bindings,
            tasks,
        }
    }

    pub fn bindings(&self) -> &BindingStore {
        &self.bindings
    }

    /// Send a new text message representing `subject` to `recipient` and
    /// record the binding.
    pub async fn send_or_bind(
        &self,
        subject: Subject,
        recipient: UserId,
        text: &str,
        opts: SendOptions,
    ) -> Result<SentMessage> {
        let sent = self.gateway.send_text(recipient.into(), text, opts).await?;
        self.bindings.insert(subject, recipient, sent.id).await?;
        Ok(sent)
    }

    /// Send one attachment. Attachments are never edited, only sent once
    /// per recipient.
    pub async fn send_attachment(
        &self,
        subject: Subject,
        recipient: UserId,
        file_ref: &str,
        kind: AttachmentKind,
        reply_to: Option<MessageId>,
    ) -> Result<SentMessage> {
        let sent = self
            .gateway
            .send_attachment(recipient.into(), file_ref, kind, reply_to)
            .await?;
        self.bindings.insert(subject, recipient, sent.id).await?;
        Ok(sent)
    }

    /// Send several attachments as one media group, binding each echoed
    /// message to its subject in order.
    pub async fn send_attachment_group(
        &self,
        items: &[(Subject, String, AttachmentKind)],
        recipient: UserId,
    ) -> Result<Vec<SentMessage>> {
        let files: Vec<(String, AttachmentKind)> = items
            .iter()
            .map(|(_, file_ref, kind)| (file_ref.clone(), *kind))
            .collect();
        let sent = self
            .gateway
            .send_attachment_group(recipient.into(), &files)
            .await?;
        for ((subject, _, _), message) in items.iter().zip(&sent) {
            self.bindings.insert(*subject, recipient, message.id).await?;
        }
        Ok(sent)
    }

    /// Edit the most recent externally visible message for (subject,
    /// recipient), falling back to a fresh send when the provider refuses
    /// the edit. The superseded binding is left in place; purge flows sweep
    /// it later.
    pub async fn edit_or_resend(
        &self,
        subject: Subject,
        recipient: UserId,
        text: &str,
        markup: Option<Markup>,
    ) -> Result<EditOutcome> {
        let latest = self.bindings.latest(subject, recipient).await?;
        if let Some(binding) = latest {
            match self
                .gateway
                .edit_text(recipient.into(), binding.message_id, text, markup.clone())
                .await
            {
                Ok(()) => return Ok(EditOutcome::Edited),
                Err(GatewayError::NotModified) => return Ok(EditOutcome::Unchanged),
                Err(error) => {
                    tracing::warn!(
                        %recipient,
                        message = %binding.message_id,
                        %error,
                        "edit failed, falling back to resend"
                    );
                }
            }
        }

        let sent = self
            .gateway
            .send_text(
                recipient.into(),
                text,
                SendOptions {
                    markup,
                    ..SendOptions::default()
                },
            )
            .await?;
        self.bindings.insert(subject, recipient, sent.id).await?;
        Ok(EditOutcome::Resent(sent.id))
    }

    /// Delete every message bound to the task's subject graph (the task
    /// itself, each attachment, each response), across all recipients.
    /// Remote deletes are best-effort; binding bookkeeping is always
    /// removed.
    pub async fn purge_all(&self, task: &Task) -> Result<()> {
        let mut subjects = vec![Subject::Task(task.id)];
        for attachment in self
            .tasks
            .attachments(task.id)
            .await
            .context("collecting attachments for purge")?
        {
            subjects.push(Subject::Attachment(attachment.id));
        }
        for response in self
            .tasks
            .responses(task.id)
            .await
            .context("collecting responses for purge")?
        {
            subjects.push(Subject::Response(response.id));
        }

        // Collect every target first, then attempt each delete
        // independently; one failure never blocks the rest.
        let mut targets = Vec::new();
        for subject in &subjects {
            targets.extend(self.bindings.for_subject(*subject).await?);
        }

        for binding in &targets {
            if let Err(error) = self
                .gateway
                .delete_message(binding.recipient.into(), binding.message_id)
                .await
            {
                tracing::warn!(
                    recipient = %binding.recipient,
                    message = %binding.message_id,
                    %error,
                    "failed to delete remote message during purge"
                );
            }
        }
        for subject in subjects {
            self.bindings.delete_for_subject(subject).await?;
        }
        Ok(())
    }

    /// Delete the messages bound to one subject (for one purge-scope
    /// cleanup, e.g. retracting an offer notification) and drop the rows.
    pub async fn purge_subject(&self, subject: Subject) -> Result<()> {
        for binding in self.bindings.for_subject(subject).await? {
            if let Err(error) = self
                .gateway
                .delete_message(binding.recipient.into(), binding.message_id)
                .await
            {
                tracing::warn!(
                    recipient = %binding.recipient,
                    message = %binding.message_id,
                    %error,
                    "failed to delete remote message"
                );
            }
        }
        self.bindings.delete_for_subject(subject).await?;
        Ok(())
    }
}

//! Rate-limited broadcast fan-out: delivers or re-renders a task to a
//! recipient set.
//!
//! Sends run strictly sequentially with a minimum inter-send delay to stay
//! inside the gateway's per-chat and global rate limits. A provider failure
//! aborts only that recipient's delivery; a failed mention aborts the whole
//! fan-out because the broken reference affects every recipient.

use crate::error::{Error, Result};
use crate::gateway::SendOptions;
use crate::markup::Markup;
use crate::render;
use crate::store::{CatalogStore, TaskStore, UserStore};
use crate::tracker::MessageTracker;
use crate::types::{Attachment, MessageId, Subject, Tag, Task, UserId, UserProfile};
use std::sync::Arc;
use std::time::Duration;

pub struct Broadcaster {
    tracker: Arc<MessageTracker>,
    users: UserStore,
    tasks: TaskStore,
    catalog: CatalogStore,
    send_interval: Duration,
    tag_filtering: bool,
}

impl Broadcaster {
    pub fn new(
        tracker: Arc<MessageTracker>,
        users: UserStore,
        tasks: TaskStore,
        catalog: CatalogStore,
        send_interval: Duration,
        tag_filtering: bool,
    ) -> Self {
        Self {
            tracker,
            users,
            tasks,
            catalog,
            send_interval,
            tag_filtering,
        }
    }

    /// All eligible, non-blocked registered users excluding the creator.
    /// With tag filtering enabled, narrowed to the task's tag subscribers.
    pub async fn eligible_recipients(&self, task: &Task) -> Result<Vec<UserProfile>> {
        if self.tag_filtering {
            if let Some(tag) = task.tag {
                return self.users.subscribers_of(tag, task.creator).await;
            }
        }
        self.users.eligible_recipients(task.creator).await
    }

    pub async fn task_tag(&self, task: &Task) -> Result<Option<Tag>> {
        match task.tag {
            Some(tag) => self.catalog.tag(tag).await,
            None => Ok(None),
        }
    }

    /// Render the task fresh to every eligible recipient: attachments
    /// first, then the text bound as a reply to the first attachment.
    pub async fn broadcast_new(&self, task: &Task, markup: Markup) -> Result<()> {
        let attachments = self.tasks.attachments(task.id).await?;
        let tag = self.task_tag(task).await?;
        let text = render::task_body(task, tag.as_ref());

        for recipient in self.eligible_recipients(task).await? {
            match self
                .deliver(task, &attachments, recipient.id, &text, Some(markup.clone()))
                .await
            {
                Ok(_) => {}
                Err(Error::Provider(error)) => {
                    // This recipient is unreachable; the fan-out goes on.
                    tracing::warn!(
                        task = %task.id,
                        recipient = %recipient.id,
                        %error,
                        "failed to deliver task to recipient"
                    );
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Re-render the task for every recipient currently bound to it (except
    /// the creator). `render_for` personalizes text and markup per
    /// recipient; returning `None` skips that recipient.
    pub async fn broadcast_edit<F>(&self, task: &Task, render_for: F) -> Result<()>
    where
        F: Fn(UserId) -> Option<(String, Option<Markup>)>,
    {
        let recipients = self
            .tracker
            .bindings()
            .recipients_of(Subject::Task(task.id))
            .await?;

        for recipient in recipients {
            if recipient == task.creator {
                continue;
            }
            let Some((text, markup)) = render_for(recipient) else {
                continue;
            };
            self.throttle().await;
            match self
                .tracker
                .edit_or_resend(Subject::Task(task.id), recipient, &text, markup)
                .await
            {
                Ok(_) => {}
                Err(Error::Provider(error)) => {
                    tracing::warn!(
                        task = %task.id,
                        %recipient,
                        %error,
                        "failed to re-render task for recipient"
                    );
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Deliver one task rendering to one recipient: attachments (media
    /// group when possible), then the text as a reply to the first
    /// attachment message. Also used for the creator's own confirmation
    /// view.
    pub async fn deliver(
        &self,
        task: &Task,
        attachments: &[Attachment],
        recipient: UserId,
        text: &str,
        markup: Option<Markup>,
    ) -> Result<MessageId> {
        let mut first_attachment_message = None;

        if attachments.len() > 1 && attachments.iter().all(|a| a.kind.groupable()) {
            self.throttle().await;
            let items: Vec<_> = attachments
                .iter()
                .map(|a| (Subject::Attachment(a.id), a.file_ref.clone(), a.kind))
                .collect();
            let sent = self.tracker.send_attachment_group(&items, recipient).await?;
            first_attachment_message = sent.first().map(|m| m.id);
        } else {
            for attachment in attachments {
                self.throttle().await;
                let sent = self
                    .tracker
                    .send_attachment(
                        Subject::Attachment(attachment.id),
                        recipient,
                        &attachment.file_ref,
                        attachment.kind,
                        None,
                    )
                    .await?;
                if first_attachment_message.is_none() {
                    first_attachment_message = Some(sent.id);
                }
            }
        }

        self.throttle().await;
        let sent = self
            .tracker
            .send_or_bind(
                Subject::Task(task.id),
                recipient,
                text,
                SendOptions {
                    markup,
                    reply_to: first_attachment_message,
                    ..SendOptions::default()
                },
            )
            .await?;
        Ok(sent.id)
    }

    async fn throttle(&self) {
        if !self.send_interval.is_zero() {
            tokio::time::sleep(self.send_interval).await;
        }
    }
}

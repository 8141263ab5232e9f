//! Inbound routing: commands, content units, and inline-control presses.
//!
//! Every update first syncs the sender's profile; blocked users get a
//! single notice and nothing else runs. Lifecycle transitions for one task
//! are serialized behind a per-task mutex so concurrent presses cannot
//! interleave their fan-outs. Rejection feedback is ephemeral: the notice
//! retracts itself after a short lifetime.

use crate::config::{Config, Links};
use crate::error::{Error, NotFound, Result};
use crate::gateway::{ActionToken, ChatRef, Gateway, SendOptions};
use crate::lifecycle::Lifecycle;
use crate::markup::Action;
use crate::render;
use crate::store::{CatalogStore, ChatProfile, TaskStore, UserStore};
use crate::submission::{DebounceKey, DebounceScheduler, InboundUnit, Resolution, SubmissionAggregator};
use crate::types::{TaskId, UserProfile};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const ACK_OFFER_SENT: &str = "Offer sent.";
const ACK_OFFER_REMOVED: &str = "Offer removed.";
const ACK_TASK_CLOSED: &str = "Request closed.";
const ACK_TASK_CANCELLED: &str = "Request cancelled.";
const ACK_TASK_REPEATED: &str = "Request posted again.";

/// Slash commands understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Rules,
    Chat,
    Admin,
    Today,
}

impl Command {
    pub fn parse(text: &str) -> Option<Command> {
        match text.trim() {
            "/start" => Some(Command::Start),
            "/rules" => Some(Command::Rules),
            "/chat" => Some(Command::Chat),
            "/admin" => Some(Command::Admin),
            "/today" => Some(Command::Today),
            _ => None,
        }
    }
}

/// One decoded inbound update, as handed over by the transport.
#[derive(Debug, Clone)]
pub enum Inbound {
    Command { chat: ChatProfile, command: Command },
    Content { chat: ChatProfile, unit: InboundUnit },
    Action { chat: ChatProfile, token: ActionToken, data: String },
}

pub struct Dispatcher<S: DebounceScheduler> {
    gateway: Arc<dyn Gateway>,
    lifecycle: Lifecycle,
    aggregator: SubmissionAggregator<S>,
    users: UserStore,
    tasks: TaskStore,
    catalog: CatalogStore,
    links: Links,
    auto_grant_publish: bool,
    tag_filtering: bool,
    ephemeral_ttl: Duration,
    /// Per-task sequence point: transitions for one task never interleave.
    task_locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: DebounceScheduler> Dispatcher<S> {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        lifecycle: Lifecycle,
        scheduler: S,
        users: UserStore,
        tasks: TaskStore,
        catalog: CatalogStore,
        config: &Config,
    ) -> Self {
        Self {
            gateway,
            lifecycle,
            aggregator: SubmissionAggregator::new(
                scheduler,
                config.text_debounce(),
                config.group_debounce(),
                config.min_text_length,
            ),
            users,
            tasks,
            catalog,
            links: config.links.clone(),
            auto_grant_publish: config.auto_grant_publish,
            tag_filtering: config.tag_filtering,
            ephemeral_ttl: config.ephemeral_ttl(),
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Route one inbound update end to end.
    pub async fn handle(&self, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::Command { chat, command } => {
                let (profile, created) = self.admit(&chat).await?;
                if profile.blocked {
                    return self.blocked_notice(&profile).await;
                }
                self.handle_command(command, &profile, created).await
            }
            Inbound::Content { chat, unit } => {
                let (profile, _) = self.admit(&chat).await?;
                if profile.blocked {
                    return self.blocked_notice(&profile).await;
                }
                if let Some(resolution) = self.aggregator.accept(unit) {
                    self.resolve(resolution).await?;
                }
                Ok(())
            }
            Inbound::Action { chat, token, data } => {
                let (profile, _) = self.admit(&chat).await?;
                if profile.blocked {
                    // A press is acknowledged in place, not answered in chat.
                    self.gateway
                        .answer_action(&token, render::BLOCKED_TEXT)
                        .await?;
                    return Ok(());
                }
                self.handle_action(&token, &data, &profile).await
            }
        }
    }

    /// A debounce timer fired; resolve whatever the window was holding.
    pub async fn debounce_expired(&self, key: DebounceKey) -> Result<()> {
        if let Some(resolution) = self.aggregator.timer_fired(key) {
            self.resolve(resolution).await?;
        }
        Ok(())
    }

    /// Drain the expiry channel until the schedulers hang up. Failures are
    /// logged per submission; the loop never stops on them.
    pub async fn run(&self, mut expired: mpsc::UnboundedReceiver<DebounceKey>) {
        while let Some(key) = expired.recv().await {
            if let Err(error) = self.debounce_expired(key).await {
                tracing::error!(%error, "failed to resolve expired submission");
            }
        }
    }

    /// Sync the sender's profile; first contact registers the user.
    async fn admit(&self, chat: &ChatProfile) -> Result<(UserProfile, bool)> {
        let (profile, created) = self.users.sync(chat, self.auto_grant_publish).await?;
        if created {
            tracing::info!(user = %profile.id, "registered new user");
            if self.tag_filtering {
                self.catalog.subscribe_all_tags(profile.id).await?;
            }
        }
        Ok((profile, created))
    }

    async fn blocked_notice(&self, profile: &UserProfile) -> Result<()> {
        self.gateway
            .send_text(profile.id.into(), render::BLOCKED_TEXT, SendOptions::default())
            .await?;
        Ok(())
    }

    async fn handle_command(
        &self,
        command: Command,
        profile: &UserProfile,
        created: bool,
    ) -> Result<()> {
        let text = match command {
            Command::Start => {
                // First contact always gets the welcome pointer.
                if created || !profile.can_publish {
                    render::welcome_text(&self.links)
                } else {
                    // Short confirmation that cleans itself up.
                    return self
                        .send_ephemeral(profile.id.into(), render::CHAT_ACTIVE_TEXT)
                        .await;
                }
            }
            Command::Rules => render::rules_text(&self.links),
            Command::Chat => render::general_chat_text(&self.links),
            Command::Admin => render::admin_text(&self.links),
            Command::Today => {
                let today = chrono::Local::now().date_naive();
                let midnight = today
                    .and_hms_opt(0, 0, 0)
                    .and_then(|t| t.and_local_timezone(chrono::Local).earliest())
                    .ok_or_else(|| anyhow::anyhow!("invalid local midnight"))?
                    .with_timezone(&chrono::Utc);
                let count = self.tasks.count_created_since(midnight).await?;
                render::today_text(&today.format("%Y-%m-%d").to_string(), count)
            }
        };
        self.gateway
            .send_text(profile.id.into(), &text, SendOptions::default())
            .await?;
        Ok(())
    }

    /// A window closed (or a lone captioned attachment landed): either a
    /// submission to publish or a rejection to flash at the sender.
    async fn resolve(&self, resolution: Resolution) -> Result<()> {
        match resolution {
            Resolution::Submission(submission) => {
                let tag = if self.tag_filtering {
                    self.catalog.first_tag().await?.map(|t| t.id)
                } else {
                    None
                };
                if let Err(error) = self.lifecycle.publish(&submission, tag).await {
                    match &error {
                        Error::Validation(_) | Error::Permission(_) | Error::NotFound(_) => {
                            self.send_ephemeral(submission.sender.into(), &error.user_facing_text())
                                .await?;
                        }
                        _ => return Err(error),
                    }
                }
                Ok(())
            }
            Resolution::Rejected { sender, reason } => {
                tracing::debug!(user = %sender, %reason, "submission rejected");
                let error = Error::Validation(reason);
                self.send_ephemeral(sender.into(), &error.user_facing_text())
                    .await
            }
        }
    }

    async fn handle_action(
        &self,
        token: &ActionToken,
        data: &str,
        profile: &UserProfile,
    ) -> Result<()> {
        let action = match Action::parse(data) {
            Ok(action) => action,
            Err(reason) => {
                tracing::warn!(user = %profile.id, data, %reason, "malformed action token");
                let error = Error::Validation(reason);
                self.gateway
                    .answer_action(token, &error.user_facing_text())
                    .await?;
                return Ok(());
            }
        };

        let outcome = self.perform(action, profile).await;
        let ack = match &outcome {
            Ok(ack) => ack.to_string(),
            Err(error) => error.user_facing_text(),
        };
        if let Err(error) = &outcome {
            tracing::warn!(user = %profile.id, %error, "action failed");
        }
        self.gateway.answer_action(token, &ack).await?;
        Ok(())
    }

    async fn perform(&self, action: Action, profile: &UserProfile) -> Result<&'static str> {
        match action {
            Action::SelectOffer { task, option } => {
                let lock = self.task_lock(task);
                let _guard = lock.lock().await;
                self.lifecycle.respond(task, option, profile).await?;
                Ok(ACK_OFFER_SENT)
            }
            Action::CancelOffer { response } => {
                let task = self
                    .tasks
                    .response(response)
                    .await?
                    .ok_or(Error::NotFound(NotFound::Response))?
                    .task_id;
                let lock = self.task_lock(task);
                let _guard = lock.lock().await;
                self.lifecycle.respond_cancel(response, profile.id).await?;
                Ok(ACK_OFFER_REMOVED)
            }
            Action::CloseTask { task } => {
                let lock = self.task_lock(task);
                let _guard = lock.lock().await;
                self.lifecycle.close_task(task, profile.id).await?;
                Ok(ACK_TASK_CLOSED)
            }
            Action::CancelTask { task } => {
                let lock = self.task_lock(task);
                let _guard = lock.lock().await;
                self.lifecycle.cancel_task(task, profile.id).await?;
                drop(_guard);
                self.task_locks.lock().expect("task locks").remove(&task);
                Ok(ACK_TASK_CANCELLED)
            }
            Action::RepeatTask { task } => {
                let lock = self.task_lock(task);
                let _guard = lock.lock().await;
                self.lifecycle.repeat_task(task, profile.id).await?;
                Ok(ACK_TASK_REPEATED)
            }
        }
    }

    fn task_lock(&self, task: TaskId) -> Arc<tokio::sync::Mutex<()>> {
        self.task_locks
            .lock()
            .expect("task locks")
            .entry(task)
            .or_default()
            .clone()
    }

    /// Flash a short notice at the user and retract it after the configured
    /// lifetime. Retraction is best-effort.
    async fn send_ephemeral(&self, chat: ChatRef, text: &str) -> Result<()> {
        let sent = self
            .gateway
            .send_text(chat, text, SendOptions::default())
            .await?;
        if self.ephemeral_ttl.is_zero() {
            if let Err(error) = self.gateway.delete_message(chat, sent.id).await {
                tracing::debug!(%error, "failed to retract notice");
            }
            return Ok(());
        }
        let gateway = self.gateway.clone();
        let ttl = self.ephemeral_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Err(error) = gateway.delete_message(chat, sent.id).await {
                tracing::debug!(%error, "failed to retract notice");
            }
        });
        Ok(())
    }
}

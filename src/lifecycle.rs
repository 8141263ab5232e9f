//! Task lifecycle: publish, close, cancel, repeat, and the offer flow.
//!
//! Every externally visible view is re-derived from current task state on
//! each transition; bindings only say where the previous rendering went.
//! Purges are best-effort against the provider but always drop the binding
//! rows, so a task deleted here never leaves stale bookkeeping behind.

use crate::broadcast::Broadcaster;
use crate::error::{Error, NotFound, Permission, Result};
use crate::gateway::{Gateway, SendOptions};
use crate::markup;
use crate::mention::{Mention, MentionVerifier};
use crate::render;
use crate::store::{CatalogStore, TaskStore, UserStore};
use crate::submission::Submission;
use crate::tracker::MessageTracker;
use crate::types::{
    PaymentOptionId, Response, ResponseId, Stage, Subject, Tag, TagId, Task, TaskId, UserId,
    UserProfile,
};
use std::sync::Arc;

pub struct Lifecycle {
    tracker: Arc<MessageTracker>,
    broadcaster: Broadcaster,
    verifier: MentionVerifier,
    users: UserStore,
    tasks: TaskStore,
    catalog: CatalogStore,
}

impl Lifecycle {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        tracker: Arc<MessageTracker>,
        broadcaster: Broadcaster,
        users: UserStore,
        tasks: TaskStore,
        catalog: CatalogStore,
    ) -> Self {
        Self {
            tracker,
            broadcaster,
            verifier: MentionVerifier::new(gateway),
            users,
            tasks,
            catalog,
        }
    }

    /// Persist an aggregated submission as a new task and fan it out:
    /// the creator gets a confirmation with lifecycle controls, everyone
    /// else gets the task with one button per payment option.
    pub async fn publish(&self, submission: &Submission, tag: Option<TagId>) -> Result<Task> {
        let creator = self
            .users
            .get(submission.sender)
            .await?
            .ok_or(Error::NotFound(NotFound::User))?;
        if !creator.can_publish {
            return Err(Error::Permission(Permission::CannotPublish));
        }

        let task = self
            .tasks
            .create_task(&submission.text, creator.id, tag)
            .await?;
        for (file_ref, kind) in &submission.attachments {
            self.tasks.add_attachment(task.id, file_ref, *kind).await?;
        }
        tracing::info!(
            task = %task.id,
            creator = %creator.id,
            attachments = submission.attachments.len(),
            "task published"
        );

        self.announce(&task, render::creator_view).await?;
        Ok(task)
    }

    /// Close the task: offers stop, every rendering becomes the closed
    /// view, the creator keeps a repeat control.
    pub async fn close_task(&self, task: TaskId, actor: UserId) -> Result<Task> {
        let task = self.owned_task(task, actor).await?;
        self.tasks.set_stage(task.id, Stage::Closed).await?;
        let task = Task {
            stage: Stage::Closed,
            ..task
        };
        tracing::info!(task = %task.id, "task closed");

        let tag = self.broadcaster.task_tag(&task).await?;
        let closed = render::closed_view(&task, tag.as_ref());
        self.tracker
            .edit_or_resend(
                Subject::Task(task.id),
                task.creator,
                &closed,
                Some(markup::repeat_only(task.id)),
            )
            .await?;
        self.broadcaster
            .broadcast_edit(&task, |_| Some((closed.clone(), None)))
            .await?;
        Ok(task)
    }

    /// Cancel the task: retract every message sent for it, then delete the
    /// task row (attachments and responses cascade).
    pub async fn cancel_task(&self, task: TaskId, actor: UserId) -> Result<()> {
        let task = self.owned_task(task, actor).await?;
        self.tracker.purge_all(&task).await?;
        self.tasks.delete_task(task.id).await?;
        tracing::info!(task = %task.id, "task cancelled");
        Ok(())
    }

    /// Repeat the task: retract every previous rendering, drop all offers,
    /// reset the stage, and fan the task out again from scratch.
    pub async fn repeat_task(&self, task: TaskId, actor: UserId) -> Result<Task> {
        let task = self.owned_task(task, actor).await?;
        self.tracker.purge_all(&task).await?;
        self.tasks.delete_responses(task.id).await?;
        self.tasks.set_stage(task.id, Stage::Created).await?;
        let task = Task {
            stage: Stage::Created,
            ..task
        };
        tracing::info!(task = %task.id, "task reposted");

        self.announce(&task, render::reposted_view).await?;
        Ok(task)
    }

    /// Record an offer and notify the creator, mentioning the respondent.
    /// A mention that does not survive delivery aborts the offer: the
    /// notification is already retracted by the verifier, and the response
    /// row plus its bindings are rolled back here.
    pub async fn respond(
        &self,
        task: TaskId,
        option: PaymentOptionId,
        actor: &UserProfile,
    ) -> Result<Response> {
        let task = self
            .tasks
            .task(task)
            .await?
            .ok_or(Error::NotFound(NotFound::Task))?;
        if task.stage != Stage::Created {
            return Err(Error::NotFound(NotFound::Task));
        }
        if task.creator == actor.id {
            return Err(Error::Permission(Permission::SelfResponse));
        }
        if self.tasks.response_for(task.id, actor.id).await?.is_some() {
            return Err(Error::Permission(Permission::DuplicateResponse));
        }
        let option = self
            .catalog
            .payment_option(option)
            .await?
            .ok_or(Error::NotFound(NotFound::PaymentOption))?;

        let response = self.tasks.create_response(task.id, actor.id, option.id).await?;

        let mention = Mention::render(actor);
        let text = render::offer_notification(mention.text(), &task, &option.name);
        let entities = text
            .find(mention.text())
            .and_then(|idx| mention.entity_at(text[..idx].chars().count()))
            .into_iter()
            .collect();
        let sent = self
            .tracker
            .send_or_bind(
                Subject::Response(response.id),
                task.creator,
                &text,
                SendOptions {
                    reply_to: task.creator_reply_message_id,
                    entities,
                    ..SendOptions::default()
                },
            )
            .await?;

        if let Err(error) = self
            .verifier
            .verify_and_notify(task.creator.into(), &sent, actor)
            .await
        {
            self.tracker
                .bindings()
                .delete_for_subject(Subject::Response(response.id))
                .await?;
            self.tasks.delete_response(response.id).await?;
            return Err(error);
        }

        tracing::info!(
            task = %task.id,
            respondent = %actor.id,
            option = %option.id,
            "offer recorded"
        );

        let tag = self.broadcaster.task_tag(&task).await?;
        self.tracker
            .edit_or_resend(
                Subject::Task(task.id),
                actor.id,
                &render::offer_sent_view(&task, tag.as_ref()),
                Some(markup::retract_offer(response.id)),
            )
            .await?;
        Ok(response)
    }

    /// Retract an offer: delete the creator's notification, drop the
    /// response row, and restore the respondent's view of the task.
    pub async fn respond_cancel(&self, response: ResponseId, actor: UserId) -> Result<()> {
        let response = self
            .tasks
            .response(response)
            .await?
            .filter(|r| r.respondent == actor)
            .ok_or(Error::NotFound(NotFound::Response))?;
        let task = self
            .tasks
            .task(response.task_id)
            .await?
            .ok_or(Error::NotFound(NotFound::Task))?;

        self.tracker
            .purge_subject(Subject::Response(response.id))
            .await?;
        self.tasks.delete_response(response.id).await?;
        tracing::info!(task = %task.id, respondent = %actor, "offer retracted");

        let tag = self.broadcaster.task_tag(&task).await?;
        let (text, restored) = match task.stage {
            Stage::Created => {
                let options = self.catalog.payment_options().await?;
                (
                    render::offer_removed_view(&task, tag.as_ref()),
                    Some(markup::offer_options(task.id, &options)),
                )
            }
            Stage::Closed => (render::closed_view(&task, tag.as_ref()), None),
        };
        self.tracker
            .edit_or_resend(Subject::Task(task.id), actor, &text, restored)
            .await?;
        Ok(())
    }

    /// Send the creator confirmation, remember its message id as the
    /// reply anchor for offer notifications, and fan the task out.
    async fn announce(
        &self,
        task: &Task,
        creator_template: fn(&Task, Option<&Tag>) -> String,
    ) -> Result<()> {
        let attachments = self.tasks.attachments(task.id).await?;
        let tag = self.broadcaster.task_tag(task).await?;

        let confirmation = self
            .broadcaster
            .deliver(
                task,
                &attachments,
                task.creator,
                &creator_template(task, tag.as_ref()),
                Some(markup::creator_controls(task.id)),
            )
            .await?;
        self.tasks
            .set_creator_reply_message(task.id, confirmation)
            .await?;

        let options = self.catalog.payment_options().await?;
        self.broadcaster
            .broadcast_new(task, markup::offer_options(task.id, &options))
            .await?;
        Ok(())
    }

    async fn owned_task(&self, task: TaskId, actor: UserId) -> Result<Task> {
        self.tasks
            .task_for_creator(task, actor)
            .await?
            .ok_or(Error::NotFound(NotFound::Task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BindingStore;
    use crate::testing::{
        memory_pool, seed_payment_option, seed_user, set_can_publish, GatewayCall, MockGateway,
    };
    use crate::types::AttachmentKind;
    use std::time::Duration;

    struct Fixture {
        gateway: Arc<MockGateway>,
        lifecycle: Lifecycle,
        tasks: TaskStore,
        bindings: BindingStore,
        pool: sqlx::SqlitePool,
        option: PaymentOptionId,
    }

    async fn fixture() -> Fixture {
        let pool = memory_pool().await;
        seed_user(&pool, 1, "Creator", Some("creator")).await;
        seed_user(&pool, 2, "Master", Some("master")).await;
        seed_user(&pool, 3, "Other", None).await;
        let option = seed_payment_option(&pool, "50/50").await;

        let gateway = Arc::new(MockGateway::new());
        let tasks = TaskStore::new(pool.clone());
        let bindings = BindingStore::new(pool.clone());
        let tracker = Arc::new(MessageTracker::new(
            gateway.clone(),
            bindings.clone(),
            tasks.clone(),
        ));
        let broadcaster = Broadcaster::new(
            tracker.clone(),
            UserStore::new(pool.clone()),
            tasks.clone(),
            CatalogStore::new(pool.clone()),
            Duration::ZERO,
            false,
        );
        let lifecycle = Lifecycle::new(
            gateway.clone(),
            tracker,
            broadcaster,
            UserStore::new(pool.clone()),
            tasks.clone(),
            CatalogStore::new(pool.clone()),
        );
        Fixture {
            gateway,
            lifecycle,
            tasks,
            bindings,
            pool,
            option,
        }
    }

    fn submission(sender: i64, text: &str) -> Submission {
        Submission {
            sender: UserId(sender),
            text: text.into(),
            attachments: vec![],
        }
    }

    async fn profile(fix: &Fixture, id: i64) -> UserProfile {
        UserStore::new(fix.pool.clone())
            .get(UserId(id))
            .await
            .expect("get user")
            .expect("user exists")
    }

    #[tokio::test]
    async fn publish_confirms_creator_and_broadcasts() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");

        // Creator confirmation carries lifecycle controls and is recorded
        // as the reply anchor.
        let creator_sends = fix.gateway.sends_to(1);
        let GatewayCall::SendText { text, markup, id, .. } = &creator_sends[0] else {
            panic!("expected creator confirmation");
        };
        assert!(text.contains("Your request"));
        assert_eq!(markup.as_ref(), Some(&markup::creator_controls(task.id)));
        let stored = fix.tasks.task(task.id).await.expect("task").expect("some");
        assert_eq!(stored.creator_reply_message_id, Some(*id));

        // Both other users got the task with offer buttons.
        for chat in [2, 3] {
            let sends = fix.gateway.sends_to(chat);
            assert_eq!(sends.len(), 1);
            let GatewayCall::SendText { markup, .. } = &sends[0] else {
                panic!("expected broadcast text");
            };
            assert!(markup.as_ref().is_some_and(|m| m.rows[0][0].label == "50/50"));
        }
    }

    #[tokio::test]
    async fn publish_without_permission_is_rejected() {
        let fix = fixture().await;
        set_can_publish(&fix.pool, 1, false).await;

        let result = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await;
        assert!(matches!(
            result,
            Err(Error::Permission(Permission::CannotPublish))
        ));
        assert!(fix.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn close_rerenders_every_view() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        fix.gateway.clear_calls();

        let closed = fix.lifecycle.close_task(task.id, UserId(1)).await.expect("close");
        assert_eq!(closed.stage, Stage::Closed);

        let GatewayCall::EditText { text, markup, .. } = &fix.gateway.sends_to(1)[0] else {
            panic!("expected creator edit");
        };
        assert!(text.contains("Request closed"));
        assert_eq!(markup.as_ref(), Some(&markup::repeat_only(task.id)));

        for chat in [2, 3] {
            let GatewayCall::EditText { text, markup, .. } = &fix.gateway.sends_to(chat)[0]
            else {
                panic!("expected recipient edit");
            };
            assert!(text.contains("Request closed"));
            assert!(markup.is_none());
        }
    }

    #[tokio::test]
    async fn close_by_non_creator_is_not_found() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");

        let result = fix.lifecycle.close_task(task.id, UserId(2)).await;
        assert!(matches!(result, Err(Error::NotFound(NotFound::Task))));
    }

    #[tokio::test]
    async fn cancel_purges_messages_and_deletes_task() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        fix.gateway.clear_calls();

        fix.lifecycle.cancel_task(task.id, UserId(1)).await.expect("cancel");

        assert!(fix.tasks.task(task.id).await.expect("query").is_none());
        assert!(fix
            .bindings
            .for_subject(Subject::Task(task.id))
            .await
            .expect("rows")
            .is_empty());
        // One remote delete per previously sent rendering (creator + 2).
        let deletes = fix
            .gateway
            .calls()
            .iter()
            .filter(|call| matches!(call, GatewayCall::Delete { .. }))
            .count();
        assert_eq!(deletes, 3);
    }

    #[tokio::test]
    async fn repeat_drops_offers_and_rebroadcasts() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        let master = profile(&fix, 2).await;
        fix.lifecycle
            .respond(task.id, fix.option, &master)
            .await
            .expect("respond");
        fix.gateway.clear_calls();

        let reposted = fix.lifecycle.repeat_task(task.id, UserId(1)).await.expect("repeat");
        assert_eq!(reposted.stage, Stage::Created);
        assert!(fix.tasks.responses(task.id).await.expect("responses").is_empty());

        // Everyone got a fresh send, not an edit.
        assert!(fix
            .gateway
            .sends_to(1)
            .iter()
            .any(|call| matches!(call, GatewayCall::SendText { text, .. } if text.contains("posted again"))));
        assert!(fix
            .gateway
            .sends_to(2)
            .iter()
            .any(|call| matches!(call, GatewayCall::SendText { .. })));
    }

    #[tokio::test]
    async fn respond_notifies_creator_as_reply_and_updates_respondent() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        let anchor = fix
            .tasks
            .task(task.id)
            .await
            .expect("task")
            .expect("some")
            .creator_reply_message_id;
        fix.gateway.clear_calls();

        let master = profile(&fix, 2).await;
        let response = fix
            .lifecycle
            .respond(task.id, fix.option, &master)
            .await
            .expect("respond");

        let GatewayCall::SendText { text, reply_to, .. } = &fix.gateway.sends_to(1)[0] else {
            panic!("expected offer notification");
        };
        assert!(text.contains("@master wants to pick up"));
        assert!(text.contains("50/50"));
        assert_eq!(*reply_to, anchor);

        let GatewayCall::EditText { text, markup, .. } = &fix.gateway.sends_to(2)[0] else {
            panic!("expected respondent edit");
        };
        assert!(text.contains("Your offer was sent"));
        assert_eq!(markup.as_ref(), Some(&markup::retract_offer(response.id)));
    }

    #[tokio::test]
    async fn respond_guards_self_and_duplicate_offers() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");

        let creator = profile(&fix, 1).await;
        assert!(matches!(
            fix.lifecycle.respond(task.id, fix.option, &creator).await,
            Err(Error::Permission(Permission::SelfResponse))
        ));

        let master = profile(&fix, 2).await;
        fix.lifecycle
            .respond(task.id, fix.option, &master)
            .await
            .expect("first offer");
        assert!(matches!(
            fix.lifecycle.respond(task.id, fix.option, &master).await,
            Err(Error::Permission(Permission::DuplicateResponse))
        ));
    }

    #[tokio::test]
    async fn respond_on_closed_task_is_not_found() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        fix.lifecycle.close_task(task.id, UserId(1)).await.expect("close");

        let master = profile(&fix, 2).await;
        assert!(matches!(
            fix.lifecycle.respond(task.id, fix.option, &master).await,
            Err(Error::NotFound(NotFound::Task))
        ));
    }

    #[tokio::test]
    async fn degraded_mention_rolls_back_the_offer() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        fix.gateway.clear_calls();

        // User 3 has no handle; the provider drops the display-name mention.
        let hidden = profile(&fix, 3).await;
        fix.gateway.suppress_text_mentions(true);
        let result = fix.lifecycle.respond(task.id, fix.option, &hidden).await;
        assert!(matches!(result, Err(Error::MentionFailed { user }) if user == UserId(3)));

        // The offer and its bindings are gone and the notification was
        // retracted from the creator's chat.
        assert!(fix
            .tasks
            .response_for(task.id, UserId(3))
            .await
            .expect("query")
            .is_none());
        assert!(fix
            .gateway
            .sends_to(1)
            .iter()
            .any(|call| matches!(call, GatewayCall::Delete { .. })));
        // The respondent got the privacy instruction, not an offer view.
        assert!(fix
            .gateway
            .sends_to(3)
            .iter()
            .any(|call| matches!(call, GatewayCall::SendText { text, .. } if text.contains("privacy"))));
        assert!(!fix
            .gateway
            .sends_to(3)
            .iter()
            .any(|call| matches!(call, GatewayCall::EditText { .. })));
    }

    #[tokio::test]
    async fn respond_cancel_retracts_notification_and_restores_view() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        let master = profile(&fix, 2).await;
        let response = fix
            .lifecycle
            .respond(task.id, fix.option, &master)
            .await
            .expect("respond");
        fix.gateway.clear_calls();

        fix.lifecycle
            .respond_cancel(response.id, UserId(2))
            .await
            .expect("retract");

        assert!(fix.tasks.response(response.id).await.expect("query").is_none());
        assert!(fix
            .bindings
            .for_subject(Subject::Response(response.id))
            .await
            .expect("rows")
            .is_empty());
        assert!(fix
            .gateway
            .sends_to(1)
            .iter()
            .any(|call| matches!(call, GatewayCall::Delete { .. })));

        let GatewayCall::EditText { text, markup, .. } = &fix.gateway.sends_to(2)[0] else {
            panic!("expected respondent edit");
        };
        assert!(text.contains("Your offer was removed"));
        assert!(markup.as_ref().is_some_and(|m| m.rows[0][0].label == "50/50"));
    }

    #[tokio::test]
    async fn respond_cancel_by_stranger_is_not_found() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        let master = profile(&fix, 2).await;
        let response = fix
            .lifecycle
            .respond(task.id, fix.option, &master)
            .await
            .expect("respond");

        assert!(matches!(
            fix.lifecycle.respond_cancel(response.id, UserId(3)).await,
            Err(Error::NotFound(NotFound::Response))
        ));
    }

    #[tokio::test]
    async fn publish_with_attachments_threads_text_after_files() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(
                &Submission {
                    sender: UserId(1),
                    text: "Replace the cylinder lock today".into(),
                    attachments: vec![
                        ("photo-1".into(), AttachmentKind::Photo),
                        ("photo-2".into(), AttachmentKind::Photo),
                    ],
                },
                None,
            )
            .await
            .expect("publish");

        let creator_sends = fix.gateway.sends_to(1);
        let GatewayCall::SendAttachmentGroup { ids, .. } = &creator_sends[0] else {
            panic!("expected media group first");
        };
        let GatewayCall::SendText { reply_to, .. } = &creator_sends[1] else {
            panic!("expected text after attachments");
        };
        assert_eq!(*reply_to, ids.first().copied());
        assert_eq!(
            fix.tasks.attachments(task.id).await.expect("attachments").len(),
            2
        );
    }

    // Keeps the rollback honest: after a failed mention the next offer from
    // the same user must succeed (no leftover uniqueness conflict).
    #[tokio::test]
    async fn offer_can_be_retried_after_mention_failure() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");

        let hidden = profile(&fix, 3).await;
        fix.gateway.suppress_text_mentions(true);
        assert!(fix.lifecycle.respond(task.id, fix.option, &hidden).await.is_err());

        fix.gateway.suppress_text_mentions(false);
        fix.lifecycle
            .respond(task.id, fix.option, &hidden)
            .await
            .expect("retry succeeds");
    }

    #[tokio::test]
    async fn respond_to_unknown_payment_option_is_not_found() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");

        let master = profile(&fix, 2).await;
        assert!(matches!(
            fix.lifecycle
                .respond(task.id, PaymentOptionId(999), &master)
                .await,
            Err(Error::NotFound(NotFound::PaymentOption))
        ));
    }

    #[tokio::test]
    async fn cancel_also_retracts_offer_notifications() {
        let fix = fixture().await;
        let task = fix
            .lifecycle
            .publish(&submission(1, "Fix the leaking pipe in unit 4"), None)
            .await
            .expect("publish");
        let master = profile(&fix, 2).await;
        let response = fix
            .lifecycle
            .respond(task.id, fix.option, &master)
            .await
            .expect("respond");
        fix.gateway.clear_calls();

        fix.lifecycle.cancel_task(task.id, UserId(1)).await.expect("cancel");
        assert!(fix
            .bindings
            .for_subject(Subject::Response(response.id))
            .await
            .expect("rows")
            .is_empty());
        // Creator's chat lost both the rendering and the notification.
        let creator_deletes = fix
            .gateway
            .sends_to(1)
            .iter()
            .filter(|call| matches!(call, GatewayCall::Delete { .. }))
            .count();
        assert_eq!(creator_deletes, 2);
    }
}

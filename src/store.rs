//! Persistence stores, each a thin wrapper over the shared SQLite pool.

use crate::error::Result;
use crate::types::{
    Attachment, AttachmentId, AttachmentKind, MessageBinding, MessageId, PaymentOption,
    PaymentOptionId, Response, ResponseId, Stage, Subject, Tag, TagId, Task, TaskId, UserId,
    UserProfile,
};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Inbound chat identity, as decoded by the transport.
#[derive(Debug, Clone)]
pub struct ChatProfile {
    pub id: UserId,
    pub first_name: String,
    pub last_name: Option<String>,
    pub handle: Option<String>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, first_name, last_name, handle, can_publish, blocked, created_at
             FROM users WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch user")?;

        Ok(row.map(UserRow::into_profile))
    }

    /// Get-or-create from an inbound chat identity, refreshing any profile
    /// fields that changed since the last update. Returns the profile and
    /// whether it was just created.
    pub async fn sync(
        &self,
        chat: &ChatProfile,
        grant_publish_on_create: bool,
    ) -> Result<(UserProfile, bool)> {
        if let Some(existing) = self.get(chat.id).await? {
            let changed = existing.first_name != chat.first_name
                || existing.last_name != chat.last_name
                || existing.handle != chat.handle;
            if !changed {
                return Ok((existing, false));
            }
            sqlx::query("UPDATE users SET first_name = ?, last_name = ?, handle = ? WHERE id = ?")
                .bind(&chat.first_name)
                .bind(&chat.last_name)
                .bind(&chat.handle)
                .bind(chat.id.0)
                .execute(&self.pool)
                .await
                .context("failed to update user profile")?;
            let refreshed = UserProfile {
                first_name: chat.first_name.clone(),
                last_name: chat.last_name.clone(),
                handle: chat.handle.clone(),
                ..existing
            };
            return Ok((refreshed, false));
        }

        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, first_name, last_name, handle, can_publish, blocked, created_at)
             VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(chat.id.0)
        .bind(&chat.first_name)
        .bind(&chat.last_name)
        .bind(&chat.handle)
        .bind(grant_publish_on_create)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert user")?;

        Ok((
            UserProfile {
                id: chat.id,
                first_name: chat.first_name.clone(),
                last_name: chat.last_name.clone(),
                handle: chat.handle.clone(),
                can_publish: grant_publish_on_create,
                blocked: false,
                created_at,
            },
            true,
        ))
    }

    /// All non-blocked registered users except `exclude`.
    pub async fn eligible_recipients(&self, exclude: UserId) -> Result<Vec<UserProfile>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, first_name, last_name, handle, can_publish, blocked, created_at
             FROM users WHERE blocked = 0 AND id != ? ORDER BY id ASC",
        )
        .bind(exclude.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch eligible recipients")?;

        Ok(rows.into_iter().map(UserRow::into_profile).collect())
    }

    /// Non-blocked users subscribed to `tag`, except `exclude`.
    pub async fn subscribers_of(&self, tag: TagId, exclude: UserId) -> Result<Vec<UserProfile>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT u.id, u.first_name, u.last_name, u.handle, u.can_publish, u.blocked, u.created_at
             FROM users u
             JOIN tag_subscriptions s ON s.user_id = u.id
             WHERE s.tag_id = ? AND u.blocked = 0 AND u.id != ?
             ORDER BY u.id ASC",
        )
        .bind(tag.0)
        .bind(exclude.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch tag subscribers")?;

        Ok(rows.into_iter().map(UserRow::into_profile).collect())
    }
}

#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn payment_option(&self, id: PaymentOptionId) -> Result<Option<PaymentOption>> {
        let row = sqlx::query_as::<_, PaymentOptionRow>(
            "SELECT id, name, description FROM payment_options WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch payment option")?;

        Ok(row.map(PaymentOptionRow::into_option))
    }

    pub async fn payment_options(&self) -> Result<Vec<PaymentOption>> {
        let rows = sqlx::query_as::<_, PaymentOptionRow>(
            "SELECT id, name, description FROM payment_options ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch payment options")?;

        Ok(rows.into_iter().map(PaymentOptionRow::into_option).collect())
    }

    pub async fn tag(&self, id: TagId) -> Result<Option<Tag>> {
        let row = sqlx::query_as::<_, TagRow>("SELECT id, name FROM tags WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch tag")?;

        Ok(row.map(TagRow::into_tag))
    }

    pub async fn first_tag(&self) -> Result<Option<Tag>> {
        let row = sqlx::query_as::<_, TagRow>("SELECT id, name FROM tags ORDER BY id ASC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch first tag")?;

        Ok(row.map(TagRow::into_tag))
    }

    /// Subscribe a user to every existing tag. Used at registration when
    /// tag filtering is enabled.
    pub async fn subscribe_all_tags(&self, user: UserId) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO tag_subscriptions (user_id, tag_id)
             SELECT ?, id FROM tags",
        )
        .bind(user.0)
        .execute(&self.pool)
        .await
        .context("failed to subscribe user to tags")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_task(
        &self,
        body: &str,
        creator: UserId,
        tag: Option<TagId>,
    ) -> Result<Task> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO tasks (body, creator_id, tag_id, stage, created_at)
             VALUES (?, ?, ?, 'created', ?)",
        )
        .bind(body)
        .bind(creator.0)
        .bind(tag.map(|t| t.0))
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert task")?;

        Ok(Task {
            id: TaskId(result.last_insert_rowid()),
            body: body.to_string(),
            creator,
            tag,
            stage: Stage::Created,
            creator_reply_message_id: None,
            created_at,
        })
    }

    pub async fn task(&self, id: TaskId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, body, creator_id, tag_id, stage, creator_reply_message_id, created_at
             FROM tasks WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch task")?;

        row.map(TaskRow::into_task).transpose()
    }

    /// Task lookup scoped to its creator. Ownership mismatches come back as
    /// `None`, which callers surface as not-found.
    pub async fn task_for_creator(&self, id: TaskId, creator: UserId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, body, creator_id, tag_id, stage, creator_reply_message_id, created_at
             FROM tasks WHERE id = ? AND creator_id = ?",
        )
        .bind(id.0)
        .bind(creator.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch task for creator")?;

        row.map(TaskRow::into_task).transpose()
    }

    pub async fn set_stage(&self, id: TaskId, stage: Stage) -> Result<()> {
        sqlx::query("UPDATE tasks SET stage = ? WHERE id = ?")
            .bind(stage.as_str())
            .bind(id.0)
            .execute(&self.pool)
            .await
            .context("failed to update task stage")?;
        Ok(())
    }

    pub async fn set_creator_reply_message(&self, id: TaskId, message: MessageId) -> Result<()> {
        sqlx::query("UPDATE tasks SET creator_reply_message_id = ? WHERE id = ?")
            .bind(message.0)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .context("failed to update creator reply message")?;
        Ok(())
    }

    /// Delete the task row. Attachments and responses cascade.
    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .context("failed to delete task")?;
        Ok(())
    }

    pub async fn count_created_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE created_at >= ?")
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .context("failed to count tasks")?;
        Ok(count.0)
    }

    pub async fn add_attachment(
        &self,
        task: TaskId,
        file_ref: &str,
        kind: AttachmentKind,
    ) -> Result<Attachment> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO attachments (task_id, file_ref, kind, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task.0)
        .bind(file_ref)
        .bind(kind.as_str())
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert attachment")?;

        Ok(Attachment {
            id: AttachmentId(result.last_insert_rowid()),
            task_id: task,
            file_ref: file_ref.to_string(),
            kind,
            created_at,
        })
    }

    pub async fn attachments(&self, task: TaskId) -> Result<Vec<Attachment>> {
        let rows = sqlx::query_as::<_, AttachmentRow>(
            "SELECT id, task_id, file_ref, kind, created_at
             FROM attachments WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch attachments")?;

        rows.into_iter().map(AttachmentRow::into_attachment).collect()
    }

    pub async fn create_response(
        &self,
        task: TaskId,
        respondent: UserId,
        option: PaymentOptionId,
    ) -> Result<Response> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO responses (task_id, respondent_id, payment_option_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(task.0)
        .bind(respondent.0)
        .bind(option.0)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert response")?;

        Ok(Response {
            id: ResponseId(result.last_insert_rowid()),
            task_id: task,
            respondent,
            payment_option: option,
            created_at,
        })
    }

    pub async fn response(&self, id: ResponseId) -> Result<Option<Response>> {
        let row = sqlx::query_as::<_, ResponseRow>(
            "SELECT id, task_id, respondent_id, payment_option_id, created_at
             FROM responses WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch response")?;

        Ok(row.map(ResponseRow::into_response))
    }

    pub async fn response_for(
        &self,
        task: TaskId,
        respondent: UserId,
    ) -> Result<Option<Response>> {
        let row = sqlx::query_as::<_, ResponseRow>(
            "SELECT id, task_id, respondent_id, payment_option_id, created_at
             FROM responses WHERE task_id = ? AND respondent_id = ?",
        )
        .bind(task.0)
        .bind(respondent.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch response for respondent")?;

        Ok(row.map(ResponseRow::into_response))
    }

    pub async fn responses(&self, task: TaskId) -> Result<Vec<Response>> {
        let rows = sqlx::query_as::<_, ResponseRow>(
            "SELECT id, task_id, respondent_id, payment_option_id, created_at
             FROM responses WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch responses")?;

        Ok(rows.into_iter().map(ResponseRow::into_response).collect())
    }

    pub async fn delete_response(&self, id: ResponseId) -> Result<()> {
        sqlx::query("DELETE FROM responses WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .context("failed to delete response")?;
        Ok(())
    }

    pub async fn delete_responses(&self, task: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM responses WHERE task_id = ?")
            .bind(task.0)
            .execute(&self.pool)
            .await
            .context("failed to delete responses")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct BindingStore {
    pool: SqlitePool,
}

impl BindingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        subject: Subject,
        recipient: UserId,
        message: MessageId,
    ) -> Result<MessageBinding> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO message_bindings (subject_kind, subject_id, recipient_id, message_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(subject.kind_str())
        .bind(subject.raw_id())
        .bind(recipient.0)
        .bind(message.0)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert message binding")?;

        Ok(MessageBinding {
            id: result.last_insert_rowid(),
            subject,
            recipient,
            message_id: message,
            created_at,
        })
    }

    /// Most recent binding for (subject, recipient) — the only one live
    /// for edits.
    pub async fn latest(
        &self,
        subject: Subject,
        recipient: UserId,
    ) -> Result<Option<MessageBinding>> {
        let row = sqlx::query_as::<_, BindingRow>(
            "SELECT id, subject_kind, subject_id, recipient_id, message_id, created_at
             FROM message_bindings
             WHERE subject_kind = ? AND subject_id = ? AND recipient_id = ?
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(subject.kind_str())
        .bind(subject.raw_id())
        .bind(recipient.0)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch latest binding")?;

        row.map(BindingRow::into_binding).transpose()
    }

    pub async fn for_subject(&self, subject: Subject) -> Result<Vec<MessageBinding>> {
        let rows = sqlx::query_as::<_, BindingRow>(
            "SELECT id, subject_kind, subject_id, recipient_id, message_id, created_at
             FROM message_bindings
             WHERE subject_kind = ? AND subject_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(subject.kind_str())
        .bind(subject.raw_id())
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch bindings for subject")?;

        rows.into_iter().map(BindingRow::into_binding).collect()
    }

    /// Distinct recipients holding a binding for the subject.
    pub async fn recipients_of(&self, subject: Subject) -> Result<Vec<UserId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT recipient_id FROM message_bindings
             WHERE subject_kind = ? AND subject_id = ? ORDER BY recipient_id ASC",
        )
        .bind(subject.kind_str())
        .bind(subject.raw_id())
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch binding recipients")?;

        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }

    pub async fn delete_by_id(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM message_bindings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete binding")?;
        Ok(())
    }

    pub async fn delete_for_subject(&self, subject: Subject) -> Result<()> {
        sqlx::query("DELETE FROM message_bindings WHERE subject_kind = ? AND subject_id = ?")
            .bind(subject.kind_str())
            .bind(subject.raw_id())
            .execute(&self.pool)
            .await
            .context("failed to delete bindings for subject")?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    first_name: String,
    last_name: Option<String>,
    handle: Option<String>,
    can_publish: bool,
    blocked: bool,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn into_profile(self) -> UserProfile {
        UserProfile {
            id: UserId(self.id),
            first_name: self.first_name,
            last_name: self.last_name,
            handle: self.handle,
            can_publish: self.can_publish,
            blocked: self.blocked,
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PaymentOptionRow {
    id: i64,
    name: String,
    description: Option<String>,
}

impl PaymentOptionRow {
    fn into_option(self) -> PaymentOption {
        PaymentOption {
            id: PaymentOptionId(self.id),
            name: self.name,
            description: self.description,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TagRow {
    id: i64,
    name: String,
}

impl TagRow {
    fn into_tag(self) -> Tag {
        Tag {
            id: TagId(self.id),
            name: self.name,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    body: String,
    creator_id: i64,
    tag_id: Option<i64>,
    stage: String,
    creator_reply_message_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let stage = Stage::parse(&self.stage)
            .with_context(|| format!("unknown task stage `{}`", self.stage))?;
        Ok(Task {
            id: TaskId(self.id),
            body: self.body,
            creator: UserId(self.creator_id),
            tag: self.tag_id.map(TagId),
            stage,
            creator_reply_message_id: self.creator_reply_message_id.map(MessageId),
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    id: i64,
    task_id: i64,
    file_ref: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl AttachmentRow {
    fn into_attachment(self) -> Result<Attachment> {
        let kind = AttachmentKind::parse(&self.kind)
            .with_context(|| format!("unknown attachment kind `{}`", self.kind))?;
        Ok(Attachment {
            id: AttachmentId(self.id),
            task_id: TaskId(self.task_id),
            file_ref: self.file_ref,
            kind,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResponseRow {
    id: i64,
    task_id: i64,
    respondent_id: i64,
    payment_option_id: i64,
    created_at: DateTime<Utc>,
}

impl ResponseRow {
    fn into_response(self) -> Response {
        Response {
            id: ResponseId(self.id),
            task_id: TaskId(self.task_id),
            respondent: UserId(self.respondent_id),
            payment_option: PaymentOptionId(self.payment_option_id),
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BindingRow {
    id: i64,
    subject_kind: String,
    subject_id: i64,
    recipient_id: i64,
    message_id: i64,
    created_at: DateTime<Utc>,
}

impl BindingRow {
    fn into_binding(self) -> Result<MessageBinding> {
        let subject = match self.subject_kind.as_str() {
            "task" => Subject::Task(TaskId(self.subject_id)),
            "attachment" => Subject::Attachment(AttachmentId(self.subject_id)),
            "response" => Subject::Response(ResponseId(self.subject_id)),
            other => {
                return Err(anyhow::anyhow!("unknown binding subject kind `{other}`").into())
            }
        };
        Ok(MessageBinding {
            id: self.id,
            subject,
            recipient: UserId(self.recipient_id),
            message_id: MessageId(self.message_id),
            created_at: self.created_at,
        })
    }
}

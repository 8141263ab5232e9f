//! Shared test doubles: in-memory database, recording gateway, manual
//! debounce scheduler.

use crate::gateway::{
    ActionToken, ChatRef, Gateway, GatewayError, MessageEntity, SendOptions, SentMessage,
};
use crate::markup::Markup;
use crate::submission::{DebounceKey, DebounceScheduler};
use crate::types::{AttachmentKind, MessageId, PaymentOptionId, TagId, UserId};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Single-connection in-memory pool with migrations applied. One connection
/// because every connection to `:memory:` is its own database.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

pub async fn seed_user(pool: &SqlitePool, id: i64, first_name: &str, handle: Option<&str>) {
    sqlx::query(
        "INSERT INTO users (id, first_name, last_name, handle, can_publish, blocked, created_at)
         VALUES (?, ?, NULL, ?, 1, 0, ?)",
    )
    .bind(id)
    .bind(first_name)
    .bind(handle)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("seed user");
}

pub async fn set_blocked(pool: &SqlitePool, id: i64, blocked: bool) {
    sqlx::query("UPDATE users SET blocked = ? WHERE id = ?")
        .bind(blocked)
        .bind(id)
        .execute(pool)
        .await
        .expect("set blocked");
}

pub async fn set_can_publish(pool: &SqlitePool, id: i64, can_publish: bool) {
    sqlx::query("UPDATE users SET can_publish = ? WHERE id = ?")
        .bind(can_publish)
        .bind(id)
        .execute(pool)
        .await
        .expect("set can_publish");
}

pub async fn seed_payment_option(pool: &SqlitePool, name: &str) -> PaymentOptionId {
    let result = sqlx::query("INSERT INTO payment_options (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .expect("seed payment option");
    PaymentOptionId(result.last_insert_rowid())
}

pub async fn seed_tag(pool: &SqlitePool, name: &str) -> TagId {
    let result = sqlx::query("INSERT INTO tags (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .expect("seed tag");
    TagId(result.last_insert_rowid())
}

pub async fn seed_subscription(pool: &SqlitePool, user: i64, tag: TagId) {
    sqlx::query("INSERT OR IGNORE INTO tag_subscriptions (user_id, tag_id) VALUES (?, ?)")
        .bind(user)
        .bind(tag.0)
        .execute(pool)
        .await
        .expect("seed subscription");
}

/// Everything the mock gateway was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    SendText {
        chat: ChatRef,
        text: String,
        markup: Option<Markup>,
        reply_to: Option<MessageId>,
        entities: Vec<MessageEntity>,
        id: MessageId,
    },
    EditText {
        chat: ChatRef,
        message: MessageId,
        text: String,
        markup: Option<Markup>,
    },
    Delete {
        chat: ChatRef,
        message: MessageId,
    },
    SendAttachment {
        chat: ChatRef,
        file_ref: String,
        kind: AttachmentKind,
        id: MessageId,
    },
    SendAttachmentGroup {
        chat: ChatRef,
        files: Vec<(String, AttachmentKind)>,
        ids: Vec<MessageId>,
    },
    AnswerAction {
        token: String,
        text: String,
    },
}

#[derive(Default)]
struct MockKnobs {
    /// Fail the next N edit calls with `MessageUnavailable`.
    failing_edits: usize,
    /// Answer the next edit with `NotModified`.
    not_modified_edits: usize,
    /// Every delete call fails.
    fail_deletes: bool,
    /// Chats whose text sends fail.
    failing_send_chats: HashSet<i64>,
    /// Drop `TextMention` entities from send echoes, simulating the
    /// provider degrading a mention to plain text.
    suppress_text_mentions: bool,
}

pub struct MockGateway {
    calls: Mutex<Vec<GatewayCall>>,
    knobs: Mutex<MockKnobs>,
    next_id: AtomicI64,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            knobs: Mutex::new(MockKnobs::default()),
            next_id: AtomicI64::new(1_000),
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("calls lock").clear();
    }

    pub fn fail_next_edits(&self, n: usize) {
        self.knobs.lock().expect("knobs lock").failing_edits = n;
    }

    pub fn not_modified_next_edits(&self, n: usize) {
        self.knobs.lock().expect("knobs lock").not_modified_edits = n;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.knobs.lock().expect("knobs lock").fail_deletes = fail;
    }

    pub fn fail_sends_to(&self, chat: i64) {
        self.knobs
            .lock()
            .expect("knobs lock")
            .failing_send_chats
            .insert(chat);
    }

    pub fn suppress_text_mentions(&self, suppress: bool) {
        self.knobs.lock().expect("knobs lock").suppress_text_mentions = suppress;
    }

    pub fn sends_to(&self, chat: i64) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                GatewayCall::SendText { chat: c, .. }
                | GatewayCall::EditText { chat: c, .. }
                | GatewayCall::Delete { chat: c, .. }
                | GatewayCall::SendAttachment { chat: c, .. }
                | GatewayCall::SendAttachmentGroup { chat: c, .. } => c.0 == chat,
                GatewayCall::AnswerAction { .. } => false,
            })
            .collect()
    }

    fn allocate_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn send_text(
        &self,
        chat: ChatRef,
        text: &str,
        opts: SendOptions,
    ) -> Result<SentMessage, GatewayError> {
        let suppress = {
            let knobs = self.knobs.lock().expect("knobs lock");
            if knobs.failing_send_chats.contains(&chat.0) {
                return Err(GatewayError::Request(format!("send to {chat} refused")));
            }
            knobs.suppress_text_mentions
        };

        let id = self.allocate_id();
        let echoed: Vec<MessageEntity> = if suppress {
            opts.entities
                .iter()
                .filter(|e| !matches!(e, MessageEntity::TextMention { .. }))
                .cloned()
                .collect()
        } else {
            opts.entities.clone()
        };

        self.record(GatewayCall::SendText {
            chat,
            text: text.to_string(),
            markup: opts.markup,
            reply_to: opts.reply_to,
            entities: echoed.clone(),
            id,
        });
        Ok(SentMessage { id, entities: echoed })
    }

    async fn edit_text(
        &self,
        chat: ChatRef,
        message: MessageId,
        text: &str,
        markup: Option<Markup>,
    ) -> Result<(), GatewayError> {
        {
            let mut knobs = self.knobs.lock().expect("knobs lock");
            if knobs.failing_edits > 0 {
                knobs.failing_edits -= 1;
                return Err(GatewayError::MessageUnavailable("message to edit not found".into()));
            }
            if knobs.not_modified_edits > 0 {
                knobs.not_modified_edits -= 1;
                return Err(GatewayError::NotModified);
            }
        }
        self.record(GatewayCall::EditText {
            chat,
            message,
            text: text.to_string(),
            markup,
        });
        Ok(())
    }

    async fn delete_message(
        &self,
        chat: ChatRef,
        message: MessageId,
    ) -> Result<(), GatewayError> {
        let fail = self.knobs.lock().expect("knobs lock").fail_deletes;
        self.record(GatewayCall::Delete { chat, message });
        if fail {
            return Err(GatewayError::MessageUnavailable("message to delete not found".into()));
        }
        Ok(())
    }

    async fn send_attachment(
        &self,
        chat: ChatRef,
        file_ref: &str,
        kind: AttachmentKind,
        _reply_to: Option<MessageId>,
    ) -> Result<SentMessage, GatewayError> {
        let id = self.allocate_id();
        self.record(GatewayCall::SendAttachment {
            chat,
            file_ref: file_ref.to_string(),
            kind,
            id,
        });
        Ok(SentMessage {
            id,
            entities: Vec::new(),
        })
    }

    async fn send_attachment_group(
        &self,
        chat: ChatRef,
        files: &[(String, AttachmentKind)],
    ) -> Result<Vec<SentMessage>, GatewayError> {
        let ids: Vec<MessageId> = files.iter().map(|_| self.allocate_id()).collect();
        self.record(GatewayCall::SendAttachmentGroup {
            chat,
            files: files.to_vec(),
            ids: ids.clone(),
        });
        Ok(ids
            .into_iter()
            .map(|id| SentMessage {
                id,
                entities: Vec::new(),
            })
            .collect())
    }

    async fn answer_action(&self, token: &ActionToken, text: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::AnswerAction {
            token: token.0.clone(),
            text: text.to_string(),
        });
        Ok(())
    }
}

/// Scheduler that records requests instead of sleeping. Tests drive expiry
/// by calling the aggregator's `timer_fired` directly.
#[derive(Default)]
pub struct ManualScheduler {
    scheduled: Mutex<Vec<(DebounceKey, Duration)>>,
    cancelled: Mutex<Vec<DebounceKey>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<(DebounceKey, Duration)> {
        self.scheduled.lock().expect("scheduled lock").clone()
    }

    pub fn cancelled(&self) -> Vec<DebounceKey> {
        self.cancelled.lock().expect("cancelled lock").clone()
    }
}

impl DebounceScheduler for ManualScheduler {
    fn schedule(&self, key: DebounceKey, delay: Duration) {
        self.scheduled.lock().expect("scheduled lock").push((key, delay));
    }

    fn cancel(&self, key: &DebounceKey) {
        self.cancelled.lock().expect("cancelled lock").push(key.clone());
    }
}

/// Chat profile helper for dispatcher tests.
pub fn chat_profile(id: i64, first_name: &str, handle: Option<&str>) -> crate::store::ChatProfile {
    crate::store::ChatProfile {
        id: UserId(id),
        first_name: first_name.to_string(),
        last_name: None,
        handle: handle.map(str::to_string),
    }
}

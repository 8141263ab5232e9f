//! Domain model: tasks, attachments, responses, users and the message
//! binding ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(TaskId);
id_newtype!(AttachmentId);
id_newtype!(ResponseId);
id_newtype!(PaymentOptionId);
id_newtype!(TagId);

/// Externally issued message identifier.
id_newtype!(MessageId);

/// Task lifecycle stage. Cancel deletes the row, so there is no stage for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Closed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "created" => Some(Stage::Created),
            "closed" => Some(Stage::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Photo,
    Video,
    Document,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Photo => "photo",
            AttachmentKind::Video => "video",
            AttachmentKind::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<AttachmentKind> {
        match s {
            "photo" => Some(AttachmentKind::Photo),
            "video" => Some(AttachmentKind::Video),
            "document" => Some(AttachmentKind::Document),
            _ => None,
        }
    }

    /// Whether the kind can travel inside a media group.
    pub fn groupable(&self) -> bool {
        matches!(self, AttachmentKind::Photo | AttachmentKind::Video)
    }
}

/// A posted job awaiting offers, owned by its creator.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub body: String,
    pub creator: UserId,
    pub tag: Option<TagId>,
    pub stage: Stage,
    /// Creator-side message that offer notifications reply to.
    pub creator_reply_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: AttachmentId,
    pub task_id: TaskId,
    pub file_ref: String,
    pub kind: AttachmentKind,
    pub created_at: DateTime<Utc>,
}

/// A respondent's claim on a task, carrying a payment-option choice.
/// Unique per (task, respondent).
#[derive(Debug, Clone)]
pub struct Response {
    pub id: ResponseId,
    pub task_id: TaskId,
    pub respondent: UserId,
    pub payment_option: PaymentOptionId,
    pub created_at: DateTime<Utc>,
}

/// Logical subject a sent message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Task(TaskId),
    Attachment(AttachmentId),
    Response(ResponseId),
}

impl Subject {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Subject::Task(_) => "task",
            Subject::Attachment(_) => "attachment",
            Subject::Response(_) => "response",
        }
    }

    pub fn raw_id(&self) -> i64 {
        match self {
            Subject::Task(id) => id.0,
            Subject::Attachment(id) => id.0,
            Subject::Response(id) => id.0,
        }
    }
}

/// Record of which external message currently represents a subject to a
/// recipient. Append-only; only the most recent row is live for edits.
#[derive(Debug, Clone)]
pub struct MessageBinding {
    pub id: i64,
    pub subject: Subject,
    pub recipient: UserId,
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: UserId,
    pub first_name: String,
    pub last_name: Option<String>,
    /// Public handle, when the user has one. A handle mention never
    /// degrades, so its presence short-circuits privacy verification.
    pub handle: Option<String>,
    pub can_publish: bool,
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {last}", self.first_name),
            _ => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentOption {
    pub id: PaymentOptionId,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips() {
        for stage in [Stage::Created, Stage::Closed] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("pending"), None);
    }

    #[test]
    fn display_name_skips_empty_last_name() {
        let mut user = UserProfile {
            id: UserId(1),
            first_name: "Ada".into(),
            last_name: Some(String::new()),
            handle: None,
            can_publish: false,
            blocked: false,
            created_at: Utc::now(),
        };
        assert_eq!(user.display_name(), "Ada");
        user.last_name = Some("Lovelace".into());
        assert_eq!(user.display_name(), "Ada Lovelace");
    }
}

//! Message templates and MarkdownV2 escaping.

use crate::config::Links;
use crate::types::{Tag, Task};

/// Escape MarkdownV2 special characters in user-provided text.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(
            ch,
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '='
                | '|' | '{' | '}' | '.' | '!'
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Canonical rendering of a task body. Always derived from current state;
/// message bindings only remember where this was last sent.
pub fn task_body(task: &Task, tag: Option<&Tag>) -> String {
    let tag_line = tag
        .map(|t| format!("\n*Tag:* {}", escape_markdown(&t.name)))
        .unwrap_or_default();
    format!(
        "*Request \\#{}:*{tag_line}\n*Description:* {}\n",
        task.id,
        escape_markdown(&task.body)
    )
}

pub fn creator_view(task: &Task, tag: Option<&Tag>) -> String {
    format!("*Your request*:\n{}", task_body(task, tag))
}

pub fn reposted_view(task: &Task, tag: Option<&Tag>) -> String {
    format!("*Request posted again*:\n{}", task_body(task, tag))
}

pub fn closed_view(task: &Task, tag: Option<&Tag>) -> String {
    format!("*Request closed*\n\n{}", task_body(task, tag))
}

pub fn offer_sent_view(task: &Task, tag: Option<&Tag>) -> String {
    format!("*Your offer was sent*\n\n{}", task_body(task, tag))
}

pub fn offer_removed_view(task: &Task, tag: Option<&Tag>) -> String {
    format!("*Your offer was removed*\n\n{}", task_body(task, tag))
}

/// Notification line sent to the creator when someone claims the task.
/// `mention_text` is already rendered; the caller owns entity placement.
pub fn offer_notification(mention_text: &str, task: &Task, option_name: &str) -> String {
    format!(
        "Master {mention_text} wants to pick up request {} {option_name}",
        task.id
    )
}

pub fn welcome_text(links: &Links) -> String {
    format!(
        "To get access, contact the [admin]({})\nAfter you are added, press Start",
        links.support
    )
}

pub const CHAT_ACTIVE_TEXT: &str =
    "Chat is active, you can post and take requests. Enjoy";

pub const BLOCKED_TEXT: &str = "Your account is blocked.";

pub const PRIVACY_INSTRUCTION_TEXT: &str = "Telegram could not create a link to your name. \
Add the bot to your privacy exceptions: *Telegram Settings → Privacy → Forwarded Messages*.";

pub fn rules_text(links: &Links) -> String {
    format!("Usage rules: {}", links.rules)
}

pub fn general_chat_text(links: &Links) -> String {
    format!("General chat: {}", links.general_chat)
}

pub fn admin_text(links: &Links) -> String {
    format!(
        "The admin may take a few hours to reply.\nIf you need help right now, message the [admin]({})",
        links.support
    )
}

pub fn today_text(date: &str, count: i64) -> String {
    let noun = if count == 1 { "request" } else { "requests" };
    format!("{count} {noun} posted on {date}")
}

//! Submission aggregation: merges multi-part inbound content (a caption plus
//! zero or more attached files, possibly arriving as an album) into one
//! logical submission under a debounce window.
//!
//! All cache state lives behind one mutex; resolution decisions are made
//! while holding it and gateway I/O never happens under it. A timer firing
//! concurrently with a new unit for the same key either sees the pending
//! entry (and consumes it) or finds it already taken — never both.

use crate::error::ValidationError;
use crate::types::{AttachmentKind, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Debounce timer key: one per pending sender text, one per pending album.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DebounceKey {
    Sender(UserId),
    Group(String),
}

/// Scheduler capability injected into the aggregator so tests can drive
/// virtual time. `schedule` replaces any timer already armed for the key.
pub trait DebounceScheduler: Send + Sync + 'static {
    fn schedule(&self, key: DebounceKey, delay: Duration);
    fn cancel(&self, key: &DebounceKey);
}

/// Tokio-backed scheduler: one abortable sleep task per key, expiry
/// reported through an mpsc channel the dispatcher drains. A timer that
/// fires naturally removes its own map entry; group keys are unique per
/// album, so the map would otherwise grow without bound.
pub struct TokioScheduler {
    timers: Arc<Mutex<HashMap<DebounceKey, JoinHandle<()>>>>,
    expired_tx: mpsc::UnboundedSender<DebounceKey>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DebounceKey>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        (
            Self {
                timers: Arc::new(Mutex::new(HashMap::new())),
                expired_tx,
            },
            expired_rx,
        )
    }
}

impl DebounceScheduler for TokioScheduler {
    fn schedule(&self, key: DebounceKey, delay: Duration) {
        let tx = self.expired_tx.clone();
        let timers = Arc::clone(&self.timers);
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.lock().expect("timer lock").remove(&fire_key);
            // Receiver gone means the dispatcher is shutting down.
            let _ = tx.send(fire_key);
        });
        if let Some(previous) = self.timers.lock().expect("timer lock").insert(key, handle) {
            previous.abort();
        }
    }

    fn cancel(&self, key: &DebounceKey) {
        if let Some(handle) = self.timers.lock().expect("timer lock").remove(key) {
            handle.abort();
        }
    }
}

/// One photo rendition offered by the provider.
#[derive(Debug, Clone)]
pub struct PhotoVariant {
    pub file_ref: String,
    pub width: u32,
    pub height: u32,
}

/// File payload of an attachment unit.
#[derive(Debug, Clone)]
pub enum AttachmentFile {
    /// Photos arrive as several renditions; only the largest is kept.
    Photo(Vec<PhotoVariant>),
    Single(String),
}

/// One inbound unit as decoded by the transport.
#[derive(Debug, Clone)]
pub enum InboundUnit {
    Text {
        sender: UserId,
        text: String,
    },
    Attachment {
        sender: UserId,
        /// Shared album id when parts arrive together.
        group: Option<String>,
        kind: AttachmentKind,
        file: AttachmentFile,
        caption: Option<String>,
    },
}

/// A fully aggregated submission: exactly one text plus the collected files.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub sender: UserId,
    pub text: String,
    pub attachments: Vec<(String, AttachmentKind)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Submission(Submission),
    Rejected {
        sender: UserId,
        reason: ValidationError,
    },
}

struct PendingGroup {
    sender: UserId,
    parts: Vec<(String, AttachmentKind)>,
    caption: Option<String>,
}

#[derive(Default)]
struct AggregatorState {
    /// Per-sender cached text awaiting a possible album merge.
    texts: HashMap<UserId, String>,
    /// Per-album cached parts awaiting the debounce window.
    groups: HashMap<String, PendingGroup>,
}

pub struct SubmissionAggregator<S: DebounceScheduler> {
    state: Mutex<AggregatorState>,
    scheduler: S,
    text_debounce: Duration,
    group_debounce: Duration,
    min_text_length: usize,
}

impl<S: DebounceScheduler> SubmissionAggregator<S> {
    pub fn new(
        scheduler: S,
        text_debounce: Duration,
        group_debounce: Duration,
        min_text_length: usize,
    ) -> Self {
        Self {
            state: Mutex::new(AggregatorState::default()),
            scheduler,
            text_debounce,
            group_debounce,
            min_text_length,
        }
    }

    /// Accept one inbound unit. Returns a resolution only for units that
    /// complete immediately (lone captioned attachments); everything else
    /// waits for its debounce timer.
    pub fn accept(&self, unit: InboundUnit) -> Option<Resolution> {
        match unit {
            InboundUnit::Text { sender, text } => {
                {
                    let mut state = self.state.lock().expect("aggregator lock");
                    state.texts.insert(sender, text);
                }
                self.scheduler
                    .schedule(DebounceKey::Sender(sender), self.text_debounce);
                None
            }
            InboundUnit::Attachment {
                sender,
                group: Some(group),
                kind,
                file,
                caption,
            } => {
                let part = (best_file_ref(file), kind);
                let is_new_group = {
                    let mut state = self.state.lock().expect("aggregator lock");
                    let is_new = !state.groups.contains_key(&group);
                    let pending = state.groups.entry(group.clone()).or_insert(PendingGroup {
                        sender,
                        parts: Vec::new(),
                        caption: None,
                    });
                    pending.parts.push(part);
                    if pending.caption.is_none() {
                        pending.caption = caption;
                    }
                    is_new
                };
                if is_new_group {
                    self.scheduler
                        .schedule(DebounceKey::Group(group), self.group_debounce);
                }
                None
            }
            InboundUnit::Attachment {
                sender,
                group: None,
                kind,
                file,
                caption,
            } => {
                // A lone attachment has no album window. Its caption, or a
                // pending text from the same sender, resolves it on the spot.
                let text = match caption {
                    Some(caption) => Some(caption),
                    None => {
                        let taken = self
                            .state
                            .lock()
                            .expect("aggregator lock")
                            .texts
                            .remove(&sender);
                        if taken.is_some() {
                            self.scheduler.cancel(&DebounceKey::Sender(sender));
                        }
                        taken
                    }
                };
                let attachments = vec![(best_file_ref(file), kind)];
                Some(self.finish(sender, text, attachments))
            }
        }
    }

    /// A debounce timer for `key` has fired. Returns the resolution, or
    /// `None` when the pending entry was already consumed by a merge.
    pub fn timer_fired(&self, key: DebounceKey) -> Option<Resolution> {
        match key {
            DebounceKey::Sender(sender) => {
                let text = self
                    .state
                    .lock()
                    .expect("aggregator lock")
                    .texts
                    .remove(&sender)?;
                Some(self.finish(sender, Some(text), Vec::new()))
            }
            DebounceKey::Group(group) => {
                let (pending, merged_text) = {
                    let mut state = self.state.lock().expect("aggregator lock");
                    let pending = state.groups.remove(&group)?;
                    let merged_text = state.texts.remove(&pending.sender);
                    (pending, merged_text)
                };
                let sender = pending.sender;
                if merged_text.is_some() {
                    self.scheduler.cancel(&DebounceKey::Sender(sender));
                }
                let text = merged_text.or(pending.caption);
                Some(self.finish(sender, text, pending.parts))
            }
        }
    }

    fn finish(
        &self,
        sender: UserId,
        text: Option<String>,
        attachments: Vec<(String, AttachmentKind)>,
    ) -> Resolution {
        let text = match text {
            Some(text) => text.trim().to_string(),
            None => {
                return Resolution::Rejected {
                    sender,
                    reason: ValidationError::MissingText,
                }
            }
        };
        if text.chars().count() < self.min_text_length {
            return Resolution::Rejected {
                sender,
                reason: ValidationError::TooShort,
            };
        }
        Resolution::Submission(Submission {
            sender,
            text,
            attachments,
        })
    }
}

/// Pick the highest-resolution rendition of a photo; other kinds carry a
/// single reference.
fn best_file_ref(file: AttachmentFile) -> String {
    match file {
        AttachmentFile::Single(file_ref) => file_ref,
        AttachmentFile::Photo(variants) => variants
            .into_iter()
            .max_by_key(|v| u64::from(v.width) * u64::from(v.height))
            .map(|v| v.file_ref)
            .unwrap_or_default(),
    }
}

//! Task dispatch and notification engine for a task-marketplace bot.
//!
//! The crate is transport-agnostic: a host binary decodes provider updates
//! into [`dispatch::Inbound`] values, feeds them to a [`dispatch::Dispatcher`],
//! and implements [`gateway::Gateway`] over its messaging provider. The
//! engine owns everything in between: submission aggregation under debounce
//! windows, task lifecycle transitions, offer handling with mention
//! verification, message-state tracking, and rate-limited fan-out.

pub mod broadcast;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod markup;
pub mod mention;
pub mod render;
pub mod store;
pub mod submission;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcast::Broadcaster;
pub use config::Config;
pub use db::Db;
pub use dispatch::{Command, Dispatcher, Inbound};
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayError};
pub use lifecycle::Lifecycle;
pub use submission::{DebounceKey, DebounceScheduler, SubmissionAggregator, TokioScheduler};
pub use tracker::MessageTracker;

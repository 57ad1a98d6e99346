//! CIRRUS Cache - Topic/Note Model
//!
//! The in-memory mirror of one record zone: topics (parents) with their notes
//! (children), plus an orphan bucket for notes whose topic is gone or unknown.
//! Permissions are resolved here from share metadata or the same-creator
//! rule.
//!
//! This crate does no I/O. The sync layer feeds it batches and decides when
//! observers may look at it.

mod model;
mod topic_cache;

pub use model::{CachedNote, CachedTopic, Section};
pub use topic_cache::{ApplyOutcome, TopicCache};

//! NewsAcquire - news article acquisition and analysis system.
//!
//! Continuously discovers article URLs from news-site front pages, fetches
//! and parses each article into a normalized record, and feeds records
//! through a multi-stage analytical pipeline whose terminal stage submits
//! batches to a structured-output LLM API and persists the resulting
//! entity/event graph into an analytical store.

pub mod analysis;
pub mod archive;
pub mod cli;
pub mod config;
pub mod crawlers;
pub mod executor;
pub mod models;
pub mod pipeline;
pub mod reparse;
pub mod repository;
pub mod scheduler;

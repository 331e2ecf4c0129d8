//! Inbox triage worker
//!
//! Background classification of inbound mail. Jobs are pulled from a leased
//! Redis queue by a pool of workers, classified by an LLM provider behind a
//! circuit breaker (primary, then fallback), and degrade to a rule-based
//! heuristic on the final delivery attempt. Results are cached, persisted
//! to PostgreSQL and announced on a pub/sub channel.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;

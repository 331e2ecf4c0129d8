pub mod cache;
pub mod circuit_breaker;
pub mod heuristic;
pub mod memory_queue;
pub mod metrics_reporter;
pub mod orchestrator;
pub mod provider;
pub mod publisher;
pub mod queue;
pub mod worker;

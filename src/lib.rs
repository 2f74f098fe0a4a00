pub mod agent;
pub mod config;
pub mod context_log;
pub mod coordinator;
pub mod dependency;
pub mod error;
pub mod events;
pub mod feature_list;
pub mod git;
pub mod lock;
pub mod log;
pub mod prompt;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

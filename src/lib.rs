pub mod alerts;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod database;
pub mod detection;
pub mod error;
pub mod file_state;
pub mod hash;
pub mod health;
pub mod network_alerts;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod recovery;
pub mod scanner;
pub mod schema;
pub mod watcher;

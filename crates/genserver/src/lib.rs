//! Proxy server for third-party image and video generation.
//!
//! Image requests fan out through [`batch::BatchOrchestrator`]; video
//! requests become long-running tasks tracked by [`tasks::TaskTracker`];
//! finished work is kept in the quota-aware [`history::HistoryStore`].

pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod history;
pub mod model;
pub mod poll;
pub mod state;
pub mod tasks;
pub mod upstream;
pub mod validation;

pub use api::router;
pub use config::Config;
pub use state::AppState;

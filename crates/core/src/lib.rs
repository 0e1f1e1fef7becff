pub mod api;
pub mod cache;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod event_log;
pub mod poller;
pub mod session;
pub mod simulation;
pub mod store;
pub mod types;
pub mod view;

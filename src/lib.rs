pub mod api;
pub mod compose;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod health;
pub mod ingest;
pub mod panel;
pub mod shutdown;
pub mod store;
pub mod surface;

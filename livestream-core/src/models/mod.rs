pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod state;
pub mod stream_report;

pub mod config;
pub mod error;
pub mod events;
pub mod installer;
pub mod messages;
pub mod progress;
pub mod storage;

//! Shared wire and data types for the Whisper message-sync core.

pub mod api;
pub mod codec;
pub mod event;
pub mod message;

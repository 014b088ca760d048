//! `Whisper`: real-time message synchronization for a chat client.
//!
//! The [`sync`] module keeps the active conversation's message list
//! consistent across a pushed event stream ([`transport`]) and a
//! request/response API ([`api`]). [`sim`] provides an in-process backend
//! for both channels.

pub mod api;
pub mod auth;
pub mod config;
pub mod sim;
pub mod sync;
pub mod transport;

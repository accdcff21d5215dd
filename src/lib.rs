//! Realtime voice bridge.
//!
//! One duplex WebSocket per user: the browser streams microphone PCM
//! in, the bridge converts it to the upstream dialog service's wire
//! format, and synthesized speech plus dialog events stream back.

pub mod audio;
pub mod bridge;
pub mod config;
pub mod protocol;
pub mod session;
pub mod upstream;

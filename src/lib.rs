//! Several bot processes sharing the same Telegram chats, coordinating through
//! the filesystem so each event is answered once and quiet chats get nudged.

pub mod backend;
pub mod config;
pub mod coord;
pub mod engine;
pub mod telegram;

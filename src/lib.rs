#![forbid(unsafe_code)]

//! YouGen backend: video metadata, notes, transcript-grounded chat and
//! playlist batch downloads with live progress over WebSocket.

pub mod api;
pub mod chat;
pub mod config;
pub mod download;
pub mod error;
pub mod identifier;
pub mod llm;
pub mod logging;
pub mod notes;
pub mod orchestrator;
pub mod progress;
pub mod provider;
pub mod resolver;
pub mod store;
pub mod transcript;
pub mod ytdlp;

#[cfg(test)]
mod testing;

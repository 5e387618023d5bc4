//! Side-effecting adapters: remote capabilities, config files and exports.

pub mod capability;
pub mod chat;
pub mod config;
pub mod export;
pub mod prompt;
pub mod service;

//! Remote Prompt: runs coding-agent CLIs on behalf of mobile clients.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod runner;
pub mod session;
pub mod store;

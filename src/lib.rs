// agentlink
// Resumable streaming client for remote agent sessions

pub mod cli;
pub mod client;
pub mod core;
pub mod session;

// Re-export commonly used types
pub use client::{AgentClient, ClientError};
pub use core::Config;
pub use session::SessionHub;

// Error handling
pub use anyhow::{Error, Result};

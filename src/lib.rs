//! Agenthub - desktop manager for AI development CLI tools.
//!
//! This crate provides the core functionality for the agenthub CLI and its
//! background helper process: the CLI detects, installs, updates, and
//! removes AI development command-line tools, while the helper owns
//! long-lived work such as periodic update checks and pushes notifications
//! back to interested clients.
//!
//! # Architecture
//!
//! The CLI and the helper are separate OS processes coordinating over a
//! local socket:
//!
//! - **ipc** - Envelope protocol, connection framing, server, and client
//! - **helper** - Helper process body and its IPC request handler
//! - **commands** - CLI subcommand implementations
//! - **platform** - Resolved directories and helper pid bookkeeping
//! - **config** - Configuration loading/saving

pub mod commands;
pub mod config;
pub mod helper;
pub mod ipc;
pub mod platform;

// Re-export commonly used types
pub use config::Config;
pub use helper::{Helper, HelperHandler, HelperState};
pub use ipc::{Client, Envelope, Handler, IpcError, MessageType, Server};
pub use platform::Platform;

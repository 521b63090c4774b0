//! Local IPC between the CLI and the background helper.
//!
//! The CLI and the helper are separate OS processes: the CLI issues
//! commands and queries status; the helper executes long-lived work and
//! pushes notifications. This module is the channel between them.
//!
//! # Architecture
//!
//! ```text
//! Helper Process                        CLI Process
//! ┌───────────────────┐                ┌───────────────────┐
//! │ Server            │                │ Client            │
//! │  accept loop      │◄──────────────►│  reader task      │
//! │  one task per     │  JSON envelope │  pending-request  │
//! │  connection       │  documents     │  table + subs     │
//! └────────┬──────────┘                └────────┬──────────┘
//!          │ Handler                            │ send / subscribe
//!          ▼                                    ▼
//!     helper business logic                CLI commands
//! ```
//!
//! # Wire Protocol
//!
//! Each message is one [`Envelope`] serialized as a JSON document;
//! successive envelopes on a stream are concatenated documents with no
//! length prefix (parser-boundary delimited, newline-insensitive). The
//! envelope `type` strings and this framing are a stable contract between
//! independently-built CLI and helper binaries.
//!
//! Transport is a Unix domain socket on POSIX and a named pipe on Windows;
//! see [`transport`].

pub mod client;
pub mod connection;
pub mod error;
pub mod message;
pub mod payload;
pub mod server;
pub mod transport;

pub use client::Client;
pub use connection::Connection;
pub use error::IpcError;
pub use message::{Envelope, MessageType};
pub use server::{FnHandler, Handler, Server};

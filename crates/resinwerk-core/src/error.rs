// SPDX-License-Identifier: MIT
//
// Unified error types for Resinwerk.

use thiserror::Error;

/// Top-level error type for all Resinwerk operations.
///
/// The variants deliberately separate the three user-visible failure stages:
/// "device unreachable" ([`Discovery`](Error::Discovery) /
/// [`Connection`](Error::Connection)), "device refused the request"
/// ([`CommandRejected`](Error::CommandRejected)), and "transfer interrupted"
/// ([`Transfer`](Error::Transfer)).
#[derive(Debug, Error)]
pub enum Error {
    // -- Discovery / connection --
    #[error("printer discovery failed: {0}")]
    Discovery(String),

    #[error("printer connection failed: {0}")]
    Connection(String),

    // -- Protocol --
    #[error("device rejected command {cmd}: ack code {code}")]
    CommandRejected { cmd: u32, code: i64 },

    #[error("timed out waiting for {operation}")]
    Timeout { operation: &'static str },

    #[error("print start unconfirmed after {observed} status updates")]
    PrintStartUnconfirmed { observed: u32 },

    // -- Transfers --
    #[error("file transfer failed: {0}")]
    Transfer(String),

    // -- Embedded servers --
    #[error("broker error: {0}")]
    Broker(String),

    #[error("file server error: {0}")]
    FileServer(String),

    // -- Plumbing --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, Error>;

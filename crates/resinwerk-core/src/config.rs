// SPDX-License-Identifier: MIT
//
// Session and discovery configuration.
//
// Explicit objects passed into each component at construction; no
// process-wide mutable state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one printer session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on the connect and subscribe signal waits after the redirect
    /// datagram is sent.
    pub connect_timeout: Duration,
    /// Overall bound on a command/response exchange.
    pub command_timeout: Duration,
    /// Bound on each status-message wait during uploads and print starts.
    /// The printer pushes status on `status_interval_ms` cadence, so this
    /// is set to twice that by default.
    pub status_timeout: Duration,
    /// How many status messages to observe for print-start confirmation
    /// before giving up.  The printer may still have started the print;
    /// exceeding the bound is reported as its own error.
    pub print_start_status_limit: u32,
    /// Requested cadence of unsolicited status messages, in milliseconds.
    pub status_interval_ms: u32,
    /// Depth of the bounded transfer-progress channel.
    pub progress_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(10),
            print_start_status_limit: 5,
            status_interval_ms: 5000,
            progress_queue_depth: 16,
        }
    }
}

/// Tunables for UDP discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port the printers listen on.  Only tests point this anywhere
    /// other than [`crate::types::SDCP_UDP_PORT`].
    pub port: u16,
    /// How long to collect broadcast replies.
    pub broadcast_timeout: Duration,
    /// How long to wait for a unicast probe reply.
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: crate::types::SDCP_UDP_PORT,
            broadcast_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

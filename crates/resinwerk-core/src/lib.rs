// SPDX-License-Identifier: MIT
//
// Resinwerk — Core types, errors, and configuration shared across all crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DiscoveryConfig, SessionConfig};
pub use error::{Error, Result};
pub use types::*;

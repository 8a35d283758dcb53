//! Core configuration
//!
//! Settings the host layer supplies to the engine, scanner and server.
//! Defaults mirror a small-LAN deployment: 20 concurrent scan dials, a
//! 500 ms probe timeout and 1 KiB transfer chunks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Default TCP port for the connection server
pub const DEFAULT_PORT: u16 = 9182;

/// Core settings shared by the engine, scanner and server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stable opaque identifier announced to peers
    pub device_id: String,

    /// Display name announced to peers
    pub device_name: String,

    /// Operating system string announced to peers
    pub os: String,

    /// Destination root for received files
    pub inbox_dir: PathBuf,

    /// TCP port for the connection server and for dialing peers
    pub port: u16,

    /// Scan fan-out width (bounded-concurrency probe pool size)
    pub max_connections: usize,

    /// Dial timeout for discovery probes, in milliseconds
    pub timeout_ms: u64,

    /// Transfer chunk size in bytes; announced to the receiver in the
    /// manifest so both sides size their buffers identically
    pub buffer_size: u64,

    /// Subnet prefixes to sweep, in `a.b.c.d/len` notation
    pub subnets: Vec<String>,

    /// Whether inbound EXEC_CMD channels are accepted. Off by default;
    /// this hands shell access to anyone on the LAN segment.
    pub enable_remote_exec: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: Uuid::new_v4().to_string(),
            device_name: "lanlink".to_string(),
            os: std::env::consts::OS.to_string(),
            inbox_dir: PathBuf::from("files"),
            port: DEFAULT_PORT,
            max_connections: 20,
            timeout_ms: 500,
            buffer_size: 1024,
            subnets: Vec::new(),
            enable_remote_exec: false,
        }
    }
}

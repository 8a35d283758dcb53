//! LAN Link Protocol Implementation
//!
//! This library implements the lanlink peer-to-peer LAN sharing protocol:
//! active subnet discovery, text messaging, resumable file and directory
//! transfer, remote directory exploration and download, and an optional
//! remote command channel, all over one length-prefixed binary TCP protocol.

pub mod config;
pub mod device;
pub mod events;
pub mod exec;
pub mod explorer;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod transfer;
pub mod wire;

mod error;
pub use config::{Config, DEFAULT_PORT};
pub use device::{Device, Direction, FileEntry, FileTransfer, Transfer};
pub use error::{ProtocolError, Result};
pub use events::{CoreEvent, EventBus, SCAN_DONE};
pub use exec::CommandChannel;
pub use explorer::RemoteEntry;
pub use registry::Registry;
pub use scanner::{Scanner, SubnetPrefix};
pub use server::Server;
pub use transfer::Engine;

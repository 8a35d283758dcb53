//! Remote directory exploration and download
//!
//! `Explore` lists a directory on the remote peer; the empty path stands for
//! the peer's storage roots (filesystem root, home directory, and mounted
//! media). Listings are sorted directories-first, then lexicographically.
//!
//! `Get` downloads remote paths: the responder expands them exactly like an
//! outbound resource send and becomes the data producer on the same
//! connection, while the initiator drops into the ordinary receive path.
//!
//! Both sub-protocols carry the fixed magic frame after the control byte; a
//! mismatch closes the connection without any reply.

use crate::device::{Direction, FileTransfer, Transfer};
use crate::transfer::{expand_resources, timed, Engine};
use crate::wire::{self, ControlByte};
use crate::{ProtocolError, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on entries returned for a single listing
const MAX_LISTING: u64 = 65_536;

/// One entry in a remote listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub is_dir: bool,
    /// Absolute path on the remote peer
    pub path: String,
}

impl RemoteEntry {
    /// Final path component, for display
    pub fn name(&self) -> &str {
        self.path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(&self.path)
    }
}

impl Engine {
    /// List a directory on a remote peer.
    ///
    /// An empty `path` asks for the peer's storage roots. A typed
    /// [`ProtocolError::Remote`] is returned when the peer answers with an
    /// application-level error (unreadable path), distinct from connection
    /// faults.
    pub async fn explore_remote(&self, addr: IpAddr, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut stream = self.dial(SocketAddr::new(addr, self.config().port)).await?;
        wire::write_header(&mut stream, ControlByte::Explore).await?;
        wire::write_magic(&mut stream).await?;
        wire::write_string(&mut stream, path).await?;
        stream.flush().await?;
        self.read_listing(&mut stream).await
    }

    async fn read_listing<S>(&self, stream: &mut S) -> Result<Vec<RemoteEntry>>
    where
        S: AsyncRead + Unpin,
    {
        timed("listing", async {
            match wire::read_control(stream).await? {
                ControlByte::Error => {
                    let msg = wire::read_string(stream).await?;
                    return Err(ProtocolError::Remote(msg));
                }
                ControlByte::Explore => {}
                other => return Err(ProtocolError::UnexpectedControl(other as u8)),
            }

            let count = wire::read_u64(stream).await?;
            if count > MAX_LISTING {
                return Err(ProtocolError::InvalidFrame(format!(
                    "listing too large: {count} entries"
                )));
            }
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let is_dir = match wire::read_control(stream).await? {
                    ControlByte::Dir => true,
                    ControlByte::File => false,
                    other => return Err(ProtocolError::UnexpectedControl(other as u8)),
                };
                let path = wire::read_string(stream).await?;
                entries.push(RemoteEntry { is_dir, path });
            }
            Ok(entries)
        })
        .await
    }

    /// Download remote paths into the inbox.
    ///
    /// Returns the inbound transfer id once the receive completes or is
    /// canceled; resume works through the ordinary inbound-continue path.
    pub async fn download_remote(&self, addr: IpAddr, paths: &[String]) -> Result<String> {
        let mut stream = self.dial(SocketAddr::new(addr, self.config().port)).await?;
        wire::write_header(&mut stream, ControlByte::Get).await?;
        wire::write_magic(&mut stream).await?;
        wire::write_u64(&mut stream, paths.len() as u64).await?;
        for path in paths {
            wire::write_string(&mut stream, path).await?;
        }
        stream.flush().await?;
        info!(addr = %addr, paths = paths.len(), "download requested");

        // The responder now behaves exactly like a resource sender.
        let preamble = self.read_preamble(&mut stream, addr).await?;
        self.receive_transfer_body(&mut stream, &preamble).await
    }

    /// Responder for `Explore`
    pub(crate) async fn handle_explore<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        wire::read_magic(stream).await?;
        let path = timed("explore path", wire::read_string(stream)).await?;
        debug!(path, "explore request");

        match list_path(&path) {
            Ok(entries) => {
                wire::write_control(stream, ControlByte::Explore).await?;
                wire::write_u64(stream, entries.len() as u64).await?;
                for entry in entries {
                    let tag = if entry.is_dir {
                        ControlByte::Dir
                    } else {
                        ControlByte::File
                    };
                    wire::write_control(stream, tag).await?;
                    wire::write_string(stream, &entry.path).await?;
                }
            }
            Err(err) => {
                warn!(path, %err, "explore failed");
                wire::write_control(stream, ControlByte::Error).await?;
                wire::write_string(stream, &err.to_string()).await?;
            }
        }
        stream.flush().await?;
        Ok(())
    }

    /// Responder for `Get`: become the resource sender on this connection
    pub(crate) async fn handle_get<S>(&self, stream: &mut S, peer_ip: IpAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        wire::read_magic(stream).await?;
        let count = timed("get paths", wire::read_u64(stream)).await?;
        if count > MAX_LISTING {
            return Err(ProtocolError::InvalidFrame(format!(
                "download request too large: {count} paths"
            )));
        }
        let mut paths = Vec::with_capacity(count as usize);
        for _ in 0..count {
            paths.push(PathBuf::from(wire::read_string(stream).await?));
        }

        let manifest = expand_resources(&paths);
        let transfer_id = Uuid::new_v4().to_string();
        // A Get request carries no identity preamble; fall back to the
        // address when the requester has never introduced itself.
        let peer_id = self
            .registry()
            .find_device_by_addr(peer_ip)
            .map(|d| d.id)
            .unwrap_or_else(|| peer_ip.to_string());
        self.registry().upsert_transfer(Transfer::resources(
            &transfer_id,
            &peer_id,
            Direction::Outbound,
            FileTransfer::new(manifest.files, manifest.total_bytes),
        ));
        info!(peer = %peer_ip, transfer_id, paths = count, "serving download");

        self.send_transfer_body(stream, &peer_id, &transfer_id).await
    }
}

/// List a local path; the empty path yields the storage roots
pub fn list_path(path: &str) -> Result<Vec<RemoteEntry>> {
    if path.is_empty() {
        return Ok(storage_roots());
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        entries.push(RemoteEntry {
            is_dir,
            path: entry.path().to_string_lossy().into_owned(),
        });
    }
    sort_listing(&mut entries);
    Ok(entries)
}

/// Storage roots offered for the empty path: `/`, the home directory, and
/// anything mounted under the user's media directories.
fn storage_roots() -> Vec<RemoteEntry> {
    let mut roots = Vec::new();

    if Path::new("/").is_dir() {
        roots.push(RemoteEntry {
            is_dir: true,
            path: "/".to_string(),
        });
    }
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        if home.is_dir() {
            roots.push(RemoteEntry {
                is_dir: true,
                path: home.to_string_lossy().into_owned(),
            });
        }
        if let Some(user) = home.file_name() {
            for base in ["/media", "/run/media"] {
                let media = Path::new(base).join(user);
                if let Ok(mounts) = std::fs::read_dir(&media) {
                    for mount in mounts.flatten() {
                        if mount.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                            roots.push(RemoteEntry {
                                is_dir: true,
                                path: mount.path().to_string_lossy().into_owned(),
                            });
                        }
                    }
                }
            }
        }
    }

    roots
}

/// Directories first, then lexicographic by path
fn sort_listing(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.path.cmp(&b.path))
    });
}

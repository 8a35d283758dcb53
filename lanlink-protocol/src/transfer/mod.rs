//! Transfer protocol engine
//!
//! Implements the symmetric peer protocol: identity exchange, message
//! delivery, resumable resource transfer, and the continue/seen notices.
//! Either peer can take either role; the **initiator** dials and writes a
//! control byte, the **responder** is dispatched by the connection server.
//!
//! Every non-`Name` initiator message opens with the identity preamble
//! (id, display name, OS, transfer id), which also keeps the responder's
//! device registry current with the sender's address.

mod manifest;
mod receive;
mod send;

pub use manifest::{expand_resources, Manifest};

use crate::config::Config;
use crate::device::Device;
use crate::events::EventBus;
use crate::registry::Registry;
use crate::wire;
use crate::{ProtocolError, Result};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Duration;

/// Deadline for any single protocol read or write inside a transfer.
///
/// A peer that stops responding mid-chunk surfaces as a connection error on
/// the affected transfer instead of hanging its handler forever.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity preamble carried by every non-`Name` initiator message
#[derive(Debug, Clone)]
pub struct Preamble {
    pub peer_id: String,
    pub peer_name: String,
    pub peer_os: String,
    pub transfer_id: String,
}

/// The symmetric transfer protocol engine.
///
/// One instance serves both roles: the host calls the `send_*` methods, the
/// connection server calls the `handle_*` methods.
pub struct Engine {
    config: Arc<Config>,
    registry: Arc<Registry>,
    events: EventBus,
}

impl Engine {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>, events: EventBus) -> Self {
        Self {
            config,
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    /// Resolve a peer id to its dialing address
    pub(crate) fn peer_addr(&self, peer_id: &str) -> Result<SocketAddr> {
        let device = self
            .registry
            .find_device(peer_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(peer_id.to_string()))?;
        Ok(SocketAddr::new(device.addr, self.config.port))
    }

    /// Dial a peer for a transfer-class exchange
    pub(crate) async fn dial(&self, addr: SocketAddr) -> Result<TcpStream> {
        timed("dial", async { Ok(TcpStream::connect(addr).await?) }).await
    }

    /// Write the identity preamble: id, name, OS, transfer id
    pub(crate) async fn write_preamble<S>(&self, stream: &mut S, transfer_id: &str) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        wire::write_string(stream, &self.config.device_id).await?;
        wire::write_string(stream, &self.config.device_name).await?;
        wire::write_string(stream, &self.config.os).await?;
        wire::write_string(stream, transfer_id).await?;
        Ok(())
    }

    /// Read the identity preamble and upsert the sender into the registry
    /// under the connection's source address.
    pub(crate) async fn read_preamble<S>(
        &self,
        stream: &mut S,
        peer_ip: IpAddr,
    ) -> Result<Preamble>
    where
        S: AsyncRead + Unpin,
    {
        let preamble = timed("preamble", async {
            let peer_id = wire::read_string(stream).await?;
            let peer_name = wire::read_string(stream).await?;
            let peer_os = wire::read_string(stream).await?;
            let transfer_id = wire::read_string(stream).await?;
            Ok(Preamble {
                peer_id,
                peer_name,
                peer_os,
                transfer_id,
            })
        })
        .await?;

        self.registry.upsert_device(Device::new(
            &preamble.peer_id,
            peer_ip,
            &preamble.peer_name,
            &preamble.peer_os,
        ));
        Ok(preamble)
    }

    /// Record a fault on a transfer and notify the host
    pub(crate) fn fail_transfer(&self, peer_id: &str, transfer_id: &str, err: &ProtocolError) {
        self.registry.with_transfer_mut(transfer_id, |t| {
            t.error = Some(err.to_string());
        });
        self.events.transfer_updated(peer_id, transfer_id);
    }

    /// Request cooperative cancellation of an in-flight transfer.
    ///
    /// The chunk loop signals the peer at the next chunk boundary; there is
    /// no hard abort mid-chunk.
    pub fn cancel_transfer(&self, transfer_id: &str) {
        let peer_id = self.registry.with_transfer_mut(transfer_id, |t| {
            if let Some(payload) = t.payload.as_mut() {
                payload.canceled = true;
            }
            t.peer_id.clone()
        });
        if let Some(peer_id) = peer_id {
            self.events.transfer_updated(&peer_id, transfer_id);
        }
    }
}

/// Bound a protocol future by [`TRANSFER_TIMEOUT`]
pub(crate) async fn timed<T>(what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(TRANSFER_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout(what.to_string())),
    }
}

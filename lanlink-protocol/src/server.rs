//! Connection server
//!
//! One TCP listener accepts all peer traffic. Each accepted connection is
//! served on its own task: the version header and opening control byte are
//! read, the matching responder runs to completion, and the connection
//! closes. Per-connection faults are logged and never take the listener
//! down.
//!
//! `Name` is answered inline since it is the one request with no body; every
//! other control byte dispatches into the engine, the explorer, or the
//! command channel.

use crate::exec;
use crate::transfer::Engine;
use crate::wire::{self, ControlByte};
use crate::{ProtocolError, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Accepts and dispatches inbound peer connections
pub struct Server {
    engine: Arc<Engine>,
    listener: TcpListener,
}

impl Server {
    /// Bind the configured port on all interfaces
    pub async fn bind(engine: Arc<Engine>) -> Result<Self> {
        let port = engine.config().port;
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        Ok(Self::with_listener(engine, listener))
    }

    /// Serve on an already-bound listener
    pub fn with_listener(engine: Arc<Engine>, listener: TcpListener) -> Self {
        Self { engine, listener }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    ///
    /// Returns only if the listener itself fails; individual connections
    /// never propagate their errors here.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "connection server listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                debug!(%peer, "connection accepted");
                if let Err(err) = serve_connection(&engine, stream, peer.ip()).await {
                    warn!(%peer, %err, "connection handler failed");
                }
            });
        }
    }
}

/// Read the opening header and run the matching responder
async fn serve_connection(engine: &Engine, mut stream: TcpStream, peer_ip: IpAddr) -> Result<()> {
    let control = wire::read_header(&mut stream).await?;
    debug!(%peer_ip, ?control, "request");

    match control {
        ControlByte::Name => answer_name(engine, &mut stream).await,
        ControlByte::Msg => engine.handle_message(&mut stream, peer_ip).await,
        ControlByte::Resources => engine.handle_resources(&mut stream, peer_ip).await,
        ControlByte::Explore => engine.handle_explore(&mut stream).await,
        ControlByte::Get => engine.handle_get(&mut stream, peer_ip).await,
        ControlByte::ContinueTransfer => engine.handle_continue(&mut stream, peer_ip).await,
        ControlByte::SeenNotice => engine.handle_seen(&mut stream).await,
        ControlByte::ExecCmd => {
            if !engine.config().enable_remote_exec {
                warn!(%peer_ip, "remote exec request refused (disabled)");
                return Err(ProtocolError::Remote("remote exec disabled".into()));
            }
            exec::handle_exec(stream).await
        }
        other => Err(ProtocolError::UnexpectedControl(other as u8)),
    }
}

/// `Name` reply: our id, display name and OS
async fn answer_name<S>(engine: &Engine, stream: &mut S) -> Result<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let config = engine.config();
    wire::write_string(stream, &config.device_id).await?;
    wire::write_string(stream, &config.device_name).await?;
    wire::write_string(stream, &config.os).await?;
    stream.flush().await?;
    Ok(())
}

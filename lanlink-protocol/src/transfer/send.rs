//! Initiator-side transfer operations
//!
//! Sending is fire-and-forget from the caller's perspective: every operation
//! creates or updates a [`Transfer`] record first, and any fault lands on
//! that record's `error` field (surfaced via `TransferUpdated`) as well as in
//! the returned `Result`.

use super::{timed, Engine};
use crate::device::{Direction, FileTransfer, Transfer};
use crate::transfer::manifest::expand_resources;
use crate::wire::{self, ControlByte};
use crate::{ProtocolError, Result};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

impl Engine {
    /// Send a text message to a known peer.
    ///
    /// No acknowledgement is round-tripped; connection-level faults are the
    /// only failure mode and are recorded on the transfer.
    pub async fn send_message(&self, peer_id: &str, text: &str) -> Result<()> {
        let transfer_id = Uuid::new_v4().to_string();
        self.registry().upsert_transfer(Transfer::message(
            &transfer_id,
            peer_id,
            Direction::Outbound,
            text,
        ));
        self.events().transfer_updated(peer_id, &transfer_id);

        let result = self.send_message_inner(peer_id, &transfer_id, text).await;
        if let Err(ref err) = result {
            self.fail_transfer(peer_id, &transfer_id, err);
        } else {
            self.events().transfer_updated(peer_id, &transfer_id);
        }
        result
    }

    async fn send_message_inner(
        &self,
        peer_id: &str,
        transfer_id: &str,
        text: &str,
    ) -> Result<()> {
        let addr = self.peer_addr(peer_id)?;
        let mut stream = self.dial(addr).await?;
        wire::write_header(&mut stream, ControlByte::Msg).await?;
        self.write_preamble(&mut stream, transfer_id).await?;
        wire::write_string(&mut stream, text).await?;
        stream.flush().await?;
        debug!(peer_id, transfer_id, "message sent");
        Ok(())
    }

    /// Send files and directories to a known peer.
    ///
    /// Directories are expanded breadth-first before the manifest is built.
    /// Returns the transfer id, which stays stable across resume attempts.
    pub async fn send_resources(&self, peer_id: &str, resources: &[PathBuf]) -> Result<String> {
        let manifest = expand_resources(resources);
        let transfer_id = Uuid::new_v4().to_string();
        self.registry().upsert_transfer(Transfer::resources(
            &transfer_id,
            peer_id,
            Direction::Outbound,
            FileTransfer::new(manifest.files, manifest.total_bytes),
        ));
        self.events().transfer_updated(peer_id, &transfer_id);

        self.send_transfer(peer_id, &transfer_id).await?;
        Ok(transfer_id)
    }

    /// Dial a peer and run the resource protocol for an existing outbound
    /// transfer, starting from its current resume state.
    pub async fn send_transfer(&self, peer_id: &str, transfer_id: &str) -> Result<()> {
        let result = async {
            let addr = self.peer_addr(peer_id)?;
            let mut stream = self.dial(addr).await?;
            wire::write_header(&mut stream, ControlByte::Resources).await?;
            self.send_transfer_body(&mut stream, peer_id, transfer_id)
                .await
        }
        .await;

        if let Err(ref err) = result {
            self.fail_transfer(peer_id, transfer_id, err);
        }
        result
    }

    /// Manifest phase plus chunk loop over an established stream.
    ///
    /// Also used verbatim by the `Get` responder and the `ContinueTransfer`
    /// responder, where this side becomes the data producer without dialing.
    pub(crate) async fn send_transfer_body<S>(
        &self,
        stream: &mut S,
        peer_id: &str,
        transfer_id: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let record = self
            .registry()
            .find_transfer(transfer_id)
            .ok_or_else(|| ProtocolError::TransferNotFound(transfer_id.to_string()))?;
        let payload = record
            .payload
            .clone()
            .ok_or_else(|| ProtocolError::InvalidFrame("transfer has no file payload".into()))?;

        // Phase 1: manifest
        self.write_preamble(stream, record.wire_id()).await?;
        wire::write_u64(stream, self.config().buffer_size).await?;
        wire::write_u64(stream, payload.total_bytes).await?;
        wire::write_u64(stream, payload.transferred_bytes).await?;
        wire::write_u64(stream, payload.files.len() as u64).await?;
        for entry in &payload.files {
            wire::write_string(stream, &entry.name).await?;
            wire::write_u64(stream, entry.size).await?;
            wire::write_u64(stream, entry.progress).await?;
        }
        wire::write_u64(stream, payload.current_index).await?;

        info!(
            peer_id,
            transfer_id,
            files = payload.files.len(),
            total_bytes = payload.total_bytes,
            resume_index = payload.current_index,
            "sending resources"
        );

        // Phase 2: payload streaming with per-chunk flow control
        let mut buf = vec![0u8; self.config().buffer_size as usize];
        let mut transferred = payload.transferred_bytes;
        let mut index = payload.current_index as usize;

        while index < payload.files.len() {
            let entry = &payload.files[index];
            let mut progress = entry.progress;

            let mut file = tokio::fs::File::open(&entry.path).await?;
            if progress > 0 {
                file.seek(std::io::SeekFrom::Start(progress)).await?;
            }

            while progress < entry.size {
                if self.transfer_canceled(transfer_id) {
                    wire::write_control(stream, ControlByte::Canceled).await?;
                    stream.flush().await?;
                    info!(peer_id, transfer_id, "send canceled locally");
                    return Ok(());
                }
                wire::write_control(stream, ControlByte::Ok).await?;

                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "source file {} shrank during transfer",
                        entry.path.display()
                    )));
                }
                timed("chunk write", wire::write_bytes(stream, &buf[..n])).await?;
                stream.flush().await?;

                // The receiver acknowledges every chunk; anything but Ok
                // means it is canceling.
                let ack = timed("chunk ack", wire::read_control(stream)).await?;
                if ack != ControlByte::Ok {
                    self.mark_canceled(peer_id, transfer_id);
                    info!(peer_id, transfer_id, "receiver canceled transfer");
                    return Ok(());
                }

                progress += n as u64;
                transferred += n as u64;
                self.registry().with_transfer_mut(transfer_id, |t| {
                    if let Some(p) = t.payload.as_mut() {
                        p.files[index].progress = progress;
                        p.transferred_bytes = transferred;
                    }
                });
                self.events().transfer_updated(peer_id, transfer_id);
            }

            index += 1;
            self.registry().with_transfer_mut(transfer_id, |t| {
                if let Some(p) = t.payload.as_mut() {
                    p.current_index = index as u64;
                }
            });
            self.events().transfer_updated(peer_id, transfer_id);
        }

        info!(peer_id, transfer_id, transferred, "resource send complete");
        Ok(())
    }

    /// Resume a stalled or canceled transfer from its current state.
    ///
    /// Clears the error/canceled flags. Outbound transfers are re-sent from
    /// the current index and per-file progress; for inbound transfers the
    /// peer is asked (over a single connection) to re-run its send from the
    /// retained state, and this side drops back into the receive path so the
    /// same `.tmp` partial files are picked up.
    pub async fn continue_transfer(&self, peer_id: &str, transfer_id: &str) -> Result<()> {
        let record = self
            .registry()
            .find_transfer(transfer_id)
            .ok_or_else(|| ProtocolError::TransferNotFound(transfer_id.to_string()))?;

        self.registry().with_transfer_mut(transfer_id, |t| {
            t.error = None;
            if let Some(p) = t.payload.as_mut() {
                p.canceled = false;
            }
        });
        self.events().transfer_updated(peer_id, transfer_id);

        match record.direction {
            Direction::Outbound => self.send_transfer(peer_id, transfer_id).await,
            Direction::Inbound => self.continue_inbound(peer_id, &record.wire_id().to_string()).await,
        }
    }

    async fn continue_inbound(&self, peer_id: &str, wire_id: &str) -> Result<()> {
        let result = async {
            let addr = self.peer_addr(peer_id)?;
            let mut stream = self.dial(addr).await?;
            wire::write_header(&mut stream, ControlByte::ContinueTransfer).await?;
            self.write_preamble(&mut stream, wire_id).await?;
            stream.flush().await?;

            match timed("continue reply", wire::read_control(&mut stream)).await? {
                ControlByte::Ok => {}
                ControlByte::Error => {
                    let msg = wire::read_string(&mut stream).await?;
                    return Err(ProtocolError::Remote(msg));
                }
                other => return Err(ProtocolError::UnexpectedControl(other as u8)),
            }

            // The peer now replays its outbound send over this connection.
            let preamble = self.read_preamble(&mut stream, addr.ip()).await?;
            self.receive_transfer_body(&mut stream, &preamble).await?;
            Ok(())
        }
        .await;

        if let Err(ref err) = result {
            let inbound_id = format!("{}{wire_id}", crate::device::INBOUND_ID_PREFIX);
            self.fail_transfer(peer_id, &inbound_id, err);
        }
        result
    }

    /// Tell a peer that its messages have been viewed, and mark the local
    /// conversation seen.
    pub async fn send_seen_notice(&self, peer_id: &str) -> Result<()> {
        self.registry().mark_seen(peer_id);

        let addr = self.peer_addr(peer_id)?;
        let mut stream = self.dial(addr).await?;
        wire::write_header(&mut stream, ControlByte::SeenNotice).await?;
        wire::write_string(&mut stream, &self.config().device_id).await?;
        stream.flush().await?;
        Ok(())
    }

    fn transfer_canceled(&self, transfer_id: &str) -> bool {
        self.registry()
            .with_transfer_mut(transfer_id, |t| {
                t.payload.as_ref().map(|p| p.canceled).unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub(crate) fn mark_canceled(&self, peer_id: &str, transfer_id: &str) {
        self.registry().with_transfer_mut(transfer_id, |t| {
            if let Some(p) = t.payload.as_mut() {
                p.canceled = true;
            }
        });
        self.events().transfer_updated(peer_id, transfer_id);
    }
}

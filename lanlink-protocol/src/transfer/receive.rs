//! Responder-side transfer operations
//!
//! Inbound transfer records carry the sender's transfer id prefixed with
//! `R`, which also names the `.tmp` partial file
//! (`<destination>_<transferId>.tmp`). Because the id is stable across
//! resume attempts, a continued transfer reopens the same partial file and
//! appends from the manifest's per-file offsets.

use super::{timed, Engine, Preamble};
use crate::device::{Direction, FileEntry, FileTransfer, Transfer, INBOUND_ID_PREFIX};
use crate::events::CoreEvent;
use crate::wire::{self, ControlByte};
use crate::{ProtocolError, Result};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Largest chunk size a sender may negotiate (16 MiB)
const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Largest file count accepted in a single manifest
const MAX_MANIFEST_FILES: u64 = 65_536;

impl Engine {
    /// Responder for `Msg`: read the sender preamble and text, record the
    /// inbound transfer, and surface the notification.
    pub(crate) async fn handle_message<S>(&self, stream: &mut S, peer_ip: IpAddr) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let preamble = self.read_preamble(stream, peer_ip).await?;
        let record_id = format!("{INBOUND_ID_PREFIX}{}", preamble.transfer_id);

        match timed("message text", wire::read_string(stream)).await {
            Ok(text) => {
                self.registry().upsert_transfer(Transfer::message(
                    &record_id,
                    &preamble.peer_id,
                    Direction::Inbound,
                    &text,
                ));
                self.registry().bump_notifications(&preamble.peer_id);
                self.events().emit(CoreEvent::MessageReceived {
                    peer_id: preamble.peer_id.clone(),
                    sender_name: preamble.peer_name.clone(),
                    text,
                });
                self.events().transfer_updated(&preamble.peer_id, &record_id);
                Ok(())
            }
            Err(err) => {
                let mut record = Transfer::message(
                    &record_id,
                    &preamble.peer_id,
                    Direction::Inbound,
                    "",
                );
                record.error = Some(err.to_string());
                self.registry().upsert_transfer(record);
                self.events().transfer_updated(&preamble.peer_id, &record_id);
                Err(err)
            }
        }
    }

    /// Responder for `Resources`: preamble, then manifest and chunk loop
    pub(crate) async fn handle_resources<S>(&self, stream: &mut S, peer_ip: IpAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let preamble = self.read_preamble(stream, peer_ip).await?;
        self.receive_transfer_body(stream, &preamble).await?;
        Ok(())
    }

    /// Manifest read plus chunk loop, with the preamble already consumed.
    ///
    /// Shared by the `Resources` responder, the `Get` initiator (after it
    /// has sent its request), and the inbound-resume path.
    pub(crate) async fn receive_transfer_body<S>(
        &self,
        stream: &mut S,
        preamble: &Preamble,
    ) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let record_id = format!("{INBOUND_ID_PREFIX}{}", preamble.transfer_id);
        let peer_id = preamble.peer_id.clone();

        // Phase 1: manifest
        let (manifest, chunk_size) = timed("manifest", self.read_manifest(stream)).await?;
        info!(
            peer_id,
            transfer_id = record_id,
            files = manifest.files.len(),
            total_bytes = manifest.total_bytes,
            resume_index = manifest.current_index,
            "receiving resources"
        );

        self.registry().upsert_transfer(Transfer::resources(
            &record_id,
            &peer_id,
            Direction::Inbound,
            manifest.clone(),
        ));
        self.registry().bump_notifications(&peer_id);
        self.events().transfer_updated(&peer_id, &record_id);

        // Phase 2: chunk loop; faults land on the record, partial .tmp
        // files stay in place for a later resume attempt.
        let result = self
            .receive_files(stream, &peer_id, &record_id, &manifest, chunk_size)
            .await;
        if let Err(ref err) = result {
            self.fail_transfer(&peer_id, &record_id, err);
        }
        result?;
        Ok(record_id)
    }

    /// Returns the manifest and the sender's negotiated chunk size, which
    /// governs both sides' chunk framing for this connection.
    async fn read_manifest<S>(&self, stream: &mut S) -> Result<(FileTransfer, u64)>
    where
        S: AsyncRead + Unpin,
    {
        let chunk_size = wire::read_u64(stream).await?;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidFrame(format!(
                "unacceptable chunk size {chunk_size}"
            )));
        }
        let total_bytes = wire::read_u64(stream).await?;
        let transferred_bytes = wire::read_u64(stream).await?;
        let count = wire::read_u64(stream).await?;
        if count > MAX_MANIFEST_FILES {
            return Err(ProtocolError::InvalidFrame(format!(
                "manifest too large: {count} files"
            )));
        }

        let mut files = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = wire::read_string(stream).await?;
            let size = wire::read_u64(stream).await?;
            let progress = wire::read_u64(stream).await?;
            if progress > size {
                return Err(ProtocolError::InvalidFrame(format!(
                    "file progress {progress} exceeds size {size}"
                )));
            }
            let dest = self.destination_for(&name)?;
            let mut entry = FileEntry::new(dest, name, size);
            entry.progress = progress;
            files.push(entry);
        }

        let current_index = wire::read_u64(stream).await?;
        if current_index > count {
            return Err(ProtocolError::InvalidFrame(format!(
                "resume index {current_index} beyond {count} files"
            )));
        }

        if transferred_bytes > total_bytes {
            return Err(ProtocolError::InvalidFrame(format!(
                "transferred {transferred_bytes} exceeds total {total_bytes}"
            )));
        }
        let mut payload = FileTransfer::new(files, total_bytes);
        payload.transferred_bytes = transferred_bytes;
        payload.current_index = current_index;
        Ok((payload, chunk_size))
    }

    async fn receive_files<S>(
        &self,
        stream: &mut S,
        peer_id: &str,
        record_id: &str,
        manifest: &FileTransfer,
        chunk_size: u64,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; chunk_size as usize];
        let mut transferred = manifest.transferred_bytes;
        let mut index = manifest.current_index as usize;

        while index < manifest.files.len() {
            let entry = &manifest.files[index];
            let mut progress = entry.progress;

            if let Some(parent) = entry.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let tmp = temp_path(&entry.path, record_id);
            let mut file = if progress == 0 {
                tokio::fs::File::create(&tmp).await?
            } else {
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&tmp)
                    .await?;
                let on_disk = file.metadata().await?.len();
                if on_disk < progress {
                    // The partial file lost bytes the sender believes were
                    // delivered; resuming from here would corrupt the file.
                    return Err(ProtocolError::InvalidFrame(format!(
                        "partial file {} is {on_disk} bytes, resume offset is {progress}",
                        tmp.display()
                    )));
                }
                file
            };
            if progress > 0 {
                file.seek(std::io::SeekFrom::Start(progress)).await?;
            }

            while progress < entry.size {
                match timed("chunk control", wire::read_control(stream)).await? {
                    ControlByte::Ok => {}
                    ControlByte::Canceled => {
                        file.flush().await?;
                        self.mark_canceled(peer_id, record_id);
                        info!(peer_id, transfer_id = record_id, "sender canceled transfer");
                        return Ok(());
                    }
                    other => return Err(ProtocolError::UnexpectedControl(other as u8)),
                }

                let n = timed(
                    "chunk read",
                    read_chunk(stream, &mut buf, entry.size - progress),
                )
                .await?;
                file.write_all(&buf[..n]).await?;

                if self.receive_canceled(record_id) {
                    file.flush().await?;
                    wire::write_control(stream, ControlByte::Canceled).await?;
                    stream.flush().await?;
                    info!(peer_id, transfer_id = record_id, "receive canceled locally");
                    return Ok(());
                }
                wire::write_control(stream, ControlByte::Ok).await?;
                stream.flush().await?;

                progress += n as u64;
                transferred += n as u64;
                self.registry().with_transfer_mut(record_id, |t| {
                    if let Some(p) = t.payload.as_mut() {
                        p.files[index].progress = progress;
                        p.transferred_bytes = transferred;
                    }
                });
                self.events().transfer_updated(peer_id, record_id);
            }

            file.flush().await?;
            drop(file);
            let final_path = unique_destination(&entry.path);
            tokio::fs::rename(&tmp, &final_path).await?;
            debug!(path = %final_path.display(), "file received");

            index += 1;
            self.registry().with_transfer_mut(record_id, |t| {
                if let Some(p) = t.payload.as_mut() {
                    p.current_index = index as u64;
                }
            });
            self.events().transfer_updated(peer_id, record_id);
        }

        info!(
            peer_id,
            transfer_id = record_id,
            transferred,
            "resource receive complete"
        );
        Ok(())
    }

    /// Responder for `ContinueTransfer`: replay an outbound send over this
    /// connection, from the retained resume state.
    pub(crate) async fn handle_continue<S>(&self, stream: &mut S, peer_ip: IpAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let preamble = self.read_preamble(stream, peer_ip).await?;
        let transfer_id = preamble.transfer_id.clone();

        let known = self
            .registry()
            .find_transfer(&transfer_id)
            .filter(|t| t.direction == Direction::Outbound && t.payload.is_some());
        if known.is_none() {
            warn!(transfer_id, "continue request for unknown transfer");
            wire::write_control(stream, ControlByte::Error).await?;
            wire::write_string(stream, "unknown transfer").await?;
            stream.flush().await?;
            return Ok(());
        }

        self.registry().with_transfer_mut(&transfer_id, |t| {
            t.error = None;
            if let Some(p) = t.payload.as_mut() {
                p.canceled = false;
            }
        });
        wire::write_control(stream, ControlByte::Ok).await?;

        let result = self
            .send_transfer_body(stream, &preamble.peer_id, &transfer_id)
            .await;
        if let Err(ref err) = result {
            self.fail_transfer(&preamble.peer_id, &transfer_id, err);
        }
        result
    }

    /// Responder for `SeenNotice`: the peer viewed our conversation
    pub(crate) async fn handle_seen<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let peer_id = timed("seen notice", wire::read_string(stream)).await?;
        self.registry().mark_seen(&peer_id);
        self.events().emit(CoreEvent::ConversationSeen { peer_id });
        Ok(())
    }

    /// Map a wire-relative name onto the inbox directory.
    ///
    /// Rejects absolute names and parent-directory components so a peer
    /// cannot write outside the inbox.
    fn destination_for(&self, name: &str) -> Result<PathBuf> {
        let mut dest = self.config().inbox_dir.clone();
        if name.is_empty() {
            return Err(ProtocolError::InvalidPath("empty file name".into()));
        }
        for part in name.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(ProtocolError::InvalidPath(format!(
                    "unacceptable file name {name:?}"
                )));
            }
            dest.push(part);
        }
        Ok(dest)
    }

    fn receive_canceled(&self, record_id: &str) -> bool {
        self.registry()
            .with_transfer_mut(record_id, |t| {
                t.payload.as_ref().map(|p| p.canceled).unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

/// Read one length-prefixed payload chunk into `buf`
async fn read_chunk<S>(stream: &mut S, buf: &mut [u8], remaining: u64) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let len = wire::read_u64(stream).await?;
    if len == 0 || len > buf.len() as u64 || len > remaining {
        return Err(ProtocolError::InvalidFrame(format!(
            "chunk of {len} bytes with {remaining} remaining"
        )));
    }
    stream.read_exact(&mut buf[..len as usize]).await?;
    Ok(len as usize)
}

/// Partial-file name: `<destination>_<transferId>.tmp`
fn temp_path(dest: &Path, transfer_id: &str) -> PathBuf {
    let mut os = dest.as_os_str().to_os_string();
    os.push(format!("_{transfer_id}.tmp"));
    PathBuf::from(os)
}

/// Collision-avoided destination: `name_(N).ext`, N counting from 1
fn unique_destination(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1u64;
    loop {
        let file_name = match &ext {
            Some(ext) => format!("{stem}_({n}).{ext}"),
            None => format!("{stem}_({n})"),
        };
        let candidate = parent.join(file_name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn temp_path_embeds_transfer_id() {
        let tmp = temp_path(Path::new("/inbox/report.pdf"), "Rabc");
        assert_eq!(tmp, Path::new("/inbox/report.pdf_Rabc.tmp"));
    }

    #[test]
    fn unique_destination_counts_from_one() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("report.pdf");

        assert_eq!(unique_destination(&dest), dest);

        File::create(&dest).unwrap();
        let first = unique_destination(&dest);
        assert_eq!(first, dir.path().join("report_(1).pdf"));

        File::create(&first).unwrap();
        let second = unique_destination(&dest);
        assert_eq!(second, dir.path().join("report_(2).pdf"));
    }

    #[test]
    fn unique_destination_without_extension() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("notes");
        File::create(&dest).unwrap();
        assert_eq!(unique_destination(&dest), dir.path().join("notes_(1)"));
    }
}

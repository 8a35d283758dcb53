//! Remote command channel (auxiliary)
//!
//! `ExecCmd` opens a long-lived bidirectional channel on the same framing as
//! everything else: each length-prefixed message from the initiator is
//! either a command line to run or, while a command is still running, data
//! to pipe to its stdin. The responder streams the command's stdout and
//! stderr back as length-prefixed chunks.
//!
//! This hands shell access to anyone who can reach the port, so the server
//! only dispatches it when `Config::enable_remote_exec` is set; it is off by
//! default.

use crate::transfer::Engine;
use crate::wire::{self, ControlByte};
use crate::Result;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Read buffer for command output pipes
const PIPE_BUF: usize = 1024;

/// Initiator side of a command channel.
///
/// Messages sent while a remote command is running are piped to its stdin;
/// otherwise they start a new command. Output arrives on [`CommandChannel::output`].
pub struct CommandChannel {
    writer: Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    output: mpsc::UnboundedReceiver<String>,
}

impl CommandChannel {
    /// Dial a peer and open the command channel
    pub async fn connect(engine: &Engine, addr: IpAddr) -> Result<Self> {
        let port = engine.config().port;
        let stream = TcpStream::connect(SocketAddr::new(addr, port)).await?;
        Self::from_stream(stream).await
    }

    async fn from_stream(mut stream: TcpStream) -> Result<Self> {
        wire::write_header(&mut stream, ControlByte::ExecCmd).await?;
        wire::write_magic(&mut stream).await?;
        stream.flush().await?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            writer: Arc::new(Mutex::new(write_half)),
            output: spawn_frame_reader(read_half),
        })
    }

    /// Send a command line, or stdin data for the running command
    pub async fn send(&self, text: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        wire::write_string(&mut *writer, text).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Receive the next output chunk; `None` when the channel closed
    pub async fn output(&mut self) -> Option<String> {
        self.output.recv().await
    }
}

/// Responder: execute received commands, stream their output back
pub(crate) async fn handle_exec<S>(mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    wire::read_magic(&mut stream).await?;
    info!("command channel opened");

    // Frame reads run on their own task: a frame read is not
    // cancel-safe, so it must never lose a select race against output
    // mid-read. The loop below selects over two channels only.
    let (reader, mut writer) = tokio::io::split(stream);
    let mut incoming = spawn_frame_reader(reader);
    let mut running: Option<RunningCommand> = None;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            frame = incoming.recv() => {
                let text = match frame {
                    Some(text) => text,
                    None => {
                        debug!("command channel closed by peer");
                        return Ok(());
                    }
                };

                // Drop a finished command before deciding what the message means
                if let Some(current) = running.as_mut() {
                    if current.child.try_wait().ok().flatten().is_some() {
                        running = None;
                    }
                }

                match running.as_mut() {
                    Some(current) => {
                        if let Some(stdin) = current.stdin.as_mut() {
                            if let Err(err) = stdin.write_all(text.as_bytes()).await {
                                let _ = out_tx.send(format!("ERROR (in): {err}\n"));
                            }
                        }
                    }
                    None => match spawn_command(text.trim_end(), &out_tx) {
                        Ok(command) => running = Some(command),
                        Err(err) => {
                            let _ = out_tx.send(format!("ERROR: {err}\n"));
                        }
                    },
                }
            }
            chunk = out_rx.recv() => {
                // The sender half lives in this scope, so recv never yields None
                if let Some(chunk) = chunk {
                    wire::write_string(&mut writer, &chunk).await?;
                    writer.flush().await?;
                }
            }
        }
    }
}

/// Read length-prefixed frames on a dedicated task, delivering them over a
/// channel. The receiver yields `None` once the connection closes.
fn spawn_frame_reader<R>(mut reader: R) -> mpsc::UnboundedReceiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match wire::read_string(&mut reader).await {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(%err, "command channel read ended");
                    return;
                }
            }
        }
    });
    rx
}

struct RunningCommand {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Spawn a whitespace-split command line with piped stdio, forwarding both
/// output pipes to the channel.
fn spawn_command(
    line: &str,
    out_tx: &mpsc::UnboundedSender<String>,
) -> std::io::Result<RunningCommand> {
    let mut parts = line.split_whitespace();
    let program = parts.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
    })?;

    // kill_on_drop reaps the child when the channel closes under it
    let mut child = Command::new(program)
        .args(parts)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    info!(command = line, "remote command started");
    let stdin = child.stdin.take();

    if let Some(stdout) = child.stdout.take() {
        forward_pipe(stdout, out_tx.clone(), "out");
    }
    if let Some(stderr) = child.stderr.take() {
        forward_pipe(stderr, out_tx.clone(), "err");
    }

    Ok(RunningCommand { child, stdin })
}

fn forward_pipe<R>(mut pipe: R, out_tx: mpsc::UnboundedSender<String>, label: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; PIPE_BUF];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if out_tx.send(chunk).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(%err, pipe = label, "command pipe read failed");
                    let _ = out_tx.send(format!("ERROR ({label}): {err}\n"));
                    return;
                }
            }
        }
    });
}

//! Direct peer links: TCP listener (incoming), TCP dialer (configured peers),
//! a Hello exchange, then length-prefixed frames both ways.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use samepage_core::wire::{decode_frame, encode_frame, FrameDecodeError, LinkMessage};
use samepage_core::{Channel, Frame, NotebookId, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::actor::Input;

const REDIAL_DELAY: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 8 * 1024;

/// One logical message's frames for a peer; the writer reports the outcome.
#[derive(Debug)]
pub struct Outgoing {
    pub message_id: Uuid,
    pub frames: Vec<Frame>,
}

pub type PeerSenders = Arc<Mutex<HashMap<NotebookId, mpsc::UnboundedSender<Outgoing>>>>;

/// Listen on `port` and keep a link to each address in `dial`.
pub async fn run_transport(
    me: NotebookId,
    port: u16,
    dial: Vec<String>,
    peers: PeerSenders,
    inputs: mpsc::UnboundedSender<Input>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(%port, "direct links listening");

    for addr in dial {
        let peers = peers.clone();
        let inputs = inputs.clone();
        tokio::spawn(async move {
            loop {
                match TcpStream::connect(addr.as_str()).await {
                    Ok(mut stream) => match handshake(&mut stream, me).await {
                        Ok((peer, buffered)) => {
                            run_connection(
                                stream,
                                me,
                                peer,
                                true,
                                buffered,
                                peers.clone(),
                                inputs.clone(),
                            )
                            .await
                        }
                        Err(e) => tracing::warn!(%addr, error = %e, "handshake failed"),
                    },
                    Err(e) => tracing::debug!(%addr, error = %e, "dial failed"),
                }
                if inputs.is_closed() {
                    break;
                }
                tokio::time::sleep(REDIAL_DELAY).await;
            }
        });
    }

    loop {
        let (mut stream, addr) = listener.accept().await?;
        let peers = peers.clone();
        let inputs = inputs.clone();
        tokio::spawn(async move {
            match handshake(&mut stream, me).await {
                Ok((peer, buffered)) => {
                    run_connection(stream, me, peer, false, buffered, peers, inputs).await
                }
                Err(e) => tracing::warn!(%addr, error = %e, "handshake failed"),
            }
        });
    }
}

/// Both sides send Hello first. Returns the peer and any bytes read past its Hello.
async fn handshake<S>(stream: &mut S, me: NotebookId) -> std::io::Result<(NotebookId, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = encode_frame(&LinkMessage::Hello {
        protocol_version: PROTOCOL_VERSION,
        notebook: me,
    })
    .map_err(invalid)?;
    stream.write_all(&hello).await?;
    stream.flush().await?;
    let mut buf = Vec::new();
    match read_message(stream, &mut buf).await? {
        Some(LinkMessage::Hello {
            protocol_version,
            notebook,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(invalid("unsupported protocol version"));
            }
            if notebook == me {
                return Err(invalid("connected to self"));
            }
            Ok((notebook, buf))
        }
        Some(LinkMessage::Frame(_)) => Err(invalid("frame before hello")),
        None => Err(std::io::ErrorKind::UnexpectedEof.into()),
    }
}

/// Next message from `reader`, buffering partial reads in `buf`. `None` on clean EOF.
async fn read_message<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<LinkMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match decode_frame(buf) {
            Ok((message, used)) => {
                buf.drain(..used);
                return Ok(Some(message));
            }
            Err(FrameDecodeError::NeedMore) => {}
            Err(e) => return Err(invalid(e)),
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(std::io::ErrorKind::UnexpectedEof.into())
            };
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Of two links between the same pair, both sides keep the one dialed by the lower id.
fn preferred(me: NotebookId, peer: NotebookId, dialed: bool) -> bool {
    if dialed {
        me < peer
    } else {
        peer < me
    }
}

/// Make `tx` the link to `peer` unless a live, preferred link is already there.
/// A replaced link loses its only sender, so its writer drains and closes.
async fn register(
    peers: &PeerSenders,
    peer: NotebookId,
    tx: mpsc::UnboundedSender<Outgoing>,
    preferred: bool,
) -> bool {
    let mut senders = peers.lock().await;
    match senders.get(&peer) {
        Some(existing) if !existing.is_closed() && !preferred => false,
        _ => {
            senders.insert(peer, tx);
            true
        }
    }
}

async fn run_connection<S>(
    stream: S,
    me: NotebookId,
    peer: NotebookId,
    dialed: bool,
    mut buf: Vec<u8>,
    peers: PeerSenders,
    inputs: mpsc::UnboundedSender<Input>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let own = tx.downgrade();
    if !register(&peers, peer, tx, preferred(me, peer, dialed)).await {
        tracing::debug!(%peer, dialed, "already linked, dropping duplicate connection");
        return;
    }
    let _ = inputs.send(Input::PeerUp(peer));

    let (mut reader, mut writer) = tokio::io::split(stream);
    let writer_inputs = inputs.clone();
    let write_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match write_frames(&mut writer, out.frames).await {
                Ok(()) => {
                    let _ = writer_inputs.send(Input::DirectDelivered(out.message_id));
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "direct write failed");
                    let _ = writer_inputs.send(Input::DirectFailed(peer));
                    return;
                }
            }
        }
        tracing::debug!(%peer, "link replaced, closing");
        let _ = writer.shutdown().await;
    });

    loop {
        match read_message(&mut reader, &mut buf).await {
            Ok(Some(LinkMessage::Frame(frame))) => {
                if inputs
                    .send(Input::Frame(Channel::Direct(peer), frame))
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(LinkMessage::Hello { .. })) => tracing::debug!(%peer, "repeated hello ignored"),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "direct link read failed");
                break;
            }
        }
    }

    write_task.abort();
    let current = {
        let mut senders = peers.lock().await;
        let current = match (own.upgrade(), senders.get(&peer)) {
            (Some(own), Some(registered)) => own.same_channel(registered),
            _ => false,
        };
        if current {
            senders.remove(&peer);
        }
        current
    };
    if current {
        let _ = inputs.send(Input::PeerDown(peer));
    }
}

async fn write_frames<W>(writer: &mut W, frames: Vec<Frame>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for frame in frames {
        let bytes = encode_frame(&LinkMessage::Frame(frame)).map_err(invalid)?;
        writer.write_all(&bytes).await?;
    }
    writer.flush().await
}

fn invalid(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
}

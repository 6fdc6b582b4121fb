//! Connection engine: one TLS stream, one reader task, serialized writes.
//!
//! Each connection owns a dedicated reader task that parses packets off the
//! stream and routes them through the message assembler. Completed messages
//! are published on a bounded delivery channel; a slow consumer blocks the
//! reader and thereby stalls ACKs, which is the intended back-pressure.
//!
//! Writes originate from any task and are serialized by the write mutex.
//! Message numbers are assigned under that mutex so the wire order always
//! matches assignment order; the counters are atomics so they can be
//! observed from other tasks while the reader or a sender advances them.
//!
//! # Invariants
//!
//! - `incoming_msg_no` equals the msgno of the next expected `HEADER`.
//! - Every pending message was opened by a `HEADER` that matched the
//!   prevailing `incoming_msg_no`; the reader task is the sole mutator of
//!   the pending map.
//! - The delivery channel is closed exactly once, after the reader task can
//!   no longer publish.
//! - A `HEADER` out of sequence, or `DATA`/`EOF`/`TXERR` for an untracked
//!   msgno, is a peer protocol violation and fatal to the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use courier_core::message::Message;
use courier_core::packet::{Packet, PacketCodec, PacketError};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use crate::tls::peer_fingerprint;

/// Capacity of the delivery channel.
///
/// Deliberately small: the reader must rendezvous with the consumer so that
/// back-pressure reaches the peer through withheld ACKs.
pub const DELIVERY_QUEUE_DEPTH: usize = 1;

/// Error text recorded when a `TXERR` packet carries no body.
pub const DEFAULT_TXERR_MESSAGE: &str = "unknown connection error";

/// Errors surfaced by connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// A `HEADER` arrived with an unexpected msgno.
    #[error("out of sequence msgno: expected {expected} but got {got}")]
    OutOfSequence {
        /// The msgno the assembler expected next.
        expected: u64,
        /// The msgno the peer sent.
        got: u64,
    },

    /// A `HEADER` arrived for a msgno already being assembled.
    #[error("bad HEADER: already tracking msgno {msg_no}")]
    DuplicateHeader {
        /// The duplicated msgno.
        msg_no: u64,
    },

    /// `DATA`/`EOF`/`TXERR` arrived for a msgno with no open message.
    #[error("not tracking msgno {msg_no}")]
    UntrackedMessage {
        /// The unknown msgno.
        msg_no: u64,
    },

    /// The message to send carries a zero request id.
    #[error("message must carry a non-zero request id before sending")]
    MissingRequestId,

    /// The connection is closed; no further sends are possible.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The delivery consumer dropped its receiver.
    #[error("delivery channel consumer is gone")]
    DeliveryClosed,

    /// Packet encode/decode or transport failure.
    #[error(transparent)]
    Packet(#[from] PacketError),
}

type PacketWriter = FramedWrite<WriteHalf<TlsStream<TcpStream>>, PacketCodec>;
type PacketReader = FramedRead<ReadHalf<TlsStream<TcpStream>>, PacketCodec>;

struct ConnectionShared {
    writer: tokio::sync::Mutex<PacketWriter>,
    incoming_msg_no: AtomicU64,
    outgoing_msg_no: AtomicU64,
    /// Latest cumulative byte count the peer has acknowledged, per outgoing
    /// msgno. Recorded for flow accounting; nothing blocks on it.
    acked: parking_lot::Mutex<HashMap<u64, u64>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    fingerprint: Option<String>,
}

impl ConnectionShared {
    /// Marks the connection closed and shuts the transport down. Only the
    /// first caller performs the shutdown; later calls are no-ops.
    async fn close_transport(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            trace!("connection already closed, skipping shutdown");
            return;
        }

        trace!("connection is closing");
        self.cancel.cancel();

        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.get_mut().shutdown().await {
            trace!(%error, "error shutting down tls stream");
        }
    }
}

/// Handle to one multiplexed TLS connection.
///
/// Cheap to clone; all clones share the same engine state.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Wraps an established TLS stream, spawning its reader task.
    ///
    /// Returns the connection handle and the delivery channel on which
    /// completed inbound messages arrive. The channel closes when the
    /// reader terminates for any reason.
    #[must_use]
    pub fn spawn(stream: TlsStream<TcpStream>) -> (Self, mpsc::Receiver<Message>) {
        let fingerprint = peer_fingerprint(&stream);
        if let Some(print) = &fingerprint {
            trace!(fingerprint = %print, "peer certificate fingerprint");
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, PacketCodec::new());
        let writer = FramedWrite::new(write_half, PacketCodec::new());
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_DEPTH);

        let shared = Arc::new(ConnectionShared {
            writer: tokio::sync::Mutex::new(writer),
            incoming_msg_no: AtomicU64::new(0),
            outgoing_msg_no: AtomicU64::new(0),
            acked: parking_lot::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            fingerprint,
        });

        tokio::spawn(read_loop(reader, delivery_tx, Arc::clone(&shared)));

        (Self { shared }, delivery_rx)
    }

    /// Sends a logical message, assigning it the next outgoing msgno.
    ///
    /// The whole packet sequence (`HEADER`, `DATA`*, `EOF`) is written under
    /// the write mutex and flushed once. Transient write faults are retried
    /// at the packet level; a closed connection aborts the remaining
    /// packets.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::MissingRequestId`] if `message.request_id == 0`;
    ///   nothing is written.
    /// - [`ConnectionError::ConnectionClosed`] if the connection closes
    ///   before the message is fully written.
    /// - [`ConnectionError::Packet`] for non-retryable encoding failures.
    pub async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        if message.request_id == 0 {
            return Err(ConnectionError::MissingRequestId);
        }
        if self.shared.cancel.is_cancelled() {
            return Err(ConnectionError::ConnectionClosed);
        }

        let mut writer = self.shared.writer.lock().await;

        // Assigned under the write mutex so wire order matches assignment
        // order; atomic so other tasks can observe the counter.
        let msg_no = self.shared.outgoing_msg_no.fetch_add(1, Ordering::SeqCst);
        trace!(msg_no, action = %message.action, "sending message");

        for packet in message.to_packets(msg_no) {
            self.write_with_retry(&mut writer, &packet).await?;
        }
        self.flush_with_retry(&mut writer).await?;

        trace!(msg_no, "done sending message");
        Ok(())
    }

    /// Closes the connection. Idempotent: the first call shuts the stream
    /// down, which terminates the reader task and closes the delivery
    /// channel exactly once; later calls are no-ops.
    pub async fn close(&self) {
        self.shared.close_transport().await;
    }

    /// SHA-1 fingerprint of the peer certificate, when the peer presented
    /// exactly one.
    #[must_use]
    pub fn fingerprint(&self) -> Option<&str> {
        self.shared.fingerprint.as_deref()
    }

    /// Latest cumulative byte count the peer has acknowledged for an
    /// outgoing msgno.
    #[must_use]
    pub fn acked_bytes(&self, msg_no: u64) -> Option<u64> {
        self.shared.acked.lock().get(&msg_no).copied()
    }

    /// Whether the connection has been closed (locally or by reader
    /// termination).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    async fn write_with_retry(
        &self,
        writer: &mut PacketWriter,
        packet: &Packet,
    ) -> Result<(), ConnectionError> {
        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(ConnectionError::ConnectionClosed);
            }
            match writer.feed(packet).await {
                Ok(()) => return Ok(()),
                Err(PacketError::Io(error)) if is_disconnect(&error) => {
                    trace!(%error, "stream closed while writing packet");
                    return Err(ConnectionError::ConnectionClosed);
                },
                Err(PacketError::Io(error)) => {
                    warn!(%error, "error writing packet (retrying)");
                    tokio::task::yield_now().await;
                },
                // Encoding failures are deterministic; retrying cannot help.
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn flush_with_retry(&self, writer: &mut PacketWriter) -> Result<(), ConnectionError> {
        loop {
            if self.shared.cancel.is_cancelled() {
                return Err(ConnectionError::ConnectionClosed);
            }
            match SinkExt::<&Packet>::flush(writer).await {
                Ok(()) => return Ok(()),
                Err(PacketError::Io(error)) if is_disconnect(&error) => {
                    trace!(%error, "stream closed while flushing");
                    return Err(ConnectionError::ConnectionClosed);
                },
                Err(PacketError::Io(error)) => {
                    warn!(%error, "error flushing packets (retrying)");
                    tokio::task::yield_now().await;
                },
                Err(error) => return Err(error.into()),
            }
        }
    }
}

/// Whether an I/O error means the transport is gone rather than transient.
fn is_disconnect(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// The per-connection reader task: parse packets, drive the assembler,
/// publish completed messages, and close the delivery channel on exit.
async fn read_loop(
    mut reader: PacketReader,
    delivery: mpsc::Sender<Message>,
    shared: Arc<ConnectionShared>,
) {
    let mut pending: HashMap<u64, Message> = HashMap::new();

    loop {
        let packet = tokio::select! {
            () = shared.cancel.cancelled() => {
                trace!("connection closed locally, reader exiting");
                break;
            },
            next = reader.next() => match next {
                None => {
                    trace!("clean end of stream");
                    break;
                },
                Some(Err(error)) => {
                    log_read_error(&error);
                    break;
                },
                Some(Ok(packet)) => packet,
            },
        };

        if let Err(error) = route_packet(packet, &mut pending, &delivery, &shared).await {
            match &error {
                ConnectionError::ConnectionClosed | ConnectionError::DeliveryClosed => {
                    trace!(%error, "reader exiting");
                },
                _ => error!(%error, "protocol violation, terminating reader"),
            }
            break;
        }
    }

    // Close the transport before the delivery sender drops so no further
    // sends can race the channel close.
    shared.close_transport().await;
}

fn log_read_error(error: &PacketError) {
    match error {
        PacketError::Io(io) if is_disconnect(io) => trace!(error = %io, "read loop ending"),
        other => error!(error = %other, "read error, terminating connection"),
    }
}

/// Applies one packet to the assembler state.
///
/// Any error returned here is fatal to the connection.
async fn route_packet(
    packet: Packet,
    pending: &mut HashMap<u64, Message>,
    delivery: &mpsc::Sender<Message>,
    shared: &ConnectionShared,
) -> Result<(), ConnectionError> {
    match packet {
        Packet::Header { msg_no, header } => {
            let expected = shared.incoming_msg_no.load(Ordering::SeqCst);
            if msg_no != expected {
                return Err(ConnectionError::OutOfSequence {
                    expected,
                    got: msg_no,
                });
            }
            if pending.contains_key(&msg_no) {
                return Err(ConnectionError::DuplicateHeader { msg_no });
            }

            pending.insert(msg_no, Message::from_header(&header));
            shared.incoming_msg_no.fetch_add(1, Ordering::SeqCst);
        },

        Packet::Data { msg_no, body } => {
            let message = pending
                .get_mut(&msg_no)
                .ok_or(ConnectionError::UntrackedMessage { msg_no })?;
            message.write(&body);
            let written = message.bytes_written();
            ack_bytes(shared, msg_no, written).await?;
        },

        Packet::Eof { msg_no } => {
            let message = pending
                .remove(&msg_no)
                .ok_or(ConnectionError::UntrackedMessage { msg_no })?;
            trace!(msg_no, "delivering message");
            delivery
                .send(message)
                .await
                .map_err(|_| ConnectionError::DeliveryClosed)?;
        },

        Packet::TxErr { msg_no, body } => {
            let mut message = pending
                .remove(&msg_no)
                .ok_or(ConnectionError::UntrackedMessage { msg_no })?;
            message.error = if body.is_empty() {
                DEFAULT_TXERR_MESSAGE.to_string()
            } else {
                String::from_utf8_lossy(&body).into_owned()
            };
            message.write(&body);
            let written = message.bytes_written();
            ack_bytes(shared, msg_no, written).await?;
            delivery
                .send(message)
                .await
                .map_err(|_| ConnectionError::DeliveryClosed)?;
        },

        Packet::Ack {
            msg_no,
            acked_bytes,
        } => {
            trace!(msg_no, acked_bytes, "peer acknowledged bytes");
            shared.acked.lock().insert(msg_no, acked_bytes);
        },
    }

    Ok(())
}

/// Writes an ACK for `msg_no` on the return path and flushes it, before the
/// reader processes any further inbound packet.
async fn ack_bytes(
    shared: &ConnectionShared,
    msg_no: u64,
    unacked_bytes: u64,
) -> Result<(), ConnectionError> {
    trace!(msg_no, unacked_bytes, "acking message bytes");
    let mut writer = shared.writer.lock().await;
    writer
        .send(&Packet::Ack {
            msg_no,
            acked_bytes: unacked_bytes,
        })
        .await?;
    Ok(())
}

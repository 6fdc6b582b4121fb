//! Self-delimiting packet codec for the courier wire protocol.
//!
//! This module implements a [`tokio_util::codec`] compatible codec for the
//! CRLF-framed packet envelope. Each packet consists of:
//!
//! ```text
//! +---------------------------------+------------------+------------+
//! | "TYPE MSGNO BODYLEN\r\n"        | Payload          | "END\r\n"  |
//! +---------------------------------+------------------+------------+
//! ```
//!
//! where `TYPE` is one of `HEADER`, `DATA`, `EOF`, `TXERR`, `ACK`, and
//! `MSGNO`/`BODYLEN` are ASCII decimal integers. `HEADER` payloads are a
//! JSON-encoded [`MessageHeader`]; `ACK` payloads are an ASCII decimal
//! cumulative byte count; `EOF` payloads are empty; `DATA`/`TXERR` payloads
//! are opaque bytes.
//!
//! # Bounded reads
//!
//! The codec enforces bounded reads:
//! - the command line must fit in [`MAX_COMMAND_LINE`] bytes,
//! - the declared body length is validated against the codec's maximum
//!   BEFORE allocation,
//! - oversized bodies are rejected with [`PacketError::BodyTooLarge`].
//!
//! # Invariants
//!
//! - The codec is stateless: it never inspects msgno ordering. Sequencing
//!   is enforced by the connection's packet router.
//! - Every encoded packet round-trips through `decode` to an equal value.

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum packet body size (16 MiB).
pub const MAX_PACKET_BODY: usize = 16 * 1024 * 1024;

/// Maximum length of the `TYPE MSGNO BODYLEN` command line, excluding CRLF.
///
/// The longest legal line (`TXERR` with both integers at their maximum
/// width) is well under this.
pub const MAX_COMMAND_LINE: usize = 64;

/// Trailer terminating every packet body on the wire.
const PACKET_TRAILER: &[u8] = b"END\r\n";

/// Errors produced while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The byte stream does not parse as a packet.
    #[error("malformed packet: {reason}")]
    Malformed {
        /// What failed to parse.
        reason: String,
    },

    /// The declared body length exceeds the codec's limit.
    #[error("packet body of {size} bytes exceeds limit of {max}")]
    BodyTooLarge {
        /// Declared body size in bytes.
        size: usize,
        /// Maximum allowed body size.
        max: usize,
    },

    /// A `HEADER` body failed to encode or decode as JSON.
    #[error("invalid header body: {0}")]
    HeaderJson(#[from] serde_json::Error),

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PacketError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Payload-encoding tag carried in message headers and action lookup keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    /// JSON-encoded payload.
    #[default]
    Json,
    /// JSON payload destined for a store-and-forward queue.
    Jsonstore,
}

impl Envelope {
    /// Returns the wire token for this envelope, as used in lookup keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonstore => "jsonstore",
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a message is a request or a reply to one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A request expecting a reply.
    #[default]
    Request,
    /// A reply correlated by request id.
    Reply,
}

/// Header fields carried by the first packet of every logical message.
///
/// Serialized as the JSON body of a `HEADER` packet. Empty string fields
/// are omitted on the wire and default on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Composite `Class.action` name the message addresses.
    #[serde(default)]
    pub action: String,

    /// Payload encoding.
    #[serde(default)]
    pub envelope: Envelope,

    /// Application error string, if the sender is reporting one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Application error code, if the sender is reporting one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,

    /// Caller-chosen correlation id. Non-zero on every outgoing message.
    #[serde(default)]
    pub request_id: u64,

    /// Opaque authorization ticket.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ticket: String,

    /// Request or reply.
    #[serde(default, rename = "type")]
    pub message_type: MessageType,

    /// Action version the caller is addressing.
    #[serde(default)]
    pub version: i64,
}

/// Wire packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Opens a logical message; body is the JSON header.
    Header,
    /// Appends body bytes to an open message.
    Data,
    /// Closes a message cleanly; empty body.
    Eof,
    /// Closes a message with a transmission error; body is the error text.
    TxErr,
    /// Acknowledges cumulative bytes received for a message.
    Ack,
}

impl PacketType {
    /// Returns the wire token for this packet type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Header => "HEADER",
            Self::Data => "DATA",
            Self::Eof => "EOF",
            Self::TxErr => "TXERR",
            Self::Ack => "ACK",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "HEADER" => Some(Self::Header),
            "DATA" => Some(Self::Data),
            "EOF" => Some(Self::Eof),
            "TXERR" => Some(Self::TxErr),
            "ACK" => Some(Self::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Opens logical message `msg_no`.
    Header {
        /// Message number this packet belongs to.
        msg_no: u64,
        /// Header fields copied into the new message.
        header: MessageHeader,
    },
    /// Appends `body` to message `msg_no`.
    Data {
        /// Message number this packet belongs to.
        msg_no: u64,
        /// Payload bytes.
        body: Bytes,
    },
    /// Completes message `msg_no`.
    Eof {
        /// Message number this packet belongs to.
        msg_no: u64,
    },
    /// Aborts message `msg_no` with an error; `body` is the error text.
    TxErr {
        /// Message number this packet belongs to.
        msg_no: u64,
        /// Error text bytes (may be empty).
        body: Bytes,
    },
    /// Acknowledges `acked_bytes` cumulative bytes received on `msg_no`.
    Ack {
        /// Message number being acknowledged.
        msg_no: u64,
        /// Cumulative byte count received so far.
        acked_bytes: u64,
    },
}

impl Packet {
    /// Returns the message number this packet addresses.
    #[must_use]
    pub const fn msg_no(&self) -> u64 {
        match self {
            Self::Header { msg_no, .. }
            | Self::Data { msg_no, .. }
            | Self::Eof { msg_no }
            | Self::TxErr { msg_no, .. }
            | Self::Ack { msg_no, .. } => *msg_no,
        }
    }

    /// Returns the wire type tag of this packet.
    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        match self {
            Self::Header { .. } => PacketType::Header,
            Self::Data { .. } => PacketType::Data,
            Self::Eof { .. } => PacketType::Eof,
            Self::TxErr { .. } => PacketType::TxErr,
            Self::Ack { .. } => PacketType::Ack,
        }
    }
}

/// Codec translating between the byte stream and [`Packet`] values.
///
/// Used with [`tokio_util::codec::FramedRead`] and
/// [`tokio_util::codec::FramedWrite`] on each half of a connection.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_body: usize,
}

impl PacketCodec {
    /// Creates a codec with the default body size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_body: MAX_PACKET_BODY,
        }
    }

    /// Creates a codec with a custom body size limit.
    #[must_use]
    pub const fn with_max_body(max_body: usize) -> Self {
        Self { max_body }
    }

    /// Returns the maximum body size this codec accepts.
    #[must_use]
    pub const fn max_body(&self) -> usize {
        self.max_body
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed `TYPE MSGNO BODYLEN` command line.
struct CommandLine {
    packet_type: PacketType,
    msg_no: u64,
    body_len: usize,
}

fn parse_command_line(line: &[u8]) -> Result<CommandLine, PacketError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| PacketError::malformed("command line is not valid UTF-8"))?;

    let mut fields = text.split(' ');
    let type_token = fields
        .next()
        .ok_or_else(|| PacketError::malformed("empty command line"))?;
    let packet_type = PacketType::from_token(type_token)
        .ok_or_else(|| PacketError::malformed(format!("unknown packet type `{type_token}`")))?;

    let msg_no = fields
        .next()
        .and_then(|f| f.parse::<u64>().ok())
        .ok_or_else(|| PacketError::malformed("missing or non-numeric msgno"))?;
    let body_len = fields
        .next()
        .and_then(|f| f.parse::<usize>().ok())
        .ok_or_else(|| PacketError::malformed("missing or non-numeric body length"))?;

    if fields.next().is_some() {
        return Err(PacketError::malformed("trailing fields on command line"));
    }

    Ok(CommandLine {
        packet_type,
        msg_no,
        body_len,
    })
}

/// Position of the first CRLF in `src`, if one is buffered.
fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|pair| pair == b"\r\n")
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        // Wait for the full command line before parsing anything, but never
        // buffer an unbounded line.
        let Some(line_len) = find_crlf(src) else {
            if src.len() > MAX_COMMAND_LINE {
                return Err(PacketError::malformed("command line too long"));
            }
            return Ok(None);
        };
        if line_len > MAX_COMMAND_LINE {
            return Err(PacketError::malformed("command line too long"));
        }

        let command = parse_command_line(&src[..line_len])?;

        // Validate the declared length BEFORE reserving or allocating.
        if command.body_len > self.max_body {
            return Err(PacketError::BodyTooLarge {
                size: command.body_len,
                max: self.max_body,
            });
        }

        let frame_len = line_len + 2 + command.body_len + PACKET_TRAILER.len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(line_len + 2);
        let body = src.split_to(command.body_len).freeze();
        let trailer = src.split_to(PACKET_TRAILER.len());
        if &trailer[..] != PACKET_TRAILER {
            return Err(PacketError::malformed("missing END trailer"));
        }

        let packet = match command.packet_type {
            PacketType::Header => Packet::Header {
                msg_no: command.msg_no,
                header: serde_json::from_slice(&body)?,
            },
            PacketType::Data => Packet::Data {
                msg_no: command.msg_no,
                body,
            },
            // A peer declaring a body on EOF is tolerated; the bytes carry
            // no meaning and are dropped.
            PacketType::Eof => Packet::Eof {
                msg_no: command.msg_no,
            },
            PacketType::TxErr => Packet::TxErr {
                msg_no: command.msg_no,
                body,
            },
            PacketType::Ack => {
                let acked_bytes = std::str::from_utf8(&body)
                    .ok()
                    .and_then(|text| text.parse::<u64>().ok())
                    .ok_or_else(|| PacketError::malformed("non-numeric ACK body"))?;
                Packet::Ack {
                    msg_no: command.msg_no,
                    acked_bytes,
                }
            },
        };

        Ok(Some(packet))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(PacketError::malformed("truncated packet at end of stream")),
        }
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, packet: &Packet, dst: &mut BytesMut) -> Result<(), PacketError> {
        let body: Bytes = match packet {
            Packet::Header { header, .. } => serde_json::to_vec(header)?.into(),
            Packet::Data { body, .. } | Packet::TxErr { body, .. } => body.clone(),
            Packet::Eof { .. } => Bytes::new(),
            Packet::Ack { acked_bytes, .. } => acked_bytes.to_string().into_bytes().into(),
        };

        if body.len() > self.max_body {
            return Err(PacketError::BodyTooLarge {
                size: body.len(),
                max: self.max_body,
            });
        }

        let line = format!(
            "{} {} {}\r\n",
            packet.packet_type(),
            packet.msg_no(),
            body.len()
        );
        dst.reserve(line.len() + body.len() + PACKET_TRAILER.len());
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(&body);
        dst.extend_from_slice(PACKET_TRAILER);

        Ok(())
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), PacketError> {
        self.encode(&packet, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) -> Packet {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&packet, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn header_roundtrip() {
        let header = MessageHeader {
            action: "Inventory.check".to_string(),
            envelope: Envelope::Json,
            request_id: 42,
            message_type: MessageType::Request,
            version: 1,
            ..MessageHeader::default()
        };
        let packet = Packet::Header { msg_no: 0, header };
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn header_omits_empty_optional_fields() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                &Packet::Header {
                    msg_no: 3,
                    header: MessageHeader {
                        action: "A.b".to_string(),
                        request_id: 7,
                        ..MessageHeader::default()
                    },
                },
                &mut buf,
            )
            .unwrap();

        let wire = String::from_utf8(buf.to_vec()).unwrap();
        assert!(wire.starts_with("HEADER 3 "));
        assert!(!wire.contains("\"error\""));
        assert!(!wire.contains("\"ticket\""));
        assert!(wire.contains("\"type\":\"request\""));
    }

    #[test]
    fn data_roundtrip() {
        let packet = Packet::Data {
            msg_no: 9,
            body: Bytes::from_static(b"{\"ok\":true}"),
        };
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn eof_has_empty_body() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&Packet::Eof { msg_no: 2 }, &mut buf).unwrap();
        assert_eq!(&buf[..], b"EOF 2 0\r\nEND\r\n");
    }

    #[test]
    fn ack_body_is_ascii_decimal() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                &Packet::Ack {
                    msg_no: 5,
                    acked_bytes: 2048,
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], b"ACK 5 4\r\n2048END\r\n");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            Packet::Ack {
                msg_no: 5,
                acked_bytes: 2048
            }
        );
    }

    #[test]
    fn decode_partial_command_line() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&b"DATA 1 1"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn decode_partial_body() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&b"DATA 1 10\r\nabc"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_multiple_packets() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                &Packet::Data {
                    msg_no: 0,
                    body: Bytes::from_static(b"first"),
                },
                &mut buf,
            )
            .unwrap();
        codec.encode(&Packet::Eof { msg_no: 0 }, &mut buf).unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().packet_type(),
            PacketType::Data
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Packet::Eof { msg_no: 0 }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_type_is_malformed() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&b"PING 0 0\r\nEND\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn bad_trailer_is_malformed() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&b"DATA 0 2\r\nabEND\n\r"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn non_numeric_ack_is_malformed() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&b"ACK 0 3\r\nxyzEND\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn oversized_body_rejected_before_buffering() {
        let mut codec = PacketCodec::with_max_body(16);
        // Only the command line is buffered; the declared length alone must
        // trigger the rejection.
        let mut buf = BytesMut::from(&b"DATA 0 1024\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PacketError::BodyTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn unbounded_command_line_rejected() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(vec![b'A'; MAX_COMMAND_LINE + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn garbled_header_json_is_rejected() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&b"HEADER 0 3\r\n{{{END\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PacketError::HeaderJson(_))
        ));
    }

    #[test]
    fn decode_eof_clean() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_eof_truncated() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&b"DATA 0 100\r\npartial"[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn header_defaults_on_sparse_json() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&b"HEADER 0 2\r\n{}END\r\n"[..]);
        let Packet::Header { header, .. } = codec.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected HEADER");
        };
        assert_eq!(header.envelope, Envelope::Json);
        assert_eq!(header.message_type, MessageType::Request);
        assert_eq!(header.request_id, 0);
        assert!(header.error.is_empty());
    }
}

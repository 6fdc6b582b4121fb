//! Logical message model.
//!
//! A [`Message`] is the unit callers send and receive. On the wire it is
//! decomposed into an ordered packet stream (`HEADER`, `DATA`*, `EOF`) on a
//! single message number; inbound, the connection's packet router
//! reassembles it from the same stream.

use bytes::Bytes;

use crate::packet::{Envelope, MessageHeader, MessageType, Packet};

/// Maximum body bytes carried by a single `DATA` packet.
///
/// Larger bodies are split into contiguous chunks at this size.
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// A logical request or reply message.
///
/// Header fields are plain data; the body is an append-only buffer. While a
/// message is being reassembled it is mutated only by the connection's
/// reader task; once delivered it is owned by the consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Composite `Class.action` name.
    pub action: String,
    /// Payload encoding.
    pub envelope: Envelope,
    /// Action version.
    pub version: i64,
    /// Request or reply.
    pub message_type: MessageType,
    /// Correlation id. Must be non-zero before sending.
    pub request_id: u64,
    /// Error string, set from the header or by a `TXERR` packet.
    pub error: String,
    /// Error code string.
    pub error_code: String,
    /// Opaque authorization ticket.
    pub ticket: String,

    body: Vec<u8>,
}

impl Message {
    /// Creates an empty request message.
    #[must_use]
    pub fn new_request() -> Self {
        Self {
            message_type: MessageType::Request,
            ..Self::default()
        }
    }

    /// Creates an empty reply message.
    #[must_use]
    pub fn new_reply() -> Self {
        Self {
            message_type: MessageType::Reply,
            ..Self::default()
        }
    }

    /// Creates a message from the header fields of an accepted `HEADER`
    /// packet. The packet header can be discarded afterwards.
    #[must_use]
    pub fn from_header(header: &MessageHeader) -> Self {
        Self {
            action: header.action.clone(),
            envelope: header.envelope,
            version: header.version,
            message_type: header.message_type,
            request_id: header.request_id,
            error: header.error.clone(),
            error_code: header.error_code.clone(),
            ticket: header.ticket.clone(),
            body: Vec::new(),
        }
    }

    /// Returns the header fields of this message, for the `HEADER` packet.
    #[must_use]
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            action: self.action.clone(),
            envelope: self.envelope,
            error: self.error.clone(),
            error_code: self.error_code.clone(),
            request_id: self.request_id,
            ticket: self.ticket.clone(),
            message_type: self.message_type,
            version: self.version,
        }
    }

    /// Appends bytes to the message body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Returns the body accumulated so far.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the number of body bytes written, as acknowledged to peers.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.body.len() as u64
    }

    /// Decomposes this message into its wire packet sequence on `msg_no`:
    /// one `HEADER`, zero or more `DATA` chunks, one `EOF`.
    #[must_use]
    pub fn to_packets(&self, msg_no: u64) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(2 + self.body.len().div_ceil(DATA_CHUNK_SIZE));
        packets.push(Packet::Header {
            msg_no,
            header: self.header(),
        });
        for chunk in self.body.chunks(DATA_CHUNK_SIZE) {
            packets.push(Packet::Data {
                msg_no,
                body: Bytes::copy_from_slice(chunk),
            });
        }
        packets.push(Packet::Eof { msg_no });
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    #[test]
    fn empty_body_yields_header_and_eof_only() {
        let mut msg = Message::new_request();
        msg.action = "Ping.ping".to_string();
        msg.request_id = 1;

        let packets = msg.to_packets(0);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet_type(), PacketType::Header);
        assert_eq!(packets[1], Packet::Eof { msg_no: 0 });
    }

    #[test]
    fn body_is_chunked_contiguously() {
        let mut msg = Message::new_request();
        msg.request_id = 2;
        msg.write(&vec![0xAB; DATA_CHUNK_SIZE + 100]);

        let packets = msg.to_packets(7);
        assert_eq!(packets.len(), 4);

        let Packet::Data { body: first, .. } = &packets[1] else {
            panic!("expected DATA");
        };
        let Packet::Data { body: second, .. } = &packets[2] else {
            panic!("expected DATA");
        };
        assert_eq!(first.len(), DATA_CHUNK_SIZE);
        assert_eq!(second.len(), 100);
        assert!(packets.iter().all(|p| p.msg_no() == 7));
    }

    #[test]
    fn header_fields_survive_the_header_packet() {
        let mut msg = Message::new_reply();
        msg.action = "Inventory.check".to_string();
        msg.request_id = 99;
        msg.version = 2;
        msg.error = "boom".to_string();

        let rebuilt = Message::from_header(&msg.header());
        assert_eq!(rebuilt.action, msg.action);
        assert_eq!(rebuilt.request_id, 99);
        assert_eq!(rebuilt.message_type, MessageType::Reply);
        assert_eq!(rebuilt.version, 2);
        assert_eq!(rebuilt.error, "boom");
        assert_eq!(rebuilt.bytes_written(), 0);
    }
}

//! # courier-core
//!
//! Wire protocol and service discovery primitives for courier, a
//! service-to-service messaging substrate.
//!
//! This crate carries the transport-independent pieces:
//!
//! - **Packet codec**: the self-delimiting CRLF-framed packet envelope
//!   (`HEADER`, `DATA`, `EOF`, `TXERR`, `ACK`)
//! - **Message model**: logical messages and their packetisation
//! - **Discovery records**: the signed class-record format and its
//!   line-oriented cache file framing
//! - **Service cache**: the dual-index lookup structure over verified
//!   records
//!
//! The async connection engine and service runtime live in `courier-net`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod crypto;
pub mod message;
pub mod packet;
pub mod record;

pub use cache::{CacheError, ServiceCache};
pub use message::{DATA_CHUNK_SIZE, Message};
pub use packet::{
    Envelope, MessageHeader, MessageType, Packet, PacketCodec, PacketError, PacketType,
};
pub use record::{
    ActionRecord, ClassRecord, ClassRecords, RecordBlock, RecordError, ServiceProxy,
};

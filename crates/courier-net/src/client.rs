//! Client handle over one connection.
//!
//! A [`Client`] pairs a [`Connection`] with the receiving end of its
//! delivery channel. Services wrap accepted connections in the same type,
//! so handlers reply through the handle they were given.

use courier_core::message::Message;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsStream;
use tracing::info;

use crate::connection::{Connection, ConnectionError};
use crate::tls::TlsConfig;

/// Errors establishing a client connection.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The connspec host does not parse as a DNS name or IP address.
    #[error("invalid connspec `{connspec}`")]
    InvalidConnspec {
        /// The offending connspec.
        connspec: String,
    },

    /// TCP connect or TLS handshake failed.
    #[error("failed to connect: {0}")]
    Connect(#[from] std::io::Error),
}

/// One end of a courier connection: send messages, receive deliveries.
pub struct Client {
    connection: Connection,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl Client {
    /// Dials a secure connection to `connspec` (`host:port`).
    ///
    /// The peer certificate is not chain-validated; callers are expected to
    /// check [`Client::fingerprint`] against the service's discovery
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConnspec`] for an unparseable host, or
    /// [`ClientError::Connect`] if the dial or handshake fails.
    pub async fn connect(connspec: &str, tls: &TlsConfig) -> Result<Self, ClientError> {
        info!(connspec = %connspec, "dialing connection");

        let host = connspec.rsplit_once(':').map_or(connspec, |(host, _)| host);
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|_| ClientError::InvalidConnspec {
                connspec: connspec.to_string(),
            })?;

        let tcp = TcpStream::connect(connspec).await?;
        let stream = tls.connector().connect(server_name, tcp).await?;

        let (connection, delivery) = Connection::spawn(TlsStream::Client(stream));
        Ok(Self::from_connection(connection, delivery))
    }

    /// Wraps an already-established connection (the service side of an
    /// accept).
    #[must_use]
    pub fn from_connection(connection: Connection, delivery: mpsc::Receiver<Message>) -> Self {
        Self {
            connection,
            incoming: tokio::sync::Mutex::new(delivery),
        }
    }

    /// Receives the next completed inbound message.
    ///
    /// Returns `None` once the connection's reader has terminated and the
    /// delivery channel is drained.
    pub async fn recv(&self) -> Option<Message> {
        self.incoming.lock().await.recv().await
    }

    /// Sends a message on the underlying connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        self.connection.send(message).await
    }

    /// Closes the underlying connection. Idempotent.
    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// SHA-1 fingerprint of the peer certificate, when presented.
    #[must_use]
    pub fn fingerprint(&self) -> Option<&str> {
        self.connection.fingerprint()
    }

    /// The underlying connection handle.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

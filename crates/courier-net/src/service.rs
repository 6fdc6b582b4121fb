//! Service runtime: TLS listener, action registry, and dispatcher.
//!
//! A [`Service`] binds a TLS listener, wraps each accepted connection in a
//! [`Client`], and runs one dispatcher task per client that maps inbound
//! message actions to registered handlers. Unknown actions are answered
//! with a JSON error reply; clients idle past [`CLIENT_IDLE_TIMEOUT`] are
//! disconnected.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use courier_core::crypto::{CryptoError, RecordSigningKey, load_signing_key};
use courier_core::message::Message;
use courier_core::packet::Envelope;
use courier_core::record::{
    ActionRecord, ClassRecord, ClassRecords, RecordError, render_signed_record,
};
use futures::future::BoxFuture;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio_rustls::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::client::Client;
use crate::config::Config;
use crate::connection::Connection;
use crate::tls::{TlsConfig, TlsError};

/// Idle timeout applied between inbound messages on each client.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum byte length of a service's human name.
pub const MAX_HUMAN_NAME_LEN: usize = 18;

/// Seconds between discovery announcements, advertised in class records.
pub const DEFAULT_ANNOUNCE_INTERVAL: u64 = 15;

/// Body of the reply sent for actions no handler is registered for.
const NO_SUCH_ACTION_BODY: &[u8] = br#"{"error": "no such action"}"#;

/// Errors surfaced by the service runtime.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The human name exceeds [`MAX_HUMAN_NAME_LEN`] bytes.
    #[error("name `{name}` is too long, must be at most {max} bytes")]
    NameTooLong {
        /// The offending name.
        name: String,
        /// Maximum allowed length.
        max: usize,
    },

    /// No certificate/key pair was found for the service.
    #[error("could not find a valid crt/key pair for service `{name}`")]
    MissingIdentity {
        /// The service's human name.
        name: String,
    },

    /// Handler registration attempted while the service is running.
    #[error("cannot register handlers while the service is running")]
    AlreadyRunning,

    /// TLS identity failed to load.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The service key failed to parse.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Discovery record serialization failed.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Listener or socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A registered handler invoked for one message.
pub trait ActionHandler: Send + Sync {
    /// Handles one inbound message; replies go through `client`.
    fn handle(&self, message: Message, client: Arc<Client>) -> BoxFuture<'static, ()>;
}

impl<F, Fut> ActionHandler for F
where
    F: Fn(Message, Arc<Client>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, message: Message, client: Arc<Client>) -> BoxFuture<'static, ()> {
        Box::pin(self(message, client))
    }
}

struct ServiceAction {
    handler: Arc<dyn ActionHandler>,
    crud_tags: String,
    version: i64,
}

/// A courier service: TLS listener plus action dispatcher.
pub struct Service {
    sector: String,
    human_name: String,
    name: String,

    listener: TcpListener,
    local_addr: SocketAddr,
    tls: TlsConfig,
    signing_key: RecordSigningKey,
    certificate_pem: String,

    actions: parking_lot::Mutex<HashMap<String, ServiceAction>>,
    running: AtomicBool,
    clients: parking_lot::Mutex<Vec<Arc<Client>>>,
    connections_accepted: AtomicU64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("sector", &self.sector)
            .field("human_name", &self.human_name)
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field(
                "connections_accepted",
                &self.connections_accepted.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Creates a service bound to `connspec`, discovering its certificate
    /// and key through `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::MissingIdentity`] if no cert/key pair exists
    /// for `human_name`, otherwise as [`Service::bind_with_identity`].
    pub async fn bind(
        sector: &str,
        connspec: &str,
        human_name: &str,
        config: &Config,
    ) -> Result<Self, ServiceError> {
        let missing = || ServiceError::MissingIdentity {
            name: human_name.to_string(),
        };
        let cert_path = config.service_cert_path(human_name).ok_or_else(missing)?;
        let key_path = config.service_key_path(human_name).ok_or_else(missing)?;

        let certificate_pem = std::fs::read_to_string(&cert_path)?;
        let key_pem = std::fs::read_to_string(&key_path)?;
        Self::bind_with_identity(sector, connspec, human_name, &certificate_pem, &key_pem).await
    }

    /// Creates a service bound to `connspec` with an explicitly supplied
    /// PEM certificate and key, rather than discovered ones.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NameTooLong`] for an oversized name, or an
    /// error loading the identity or binding the listener.
    pub async fn bind_with_identity(
        sector: &str,
        connspec: &str,
        human_name: &str,
        certificate_pem: &str,
        key_pem: &str,
    ) -> Result<Self, ServiceError> {
        if human_name.len() > MAX_HUMAN_NAME_LEN {
            return Err(ServiceError::NameTooLong {
                name: human_name.to_string(),
                max: MAX_HUMAN_NAME_LEN,
            });
        }

        let signing_key = load_signing_key(key_pem)?;
        let tls = TlsConfig::from_pem(certificate_pem.as_bytes(), key_pem.as_bytes())?;

        info!(connspec = %connspec, "starting service");
        let listener = TcpListener::bind(connspec).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "service now listening");

        Ok(Self {
            sector: sector.to_string(),
            human_name: human_name.to_string(),
            name: generate_instance_name(human_name),
            listener,
            local_addr,
            tls,
            signing_key,
            certificate_pem: certificate_pem.trim().to_string(),
            actions: parking_lot::Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            clients: parking_lot::Mutex::new(Vec::new()),
            connections_accepted: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Registers a handler for the composite `Class.action` name.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyRunning`] once the accept loop has
    /// started.
    pub fn register<H>(&self, name: &str, handler: H) -> Result<(), ServiceError>
    where
        H: ActionHandler + 'static,
    {
        if self.running.load(Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }
        self.actions.lock().insert(
            name.to_string(),
            ServiceAction {
                handler: Arc::new(handler),
                crud_tags: String::new(),
                version: 1,
            },
        );
        Ok(())
    }

    /// Runs the accept loop until [`Service::stop`] is called or the
    /// listener fails. Every accepted connection gets its own dispatcher
    /// task; all clients are closed when the loop exits.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let Some(acceptor) = self.tls.acceptor() else {
            // bind_with_identity always installs an acceptor.
            error!("service tls config has no acceptor");
            return;
        };

        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (tcp, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(error) => {
                    trace!(%error, "exiting service accept loop");
                    break;
                },
            };

            let acceptor = acceptor.clone();
            let service = Arc::clone(&self);
            self.connections_accepted.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                let stream = match acceptor.accept(tcp).await {
                    Ok(stream) => stream,
                    Err(error) => {
                        trace!(peer = %peer_addr, %error, "tls handshake failed");
                        return;
                    },
                };

                let (connection, delivery) = Connection::spawn(TlsStream::Server(stream));
                let client = Arc::new(Client::from_connection(connection, delivery));
                service.clients.lock().push(Arc::clone(&client));
                service.handle_client(client).await;
            });
        }

        let clients: Vec<_> = self.clients.lock().drain(..).collect();
        for client in clients {
            client.close().await;
        }
    }

    /// Dispatches inbound messages for one client until the connection
    /// closes or the idle timeout fires.
    async fn handle_client(self: Arc<Self>, client: Arc<Client>) {
        loop {
            let message = match tokio::time::timeout(CLIENT_IDLE_TIMEOUT, client.recv()).await {
                Err(_) => {
                    trace!("client idle timeout");
                    break;
                },
                Ok(None) => break,
                Ok(Some(message)) => message,
            };

            let handler = self
                .actions
                .lock()
                .get(&message.action)
                .map(|action| Arc::clone(&action.handler));

            if let Some(handler) = handler {
                handler.handle(message, Arc::clone(&client)).await;
            } else {
                error!(action = %message.action, "do not know how to handle action");

                let mut reply = Message::new_reply();
                reply.envelope = Envelope::Json;
                reply.request_id = message.request_id;
                reply.write(NO_SUCH_ACTION_BODY);

                if let Err(error) = client.send(&reply).await {
                    warn!(%error, "failed to send no-such-action reply");
                    client.close().await;
                    break;
                }
            }
        }

        client.close().await;
        self.remove_client(&client);
    }

    /// Drops a client from the tracking list.
    fn remove_client(&self, client: &Arc<Client>) {
        let mut clients = self.clients.lock();
        if let Some(index) = clients.iter().position(|entry| Arc::ptr_eq(entry, client)) {
            clients.remove(index);
        } else {
            error!("tried removing a client that was not being tracked");
        }
    }

    /// Stops the accept loop. Safe to call before or after `run`, and more
    /// than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Renders this service's signed discovery record, ready to follow a
    /// `%%%` separator in the cache file.
    ///
    /// # Errors
    ///
    /// Returns a wrapped [`RecordError`] if serialization fails.
    pub fn to_cache_text(&self) -> Result<String, ServiceError> {
        Ok(render_signed_record(
            &self.class_records(),
            &self.certificate_pem,
            &self.signing_key,
        )?)
    }

    /// Builds the class-record payload from the registered actions,
    /// grouping composite names by their class prefix.
    fn class_records(&self) -> ClassRecords {
        let actions = self.actions.lock();
        let mut classes: BTreeMap<String, Vec<ActionRecord>> = BTreeMap::new();
        for (name, action) in actions.iter() {
            let (class, action_name) = name.split_once('.').unwrap_or((name.as_str(), ""));
            classes.entry(class.to_string()).or_default().push(ActionRecord {
                name: action_name.to_string(),
                crud_tags: action.crud_tags.clone(),
                version: action.version,
            });
        }

        let classes = classes
            .into_iter()
            .map(|(name, mut actions)| {
                actions.sort_by(|a, b| a.name.cmp(&b.name));
                ClassRecord { name, actions }
            })
            .collect();

        ClassRecords {
            version: 3,
            ident: self.name.clone(),
            sector: self.sector.clone(),
            weight: 1,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            connspec: self.local_addr.to_string(),
            protocols: vec![Envelope::Json.as_str().to_string()],
            classes,
        }
    }

    /// The randomized instance name (`human_name` plus random suffix).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured human name.
    #[must_use]
    pub fn human_name(&self) -> &str {
        &self.human_name
    }

    /// The sector this service announces into.
    #[must_use]
    pub fn sector(&self) -> &str {
        &self.sector
    }

    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop has started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Total connections accepted since startup.
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::SeqCst)
    }

    /// Number of clients currently tracked.
    #[must_use]
    pub fn open_connections(&self) -> u64 {
        self.clients.lock().len() as u64
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Generates the instance name: the human name plus a random base64
/// suffix, unique per process lifetime.
fn generate_instance_name(human_name: &str) -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{human_name}-{}", STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_names_carry_the_human_name() {
        let name = generate_instance_name("inventory");
        assert!(name.starts_with("inventory-"));
        assert!(name.len() > "inventory-".len());
    }

    #[test]
    fn instance_names_are_unique() {
        assert_ne!(generate_instance_name("svc"), generate_instance_name("svc"));
    }
}

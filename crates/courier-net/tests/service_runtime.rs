//! Service dispatcher tests: registered actions, unknown-action replies,
//! discovery text, and stats.

use std::sync::Arc;
use std::time::Duration;

use courier_core::cache::ServiceCache;
use courier_core::message::Message;
use courier_core::packet::{Envelope, MessageType};
use courier_core::record::RECORD_SEPARATOR;
use courier_net::client::Client;
use courier_net::service::Service;
use courier_net::stats::gather_stats;
use courier_net::tls::TlsConfig;

const SERVICE_CERT_PEM: &str = include_str!("fixtures/service.crt");
const SERVICE_KEY_PEM: &str = include_str!("fixtures/service.key");

async fn start_service() -> Arc<Service> {
    let service = Service::bind_with_identity(
        "main",
        "127.0.0.1:0",
        "inventory",
        SERVICE_CERT_PEM,
        SERVICE_KEY_PEM,
    )
    .await
    .unwrap();

    service
        .register("Inventory.check", |message: Message, client: Arc<Client>| async move {
            let mut reply = Message::new_reply();
            reply.envelope = Envelope::Json;
            reply.request_id = message.request_id;
            reply.write(br#"{"stocked":true}"#);
            client.send(&reply).await.unwrap();
        })
        .unwrap();

    let service = Arc::new(service);
    let runner = Arc::clone(&service);
    tokio::spawn(async move { runner.run().await });
    service
}

fn request(action: &str, request_id: u64, body: &[u8]) -> Message {
    let mut message = Message::new_request();
    message.action = action.to_string();
    message.envelope = Envelope::Json;
    message.version = 1;
    message.request_id = request_id;
    message.write(body);
    message
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registered_action_gets_a_reply() {
    let service = start_service().await;
    let client = Client::connect(&service.local_addr().to_string(), &TlsConfig::client_only())
        .await
        .unwrap();

    client
        .send(&request("Inventory.check", 42, b"{}"))
        .await
        .unwrap();

    let reply = client.recv().await.expect("reply delivered");
    assert_eq!(reply.message_type, MessageType::Reply);
    assert_eq!(reply.request_id, 42);
    assert_eq!(reply.body(), br#"{"stocked":true}"#);

    client.close().await;
    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_action_gets_error_reply() {
    let service = start_service().await;
    let client = Client::connect(&service.local_addr().to_string(), &TlsConfig::client_only())
        .await
        .unwrap();

    client
        .send(&request("Inventory.vanish", 7, b"{}"))
        .await
        .unwrap();

    let reply = client.recv().await.expect("error reply delivered");
    assert_eq!(reply.message_type, MessageType::Reply);
    assert_eq!(reply.envelope, Envelope::Json);
    assert_eq!(reply.request_id, 7);
    assert_eq!(reply.body(), br#"{"error": "no such action"}"#);

    // The connection survives an unknown action.
    client
        .send(&request("Inventory.check", 8, b"{}"))
        .await
        .unwrap();
    assert_eq!(client.recv().await.unwrap().request_id, 8);

    client.close().await;
    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn register_rejected_while_running() {
    let service = start_service().await;
    for _ in 0..500 {
        if service.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = service
        .register("Late.arrival", |_: Message, _: Arc<Client>| async {})
        .unwrap_err();
    assert!(matches!(
        err,
        courier_net::service::ServiceError::AlreadyRunning
    ));
    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovery_text_roundtrips_through_the_cache() {
    let service = start_service().await;

    let mut file_contents = String::from(RECORD_SEPARATOR);
    file_contents.push('\n');
    file_contents.push_str(&service.to_cache_text().unwrap());

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), &file_contents).unwrap();

    let cache = ServiceCache::new(file.path());
    cache.refresh().unwrap();

    assert_eq!(cache.size(), 1);
    let proxy = cache.retrieve(service.name()).expect("service indexed");
    proxy.validate().expect("signature verifies");
    assert_eq!(proxy.sector(), "main");
    assert_eq!(proxy.connspec(), service.local_addr().to_string());

    let hits = cache.search_by_action("main", "Inventory.check", 1, "json");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].ident(), service.name());

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_track_accepted_and_open_connections() {
    let service = start_service().await;
    let client = Client::connect(&service.local_addr().to_string(), &TlsConfig::client_only())
        .await
        .unwrap();

    // Exchange one message so the accept is fully processed.
    client
        .send(&request("Inventory.check", 1, b"{}"))
        .await
        .unwrap();
    client.recv().await.unwrap();

    let stats = gather_stats(&service);
    assert_eq!(stats.total_clients_accepted, 1);
    assert_eq!(stats.open_connections, 1);

    client.close().await;

    // The dispatcher notices the closed delivery channel and untracks.
    for _ in 0..500 {
        if gather_stats(&service).open_connections == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gather_stats(&service).open_connections, 0);

    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_human_name_is_rejected() {
    let err = Service::bind_with_identity(
        "main",
        "127.0.0.1:0",
        "a-name-well-over-eighteen-bytes",
        SERVICE_CERT_PEM,
        SERVICE_KEY_PEM,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        courier_net::service::ServiceError::NameTooLong { .. }
    ));
}

//! End-to-end tests over real WebSocket sessions.
//!
//! Each test starts a server on a free port and talks to it with
//! [`SessionClient`] or a raw tungstenite connection.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

use strand_core::markup::nodes_to_collaborative;
use strand_core::{
    class, AttributeDef, Attributes, ClassDef, ClassId, CollaborativeRef, DocId, Hierarchy,
    MarkupNode, Query, TxFactory, TypeKind, WorkspaceId,
};
use strand_server::workspace::SYSTEM_ACCOUNT;
use strand_server::{
    FindParams, HelloParams, ServerConfig, ServerError, SessionClient, SessionEvent, StrandServer,
    WorkspaceSettings,
};

const ISSUE: ClassId = ClassId::from_static("tracker:class:Issue");

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn settings() -> WorkspaceSettings {
    let mut schema = Hierarchy::platform();
    schema.add(
        ClassDef::new(ISSUE)
            .extends(class::DOC)
            .domain("tracker")
            .attribute(AttributeDef::new("title", TypeKind::String))
            .attribute(AttributeDef::new("content", TypeKind::CollaborativeMarkup)),
    );
    WorkspaceSettings {
        schema: Arc::new(schema),
        ..WorkspaceSettings::default()
    }
}

/// Start a server on a free port. Returns the server and its URL.
async fn start_test_server(mut config: ServerConfig) -> (Arc<StrandServer>, String) {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let server = Arc::new(StrandServer::new(config, settings()).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

fn issue(title: &str) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("title".into(), json!(title));
    attrs
}

async fn connect(url: &str, hello: HelloParams) -> SessionClient {
    timeout(Duration::from_secs(2), SessionClient::connect(url, "acme", hello))
        .await
        .expect("connect timed out")
        .unwrap()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let result = tokio_tungstenite::connect_async(format!("{url}/acme")).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_hello_and_ping() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let mut client = connect(&url, HelloParams::default()).await;
    let mut events = client.take_event_rx().unwrap();

    assert!(matches!(events.recv().await, Some(SessionEvent::Connected)));
    assert!(client.session_id().is_some());
    client.ping().await.unwrap();
    assert!(client.is_connected());

    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_workspaces, 1);
}

#[tokio::test]
async fn test_invalid_workspace_is_rejected() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let result = SessionClient::connect(&url, "not.a.workspace", HelloParams::default()).await;
    assert!(matches!(result, Err(ServerError::WebSocket(_))));
}

#[tokio::test]
async fn test_large_find_all_arrives_in_chunks() {
    let config = ServerConfig {
        chunk_limit: 512,
        ..ServerConfig::default()
    };
    let (_server, url) = start_test_server(config).await;
    let client = connect(&url, HelloParams::default()).await;

    let f = TxFactory::new(SYSTEM_ACCOUNT);
    for i in 0..101 {
        let tx = f.create_doc(ISSUE, DocId::nil(), DocId::new(), issue(&format!("issue {i:03}")));
        client.apply(&tx).await.unwrap();
    }

    let result = timeout(
        Duration::from_secs(5),
        client.find_all(&FindParams::new(ISSUE, Query::new())),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.total, 101);
    assert_eq!(result.docs.len(), 101);

    let mut params = FindParams::new(ISSUE, Query::new());
    params.limit = Some(10);
    let limited = client.find_all(&params).await.unwrap();
    assert_eq!(limited.total, 101);
    assert_eq!(limited.docs.len(), 10);
}

#[tokio::test]
async fn test_transactions_are_broadcast_to_other_sessions() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let writer = connect(&url, HelloParams::default()).await;
    let mut reader = connect(
        &url,
        HelloParams {
            binary: true,
            compression: true,
        },
    )
    .await;
    let mut events = reader.take_event_rx().unwrap();
    assert!(matches!(events.recv().await, Some(SessionEvent::Connected)));

    let id = DocId::new();
    let f = TxFactory::new(SYSTEM_ACCOUNT);
    let sequence = writer
        .apply(&f.create_doc(ISSUE, DocId::nil(), id, issue("shared")))
        .await
        .unwrap();
    assert_eq!(sequence, 0);

    let txs = loop {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(SessionEvent::Transactions(txs)) if !txs.is_empty() => break txs,
            Some(SessionEvent::Transactions(_)) => continue,
            other => panic!("Expected transactions, got {other:?}"),
        }
    };
    assert_eq!(txs[0].object_id, id);

    // The binary, compressed session can still issue requests.
    let found = reader
        .find_all(&FindParams::new(ISSUE, Query::new().eq("title", "shared")))
        .await
        .unwrap();
    assert_eq!(found.docs.len(), 1);
}

#[tokio::test]
async fn test_collaborative_content_over_the_wire() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let client = connect(&url, HelloParams::default()).await;

    let f = TxFactory::new(SYSTEM_ACCOUNT);
    let target = DocId::new();
    let source = DocId::new();
    client
        .apply(&f.create_doc(ISSUE, DocId::nil(), target, issue("target")))
        .await
        .unwrap();
    client
        .apply(&f.create_doc(ISSUE, DocId::nil(), source, issue("source")))
        .await
        .unwrap();

    let reference = CollaborativeRef::new(source, "content");
    assert_eq!(client.load_collaborative(&reference).await.unwrap(), None);

    let update = nodes_to_collaborative(
        &MarkupNode::new("doc").with_child(MarkupNode::reference(target, &ISSUE, "Target")),
        "content",
    );
    let sequence = client.update_collaborative(&reference, &update).await.unwrap();
    assert!(sequence.is_some());
    assert!(client.load_collaborative(&reference).await.unwrap().is_some());

    let mut found = 0;
    for _ in 0..100 {
        let query = Query::new().eq("attachedTo", target).eq("srcDocId", source);
        found = client
            .find_all(&FindParams::new(class::ACTIVITY_REFERENCE, query))
            .await
            .unwrap()
            .docs
            .len();
        if found == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(found, 1);
}

#[tokio::test]
async fn test_failed_request_reports_error() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let client = connect(&url, HelloParams::default()).await;

    let f = TxFactory::new(SYSTEM_ACCOUNT);
    let create = f.create_doc(ISSUE, DocId::nil(), DocId::new(), issue("once"));
    client.apply(&create).await.unwrap();
    let result = client.apply(&create).await;
    assert!(matches!(result, Err(ServerError::Remote(_))));

    // The session survives the failed call.
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_commits_are_written_to_storage() {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().to_path_buf()),
        ..ServerConfig::default()
    };
    let (server, url) = start_test_server(config).await;
    let client = connect(&url, HelloParams::default()).await;

    let id = DocId::new();
    let f = TxFactory::new(SYSTEM_ACCOUNT);
    client
        .apply(&f.create_doc(ISSUE, DocId::nil(), id, issue("durable")))
        .await
        .unwrap();
    client.close().await.unwrap();

    let workspace = server.registry().get(&WorkspaceId::new("acme")).await.unwrap();
    let storage = workspace.storage().unwrap();
    let docs = storage.load_documents().unwrap();
    assert!(docs.iter().any(|d| d.id == id && d.str_attr("title") == Some("durable")));
    assert!(storage.recover_sequence().unwrap() >= 1);
}

//! Both roles over loopback TCP.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::secret::SecretString;
use relay_rpc::endpoint::{self, AcceptorConfig, InitiatorConfig};
use relay_rpc::handshake::ClientCredentials;
use relay_rpc::{CallError, CloseReason, HandlerError, HandlerRegistry};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn acceptor_config() -> AcceptorConfig {
    AcceptorConfig {
        heartbeat_interval: Duration::from_secs(30),
        handshake_timeout: Duration::from_secs(15),
    }
}

fn initiator_config(secret: &str) -> InitiatorConfig {
    InitiatorConfig {
        credentials: ClientCredentials {
            client_id: "1512".to_string(),
            secret: SecretString::from(secret),
        },
        info: json!({"max_sessions": 15, "acceptable_regions": ["us-east"]}),
        handshake_timeout: Duration::from_secs(15),
    }
}

#[tokio::test]
async fn test_calls_flow_in_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let credentials = HashMap::from([("1512".to_string(), SecretString::from("hello_world"))]);

        endpoint::accept(
            socket,
            &credentials,
            acceptor_config(),
            |client_id| async move { json!({"connection_id": format!("{client_id}-00ff")}) },
            |accepted| {
                let mut handlers = HandlerRegistry::new();
                handlers.on_call("info", |_conn, _args| async { Ok(json!("voice-relay")) });
                (accepted.client_id.clone(), handlers)
            },
            CancellationToken::new(),
        )
        .await
        .unwrap()
    });

    let socket = TcpStream::connect(addr).await.unwrap();
    let client = endpoint::connect(
        socket,
        &initiator_config("hello_world"),
        |server_info| {
            let connection_id = server_info["connection_id"].as_str().unwrap_or_default().to_string();
            let mut handlers = HandlerRegistry::new();
            handlers.on_call("make_resource_ref", move |_conn, _args| {
                let connection_id = connection_id.clone();
                async move { Ok(json!(format!("{connection_id}.1"))) }
            });
            handlers
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let (accepted, server) = server.await.unwrap();
    assert_eq!(accepted.remote_info["max_sessions"], 15);

    let name = client.handle.call("info", vec![], None).await.unwrap();
    assert_eq!(name, json!("voice-relay"));

    let remote_ref: String = server
        .handle
        .call_as("make_resource_ref", vec![], Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(remote_ref, "1512-00ff.1");

    let err = server
        .handle
        .call("resource_call", vec![json!("play")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotFound { .. }));

    client.handle.close();
    assert_eq!(client.task.await.unwrap(), CloseReason::Shutdown);
    assert_eq!(server.task.await.unwrap(), CloseReason::Eof);
}

#[tokio::test]
async fn test_bad_secret_never_starts_main_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let credentials = HashMap::from([("1512".to_string(), SecretString::from("hello_world"))]);
        endpoint::accept(
            socket,
            &credentials,
            acceptor_config(),
            |_| async { Value::Null },
            |accepted| (accepted.client_id.clone(), HandlerRegistry::new()),
            CancellationToken::new(),
        )
        .await
        .map(|_| ())
    });

    let socket = TcpStream::connect(addr).await.unwrap();
    let client = endpoint::connect(
        socket,
        &initiator_config("wrong"),
        |_| HandlerRegistry::new(),
        CancellationToken::new(),
    )
    .await;

    assert!(client.is_err());
    assert!(server.await.unwrap().is_err());
}

#[tokio::test]
async fn test_cast_reaches_handler_after_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (count_tx, mut count_rx) = tokio::sync::mpsc::unbounded_channel::<u32>();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let credentials = HashMap::from([("1512".to_string(), SecretString::from("hello_world"))]);
        endpoint::accept(
            socket,
            &credentials,
            acceptor_config(),
            |_| async { json!({}) },
            move |accepted| {
                let mut handlers = HandlerRegistry::new();
                handlers.on_cast("session_count_update", move |_conn, args| {
                    let count_tx = count_tx.clone();
                    async move {
                        let count: u32 = args.get(0, "count")?;
                        let _ = count_tx.send(count);
                        Ok::<_, HandlerError>(())
                    }
                });
                (accepted.client_id.clone(), handlers)
            },
            CancellationToken::new(),
        )
        .await
        .unwrap()
    });

    let socket = TcpStream::connect(addr).await.unwrap();
    let client = endpoint::connect(
        socket,
        &initiator_config("hello_world"),
        |_| HandlerRegistry::new(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let _server = server.await.unwrap();

    client
        .handle
        .cast("session_count_update", vec![json!(3)])
        .await
        .unwrap();
    assert_eq!(count_rx.recv().await.unwrap(), 3);
}

//! End-to-end tests: the real authority on a loopback port, driven by the
//! real client and by raw WebSocket peers.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use turnstile::client::{Client, ClientConfig, StartedRequest};
use turnstile::protocol::{Command, RpcMessage, ERROR_PROTOCOL, ERROR_REQUEST_ID_DUPLICATED};
use turnstile::{serve, AppState, Args};

const TOKEN: &str = "integration-token";

async fn start_authority() -> (SocketAddr, Arc<AppState>) {
    let args = Args::parse_from(["turnstile", "--auth-token", TOKEN]);
    let state = Arc::new(AppState::new(args));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(Arc::clone(&state), listener));

    (addr, state)
}

async fn connected_client(addr: SocketAddr, pool: usize) -> Client {
    let client = Client::new(ClientConfig {
        number_of_connections: pool,
        timeout: Duration::from_secs(5),
        ..ClientConfig::new(format!("ws://{}", addr), TOKEN)
    })
    .unwrap();

    client.connect();
    assert_ok!(client.wait_until_connected(Duration::from_secs(5)).await);
    client
}

/// Poll the registry until `request_type` reaches `expected`
async fn wait_for_count(state: &AppState, request_type: &str, expected: u32) {
    for _ in 0..250 {
        if state.registry.count(request_type) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "count of '{}' stuck at {}, expected {}",
        request_type,
        state.registry.count(request_type),
        expected
    );
}

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn raw_socket(addr: SocketAddr) -> RawSocket {
    let (ws, _) = connect_async(format!("ws://{}/ws/{}", addr, TOKEN))
        .await
        .unwrap();
    ws
}

async fn next_reply(ws: &mut RawSocket) -> Command {
    let wait = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    match Command::decode(&RpcMessage::parse(&text)).unwrap() {
                        Some(Command::Heartbeat) | None => continue,
                        Some(command) => return command,
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_shared_ceiling_scenario() {
    let (addr, _state) = start_authority().await;
    let client = connected_client(addr, 1).await;

    let (a, b, c) = tokio::join!(
        client.start_request("t1", 2),
        client.start_request("t1", 2),
        client.start_request("t1", 2),
    );
    let t1: Vec<StartedRequest> = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    assert_eq!(t1.iter().filter(|r| r.is_limited()).count(), 1);
    assert_eq!(client.get_request_count("t1").await.unwrap(), 2);

    let (d, e) = tokio::join!(client.start_request("t2", 2), client.start_request("t2", 2));
    let t2: Vec<StartedRequest> = vec![d.unwrap(), e.unwrap()];
    assert!(t2.iter().all(|r| !r.is_limited()));
    assert_eq!(client.get_request_count("t2").await.unwrap(), 2);

    for request in t1.iter().chain(t2.iter()) {
        client.end_request(request);
    }

    // One connection: the ends are processed before the count queries
    assert_eq!(client.get_request_count("t1").await.unwrap(), 0);
    assert_eq!(client.get_request_count("t2").await.unwrap(), 0);

    client.close().await;
}

#[tokio::test]
async fn test_end_twice_is_harmless() {
    let (addr, _state) = start_authority().await;
    let client = connected_client(addr, 1).await;

    let first = client.start_request("jobs", 5).await.unwrap();
    let second = client.start_request("jobs", 5).await.unwrap();
    assert_eq!(client.get_request_count("jobs").await.unwrap(), 2);

    client.end_request(&first);
    client.end_request(&first);
    first.end();

    assert_eq!(client.get_request_count("jobs").await.unwrap(), 1);

    client.end_request(&second);
    assert_eq!(client.get_request_count("jobs").await.unwrap(), 0);

    client.close().await;
}

#[tokio::test]
async fn test_pool_shares_one_ceiling() {
    let (addr, state) = start_authority().await;
    let client = Arc::new(connected_client(addr, 4).await);

    let attempts: Vec<_> = (0..20)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.start_request("pool", 7).await })
        })
        .collect();

    let mut admitted = Vec::new();
    for attempt in attempts {
        let request = attempt.await.unwrap().unwrap();
        if !request.is_limited() {
            admitted.push(request);
        }
    }

    assert_eq!(admitted.len(), 7);
    assert_eq!(state.registry.count("pool"), 7);

    for request in &admitted {
        request.end();
    }
    wait_for_count(&state, "pool", 0).await;

    client.close().await;
}

#[tokio::test]
async fn test_closing_client_releases_its_slots() {
    let (addr, state) = start_authority().await;
    let holder = connected_client(addr, 2).await;
    let bystander = connected_client(addr, 1).await;

    let _a = holder.start_request("crash", 10).await.unwrap();
    let _b = holder.start_request("crash", 10).await.unwrap();
    let kept = bystander.start_request("crash", 10).await.unwrap();
    assert!(!kept.is_limited());
    assert_eq!(state.registry.count("crash"), 3);

    // The holder never ends its requests
    holder.close().await;

    wait_for_count(&state, "crash", 1).await;
    assert_eq!(bystander.get_request_count("crash").await.unwrap(), 1);

    bystander.close().await;
}

#[tokio::test]
async fn test_wrong_token_is_forbidden() {
    let (addr, _state) = start_authority().await;

    let result = connect_async(format!("ws://{}/ws/not-the-token", addr)).await;
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        other => panic!("expected 403, got {:?}", other.map(|(_, r)| r.status())),
    }
}

#[tokio::test]
async fn test_other_paths_get_banner() {
    let (addr, _state) = start_authority().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("Parallel request controller server."));
}

#[tokio::test]
async fn test_raw_protocol_errors_keep_connection_open() {
    let (addr, state) = start_authority().await;
    let mut ws = raw_socket(addr).await;

    let start = Command::StartRequest {
        request_id: "42".into(),
        request_type: "raw".into(),
        limit: 1,
    }
    .encode();

    ws.send(Message::Text(start.clone())).await.unwrap();
    assert_eq!(
        next_reply(&mut ws).await,
        Command::StartRequestAck {
            request_id: "42".into(),
            limit_reached: false,
        }
    );

    ws.send(Message::Text(start)).await.unwrap();
    match next_reply(&mut ws).await {
        Command::Error { code, .. } => assert_eq!(code, ERROR_REQUEST_ID_DUPLICATED),
        other => panic!("expected duplicate error, got {:?}", other),
    }

    ws.send(Message::Text(
        "START-REQUEST\nRequest-ID: 43\nRequest-Type: raw\nRequest-Limit: x\n".into(),
    ))
    .await
    .unwrap();
    match next_reply(&mut ws).await {
        Command::Error { code, message } => {
            assert_eq!(code, ERROR_PROTOCOL);
            assert_eq!(
                message,
                "Parameter 'Request-Limit' for message 'START-REQUEST' must be a valid integer"
            );
        }
        other => panic!("expected protocol error, got {:?}", other),
    }

    // Still usable afterwards
    ws.send(Message::Text(
        Command::GetRequestCount {
            request_type: "raw".into(),
        }
        .encode(),
    ))
    .await
    .unwrap();
    assert_eq!(
        next_reply(&mut ws).await,
        Command::RequestCount {
            request_type: "raw".into(),
            count: 1,
        }
    );

    drop(ws);
    wait_for_count(&state, "raw", 0).await;
}

//! Client reconnect behaviour against a scripted authority that drops
//! sockets on purpose.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use turnstile::client::{Client, ClientConfig, ErrorHandler};
use turnstile::protocol::{Command, RpcMessage};
use turnstile::TurnstileError;

#[derive(Default)]
struct Recorder {
    connection_errors: Mutex<Vec<String>>,
    timeouts: Mutex<usize>,
    server_errors: Mutex<Vec<(String, String)>>,
}

impl ErrorHandler for Recorder {
    fn on_connection_error(&self, error: &TurnstileError) {
        if error.is_timeout() {
            *self.timeouts.lock().unwrap() += 1;
        }
        self.connection_errors.lock().unwrap().push(error.to_string());
    }

    fn on_server_error(&self, code: &str, message: &str) {
        self.server_errors
            .lock()
            .unwrap()
            .push((code.to_string(), message.to_string()));
    }
}

struct ScriptedAuthority {
    listener: TcpListener,
}

impl ScriptedAuthority {
    async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.listener.local_addr().unwrap())
    }

    async fn accept(&self) -> WebSocketStream<TcpStream> {
        let accept = async {
            let (stream, _) = self.listener.accept().await.unwrap();
            accept_async(stream).await.unwrap()
        };
        tokio::time::timeout(Duration::from_secs(5), accept)
            .await
            .expect("client did not (re)connect")
    }
}

fn client(url: String, recorder: &Arc<Recorder>, heartbeat: Duration) -> Arc<Client> {
    let client = Client::new(ClientConfig {
        retry_connection_delay: Duration::from_millis(50),
        timeout: Duration::from_secs(5),
        heartbeat_interval: heartbeat,
        error_handler: Some(recorder.clone()),
        ..ClientConfig::new(url, "token")
    })
    .unwrap();
    client.connect();
    Arc::new(client)
}

/// Next non-heartbeat command sent by the client
async fn next_command(ws: &mut WebSocketStream<TcpStream>) -> Command {
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
                other => panic!("client socket ended: {:?}", other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap()
}

async fn reply(ws: &mut WebSocketStream<TcpStream>, command: Command) {
    ws.send(Message::Text(command.encode())).await.unwrap();
}

#[tokio::test]
async fn test_pending_work_is_replayed_after_reconnect() {
    let authority = ScriptedAuthority::bind().await;
    let recorder = Arc::new(Recorder::default());
    let client = client(authority.url(), &recorder, Duration::from_secs(30));

    let start = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start_request("jobs", 3).await })
    };

    // First socket: swallow the start and hang up without acknowledging
    let mut first = authority.accept().await;
    let expected_start = Command::StartRequest {
        request_id: "0".into(),
        request_type: "jobs".into(),
        limit: 3,
    };
    assert_eq!(next_command(&mut first).await, expected_start);
    drop(first);

    // Second socket: the start comes again and is admitted this time
    let mut second = authority.accept().await;
    assert_eq!(next_command(&mut second).await, expected_start);
    reply(
        &mut second,
        Command::StartRequestAck {
            request_id: "0".into(),
            limit_reached: false,
        },
    )
    .await;

    let request = start.await.unwrap().unwrap();
    assert!(!request.is_limited());
    assert_eq!(request.id(), Some(0));

    // A count query in flight when the socket drops is asked again too
    let count = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.get_request_count("jobs").await })
    };
    assert_eq!(
        next_command(&mut second).await,
        Command::GetRequestCount {
            request_type: "jobs".into(),
        }
    );
    drop(second);

    let mut third = authority.accept().await;
    // Not ended yet, so the start is still owed to the authority
    assert_eq!(next_command(&mut third).await, expected_start);
    assert_eq!(
        next_command(&mut third).await,
        Command::GetRequestCount {
            request_type: "jobs".into(),
        }
    );
    reply(
        &mut third,
        Command::RequestCount {
            request_type: "jobs".into(),
            count: 1,
        },
    )
    .await;
    assert_eq!(count.await.unwrap().unwrap(), 1);

    client.end_request(&request);
    assert_eq!(
        next_command(&mut third).await,
        Command::EndRequest {
            request_id: "0".into(),
        }
    );

    assert!(recorder.connection_errors.lock().unwrap().len() >= 2);
    client.close().await;
}

#[tokio::test]
async fn test_ended_requests_are_not_replayed() {
    let authority = ScriptedAuthority::bind().await;
    let recorder = Arc::new(Recorder::default());
    let client = client(authority.url(), &recorder, Duration::from_secs(30));

    let mut first = authority.accept().await;

    let start = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start_request("once", 1).await })
    };
    assert!(matches!(
        next_command(&mut first).await,
        Command::StartRequest { .. }
    ));
    reply(
        &mut first,
        Command::StartRequestAck {
            request_id: "0".into(),
            limit_reached: false,
        },
    )
    .await;
    let request = start.await.unwrap().unwrap();
    request.end();
    assert!(matches!(
        next_command(&mut first).await,
        Command::EndRequest { .. }
    ));

    // A limited start leaves nothing to replay either
    let limited = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start_request("once", 1).await })
    };
    assert!(matches!(
        next_command(&mut first).await,
        Command::StartRequest { .. }
    ));
    reply(
        &mut first,
        Command::StartRequestAck {
            request_id: "1".into(),
            limit_reached: true,
        },
    )
    .await;
    assert!(limited.await.unwrap().unwrap().is_limited());
    drop(first);

    let mut second = authority.accept().await;
    let count = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.get_request_count("once").await })
    };
    // The first thing on the new socket is the fresh query, not a replay
    assert_eq!(
        next_command(&mut second).await,
        Command::GetRequestCount {
            request_type: "once".into(),
        }
    );
    reply(
        &mut second,
        Command::RequestCount {
            request_type: "once".into(),
            count: 0,
        },
    )
    .await;
    assert_eq!(count.await.unwrap().unwrap(), 0);

    client.close().await;
}

#[tokio::test]
async fn test_silent_authority_is_dropped() {
    let authority = ScriptedAuthority::bind().await;
    let recorder = Arc::new(Recorder::default());
    let client = client(authority.url(), &recorder, Duration::from_millis(100));

    // Accept but never say anything back
    let _silent = authority.accept().await;
    let _second = authority.accept().await;

    assert!(*recorder.timeouts.lock().unwrap() >= 1);
    client.close().await;
}

#[tokio::test]
async fn test_server_errors_reach_handler() {
    let authority = ScriptedAuthority::bind().await;
    let recorder = Arc::new(Recorder::default());
    let client = client(authority.url(), &recorder, Duration::from_secs(30));

    let mut ws = authority.accept().await;
    reply(
        &mut ws,
        Command::error("REQUEST_ID_DUPLICATED", "only the first one applies"),
    )
    .await;
    ws.send(Message::Text(
        "START-REQUEST-ACK\nRequest-ID: not-a-number\nRequest-Limit-Reached: FALSE\n".into(),
    ))
    .await
    .unwrap();

    for _ in 0..100 {
        if recorder.server_errors.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let errors = recorder.server_errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 2);
    assert_eq!(
        errors[0],
        (
            "REQUEST_ID_DUPLICATED".to_string(),
            "only the first one applies".to_string()
        )
    );
    assert_eq!(errors[1].0, "PROTOCOL_ERROR");

    client.close().await;
}

#[tokio::test]
async fn test_close_wakes_callers_waiting_on_dead_authority() {
    let authority = ScriptedAuthority::bind().await;
    let recorder = Arc::new(Recorder::default());
    let client = client(authority.url(), &recorder, Duration::from_secs(30));

    let mut ws = authority.accept().await;
    let start = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start_request("stuck", 1).await })
    };
    next_command(&mut ws).await;

    client.close().await;
    assert!(matches!(
        start.await.unwrap(),
        Err(TurnstileError::Closed)
    ));
}

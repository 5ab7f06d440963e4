//! End-to-end WebSocket scenarios against a live server with simulated
//! engines.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use zasr_recognizer::sim::SimEngineFactory;
use zasr_recognizer::{EndpointConfig, VadModelConfig};
use zasr_server::{protocol::code, ServerConfig, ZasrServer};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RATE: usize = 16000;

async fn start_server(config: ServerConfig, online: bool) -> (Arc<ZasrServer>, String) {
    let engines: Arc<dyn zasr_recognizer::EngineFactory> = if online {
        Arc::new(SimEngineFactory::online(EndpointConfig::default(), 16000))
    } else {
        Arc::new(SimEngineFactory::offline(VadModelConfig::default()).with_punctuation())
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(ZasrServer::new(
        Arc::new(config),
        engines,
        None,
        tokio::runtime::Handle::current(),
    ));
    tokio::spawn(server.clone().serve(listener));
    (server, format!("ws://{addr}"))
}

fn fast_config() -> ServerConfig {
    ServerConfig {
        update_interval_ms: 0,
        ..ServerConfig::default()
    }
}

async fn connect(url: &str) -> Client {
    let (client, _) = connect_async(url).await.expect("connect");
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("send");
}

async fn send_begin(client: &mut Client, payload: Value) {
    send_json(
        client,
        json!({"header": {"name": "Begin", "mid": "m-1"}, "payload": payload}),
    )
    .await;
}

async fn send_end(client: &mut Client) {
    send_json(client, json!({"header": {"name": "End", "mid": "m-2"}, "payload": {}})).await;
}

async fn send_tone(client: &mut Client, freq: f32, secs: f32) {
    let n = (RATE as f32 * secs) as usize;
    let mut pcm = Vec::with_capacity(n * 2);
    for i in 0..n {
        let s = 0.3 * (2.0 * std::f32::consts::PI * freq * i as f32 / RATE as f32).sin();
        pcm.extend_from_slice(&((s * 32767.0) as i16).to_le_bytes());
    }
    for chunk in pcm.chunks(RATE / 10 * 2) {
        client.send(Message::Binary(chunk.to_vec())).await.expect("send audio");
    }
}

async fn send_silence(client: &mut Client, secs: f32) {
    let n = (RATE as f32 * secs) as usize * 2;
    let pcm = vec![0u8; n];
    for chunk in pcm.chunks(RATE / 10 * 2) {
        client.send(Message::Binary(chunk.to_vec())).await.expect("send audio");
    }
}

/// Reads events until `Completed` or the socket closes. Returns parsed
/// events in arrival order.
async fn collect_events(client: &mut Client) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("event before timeout");
        match msg {
            Some(Ok(Message::Text(text))) => {
                let event: Value = serde_json::from_str(&text).unwrap();
                let name = event["header"]["name"].as_str().unwrap_or("").to_string();
                events.push(event);
                if name == "Completed" {
                    return events;
                }
            }
            Some(Ok(Message::Close(_))) | None => return events,
            Some(Ok(_)) => {}
            Some(Err(e)) => panic!("read failed: {e}"),
        }
    }
}

async fn next_event(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("event before timeout")
            .expect("socket open")
            .expect("read ok");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(_) => panic!("unexpected close"),
            _ => {}
        }
    }
}

fn names(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .map(|e| e["header"]["name"].as_str().unwrap_or(""))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_one_sentence() {
    let (_server, url) = start_server(fast_config(), false).await;
    let mut client = connect(&url).await;

    send_begin(&mut client, json!({})).await;
    let started = next_event(&mut client).await;
    assert_eq!(started["header"]["name"], "Started");
    let sid = started["payload"]["sid"].as_str().unwrap().to_string();
    assert!(!sid.is_empty());

    send_tone(&mut client, 440.0, 2.0).await;
    send_silence(&mut client, 1.0).await;
    send_end(&mut client).await;

    let events = collect_events(&mut client).await;
    let names = names(&events);

    assert_eq!(*names.first().unwrap(), "SentenceBegin");
    assert_eq!(*names.last().unwrap(), "Completed");
    assert!(names.contains(&"Result"));
    assert!(names.contains(&"SentenceEnd"));

    let end = events
        .iter()
        .find(|e| e["header"]["name"] == "SentenceEnd")
        .unwrap();
    assert_eq!(end["payload"]["idx"], 1);
    assert_eq!(end["payload"]["text"], "hello world.");
    assert_eq!(end["header"]["sid"], sid.as_str());

    let begin = events
        .iter()
        .find(|e| e["header"]["name"] == "SentenceBegin")
        .unwrap();
    assert_eq!(end["payload"]["begin"], begin["payload"]["time"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pure_silence_yields_started_and_completed_only() {
    let (_server, url) = start_server(fast_config(), false).await;
    let mut client = connect(&url).await;

    send_begin(&mut client, json!({})).await;
    let started = next_event(&mut client).await;
    assert_eq!(started["header"]["name"], "Started");

    send_silence(&mut client, 5.0).await;
    send_end(&mut client).await;

    let events = collect_events(&mut client).await;
    assert_eq!(names(&events), vec!["Completed"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn online_mode_two_utterances() {
    let (_server, url) = start_server(fast_config(), true).await;
    let mut client = connect(&url).await;

    send_begin(&mut client, json!({})).await;
    let started = next_event(&mut client).await;
    assert_eq!(started["header"]["name"], "Started");

    send_tone(&mut client, 440.0, 2.0).await;
    send_silence(&mut client, 1.0).await;
    send_tone(&mut client, 440.0, 1.5).await;
    send_end(&mut client).await;

    let events = collect_events(&mut client).await;
    let ends: Vec<&Value> = events
        .iter()
        .filter(|e| e["header"]["name"] == "SentenceEnd")
        .collect();
    assert!(ends.len() >= 2, "expected two sentences, got {:?}", names(&events));
    assert_eq!(ends[0]["payload"]["idx"], 1);
    assert_eq!(ends[1]["payload"]["idx"], 2);
    assert_eq!(*names(&events).last().unwrap(), "Completed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_before_begin_keeps_socket_open() {
    let (_server, url) = start_server(fast_config(), false).await;
    let mut client = connect(&url).await;

    send_end(&mut client).await;
    let failed = next_event(&mut client).await;
    assert_eq!(failed["header"]["name"], "Failed");
    assert_eq!(failed["header"]["status"], code::NOT_STARTED);

    // the session is still usable
    send_begin(&mut client, json!({})).await;
    let started = next_event(&mut client).await;
    assert_eq!(started["header"]["name"], "Started");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_sample_rate_rejected() {
    let (_server, url) = start_server(fast_config(), false).await;
    let mut client = connect(&url).await;

    send_begin(&mut client, json!({"rate": 8000})).await;
    let failed = next_event(&mut client).await;
    assert_eq!(failed["header"]["status"], code::UNSUPPORTED_SAMPLE_RATE);

    send_end(&mut client).await;
    let failed = next_event(&mut client).await;
    assert_eq!(failed["header"]["status"], code::NOT_STARTED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_limit_refuses_with_close() {
    let config = ServerConfig {
        max_connections: 1,
        ..fast_config()
    };
    let (server, url) = start_server(config, false).await;

    let mut first = connect(&url).await;
    send_begin(&mut first, json!({})).await;
    let started = next_event(&mut first).await;
    assert_eq!(started["header"]["name"], "Started");
    assert_eq!(server.active_connections(), 1);

    let mut second = connect(&url).await;
    let msg = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("close before timeout")
        .expect("frame")
        .expect("read ok");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.reason, "Too many connections");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_connection_is_reaped() {
    let config = ServerConfig {
        connection_timeout: Duration::from_secs(1),
        ..fast_config()
    };
    let (server, url) = start_server(config, false).await;
    let mut client = connect(&url).await;

    send_begin(&mut client, json!({})).await;
    let started = next_event(&mut client).await;
    assert_eq!(started["header"]["name"], "Started");
    send_silence(&mut client, 1.0).await;

    // stall past the timeout; the reaper closes the socket with no Completed
    let mut saw_close = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, client.next()).await {
        match msg {
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    assert_eq!(frame.reason, "Connection timeout");
                }
                saw_close = true;
                break;
            }
            Ok(Message::Text(text)) => {
                let event: Value = serde_json::from_str(&text).unwrap();
                assert_ne!(event["header"]["name"], "Completed");
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_close, "expected a timeout close");
    assert_eq!(server.active_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_completes_open_sessions() {
    let (server, url) = start_server(fast_config(), false).await;
    let mut client = connect(&url).await;

    send_begin(&mut client, json!({})).await;
    let started = next_event(&mut client).await;
    assert_eq!(started["header"]["name"], "Started");
    send_silence(&mut client, 0.5).await;

    // give the frames time to reach the session before stopping
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.stop();

    let events = collect_events(&mut client).await;
    assert!(names(&events).contains(&"Completed"), "got {:?}", names(&events));
}

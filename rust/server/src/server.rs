//! The WebSocket server.
//!
//! The accept loop, frame routing, and every outbound send run on the
//! control executor. Each connection gets an ordered send lane drained by a
//! writer task that exclusively owns the socket's sink half, and a work
//! queue drained by a task on the work executor, so binary frames reach the
//! session pipeline in arrival order without blocking the control thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zasr_recognizer::EngineFactory;
use zasr_voiceprint::SpeakerIdentifier;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::session::{Outbound, Session, SessionState, TextAction};

enum Lane {
    Frame(String),
    Close(String),
}

enum WorkItem {
    Audio(Vec<u8>),
    Finish,
}

/// Posts outbound frames onto the connection's send lane. The lane is the
/// only writer of the socket, which keeps the send path single-threaded and
/// per-session ordered.
struct ConnOutbound {
    tx: mpsc::UnboundedSender<Lane>,
}

impl Outbound for ConnOutbound {
    fn send(&self, text: String) {
        let _ = self.tx.send(Lane::Frame(text));
    }

    fn close(&self, reason: &str) {
        let _ = self.tx.send(Lane::Close(reason.to_string()));
    }
}

struct Connection {
    session: Arc<Session>,
}

/// The server: accept loop, connection map, timeout reaper.
pub struct ZasrServer {
    config: Arc<ServerConfig>,
    engines: Arc<dyn EngineFactory>,
    speaker: Option<Arc<SpeakerIdentifier>>,
    work: Handle,
    connections: Mutex<HashMap<u64, Connection>>,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ZasrServer {
    pub fn new(
        config: Arc<ServerConfig>,
        engines: Arc<dyn EngineFactory>,
        speaker: Option<Arc<SpeakerIdentifier>>,
        work: Handle,
    ) -> Self {
        Self {
            config,
            engines,
            speaker,
            work,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled by [`ZasrServer::stop`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Requests a graceful stop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Number of live connections.
    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Binds the configured address and serves until stopped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        info!(host = %self.config.host, port = self.config.port, "server listening");
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener until stopped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.work.spawn(self.clone().reap_idle_connections());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(self.clone().handle_connection(stream, peer));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        let connections: Vec<Connection> = {
            let mut map = self.connections.lock();
            map.drain().map(|(_, c)| c).collect()
        };
        info!(count = connections.len(), "closing sessions for shutdown");
        let mut closers = Vec::with_capacity(connections.len());
        for conn in connections {
            // draining may decode, so it belongs on the work executor
            closers.push(self.work.spawn(async move { conn.session.shutdown_close() }));
        }
        for closer in closers {
            let _ = closer.await;
        }
        // let the writer lanes flush the final frames
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("server stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        // Only WebSocket upgrades are served; anything else fails the
        // handshake and the transport is dropped.
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer = %peer, error = %e, "handshake failed");
                return;
            }
        };

        if self.active_connections() >= self.config.max_connections {
            warn!(peer = %peer, "connection limit reached, refusing");
            let (mut sink, _) = ws.split();
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "Too many connections".into(),
                })))
                .await;
            return;
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (mut sink, mut source) = ws.split();

        let (lane_tx, mut lane_rx) = mpsc::unbounded_channel::<Lane>();
        tokio::spawn(async move {
            while let Some(item) = lane_rx.recv().await {
                match item {
                    Lane::Frame(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Lane::Close(reason) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        let outbound = Arc::new(ConnOutbound { tx: lane_tx });
        let session = Arc::new(Session::new(
            conn_id,
            outbound,
            self.engines.clone(),
            self.speaker.clone(),
            self.config.pipeline(),
        ));
        session.touch();

        let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkItem>();
        {
            let session = session.clone();
            self.work.spawn(async move {
                while let Some(item) = work_rx.recv().await {
                    match item {
                        WorkItem::Audio(data) => session.handle_binary(&data),
                        WorkItem::Finish => session.finish(),
                    }
                }
            });
        }

        self.connections.lock().insert(
            conn_id,
            Connection {
                session: session.clone(),
            },
        );
        info!(conn = conn_id, peer = %peer, active = self.active_connections(), "connection opened");

        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if session.handle_text(&text) == TextAction::Drain {
                            let _ = work_tx.send(WorkItem::Finish);
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = work_tx.send(WorkItem::Audio(data));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong are handled by the stream
                    Some(Err(e)) => {
                        debug!(conn = conn_id, error = %e, "read failed");
                        break;
                    }
                },
                // cleanup is left to the shutdown path, which drains the map
                _ = self.shutdown.cancelled() => return,
            }
        }

        let removed = self.connections.lock().remove(&conn_id).is_some();
        if removed && session.state() != SessionState::Closed {
            session.close_silent();
        }
        info!(conn = conn_id, active = self.active_connections(), "connection closed");
    }

    /// Runs on the work executor: every second, close connections whose
    /// last activity is older than the configured timeout.
    async fn reap_idle_connections(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.cancelled() => return,
            }

            let timeout = self.config.connection_timeout;
            let expired: Vec<(u64, Arc<Session>)> = self
                .connections
                .lock()
                .iter()
                .filter(|(_, c)| c.session.idle() > timeout)
                .map(|(id, c)| (*id, c.session.clone()))
                .collect();
            if expired.is_empty() {
                continue;
            }

            {
                let mut map = self.connections.lock();
                for (id, _) in &expired {
                    map.remove(id);
                }
            }
            for (id, session) in &expired {
                debug!(conn = id, "closing timed-out connection");
                session.close_timeout();
            }
            info!(
                removed = expired.len(),
                active = self.active_connections(),
                "removed timed-out connections"
            );
        }
    }
}

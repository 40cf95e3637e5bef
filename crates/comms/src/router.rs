//! Front router.
//!
//! Accepts multipart envelopes over TCP, answers service messages
//! (`is_alive`) directly, and hands everything else to the request solver
//! with a deadline derived from the envelope's `request_timeout`. Every
//! inbound frame is processed in its own tracked task; replies are dropped
//! silently on validation failure or timeout (the client's own timer
//! recovers). `stop` cancels and awaits all in-flight tasks.

use crate::envelope::{Multipart, MultipartCodec};
use crate::solver::RequestSolver;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ocs_common::{now_ts, wire, Settings};
use ocs_common::settings::RouterSettings;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("unsupported router protocol {0:?}, only tcp is available")]
    UnsupportedProtocol(String),
    #[error("can not bind the router to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("the router is already running")]
    AlreadyRunning,
}

struct RouterTasks {
    token: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

pub struct Router {
    name: String,
    solver: Arc<RequestSolver>,
    settings: RouterSettings,
    state: Mutex<Option<RouterTasks>>,
    connection_seq: AtomicU64,
}

impl Router {
    pub fn new(name: &str, solver: Arc<RequestSolver>, settings: &Settings) -> Self {
        Self {
            name: name.to_owned(),
            solver,
            settings: settings.router(name),
            state: Mutex::new(None),
            connection_seq: AtomicU64::new(0),
        }
    }

    /// Bind and start serving. Returns the bound address (useful when the
    /// configured port is 0).
    pub async fn start(self: Arc<Self>) -> Result<SocketAddr, RouterError> {
        {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_some() {
                return Err(RouterError::AlreadyRunning);
            }
        }
        if self.settings.protocol != "tcp" {
            return Err(RouterError::UnsupportedProtocol(self.settings.protocol.clone()));
        }
        let address = format!("{}:{}", self.settings.url, self.settings.port);
        info!(router = %self.name, %address, "router starting");
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| RouterError::Bind { address, source })?;
        let local_addr = listener.local_addr().map_err(|source| RouterError::Bind {
            address: "<bound socket>".to_owned(),
            source,
        })?;

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(Arc::clone(&self).accept_loop(listener, token.clone(), tracker.clone()));

        if self.settings.ping_enabled {
            let ping_token = token.clone();
            let name = self.name.clone();
            let interval = self.settings.ping_interval.max(0.01);
            info!(router = %name, interval, "ping task started");
            tracker.spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ping_token.cancelled() => break,
                        _ = ticker.tick() => info!("{name}: listening..."),
                    }
                }
            });
        } else {
            info!(router = %self.name, "ping task disabled in config");
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = Some(RouterTasks {
            token,
            tracker,
            local_addr,
        });
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tasks| tasks.local_addr)
    }

    /// Cancel the listener, the ping task and every in-flight message task,
    /// then wait for all of them to finish.
    pub async fn stop(&self) {
        let tasks = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(tasks) = tasks else {
            info!(router = %self.name, "router is already stopped");
            return;
        };
        info!(router = %self.name, "stopping router");
        tasks.token.cancel();
        tasks.tracker.close();
        tasks.tracker.wait().await;
        info!(router = %self.name, "router stopped");
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        token: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = self.connection_seq.fetch_add(1, Ordering::Relaxed);
                        debug!(router = %self.name, %peer, connection, "client connected");
                        tracker.spawn(Arc::clone(&self).serve_connection(
                            stream,
                            connection,
                            token.clone(),
                            tracker.clone(),
                        ));
                    }
                    Err(error) => {
                        warn!(router = %self.name, %error, "accept failed");
                    }
                },
            }
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        connection: u64,
        token: CancellationToken,
        tracker: TaskTracker,
    ) {
        let socket_id = Bytes::from(format!("{}-{connection}", self.name));
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, MultipartCodec);
        let mut writer = FramedWrite::new(write_half, MultipartCodec);

        let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<Bytes>>(32);
        tracker.spawn(async move {
            while let Some(frames) = reply_rx.recv().await {
                if writer.send(frames).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                inbound = reader.next() => match inbound {
                    None => break,
                    Some(Err(error)) => {
                        warn!(router = %self.name, %error, "dropping connection on framing error");
                        break;
                    }
                    Some(Ok(frames)) => {
                        tracker.spawn(Arc::clone(&self).handle_message(
                            frames,
                            socket_id.clone(),
                            reply_tx.clone(),
                            token.clone(),
                        ));
                    }
                },
            }
        }
        debug!(router = %self.name, connection, "client disconnected");
    }

    async fn handle_message(
        self: Arc<Self>,
        frames: Vec<Bytes>,
        socket_id: Bytes,
        reply_tx: mpsc::Sender<Vec<Bytes>>,
        token: CancellationToken,
    ) {
        let mut envelope = match Multipart::from_frames(frames) {
            Ok(envelope) => envelope,
            Err(error) => {
                // No answer for damaged envelopes.
                warn!(router = %self.name, %error, "dropping an invalid envelope");
                return;
            }
        };
        envelope.prefix = vec![socket_id.clone()];

        let reply_data = if envelope.service_msg {
            service_answer(&envelope)
        } else {
            let remaining = envelope.request_timeout - now_ts();
            if !remaining.is_finite() || remaining <= 0.0 {
                warn!(router = %self.name, "request arrived after its own deadline");
                return;
            }
            let solve = Arc::clone(&self.solver).get_answer(
                envelope.data.clone(),
                socket_id,
                Some(envelope.request_timeout),
            );
            tokio::select! {
                // Router shutdown cancels in-flight resolution.
                _ = token.cancelled() => return,
                solved = tokio::time::timeout(Duration::from_secs_f64(remaining), solve) => {
                    match solved {
                        Ok(answers) => answers,
                        Err(_elapsed) => {
                            error!(router = %self.name, "handling the request has timed out");
                            return;
                        }
                    }
                }
            }
        };

        let reply = envelope.reply(reply_data);
        if reply_tx.send(reply.into_frames()).await.is_err() {
            debug!(router = %self.name, "client went away before the reply");
        }
        debug!(router = %self.name, "response sent to client");
    }
}

/// Answer a service message directly. Only `is_alive` is recognized today;
/// anything else gets a null payload.
fn service_answer(envelope: &Multipart) -> Vec<Bytes> {
    let command = envelope
        .data
        .first()
        .and_then(|raw| wire::from_bytes::<serde_json::Value>(raw).ok())
        .and_then(|message| {
            message
                .get("command")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        });
    let response = match command.as_deref() {
        Some("is_alive") => serde_json::json!({"command": "is_alive", "response": true}),
        _ => serde_json::Value::Null,
    };
    let encoded = wire::to_bytes(&response).unwrap_or_default();
    vec![Bytes::from(encoded)]
}

use crate::config::Config;
use crate::error::PipelineError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};

const CLIENT_SUFFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Retry(Duration),
    /// Burst used up: report the transport unavailable and wait before the next burst.
    Exhausted(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Consecutive failed sessions per burst. Zero retries forever without a cooldown.
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn step(&self, failures: u32) -> RetryStep {
        if self.max_attempts == 0 || failures < self.max_attempts {
            RetryStep::Retry(self.delay)
        } else {
            RetryStep::Exhausted(self.cooldown)
        }
    }
}

/// `<prefix>-XXXXXXXX`, fresh per process so a restart never reuses a stale broker session.
pub fn generate_client_id(prefix: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .to_ascii_uppercase()
        .chars()
        .take(CLIENT_SUFFIX_LEN)
        .collect();
    let prefix = prefix.trim().trim_end_matches('-');
    if prefix.is_empty() {
        suffix
    } else {
        format!("{prefix}-{suffix}")
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportSnapshot {
    pub client_id: String,
    pub state: ConnectionState,
    pub transport_unavailable: bool,
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub last_disconnect: Option<String>,
}

/// Connection health shared between the supervisor and status readers.
#[derive(Debug)]
pub struct TransportMonitor {
    client_id: String,
    state: watch::Sender<ConnectionState>,
    unavailable: AtomicBool,
    ever_connected: AtomicBool,
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    last_disconnect: Mutex<Option<String>>,
}

impl TransportMonitor {
    pub fn new(client_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            client_id: client_id.into(),
            state,
            unavailable: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_disconnect: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "transport state changed");
        }
    }

    fn mark_connecting(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);
    }

    fn mark_connected(&self) {
        if self.ever_connected.swap(true, Ordering::Relaxed) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        self.unavailable.store(false, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
    }

    fn mark_unavailable(&self) {
        self.unavailable.store(true, Ordering::Relaxed);
    }

    fn record_disconnect(&self, err: &PipelineError) {
        if let Ok(mut guard) = self.last_disconnect.lock() {
            *guard = Some(err.to_string());
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Relaxed)
    }

    /// Hands a publish to the ingest worker without waiting. A full queue drops the message.
    pub fn forward(&self, tx: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> bool {
        match tx.try_send(message) {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    topic = %message.topic,
                    dropped,
                    "ingest queue full; dropping MQTT message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    topic = %message.topic,
                    "ingest worker gone; dropping MQTT message"
                );
                false
            }
        }
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            client_id: self.client_id.clone(),
            state: self.state(),
            transport_unavailable: self.is_unavailable(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_disconnect: self.last_disconnect.lock().ok().and_then(|v| v.clone()),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed { connected: bool, error: PipelineError },
}

/// Runs MQTT sessions until shutdown. Failed sessions are retried per the config's
/// `RetryPolicy`; an exhausted burst flags the transport unavailable and waits out the
/// cooldown, then tries again. Never returns on transport errors.
pub async fn run_supervisor(
    config: Config,
    tx: mpsc::Sender<InboundMessage>,
    monitor: std::sync::Arc<TransportMonitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy = config.retry_policy();
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        monitor.mark_connecting();
        let (connected, error) = match run_session(&config, &tx, &monitor, &mut shutdown).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Failed { connected, error } => (connected, error),
        };

        if connected {
            failures = 0;
        }
        failures += 1;
        monitor.record_disconnect(&error);
        let wait = match policy.step(failures) {
            RetryStep::Retry(delay) => {
                tracing::warn!(
                    error = %error,
                    attempt = failures,
                    max_attempts = policy.max_attempts,
                    "MQTT session failed; retrying"
                );
                delay
            }
            RetryStep::Exhausted(cooldown) => {
                monitor.mark_unavailable();
                tracing::error!(
                    error = %error,
                    attempts = failures,
                    cooldown_secs = cooldown.as_secs(),
                    "MQTT transport unavailable; backing off"
                );
                failures = 0;
                cooldown
            }
        };

        monitor.set_state(ConnectionState::Backoff);
        tokio::select! {
            _ = sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    monitor.set_state(ConnectionState::Disconnected);
    tracing::info!(client_id = %monitor.client_id(), "MQTT supervisor stopped");
}

fn mqtt_options(config: &Config, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
    options.set_keep_alive(config.mqtt_keepalive());
    options.set_clean_session(true);
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

async fn run_session(
    config: &Config,
    tx: &mpsc::Sender<InboundMessage>,
    monitor: &TransportMonitor,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (client, mut eventloop) =
        AsyncClient::new(mqtt_options(config, monitor.client_id()), 64);
    let mut connected = false;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    if connected {
                        close_session(
                            &client,
                            &mut eventloop,
                            &config.mqtt_topics,
                            config.shutdown_timeout(),
                        )
                        .await;
                    }
                    return SessionEnd::Shutdown;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return SessionEnd::Failed {
                            connected,
                            error: PipelineError::TransportConnect(format!("{:?}", ack.code)),
                        };
                    }
                    connected = true;
                    for topic in &config.mqtt_topics {
                        if let Err(err) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                            return SessionEnd::Failed {
                                connected,
                                error: PipelineError::TransportDisconnect {
                                    reason: err.to_string(),
                                },
                            };
                        }
                    }
                    monitor.mark_connected();
                    tracing::info!(
                        client_id = %monitor.client_id(),
                        host = %config.mqtt_host,
                        port = config.mqtt_port,
                        "MQTT session established"
                    );
                }
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    tracing::debug!(pkid = ack.pkid, "MQTT subscription acknowledged");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    monitor.forward(
                        tx,
                        InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload,
                            received_at: Utc::now(),
                        },
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    let error = if connected {
                        PipelineError::TransportDisconnect {
                            reason: err.to_string(),
                        }
                    } else {
                        PipelineError::TransportConnect(err.to_string())
                    };
                    return SessionEnd::Failed { connected, error };
                }
            }
        }
    }
}

/// Unsubscribes and disconnects, then drives the event loop until the disconnect is on the
/// wire or `timeout` passes.
async fn close_session(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    topics: &[String],
    timeout: Duration,
) {
    for topic in topics {
        if let Err(err) = client.try_unsubscribe(topic.clone()) {
            tracing::debug!(error = %err, topic = %topic, "MQTT unsubscribe not queued");
        }
    }
    if let Err(err) = client.try_disconnect() {
        tracing::debug!(error = %err, "MQTT disconnect not queued");
    }

    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    match tokio::time::timeout(timeout, drain).await {
        Ok(()) => tracing::info!("MQTT session closed"),
        Err(_) => tracing::warn!(
            timeout_ms = timeout.as_millis() as u64,
            "MQTT session did not close in time; abandoning it"
        ),
    }
}

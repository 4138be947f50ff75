use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::analytics::Analytics;
use crate::error::{Error, Result};
use crate::hub::{BroadcastHub, Subscription};
use crate::logs::LogWriter;
use crate::redfish;
use crate::screen::{DEFAULT_SCREEN_BUF_SIZE, ScreenBuffer};
use crate::transport::{SolHandle, SolTransport, TransportConfig};

/// Reconnect backoff bounds.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// A session that survived at least this long resets the backoff.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(30);

/// Health monitor cadence and staleness threshold.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const STALE_THRESHOLD: Duration = Duration::from_secs(90);

/// SOL inactivity window handed to each transport.
const SOL_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Synthetic clear-screen pushed to subscribers on every fresh connection.
const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

/// Fallback credentials applied to servers that carry none of their own.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// IPMI username.
    pub username: String,
    /// IPMI password.
    pub password: String,
}

/// Narrow log-writing capability the supervisor needs.
///
/// Write failures stay inside the implementation: capture liveness beats log
/// durability, so nothing here propagates errors to the byte producers.
pub trait ConsoleSink: Send + Sync {
    /// Append a raw chunk to `server`'s log, cleaned however the sink likes.
    fn write(&self, server: &str, data: &[u8]);
    /// Start a new log file for `server`.
    fn rotate(&self, server: &str, name: Option<&str>) -> Result<String>;
    /// Whether a caller-requested rotation is currently allowed.
    fn can_rotate(&self, server: &str) -> bool;
    /// Up to `max` trailing bytes of the current log, for catchup fallback.
    fn tail(&self, server: &str, max: usize) -> Vec<u8>;
}

impl ConsoleSink for LogWriter {
    fn write(&self, server: &str, data: &[u8]) {
        if let Err(e) = LogWriter::write(self, server, data) {
            warn!(server, error = %e, "log write failed");
        }
    }

    fn rotate(&self, server: &str, name: Option<&str>) -> Result<String> {
        self.rotate_with_name(server, name)
    }

    fn can_rotate(&self, server: &str) -> bool {
        LogWriter::can_rotate(self, server)
    }

    fn tail(&self, server: &str, max: usize) -> Vec<u8> {
        let mut data = self.current_log_content(server).unwrap_or_default();
        if data.len() > max {
            data.drain(..data.len() - max);
        }
        data
    }
}

/// Point-in-time view of one session for a status surface.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Logical server name.
    pub server: String,
    /// BMC address.
    pub host: String,
    /// Username in use (after fallback substitution).
    pub username: String,
    /// Whether a SOL stream is currently up.
    pub connected: bool,
    /// Most recent connect or stream error.
    pub last_error: Option<String>,
    /// Time since the last received console data, when connected.
    pub idle: Option<Duration>,
}

struct SessionEntry {
    host: String,
    username: String,
    password: String,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
    handle: Mutex<Option<SolHandle>>,
    cancel: watch::Sender<bool>,
}

struct Inner {
    fallback: Credentials,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    hub: BroadcastHub,
    screens: Mutex<HashMap<String, Arc<ScreenBuffer>>>,
    sink: Arc<dyn ConsoleSink>,
    analytics: Arc<Analytics>,
}

/// Owns every per-server SOL session: connect, reconnect under backoff,
/// credential changes, health restarts, and the fan-out of received bytes to
/// the broadcast hub, screen buffer, log sink, and analytics - in that order.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Build a supervisor and start its health-monitor task. Must be called
    /// inside a tokio runtime.
    pub fn new(
        fallback: Credentials,
        sink: Arc<dyn ConsoleSink>,
        analytics: Arc<Analytics>,
    ) -> Self {
        let inner = Arc::new(Inner {
            fallback,
            sessions: RwLock::new(HashMap::new()),
            hub: BroadcastHub::new(),
            screens: Mutex::new(HashMap::new()),
            sink,
            analytics,
        });

        tokio::spawn(health_loop(Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Start (or replace) the session for `name`. Empty credentials fall back
    /// to the process-wide defaults.
    pub fn start_session(&self, name: &str, host: &str, username: &str, password: &str) {
        self.stop_session(name);

        let username = if username.is_empty() {
            self.inner.fallback.username.clone()
        } else {
            username.to_string()
        };
        let password = if password.is_empty() {
            self.inner.fallback.password.clone()
        } else {
            password.to_string()
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let entry = Arc::new(SessionEntry {
            host: host.to_string(),
            username,
            password,
            connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            handle: Mutex::new(None),
            cancel: cancel_tx,
        });

        self.inner
            .sessions
            .write()
            .expect("sessions lock")
            .insert(name.to_string(), entry.clone());

        tokio::spawn(run_session(
            self.inner.clone(),
            name.to_string(),
            entry,
            cancel_rx,
        ));
    }

    /// Stop and remove the session for `name`, clearing BMC-side sessions as
    /// a best-effort courtesy.
    pub fn stop_session(&self, name: &str) {
        let entry = self
            .inner
            .sessions
            .write()
            .expect("sessions lock")
            .remove(name);

        let Some(entry) = entry else {
            return;
        };

        let _ = entry.cancel.send(true);

        if let Some(handle) = entry.handle.lock().expect("handle lock").take() {
            tokio::spawn(async move { handle.close().await });
        }

        tokio::spawn(redfish::clear_sessions(
            entry.host.clone(),
            entry.username.clone(),
            entry.password.clone(),
        ));
    }

    /// Stop then start `name` using its recorded credentials. Used after log
    /// rotation (a provably fresh SOL stream) and by the health monitor.
    pub fn restart_session(&self, name: &str) {
        let creds = {
            let sessions = self.inner.sessions.read().expect("sessions lock");
            sessions
                .get(name)
                .map(|e| (e.host.clone(), e.username.clone(), e.password.clone()))
        };

        let Some((host, username, password)) = creds else {
            return;
        };

        info!(server = name, "restarting SOL session");
        self.stop_session(name);
        self.start_session(name, &host, &username, &password);
    }

    /// Forward console input to `name`'s BMC.
    pub async fn send_command(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let entry = {
            let sessions = self.inner.sessions.read().expect("sessions lock");
            sessions.get(name).cloned()
        };

        let Some(entry) = entry else {
            return Err(Error::SubscribeNotFound(name.to_string()));
        };
        if !entry.connected.load(Ordering::Acquire) {
            return Err(Error::NotConnected(name.to_string()));
        }
        let handle = entry.handle.lock().expect("handle lock").clone();
        match handle {
            Some(handle) => handle.write(data).await,
            None => Err(Error::NotConnected(name.to_string())),
        }
    }

    /// Subscribe to `name`'s raw console stream.
    pub fn subscribe(&self, name: &str) -> Subscription {
        self.inner.hub.subscribe(name)
    }

    /// Subscribe with catchup: the returned bytes replay recent output so a
    /// terminal emulator arrives at the correct state.
    ///
    /// The raw screen buffer is the primary catchup source; servers without an
    /// active transport fall back to the tail of their current log file.
    pub fn subscribe_with_catchup(&self, name: &str) -> Result<(Vec<u8>, Subscription)> {
        let known_session = {
            let sessions = self.inner.sessions.read().expect("sessions lock");
            sessions.contains_key(name)
        };

        let screen = {
            let screens = self.inner.screens.lock().expect("screens lock");
            screens.get(name).cloned()
        };

        let catchup = match &screen {
            Some(screen) if known_session => screen.bytes(),
            _ => self.inner.sink.tail(name, DEFAULT_SCREEN_BUF_SIZE),
        };

        if !known_session && screen.is_none() && catchup.is_empty() {
            return Err(Error::SubscribeNotFound(name.to_string()));
        }

        Ok((catchup, self.inner.hub.subscribe(name)))
    }

    /// Recent raw bytes for `name`, if a screen buffer exists.
    pub fn screen_bytes(&self, name: &str) -> Option<Vec<u8>> {
        let screens = self.inner.screens.lock().expect("screens lock");
        screens.get(name).map(|s| s.bytes())
    }

    /// Rotate `name`'s log and restart its session so the new file starts
    /// with a fresh SOL stream. Returns the new file name, or `None` while
    /// the rotation cooldown holds.
    pub fn rotate_logs(&self, name: &str, file_name: Option<&str>) -> Result<Option<String>> {
        if !self.inner.sink.can_rotate(name) {
            debug!(server = name, "rotation refused by cooldown");
            return Ok(None);
        }

        let new_name = self.inner.sink.rotate(name, file_name)?;
        self.inner.analytics.record_rotation(name);
        self.restart_session(name);
        Ok(Some(new_name))
    }

    /// Status snapshot for one server.
    pub fn status(&self, name: &str) -> Option<SessionStatus> {
        let sessions = self.inner.sessions.read().expect("sessions lock");
        sessions.get(name).map(|e| entry_status(name, e))
    }

    /// Status snapshots for every supervised server.
    pub fn statuses(&self) -> Vec<SessionStatus> {
        let sessions = self.inner.sessions.read().expect("sessions lock");
        sessions
            .iter()
            .map(|(name, e)| entry_status(name, e))
            .collect()
    }

    /// Whether a session (connected or reconnecting) exists for `name`.
    pub fn has_session(&self, name: &str) -> bool {
        self.inner
            .sessions
            .read()
            .expect("sessions lock")
            .contains_key(name)
    }

    /// The credentials snapshot recorded when `name`'s session started.
    pub fn session_credentials(&self, name: &str) -> Option<(String, String)> {
        let sessions = self.inner.sessions.read().expect("sessions lock");
        sessions
            .get(name)
            .map(|e| (e.username.clone(), e.password.clone()))
    }

    /// Whether `username`/`password` (after fallback substitution) differ
    /// from the snapshot `name`'s session was started with. `false` when no
    /// session exists.
    pub fn credentials_differ(&self, name: &str, username: &str, password: &str) -> bool {
        let effective_user = if username.is_empty() {
            &self.inner.fallback.username
        } else {
            username
        };
        let effective_pass = if password.is_empty() {
            &self.inner.fallback.password
        } else {
            password
        };

        let sessions = self.inner.sessions.read().expect("sessions lock");
        match sessions.get(name) {
            Some(e) => e.username != effective_user || e.password != effective_pass,
            None => false,
        }
    }

    /// Boot analytics handle.
    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.inner.analytics
    }

    /// Stop every session. Used on shutdown.
    pub fn stop_all(&self) {
        let names: Vec<String> = {
            let sessions = self.inner.sessions.read().expect("sessions lock");
            sessions.keys().cloned().collect()
        };
        for name in names {
            self.stop_session(&name);
        }
    }
}

fn entry_status(name: &str, e: &SessionEntry) -> SessionStatus {
    let connected = e.connected.load(Ordering::Acquire);
    SessionStatus {
        server: name.to_string(),
        host: e.host.clone(),
        username: e.username.clone(),
        connected,
        last_error: e.last_error.lock().expect("error lock").clone(),
        idle: connected.then(|| e.last_activity.lock().expect("activity lock").elapsed()),
    }
}

fn get_or_create_screen(inner: &Inner, name: &str) -> Arc<ScreenBuffer> {
    let mut screens = inner.screens.lock().expect("screens lock");
    screens
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(ScreenBuffer::default()))
        .clone()
}

/// Per-server supervisor loop: connect, pump until failure, back off, retry.
async fn run_session(
    inner: Arc<Inner>,
    name: String,
    entry: Arc<SessionEntry>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = BACKOFF_START;

    loop {
        if *cancel.borrow() {
            return;
        }

        info!(server = %name, host = %entry.host, "connecting SOL");

        let connect_time = Instant::now();
        match connect_and_pump(&inner, &name, &entry, &mut cancel).await {
            Ok(()) => return, // cancelled
            Err(e) => {
                entry.connected.store(false, Ordering::Release);
                *entry.last_error.lock().expect("error lock") = Some(e.to_string());
                error!(server = %name, error = %e, "SOL session ended");
            }
        }

        // A session that worked for a while earns a fresh backoff; immediate
        // connection failures keep doubling.
        if connect_time.elapsed() > BACKOFF_RESET_AFTER {
            backoff = BACKOFF_START;
        }

        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(backoff) => {
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

async fn connect_and_pump(
    inner: &Arc<Inner>,
    name: &str,
    entry: &Arc<SessionEntry>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    // Clear orphaned BMC-side sessions from previous dirty shutdowns.
    redfish::clear_sessions(
        entry.host.clone(),
        entry.username.clone(),
        entry.password.clone(),
    )
    .await;

    let cfg = TransportConfig {
        host: entry.host.clone(),
        port: 623,
        username: entry.username.clone(),
        password: entry.password.clone(),
        inactivity_timeout: SOL_INACTIVITY_TIMEOUT,
    };

    let transport = SolTransport::connect(cfg).await?;
    let (handle, mut data_rx, mut error_rx) = transport.split();

    *entry.handle.lock().expect("handle lock") = Some(handle.clone());
    entry.connected.store(true, Ordering::Release);
    *entry.last_error.lock().expect("error lock") = None;
    *entry.last_activity.lock().expect("activity lock") = Instant::now();

    info!(server = %name, "SOL connected");

    // Fresh screen for subscribers; the screen buffer restarts from scratch.
    inner.hub.publish(name, CLEAR_SCREEN);
    let screen = get_or_create_screen(inner, name);
    screen.reset();

    let result = loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break Ok(());
                }
            }
            err = error_rx.recv() => {
                break Err(err.unwrap_or(Error::Protocol("SOL error channel closed")));
            }
            chunk = data_rx.recv() => {
                let Some(chunk) = chunk else {
                    break Err(Error::Protocol("SOL stream closed"));
                };

                *entry.last_activity.lock().expect("activity lock") = Instant::now();

                // Fan-in order: broadcast, screen buffer, log, analytics.
                inner.hub.publish(name, &chunk);
                screen.write(&chunk);
                inner.sink.write(name, &chunk);
                inner
                    .analytics
                    .process_text(name, &String::from_utf8_lossy(&chunk));
            }
        }
    };

    entry.connected.store(false, Ordering::Release);
    entry.handle.lock().expect("handle lock").take();
    handle.close().await;

    tokio::spawn(redfish::clear_sessions(
        entry.host.clone(),
        entry.username.clone(),
        entry.password.clone(),
    ));

    result
}

/// Process-wide staleness sweep. Uses the transport's last-received clock
/// (which counts keepalive replies), not console activity, so idle-but-alive
/// servers are left alone while dead BMCs get restarted.
async fn health_loop(inner: std::sync::Weak<Inner>) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };

        let mut stale: Vec<String> = Vec::new();
        {
            let sessions = inner.sessions.read().expect("sessions lock");
            for (name, entry) in sessions.iter() {
                if !entry.connected.load(Ordering::Acquire) {
                    continue;
                }
                let handle = entry.handle.lock().expect("handle lock").clone();
                match handle {
                    None => {
                        warn!(server = %name, "connected session has no transport, will restart");
                        stale.push(name.clone());
                    }
                    Some(handle) => {
                        let idle = handle.last_recv_age();
                        if idle > STALE_THRESHOLD {
                            warn!(
                                server = %name,
                                idle = ?idle,
                                threshold = ?STALE_THRESHOLD,
                                "no BMC packets, will restart"
                            );
                            stale.push(name.clone());
                        } else {
                            debug!(server = %name, idle = ?idle, "health ok");
                        }
                    }
                }
            }
        }

        let supervisor = Supervisor { inner };
        for name in stale {
            supervisor.restart_session(&name);
        }
    }
}

// Connection manager
//
// Owns the transport lifecycle: connect with timeout, reconnect with
// backoff, heartbeat with staleness detection. Every connection attempt gets
// an epoch; events tagged with an older epoch are discarded, so nothing from
// a torn-down transport reaches observers after the state change that ended
// it. Observers run one at a time on a dispatcher task in arrival order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::state::{transition, Action, Backoff, ConnectionEvent, ConnectionState, RetryBudget};
use super::transport::{Transport, TransportEvent, TransportFactory, WebSocketTransportFactory};
use crate::config::ClientConfig;
use crate::error::VoiceError;
use crate::protocol::{ClientEvent, ServerEvent, NORMAL_CLOSURE};

/// Close code used when dropping a transport that is about to be replaced
const CLOSE_RECONNECTING: u16 = 4000;

/// Receives inbound messages and lifecycle notifications
pub trait SessionObserver: Send + Sync {
    fn on_message(&self, event: &ServerEvent);

    fn on_state_change(&self, _state: ConnectionState) {}

    /// Called once when the manager gives up
    fn on_terminal_error(&self, _error: &VoiceError) {}
}

struct MessageHandler<F>(F);

impl<F> SessionObserver for MessageHandler<F>
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_message(&self, event: &ServerEvent) {
        (self.0)(event)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub backoff: Backoff,
    pub max_reconnect_attempts: u32,
    pub send_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787/v1/conversation".to_string(),
            connect_timeout: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(40),
            backoff: Backoff::default(),
            max_reconnect_attempts: 5,
            send_queue: 256,
        }
    }
}

impl From<&ClientConfig> for ConnectionConfig {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(cfg.heartbeat_interval_ms),
            stale_after: Duration::from_millis(cfg.stale_after_ms),
            backoff: Backoff {
                base: Duration::from_millis(cfg.backoff_base_ms),
                max: Duration::from_millis(cfg.backoff_max_ms),
                jitter: cfg.backoff_jitter,
            },
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            send_queue: cfg.send_queue,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub connects: u64,
    pub messages_received: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub terminal_error: Option<String>,
}

enum Dispatch {
    Message(ServerEvent),
    State(ConnectionState),
    Terminal(VoiceError),
}

type Connected = (Arc<dyn Transport>, mpsc::Receiver<TransportEvent>);

struct Core {
    state: ConnectionState,
    attempts: u32,
    epoch: u64,
    transport: Option<Arc<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    last_activity: Instant,
    last_activity_at: Option<DateTime<Utc>>,
    connects: u64,
    messages: u64,
    terminal: Option<VoiceError>,
    /// A send on an idle connection dials again; cleared by close and exhaustion
    resume_on_send: bool,
}

impl Core {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Some(Utc::now());
    }
}

struct Inner {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    observers: Arc<RwLock<Vec<Arc<dyn SessionObserver>>>>,
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn budget(&self, core: &Core) -> RetryBudget {
        RetryBudget {
            attempts: core.attempts,
            max: self.config.max_reconnect_attempts,
        }
    }

    fn set_state(&self, core: &mut Core, next: ConnectionState) {
        if core.state == next {
            return;
        }
        debug!("Connection state {:?} -> {:?}", core.state, next);
        core.state = next;
        self.state_tx.send_replace(next);
        let _ = self.dispatch_tx.send(Dispatch::State(next));
    }

    fn begin_attempt(&self, core: &mut Core) -> u64 {
        core.epoch += 1;
        core.epoch
    }

    /// Stop the per-connection tasks and invalidate their epoch
    fn teardown(&self, core: &mut Core) -> Option<Arc<dyn Transport>> {
        core.epoch += 1;
        for task in [core.pump.take(), core.heartbeat.take()].into_iter().flatten() {
            task.abort();
        }
        core.transport.take()
    }

    /// Run `event` through the state machine and carry out its action
    fn apply(self: &Arc<Self>, core: &mut Core, event: ConnectionEvent, detail: &str) -> Action {
        let t = transition(core.state, event, self.budget(core));
        self.set_state(core, t.next);

        match &t.action {
            Action::Teardown => {
                if let Some(transport) = self.teardown(core) {
                    spawn_close(transport, NORMAL_CLOSURE, "closed");
                }
                info!("Connection closed normally");
            }
            Action::ScheduleReconnect { attempt } => {
                warn!("Connection faulted: {}", detail);
                if let Some(transport) = self.teardown(core) {
                    spawn_close(transport, CLOSE_RECONNECTING, "reconnecting");
                }
                core.attempts = *attempt;
                self.schedule_reconnect(core, *attempt);
            }
            Action::Exhausted { attempts } => {
                if let Some(transport) = self.teardown(core) {
                    spawn_close(transport, CLOSE_RECONNECTING, "giving up");
                }
                let err = VoiceError::ReconnectExhausted {
                    attempts: *attempts,
                };
                error!("{} (last failure: {})", err, detail);
                core.resume_on_send = false;
                core.terminal = Some(err.clone());
                let _ = self.dispatch_tx.send(Dispatch::Terminal(err));
            }
            _ => {}
        }

        t.action
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core, attempt: u32) {
        let delay = self.config.backoff.delay(attempt);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, attempt, self.config.max_reconnect_attempts
        );

        let epoch = core.epoch;
        let weak = Arc::downgrade(self);
        core.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let next = {
                let mut core = inner.core();
                if core.epoch != epoch {
                    return;
                }
                inner.apply(&mut core, ConnectionEvent::BackoffElapsed, "backoff elapsed");
                match inner.apply(&mut core, ConnectionEvent::Connect, "retry") {
                    Action::OpenTransport => inner.begin_attempt(&mut core),
                    _ => return,
                }
            };

            if let Err(e) = inner.establish(next).await {
                debug!("Reconnect attempt {} failed: {}", attempt, e);
            }
        }));
    }

    async fn establish(self: Arc<Self>, epoch: u64) -> Result<(), VoiceError> {
        info!("Connecting to {} (epoch {})", self.config.url, epoch);
        let result = tokio::time::timeout(self.config.connect_timeout, self.factory.connect()).await;
        self.finish_attempt(epoch, result)
    }

    fn finish_attempt(
        self: &Arc<Self>,
        epoch: u64,
        result: Result<anyhow::Result<Connected>, Elapsed>,
    ) -> Result<(), VoiceError> {
        let mut core = self.core();

        if core.epoch != epoch || core.state != ConnectionState::Connecting {
            debug!("Connection attempt {} superseded", epoch);
            if let Ok(Ok((transport, _))) = result {
                spawn_close(transport, NORMAL_CLOSURE, "superseded");
            }
            return Err(VoiceError::Closed);
        }

        match result {
            Ok(Ok((transport, events))) => {
                self.apply(&mut core, ConnectionEvent::TransportReady, "ready");
                core.attempts = 0;
                core.connects += 1;
                core.terminal = None;
                core.transport = Some(transport);
                core.touch();

                let weak = Arc::downgrade(self);
                core.pump = Some(tokio::spawn(run_pump(weak.clone(), epoch, events)));
                core.heartbeat = Some(tokio::spawn(run_heartbeat(
                    weak,
                    epoch,
                    self.config.heartbeat_interval,
                    self.config.stale_after,
                )));

                info!("Connected to {}", self.config.url);
                Ok(())
            }
            Ok(Err(e)) => {
                let err = VoiceError::Transport(format!("{:#}", e));
                self.apply(&mut core, ConnectionEvent::ConnectFailed, &err.to_string());
                Err(err)
            }
            Err(_) => {
                let err = VoiceError::ConnectTimeout(self.config.connect_timeout);
                self.apply(&mut core, ConnectionEvent::ConnectTimeout, &err.to_string());
                Err(err)
            }
        }
    }

    /// Forward an inbound message if it belongs to the live connection
    fn deliver(&self, epoch: u64, event: Option<ServerEvent>) {
        let mut core = self.core();
        if core.epoch != epoch || core.state != ConnectionState::Open {
            return;
        }
        core.touch();

        if let Some(event) = event {
            core.messages += 1;
            let _ = self.dispatch_tx.send(Dispatch::Message(event));
        }
    }

    fn handle_event(self: &Arc<Self>, epoch: u64, event: ConnectionEvent, detail: &str) {
        let mut core = self.core();
        if core.epoch != epoch {
            debug!("Ignoring {:?} from a stale connection", event);
            return;
        }
        self.apply(&mut core, event, detail);
    }

    /// One heartbeat tick; returns false once this connection is done
    fn heartbeat(self: &Arc<Self>, epoch: u64, stale_after: Duration) -> bool {
        let mut core = self.core();
        if core.epoch != epoch || core.state != ConnectionState::Open {
            return false;
        }

        let idle = core.last_activity.elapsed();
        if idle > stale_after {
            warn!("No inbound traffic for {:?}, forcing reconnect", idle);
            self.apply(&mut core, ConnectionEvent::HeartbeatStale, "heartbeat timeout");
            return false;
        }

        let Some(transport) = core.transport.clone() else {
            return false;
        };
        let ping = match serde_json::to_string(&ClientEvent::Ping) {
            Ok(ping) => ping,
            Err(_) => return true,
        };
        if let Err(e) = transport.send_text(ping) {
            self.apply(&mut core, ConnectionEvent::TransportError, &format!("{:#}", e));
            return false;
        }
        true
    }

    fn send(self: &Arc<Self>, event: &ClientEvent) -> Result<(), VoiceError> {
        let payload = serde_json::to_string(event)?;

        let mut core = self.core();
        if core.state != ConnectionState::Open {
            if core.state == ConnectionState::Idle && core.resume_on_send {
                self.reconnect_on_demand(&mut core);
            }
            return Err(VoiceError::NotConnected);
        }
        let Some(transport) = core.transport.clone() else {
            return Err(VoiceError::NotConnected);
        };

        if let Err(e) = transport.send_text(payload) {
            let detail = format!("{:#}", e);
            self.apply(&mut core, ConnectionEvent::TransportError, &detail);
            return Err(VoiceError::Transport(detail));
        }
        Ok(())
    }

    /// Dial in the background after a send found the connection idle
    fn reconnect_on_demand(self: &Arc<Self>, core: &mut Core) {
        let t = transition(core.state, ConnectionEvent::Connect, self.budget(core));
        if t.action != Action::OpenTransport {
            return;
        }

        info!("Send on an idle connection, reconnecting");
        core.attempts = 0;
        self.set_state(core, t.next);
        let epoch = self.begin_attempt(core);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.establish(epoch).await {
                debug!("On-demand reconnect failed: {}", e);
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in [core.pump.take(), core.heartbeat.take(), core.retry.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

fn spawn_close(transport: Arc<dyn Transport>, code: u16, reason: &'static str) {
    tokio::spawn(async move {
        transport.close(code, reason).await;
    });
}

async fn run_pump(inner: Weak<Inner>, epoch: u64, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            TransportEvent::Message(text) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => inner.deliver(epoch, Some(event)),
                Err(e) => {
                    warn!("Dropping malformed server message: {}", e);
                    inner.deliver(epoch, None);
                }
            },
            TransportEvent::Closed { code, reason } => {
                info!("Transport closed ({}): {}", code, reason);
                let detail = format!("closed with code {}", code);
                inner.handle_event(epoch, ConnectionEvent::Closed { code }, &detail);
                return;
            }
            TransportEvent::Error(message) => {
                inner.handle_event(epoch, ConnectionEvent::TransportError, &message);
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.handle_event(epoch, ConnectionEvent::TransportError, "event stream ended");
    }
}

async fn run_heartbeat(inner: Weak<Inner>, epoch: u64, interval: Duration, stale_after: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.heartbeat(epoch, stale_after) {
            return;
        }
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    observers: Arc<RwLock<Vec<Arc<dyn SessionObserver>>>>,
) {
    while let Some(item) = rx.recv().await {
        let observers: Vec<Arc<dyn SessionObserver>> = observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for observer in &observers {
            match &item {
                Dispatch::Message(event) => observer.on_message(event),
                Dispatch::State(state) => observer.on_state_change(*state),
                Dispatch::Terminal(err) => observer.on_terminal_error(err),
            }
        }
    }
}

/// Handle to the managed connection; cheap to clone
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Non-owning handle for observers that need to send
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn send(&self, event: &ClientEvent) -> Result<(), VoiceError> {
        match self.inner.upgrade() {
            Some(inner) => inner.send(event),
            None => Err(VoiceError::Closed),
        }
    }
}

impl ConnectionManager {
    /// Must be called inside a tokio runtime
    pub fn new(config: ConnectionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let observers: Arc<RwLock<Vec<Arc<dyn SessionObserver>>>> = Arc::default();

        tokio::spawn(run_dispatcher(dispatch_rx, Arc::clone(&observers)));

        let core = Core {
            state: ConnectionState::Idle,
            attempts: 0,
            epoch: 0,
            transport: None,
            pump: None,
            heartbeat: None,
            retry: None,
            last_activity: Instant::now(),
            last_activity_at: None,
            connects: 0,
            messages: 0,
            terminal: None,
            resume_on_send: false,
        };

        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                core: Mutex::new(core),
                state_tx,
                dispatch_tx,
                observers,
            }),
        }
    }

    /// Manager dialing `config.url` over WebSocket
    pub fn websocket(config: ConnectionConfig) -> Self {
        let factory = WebSocketTransportFactory::new(config.url.clone(), config.send_queue);
        Self::new(config, Arc::new(factory))
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    /// Register a closure for inbound messages
    pub fn add_message_handler<F>(&self, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.add_observer(Arc::new(MessageHandler(handler)));
    }

    /// Open the connection.
    ///
    /// Succeeds immediately when already open and fails with
    /// `AlreadyConnecting` while an attempt is in flight. A manual call
    /// from idle or faulted resets the retry budget and cancels any pending
    /// retry. On failure the reconnect schedule takes over.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        let epoch = {
            let mut core = self.inner.core();
            let t = transition(core.state, ConnectionEvent::Connect, self.inner.budget(&core));
            match t.action {
                Action::Reject(err) => return Err(err),
                Action::OpenTransport => {}
                _ => return Ok(()),
            }

            if let Some(retry) = core.retry.take() {
                retry.abort();
            }
            core.attempts = 0;
            core.terminal = None;
            core.resume_on_send = true;
            self.inner.set_state(&mut core, t.next);
            self.inner.begin_attempt(&mut core)
        };

        Arc::clone(&self.inner).establish(epoch).await
    }

    /// Queue one message without blocking.
    ///
    /// Fails with `NotConnected` unless the transport is open. A send that
    /// finds the connection idle after it was once connected also starts a
    /// background reconnect; after `close()` or an exhausted retry budget it
    /// only fails.
    pub fn send(&self, event: &ClientEvent) -> Result<(), VoiceError> {
        self.inner.send(event)
    }

    /// Close normally and suppress reconnects; safe from any state
    pub async fn close(&self) {
        let transport = {
            let mut core = self.inner.core();
            if let Some(retry) = core.retry.take() {
                retry.abort();
            }
            core.resume_on_send = false;
            let t = transition(core.state, ConnectionEvent::CloseRequested, self.inner.budget(&core));
            self.inner.set_state(&mut core, t.next);
            if t.action == Action::Teardown {
                self.inner.teardown(&mut core)
            } else {
                None
            }
        };

        if let Some(transport) = transport {
            transport.close(NORMAL_CLOSURE, "client closed").await;
        }

        let mut core = self.inner.core();
        let t = transition(core.state, ConnectionEvent::CloseComplete, self.inner.budget(&core));
        self.inner.set_state(&mut core, t.next);
        info!("Connection manager closed");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        let core = self.inner.core();
        ConnectionStats {
            state: core.state,
            reconnect_attempts: core.attempts,
            connects: core.connects,
            messages_received: core.messages,
            last_activity: core.last_activity_at,
            terminal_error: core.terminal.as_ref().map(|e| e.to_string()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use rand::Rng;
use shared::domain::Event;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Reconnecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the delay applied as +/- random jitter.
    pub jitter: f64,
    /// How long the stream stays up after the last subscriber leaves.
    pub linger: Duration,
    /// A silent stream is treated as dead after this long.
    pub idle_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
            linger: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl ReconnectConfig {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_delay)
    }

    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + factor).max(0.0))
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

enum PumpExit {
    Unauthorized,
}

#[derive(Default)]
struct PumpSlot {
    pump: Option<JoinHandle<()>>,
}

/// One shared subscription to the server's push stream. The underlying
/// connection runs while at least one [`EventSubscription`] is alive and for
/// a linger period after the last one is dropped.
pub struct PushConnection {
    transport: Arc<dyn Transport>,
    config: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    context_tx: watch::Sender<Option<String>>,
    events: broadcast::Sender<Event>,
    observers: AtomicUsize,
    generation: AtomicU64,
    slot: Mutex<PumpSlot>,
}

impl PushConnection {
    pub fn new(transport: Arc<dyn Transport>, config: ReconnectConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (context_tx, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            config,
            state_tx,
            context_tx,
            events,
            observers: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            slot: Mutex::new(PumpSlot::default()),
        })
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }

    /// Changes the addressing key (the working directory). A distinct value
    /// restarts the subscription from the initial delay.
    pub fn set_context_key(&self, key: Option<String>) {
        let changed = self.context_tx.send_if_modified(|current| {
            if *current == key {
                return false;
            }
            *current = key;
            true
        });
        if changed {
            debug!("sync: push context key changed");
        }
    }

    pub async fn subscribe(self: &Arc<Self>) -> EventSubscription {
        // Receiver first so nothing published after start-up is missed.
        let receiver = self.events.subscribe();
        self.observers.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut slot = self.slot.lock().await;
        let running = slot.pump.as_ref().is_some_and(|pump| !pump.is_finished());
        if !running {
            info!("sync: starting push connection");
            let connection = Arc::clone(self);
            slot.pump = Some(tokio::spawn(async move { connection.run_pump().await }));
        }

        EventSubscription {
            receiver,
            connection: Arc::clone(self),
        }
    }

    /// Tears the stream down immediately, regardless of subscribers.
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(pump) = slot.pump.take() {
            pump.abort();
            info!("sync: push connection closed");
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    fn release(self: &Arc<Self>) {
        let remaining = self.observers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining > 0 {
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = Arc::clone(self);
        handle.spawn(async move {
            sleep(connection.config.linger).await;
            if connection.observers.load(Ordering::SeqCst) == 0
                && connection.generation.load(Ordering::SeqCst) == generation
            {
                debug!("sync: no subscribers left after linger");
                connection.disconnect().await;
            }
        });
    }

    async fn run_pump(self: Arc<Self>) {
        let mut context_rx = self.context_tx.subscribe();
        loop {
            let directory = context_rx.borrow_and_update().clone();
            tokio::select! {
                exit = self.reconnect_loop(directory.as_deref()) => {
                    match exit {
                        PumpExit::Unauthorized => {
                            warn!("sync: push stream unauthorized; giving up until re-paired");
                            self.state_tx.send_replace(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
                changed = context_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    info!(directory = ?context_rx.borrow().as_deref(), "sync: restarting push stream for new context");
                }
            }
        }
    }

    async fn reconnect_loop(&self, directory: Option<&str>) -> PumpExit {
        let mut delay = self.config.initial_delay;
        loop {
            self.state_tx.send_replace(ConnectionState::Reconnecting);
            let mut reached_connected = false;

            match self.transport.subscribe_events(directory).await {
                Ok(mut stream) => {
                    reached_connected = true;
                    self.state_tx.send_replace(ConnectionState::Connected);
                    info!(directory = ?directory, "sync: push stream connected");

                    loop {
                        match timeout(self.config.idle_timeout, stream.next()).await {
                            Ok(Some(Ok(event))) => {
                                // No receivers is fine; the linger timer decides shutdown.
                                let _ = self.events.send(event);
                            }
                            Ok(Some(Err(err))) if err.is_unauthorized() => {
                                return PumpExit::Unauthorized;
                            }
                            Ok(Some(Err(err))) => {
                                warn!(error = %err, "sync: push stream failed");
                                break;
                            }
                            Ok(None) => {
                                debug!("sync: push stream closed by server");
                                break;
                            }
                            Err(_) => {
                                warn!(
                                    idle_secs = self.config.idle_timeout.as_secs(),
                                    "sync: push stream idle; reconnecting"
                                );
                                break;
                            }
                        }
                    }
                }
                Err(err) if err.is_unauthorized() => return PumpExit::Unauthorized,
                Err(err) => {
                    warn!(error = %err, "sync: failed to open push stream");
                }
            }

            if reached_connected {
                delay = self.config.initial_delay;
            }
            self.state_tx.send_replace(ConnectionState::Reconnecting);
            let wait = self.config.jittered(delay);
            debug!(wait_ms = wait.as_millis() as u64, "sync: waiting before reconnect");
            sleep(wait).await;
            delay = self.config.next_delay(delay);
        }
    }
}

/// A live attachment to the shared event stream.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
    connection: Arc<PushConnection>,
}

impl EventSubscription {
    /// Next event, or `None` once the connection is gone for good. Lagged
    /// events are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "sync: event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.connection.release();
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use shared::protocol::EventFrame;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    credentials::CredentialStore,
    error::{ClientError, Result},
    transport::Connector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts made after the first one before giving up.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_millis(1_000),
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>,
}

/// Receives payloads of one named event until dropped. Handlers are held by
/// the manager, not by a particular link, so they survive reconnects without
/// being registered twice.
pub struct EventSubscription {
    event: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    registry: Weak<Mutex<Registry>>,
}

impl EventSubscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handlers) = registry.handlers.get_mut(&self.event) {
            handlers.retain(|(id, _)| *id != self.id);
            if handlers.is_empty() {
                registry.handlers.remove(&self.event);
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    outbound: Option<mpsc::Sender<EventFrame>>,
    supervisor: Option<JoinHandle<()>>,
    credential: Option<String>,
    /// Bumped on every connect/disconnect; a supervisor from an older
    /// generation may no longer touch shared state.
    generation: u64,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    credentials: Option<Arc<CredentialStore>>,
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<ConnectionEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl ConnectionManager {
    /// `credentials`, when given, supplies the latest access credential on
    /// reconnect so a refresh in between is picked up.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        credentials: Option<Arc<CredentialStore>>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (lifecycle, _) = broadcast::channel(64);
        Arc::new(Self {
            connector,
            policy,
            credentials,
            inner: Mutex::new(Inner::default()),
            state,
            lifecycle,
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.lifecycle.subscribe()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Starts establishing the channel. A no-op while already connected; any
    /// other existing link or retry loop is torn down first.
    pub fn connect(self: &Arc<Self>, credential: &str) {
        let mut inner = self.lock_inner();
        if self.state() == ConnectionState::Connected && inner.outbound.is_some() {
            debug!("connection: already connected");
            return;
        }

        if let Some(stale) = inner.supervisor.take() {
            debug!("connection: tearing down stale connection");
            stale.abort();
        }
        inner.outbound = None;
        inner.generation += 1;
        inner.credential = Some(credential.to_string());
        let generation = inner.generation;
        self.state.send_replace(ConnectionState::Connecting);

        let manager = Arc::clone(self);
        inner.supervisor = Some(tokio::spawn(async move {
            manager.supervise(generation).await;
        }));
    }

    pub fn disconnect(&self) {
        let mut inner = self.lock_inner();
        inner.generation += 1;
        if let Some(supervisor) = inner.supervisor.take() {
            supervisor.abort();
        }
        inner.outbound = None;
        inner.credential = None;

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!("connection: disconnected by client");
            let _ = self
                .lifecycle
                .send(ConnectionEvent::Disconnected("client disconnect".into()));
        }
    }

    pub async fn emit(&self, event: &str, payload: &impl Serialize) -> Result<()> {
        let outbound = {
            let inner = self.lock_inner();
            if self.state() != ConnectionState::Connected {
                return Err(ClientError::NotConnected);
            }
            inner.outbound.clone().ok_or(ClientError::NotConnected)?
        };
        let frame = EventFrame::new(event, serde_json::to_value(payload)?);
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionLost)
    }

    pub fn subscribe(&self, event: &str) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.lock_registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, tx));
        EventSubscription {
            event: event.to_string(),
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    async fn supervise(self: Arc<Self>, generation: u64) {
        let mut retries = 0u32;
        let mut first_attempt = true;
        loop {
            let credential = self.attempt_credential(first_attempt).await;
            first_attempt = false;

            let opened = match credential {
                Some(credential) => self
                    .connector
                    .open(&credential)
                    .await
                    .map_err(|err| err.to_string()),
                None => Err("no access credential available".to_string()),
            };

            match opened {
                Ok(link) => {
                    if !self.install(generation, link.outbound) {
                        return;
                    }
                    retries = 0;
                    self.pump(link.inbound).await;
                    if !self.mark_dropped(generation) {
                        return;
                    }
                }
                Err(detail) => {
                    if !self.is_current(generation) {
                        return;
                    }
                    warn!(retries, "connection: attempt failed: {detail}");
                    let _ = self.lifecycle.send(ConnectionEvent::Error(detail));
                }
            }

            if retries >= self.policy.max_retries {
                self.give_up(generation);
                return;
            }
            retries += 1;
            if !self.set_state_if_current(generation, ConnectionState::Reconnecting) {
                return;
            }
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    async fn attempt_credential(&self, first_attempt: bool) -> Option<String> {
        if !first_attempt {
            if let Some(store) = &self.credentials {
                match store.access_credential().await {
                    Ok(Some(latest)) => return Some(latest),
                    Ok(None) => {}
                    Err(err) => warn!("connection: failed to read access credential: {err}"),
                }
            }
        }
        self.lock_inner().credential.clone()
    }

    fn install(&self, generation: u64, outbound: mpsc::Sender<EventFrame>) -> bool {
        let mut inner = self.lock_inner();
        if inner.generation != generation {
            return false;
        }
        inner.outbound = Some(outbound);
        self.state.send_replace(ConnectionState::Connected);
        info!("connection: connected");
        let _ = self.lifecycle.send(ConnectionEvent::Connected);
        true
    }

    async fn pump(&self, mut inbound: mpsc::Receiver<EventFrame>) {
        while let Some(frame) = inbound.recv().await {
            self.dispatch(frame);
        }
    }

    fn dispatch(&self, frame: EventFrame) {
        let mut registry = self.lock_registry();
        match registry.handlers.get_mut(&frame.event) {
            Some(handlers) => {
                handlers.retain(|(_, tx)| tx.send(frame.data.clone()).is_ok());
            }
            None => debug!(event = %frame.event, "connection: no subscriber for event"),
        }
    }

    fn mark_dropped(&self, generation: u64) -> bool {
        let mut inner = self.lock_inner();
        if inner.generation != generation {
            return false;
        }
        inner.outbound = None;
        self.state.send_replace(ConnectionState::Reconnecting);
        warn!("connection: transport dropped");
        let _ = self
            .lifecycle
            .send(ConnectionEvent::Disconnected("transport closed".into()));
        true
    }

    fn give_up(&self, generation: u64) {
        let mut inner = self.lock_inner();
        if inner.generation != generation {
            return;
        }
        inner.outbound = None;
        inner.supervisor = None;
        self.state.send_replace(ConnectionState::Disconnected);
        warn!(
            max_retries = self.policy.max_retries,
            "connection: reconnect attempts exhausted"
        );
        let _ = self.lifecycle.send(ConnectionEvent::Disconnected(
            "reconnect attempts exhausted".into(),
        ));
    }

    fn set_state_if_current(&self, generation: u64, state: ConnectionState) -> bool {
        let inner = self.lock_inner();
        if inner.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_inner().generation == generation
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;

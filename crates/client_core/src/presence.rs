use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::UserId,
    protocol::{HeartbeatPayload, PresenceReply, EVENT_PRESENCE_HEARTBEAT, EVENT_PRESENCE_STATUS},
};
use tokio::{
    sync::watch,
    task::{AbortHandle, JoinHandle},
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    clock::PresenceClock,
    connection::{ConnectionManager, ConnectionState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceSettings {
    pub heartbeat_interval: Duration,
    /// Must exceed `heartbeat_interval` so one late heartbeat does not flip
    /// a peer offline.
    pub online_threshold: Duration,
    pub initial_watch_delay: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(10_000),
            online_threshold: Duration::from_millis(15_000),
            initial_watch_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceStatus {
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

pub fn is_online(
    last_seen_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    let Some(seen) = last_seen_at else {
        return false;
    };
    let Ok(threshold) = chrono::Duration::from_std(threshold) else {
        return false;
    };
    now - seen < threshold
}

/// Renders a last-seen time relative to `now`: "just now", "5m ago", "3h ago"
/// or a short date such as "May 3". Empty when never seen.
pub fn format_last_seen(last_seen_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(seen) = last_seen_at else {
        return String::new();
    };
    let elapsed = (now - seen).num_milliseconds();
    if elapsed < 60_000 {
        "just now".to_string()
    } else if elapsed < 3_600_000 {
        format!("{}m ago", elapsed / 60_000)
    } else if elapsed < 86_400_000 {
        format!("{}h ago", elapsed / 3_600_000)
    } else {
        seen.format("%b %-d").to_string()
    }
}

/// Live presence of one watched identity. Dropping it stops the watch and its
/// heartbeats.
pub struct PresenceWatch {
    identity: UserId,
    status: watch::Receiver<PresenceStatus>,
    task: JoinHandle<()>,
}

impl PresenceWatch {
    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    /// Last derived status. Once the watch has ended (stopped, logged out)
    /// the identity reads as offline; the last-seen time is kept.
    pub fn status(&self) -> PresenceStatus {
        let status = *self.status.borrow();
        if self.status.has_changed().is_err() {
            return PresenceStatus {
                is_online: false,
                ..status
            };
        }
        status
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online
    }

    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.status().last_seen_at
    }

    pub async fn changed(&mut self) -> bool {
        self.status.changed().await.is_ok()
    }

    pub fn stop(self) {}
}

impl Drop for PresenceWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct Tasks {
    self_heartbeat: Option<JoinHandle<()>>,
    watches: Vec<AbortHandle>,
}

pub struct PresenceTracker {
    connection: Arc<ConnectionManager>,
    clock: Arc<PresenceClock>,
    settings: PresenceSettings,
    tasks: Mutex<Tasks>,
}

impl PresenceTracker {
    pub fn new(
        connection: Arc<ConnectionManager>,
        clock: Arc<PresenceClock>,
        settings: PresenceSettings,
    ) -> Arc<Self> {
        if settings.online_threshold <= settings.heartbeat_interval {
            warn!(
                threshold_ms = settings.online_threshold.as_millis() as u64,
                interval_ms = settings.heartbeat_interval.as_millis() as u64,
                "presence: online threshold does not exceed heartbeat interval"
            );
        }
        Arc::new(Self {
            connection,
            clock,
            settings,
            tasks: Mutex::new(Tasks::default()),
        })
    }

    pub fn settings(&self) -> PresenceSettings {
        self.settings
    }

    /// Runs the self heartbeat whenever the connection is up: one beat right
    /// after each (re)connect, then one per interval until the connection
    /// leaves the connected state.
    pub fn start(&self) {
        let mut tasks = self.lock_tasks();
        if tasks
            .self_heartbeat
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }

        let connection = Arc::clone(&self.connection);
        let period = self.settings.heartbeat_interval;
        tasks.self_heartbeat = Some(tokio::spawn(async move {
            let mut state = connection.subscribe_state();
            loop {
                if !wait_until(&mut state, |s| s == ConnectionState::Connected).await {
                    return;
                }
                debug!("presence: connection up, starting self heartbeat");
                tokio::select! {
                    _ = self_heartbeat(&connection, period) => {}
                    alive = wait_until(&mut state, |s| s != ConnectionState::Connected) => {
                        if !alive {
                            return;
                        }
                        debug!("presence: connection left connected state, pausing self heartbeat");
                    }
                }
            }
        }));
    }

    /// Starts watching `identity`: a heartbeat naming it after the initial
    /// delay and then every interval, with replies folded into the status.
    pub fn watch(&self, identity: UserId) -> PresenceWatch {
        let mut replies = self.connection.subscribe(EVENT_PRESENCE_STATUS);
        let mut ticks = self.clock.subscribe();
        let (status_tx, status) = watch::channel(PresenceStatus::default());

        let connection = Arc::clone(&self.connection);
        let clock = Arc::clone(&self.clock);
        let settings = self.settings;
        let watched = identity.clone();

        let task = tokio::spawn(async move {
            let payload = HeartbeatPayload {
                watched_id: Some(watched.clone()),
            };
            let initial = sleep(settings.initial_watch_delay);
            tokio::pin!(initial);
            let mut initial_sent = false;
            let mut beats = interval_at(
                Instant::now() + settings.heartbeat_interval,
                settings.heartbeat_interval,
            );
            beats.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seen: Option<DateTime<Utc>> = None;

            loop {
                tokio::select! {
                    _ = &mut initial, if !initial_sent => {
                        initial_sent = true;
                        send_heartbeat(&connection, &payload).await;
                    }
                    _ = beats.tick() => {
                        send_heartbeat(&connection, &payload).await;
                    }
                    reply = replies.recv() => {
                        let Some(data) = reply else {
                            break;
                        };
                        match PresenceReply::from_event(data) {
                            Ok(reply) if reply.identity_id == watched => {
                                if let Some(seen) = reply
                                    .last_seen_at
                                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                                {
                                    last_seen = Some(seen);
                                }
                            }
                            Ok(_) => continue,
                            Err(err) => {
                                warn!("presence: ignoring malformed status reply: {err}");
                                continue;
                            }
                        }
                    }
                    tick = ticks.changed() => {
                        if tick.is_err() {
                            break;
                        }
                    }
                }

                let next = PresenceStatus {
                    is_online: is_online(last_seen, clock.now(), settings.online_threshold),
                    last_seen_at: last_seen,
                };
                status_tx.send_if_modified(|current| {
                    if *current == next {
                        return false;
                    }
                    *current = next;
                    true
                });
            }
        });

        {
            let mut tasks = self.lock_tasks();
            tasks.watches.retain(|handle| !handle.is_finished());
            tasks.watches.push(task.abort_handle());
        }
        info!(watched_id = %identity, "presence: watching identity");

        PresenceWatch {
            identity,
            status,
            task,
        }
    }

    pub fn stop_all(&self) {
        let mut tasks = self.lock_tasks();
        if let Some(task) = tasks.self_heartbeat.take() {
            task.abort();
        }
        for watch in tasks.watches.drain(..) {
            watch.abort();
        }
        debug!("presence: all heartbeats stopped");
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn self_heartbeat(connection: &ConnectionManager, period: Duration) {
    let payload = HeartbeatPayload::default();
    let mut beats = tokio::time::interval(period);
    beats.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        beats.tick().await;
        send_heartbeat(connection, &payload).await;
    }
}

async fn send_heartbeat(connection: &ConnectionManager, payload: &HeartbeatPayload) {
    if let Err(err) = connection.emit(EVENT_PRESENCE_HEARTBEAT, payload).await {
        debug!("presence: heartbeat not sent: {err}");
    }
}

async fn wait_until(
    state: &mut watch::Receiver<ConnectionState>,
    accept: impl Fn(ConnectionState) -> bool,
) -> bool {
    loop {
        if accept(*state.borrow_and_update()) {
            return true;
        }
        if state.changed().await.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Shared recurring "now" tick. Subscribers see the latest tick value and
/// are woken on each new one.
pub struct PresenceClock {
    clock: Arc<dyn Clock>,
    ticks: watch::Sender<DateTime<Utc>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceClock {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (ticks, _) = watch::channel(clock.now());
        Arc::new(Self {
            clock,
            ticks,
            ticker: Mutex::new(None),
        })
    }

    /// Starts ticking every `period`. Restarting replaces the previous timer.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let clock = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(clock) = clock.upgrade() else {
                    break;
                };
                clock.tick();
            }
        });
        if let Some(previous) = self.lock_ticker().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(ticker) = self.lock_ticker().take() {
            ticker.abort();
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn tick(&self) {
        self.ticks.send_replace(self.clock.now());
    }

    pub fn subscribe(&self) -> watch::Receiver<DateTime<Utc>> {
        self.ticks.subscribe()
    }

    fn lock_ticker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.ticker.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for PresenceClock {
    fn drop(&mut self) {
        self.stop();
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::message::Envelope;
use crate::broker::{Broker, Topic, WeakBroker};
use crate::poller::{PollSource, Poller};
use crate::utils::error::EngineError;

struct Target<R> {
    request: R,
    topic: Topic,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

/// Outcome of a single pass over the targets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub sent: u64,
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerStats {
    pub route: String,
    pub sent: u64,
    pub skipped: u64,
    pub errors: u64,
    pub running: bool,
    pub interval_ms: u64,
    pub targets: Vec<Value>,
    pub topics: Vec<String>,
}

pub struct PollingBroadcaster<S: PollSource> {
    broker: WeakBroker,
    source: S,
    targets: Vec<Target<S::Request>>,
    interval: Duration,
    counters: Counters,
    running: AtomicBool,
    stop: watch::Sender<bool>,
}

impl<S: PollSource> PollingBroadcaster<S> {
    /// Prepare a poller for `requests` on the source's route. Topics are
    /// derived once here so every tick only does lookups.
    pub fn new(
        broker: &Broker,
        source: S,
        requests: Vec<S::Request>,
        interval: Duration,
    ) -> Result<Self, EngineError> {
        if interval.is_zero() {
            return Err(EngineError::Config("poll interval must be positive".to_string()));
        }
        let targets = requests
            .into_iter()
            .map(|request| {
                let topic = Topic::new(source.route(), &request)?;
                Ok(Target { request, topic })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        let (stop, _) = watch::channel(false);

        Ok(Self {
            broker: broker.downgrade(),
            source,
            targets,
            interval,
            counters: Counters::default(),
            running: AtomicBool::new(false),
            stop,
        })
    }

    pub fn topics(&self) -> Vec<&Topic> {
        self.targets.iter().map(|target| &target.topic).collect()
    }

    /// Poll every target that has subscribers and publish the results.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let Some(broker) = self.broker.upgrade() else {
            return report;
        };
        let route = self.source.route();

        for target in &self.targets {
            if !broker.has_subscribers(&target.topic) {
                report.skipped += 1;
                continue;
            }

            let value = match self.source.poll(&target.request) {
                Ok(value) => value,
                Err(e) => {
                    error!(%route, topic = %target.topic, error = %e, "poll failed");
                    report.errors += 1;
                    continue;
                }
            };

            let envelope = Envelope::update(route, &target.topic, value);
            match broker.publish(&target.topic, &envelope) {
                Ok(delivery) => {
                    debug!(%route, topic = %target.topic, delivered = delivery.delivered, "poll published");
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(%route, topic = %target.topic, error = %e, "failed to publish poll result");
                    report.errors += 1;
                }
            }
        }

        self.counters.sent.fetch_add(report.sent, Ordering::Relaxed);
        self.counters.skipped.fetch_add(report.skipped, Ordering::Relaxed);
        self.counters.errors.fetch_add(report.errors, Ordering::Relaxed);
        report
    }

    /// Tick on the configured interval until `stop` is called or the broker
    /// goes away.
    pub async fn run(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.running.store(true, Ordering::Release);
        info!(
            route = self.source.route(),
            interval_ms = self.interval.as_millis() as u64,
            targets = self.targets.len(),
            "poller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.broker.upgrade().is_none() {
                        break;
                    }
                    self.tick();
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        info!(route = self.source.route(), "poller stopped");
    }
}

impl<S: PollSource> Poller for PollingBroadcaster<S> {
    fn stats(&self) -> PollerStats {
        PollerStats {
            route: self.source.route().to_string(),
            sent: self.counters.sent.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Acquire),
            interval_ms: self.interval.as_millis() as u64,
            targets: self
                .targets
                .iter()
                .filter_map(|target| serde_json::to_value(&target.request).ok())
                .collect(),
            topics: self.targets.iter().map(|t| t.topic.to_string()).collect(),
        }
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }
}

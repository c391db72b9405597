//! Producer lifecycle tracking
//!
//! One `ProducerTracker` per route owns the running producer task of every
//! topic on that route together with its reference count:
//!
//! - `ensure` starts a producer for a topic that has none and otherwise only
//!   bumps the count, so a topic never has more than one producer
//! - `release` drops one reference and stops the producer when the count
//!   reaches zero
//!
//! Neither awaits. `ensure` reserves the entry under the lock and builds the
//! producer with the lock released, since a producer may emit (and so
//! re-enter `release` through a disconnect) before its future is returned.
//!
//! A producer that returns an error or panics is logged and torn down. Its
//! entry keeps the reference count so outstanding subscribers can still
//! release, and the next `ensure` starts a fresh producer in its place.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::topic::Topic;
use crate::utils::error::ProducerError;

/// The running body of a producer.
pub type ProducerFuture = BoxFuture<'static, Result<(), ProducerError>>;

/// Where emitted values go: the route's update path.
pub type EmitSink<V> = Arc<dyn Fn(&Topic, V) + Send + Sync>;

/// Called once a topic's producer has been stopped, for whatever reason.
pub type StopHook = Arc<dyn Fn(&Topic) + Send + Sync>;

/// Handle a producer uses to push values for its topic.
///
/// Once the producer is released the emitter goes dead and further values
/// are dropped, so a late emit can never reach subscribers of a newer
/// producer or recreate tracker state.
pub struct Emitter<V> {
    topic: Topic,
    live: Arc<AtomicBool>,
    sink: EmitSink<V>,
}

impl<V> Clone for Emitter<V> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            live: self.live.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<V> Emitter<V> {
    pub fn new(topic: Topic, sink: EmitSink<V>) -> Self {
        Self {
            topic,
            live: Arc::new(AtomicBool::new(true)),
            sink,
        }
    }

    /// Push one value. Returns `false` if the producer has been stopped.
    pub fn emit(&self, value: V) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        (self.sink)(&self.topic, value);
        true
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    fn kill(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// What `ensure` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensure {
    /// A new producer was started; carries the refcount after the call.
    Started(usize),
    /// The running producer gained a reference.
    Joined(usize),
}

/// What `release` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// References remain; the producer keeps running.
    Retained(usize),
    /// That was the last reference; the producer was stopped and forgotten.
    Stopped,
    /// Nothing was tracked for the topic.
    Untracked,
}

enum Slot<V> {
    /// No producer: it failed or finished on its own.
    Idle,
    /// Reserved by an `ensure` that is building the producer.
    Starting,
    Running(JoinHandle<()>, Emitter<V>),
}

/// How a started producer was found once the lock was taken back.
enum Commit {
    Running,
    /// Its task already ended and retired it.
    Retired,
    /// The entry was released or replaced meanwhile.
    Released,
}

struct ProducerEntry<V> {
    refcount: usize,
    generation: u64,
    slot: Slot<V>,
}

struct TrackerState<V> {
    entries: HashMap<Topic, ProducerEntry<V>>,
    next_generation: u64,
    started: u64,
}

pub struct ProducerTracker<V> {
    route: String,
    state: Arc<Mutex<TrackerState<V>>>,
    sink: EmitSink<V>,
    on_stop: Option<StopHook>,
}

impl<V: Send + 'static> ProducerTracker<V> {
    pub fn new(route: impl Into<String>, sink: EmitSink<V>) -> Self {
        Self {
            route: route.into(),
            state: Arc::new(Mutex::new(TrackerState {
                entries: HashMap::new(),
                next_generation: 0,
                started: 0,
            })),
            sink,
            on_stop: None,
        }
    }

    pub fn with_stop_hook(mut self, hook: StopHook) -> Self {
        self.on_stop = Some(hook);
        self
    }

    /// Take a reference on `topic`, starting its producer through `factory`
    /// if none is running. Must be called from within a tokio runtime.
    pub fn ensure<F>(&self, topic: &Topic, factory: F) -> Ensure
    where
        F: FnOnce(Topic, Emitter<V>) -> ProducerFuture,
    {
        let (generation, refcount) = {
            let mut state = self.lock();
            let generation = state.next_generation;
            let entry = state
                .entries
                .entry(topic.clone())
                .or_insert_with(|| ProducerEntry {
                    refcount: 0,
                    generation,
                    slot: Slot::Idle,
                });
            entry.refcount += 1;
            let refcount = entry.refcount;
            if !matches!(entry.slot, Slot::Idle) {
                debug!(route = %self.route, %topic, refcount, "joined running producer");
                return Ensure::Joined(refcount);
            }
            entry.generation = generation;
            entry.slot = Slot::Starting;
            state.next_generation += 1;
            state.started += 1;
            (generation, refcount)
        };

        let emitter = Emitter::new(topic.clone(), self.sink.clone());
        let built = std::panic::catch_unwind(AssertUnwindSafe(|| {
            factory(topic.clone(), emitter.clone())
        }));
        let future = match built {
            Ok(future) => future,
            Err(_) => {
                error!(route = %self.route, %topic, "producer panicked while starting");
                emitter.kill();
                if retire(&Arc::downgrade(&self.state), topic, generation) {
                    self.notify_stopped(topic);
                }
                return Ensure::Started(refcount);
            }
        };
        let handle = self.spawn(topic.clone(), generation, future);
        let abort = handle.abort_handle();

        let commit = {
            let mut state = self.lock();
            match state.entries.get_mut(topic) {
                Some(entry) if entry.generation == generation => {
                    if matches!(entry.slot, Slot::Starting) {
                        entry.slot = Slot::Running(handle, emitter.clone());
                        Commit::Running
                    } else {
                        Commit::Retired
                    }
                }
                _ => Commit::Released,
            }
        };
        match commit {
            Commit::Running => info!(route = %self.route, %topic, refcount, "producer started"),
            Commit::Retired => emitter.kill(),
            Commit::Released => {
                // every reference went away while the producer was being built
                emitter.kill();
                abort.abort();
                self.notify_stopped(topic);
                debug!(route = %self.route, %topic, "producer released while starting");
            }
        }
        Ensure::Started(refcount)
    }

    /// Drop one reference on `topic`, stopping its producer at zero.
    pub fn release(&self, topic: &Topic) -> Release {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(topic) else {
            return Release::Untracked;
        };

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return Release::Retained(entry.refcount);
        }

        let slot = state.entries.remove(topic).map(|entry| entry.slot);
        drop(state);

        // a `Starting` slot is cleaned up by the `ensure` that reserved it
        if let Some(Slot::Running(handle, emitter)) = slot {
            emitter.kill();
            handle.abort();
            self.notify_stopped(topic);
        }
        info!(route = %self.route, %topic, "producer released");
        Release::Stopped
    }

    pub fn refcount(&self, topic: &Topic) -> Option<usize> {
        self.lock().entries.get(topic).map(|entry| entry.refcount)
    }

    pub fn is_running(&self, topic: &Topic) -> bool {
        self.lock()
            .entries
            .get(topic)
            .is_some_and(|entry| !matches!(entry.slot, Slot::Idle))
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Number of producers started since creation (factory invocations).
    pub fn started(&self) -> u64 {
        self.lock().started
    }

    /// Stop every producer and forget all topics.
    pub fn shutdown(&self) {
        let entries: Vec<_> = self.lock().entries.drain().collect();
        for (topic, entry) in entries {
            if let Slot::Running(handle, emitter) = entry.slot {
                emitter.kill();
                handle.abort();
                self.notify_stopped(&topic);
            }
        }
    }

    fn spawn(&self, topic: Topic, generation: u64, future: ProducerFuture) -> JoinHandle<()> {
        let state = Arc::downgrade(&self.state);
        let route = self.route.clone();
        let on_stop = self.on_stop.clone();

        tokio::spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => debug!(%route, %topic, "producer finished"),
                Ok(Err(e)) => error!(%route, %topic, error = %e, "producer failed"),
                Err(_) => error!(%route, %topic, "producer panicked"),
            }
            if retire(&state, &topic, generation) {
                if let Some(hook) = on_stop {
                    hook(&topic);
                }
            }
        })
    }

    fn notify_stopped(&self, topic: &Topic) {
        if let Some(hook) = &self.on_stop {
            hook(topic);
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState<V>> {
        // the state holds no invariants a panicking holder could break halfway
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Detach a producer that ended on its own. Only the generation that spawned
/// the task may retire it; a newer producer for the same topic is left alone.
fn retire<V>(state: &Weak<Mutex<TrackerState<V>>>, topic: &Topic, generation: u64) -> bool {
    let Some(state) = state.upgrade() else {
        return false;
    };
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    let Some(entry) = state.entries.get_mut(topic) else {
        return false;
    };
    if entry.generation != generation {
        return false;
    }
    match std::mem::replace(&mut entry.slot, Slot::Idle) {
        Slot::Running(_, emitter) => {
            emitter.kill();
            true
        }
        Slot::Starting => true,
        Slot::Idle => false,
    }
}

use crate::alarm::{Alarm, AlarmListener};
use crate::store::DeadlineStore;
use crate::{EntryKey, Error};
use exit_future::{Exit, Signal};
use parking_lot::Mutex;
use slog::{crit, debug, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Instant;

/// Capacity of the expiry channel. Each delivery task parks in `send` until
/// the consumer makes room, so an expired value is never dropped; a lagging
/// consumer accumulates parked delivery tasks instead.
const EXPIRED_CHANNEL_CAPACITY: usize = 1;

/// A concurrent delay queue delivering values on a channel once their
/// deadline elapses, in deadline order.
///
/// The queue owns a deadline-ordered store, a re-armable alarm and a
/// background dispatcher task under a single lock. The dispatcher exists only
/// while entries are pending: the first `add` into an empty queue spawns it,
/// and it stops when the store empties, on [`drain`](Self::drain) or
/// [`purge`](Self::purge), or when the queue is dropped.
///
/// Every delivery is spawned as its own task, so a slow or absent consumer of
/// the expiry channel never delays popping the next due entry or blocks
/// `add`/`remove`. Pops are strictly deadline-ordered but the completion order
/// of concurrent deliveries (e.g. during `drain` or an expiry burst) is not
/// guaranteed. The expiry channel holds one value, so a single delivery can
/// complete ahead of the consumer; every later delivery parks until the
/// consumer catches up, and none is ever dropped.
pub struct DeadlineQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
    /// Held for the queue's whole lifetime so the expiry channel is never
    /// closed by this side.
    expired_tx: Sender<T>,
    handle: Handle,
    log: Logger,
}

struct Inner<T> {
    store: DeadlineStore<T>,
    /// The live alarm/dispatcher pair, if one is running.
    dispatcher: Option<DispatcherHandle>,
    /// Increments for every spawned dispatcher. Lets a dispatcher detect,
    /// after waking, that it was stopped and replaced while unlocked.
    next_dispatcher_id: u64,
}

struct DispatcherHandle {
    id: u64,
    alarm: Alarm,
    exit_signal: Signal,
}

/// What a dispatcher found under the lock after consuming a fire.
enum FireOutcome<T> {
    /// The dispatcher was stopped or replaced while it was waking.
    Stale,
    /// The minimum is not due yet; the fire belonged to an entry a racing
    /// caller removed (or was otherwise overtaken by a re-arm). The alarm
    /// has been re-armed for the current minimum.
    NotDue,
    /// The store was empty; only reachable if the arm/re-arm discipline is
    /// broken.
    Empty,
    /// The due minimum was popped.
    Popped { value: T, finished: bool },
}

/// Time remaining until `deadline`, zero if it already passed.
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

impl<T: Send + 'static> DeadlineQueue<T> {
    /// Creates an empty queue and the receiving half of its expiry channel.
    ///
    /// Captures the current tokio runtime handle for spawning the dispatcher
    /// and delivery tasks; panics outside a runtime context. Use
    /// [`with_handle`](Self::with_handle) to pass a handle explicitly.
    pub fn new(log: Logger) -> (Self, Receiver<T>) {
        Self::with_handle(Handle::current(), log)
    }

    /// Creates an empty queue spawning its tasks on `handle`.
    pub fn with_handle(handle: Handle, log: Logger) -> (Self, Receiver<T>) {
        let (expired_tx, expired_rx) = mpsc::channel(EXPIRED_CHANNEL_CAPACITY);
        let queue = DeadlineQueue {
            inner: Arc::new(Mutex::new(Inner {
                store: DeadlineStore::new(),
                dispatcher: None,
                next_dispatcher_id: 0,
            })),
            expired_tx,
            handle,
            log,
        };
        (queue, expired_rx)
    }

    /// Schedules `value` for delivery once `ttl` elapses and returns the key
    /// required to remove it before it fires.
    pub fn add(&self, value: T, ttl: Duration) -> EntryKey {
        self.add_at(value, Instant::now() + ttl)
    }

    /// As [`add`](Self::add), with an absolute deadline. A deadline already in
    /// the past is delivered as soon as the dispatcher runs.
    pub fn add_at(&self, value: T, deadline: Instant) -> EntryKey {
        let mut inner = self.inner.lock();
        let prior_min = inner.store.peek_first();
        let key = inner.store.insert(value, deadline);

        match &inner.dispatcher {
            None => {
                let (alarm, listener) = Alarm::new();
                alarm.arm(remaining(deadline));
                let (exit_signal, exit) = exit_future::signal();
                let id = inner.next_dispatcher_id;
                inner.next_dispatcher_id += 1;
                inner.dispatcher = Some(DispatcherHandle {
                    id,
                    alarm,
                    exit_signal,
                });
                self.spawn_dispatcher(id, listener, exit);
            }
            Some(dispatcher) => {
                // Only an entry due before everything already pending moves
                // the next fire.
                if prior_min.map_or(true, |min| deadline < min.deadline()) {
                    dispatcher.alarm.rearm(remaining(deadline));
                }
            }
        }

        key
    }

    /// Cancels a pending entry, returning its value.
    ///
    /// Errors if `key` does not match a pending entry, i.e. the entry was
    /// already removed, delivered, drained or purged. Removing the same key
    /// twice is a caller bug and fails loudly rather than silently no-oping.
    pub fn remove(&self, key: &EntryKey) -> Result<T, Error> {
        let mut inner = self.inner.lock();
        let value = inner.store.remove(key)?;

        match inner.store.peek_first() {
            None => inner.stop_dispatcher(),
            Some(min) => {
                // The removed entry was the next due one; move the fire to
                // the new minimum.
                if *key < min {
                    if let Some(dispatcher) = &inner.dispatcher {
                        dispatcher.alarm.rearm(remaining(min.deadline()));
                    }
                }
            }
        }

        Ok(value)
    }

    /// Whether `key` still matches a pending entry.
    pub fn contains(&self, key: &EntryKey) -> bool {
        self.inner.lock().store.contains(key)
    }

    /// Stops the dispatcher and delivers every pending entry immediately.
    ///
    /// Entries are popped in deadline order, each spawned as its own delivery
    /// task; delivery completion order across entries is not guaranteed. The
    /// queue is empty afterwards and remains usable.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.stop_dispatcher();
        let mut drained = 0usize;
        while let Some((_, value)) = inner.store.pop_first() {
            self.spawn_delivery(value);
            drained += 1;
        }
        debug!(self.log, "Deadline queue drained"; "entries" => drained);
    }

    /// Stops the dispatcher and discards every pending entry without
    /// delivering anything. The queue is empty afterwards and remains usable.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.stop_dispatcher();
        let purged = inner.store.len();
        inner.store.clear();
        debug!(self.log, "Deadline queue purged"; "entries" => purged);
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.inner.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().store.is_empty()
    }

    /// Spawns the background loop waiting on the alarm and popping due
    /// entries. `id` identifies the dispatcher generation this loop belongs
    /// to; once `Inner::dispatcher` no longer carries it, the loop is stale
    /// and exits without touching the store.
    fn spawn_dispatcher(&self, id: u64, mut listener: AlarmListener, mut exit: Exit) {
        let inner = self.inner.clone();
        let expired_tx = self.expired_tx.clone();
        let handle = self.handle.clone();
        let log = self.log.clone();

        debug!(log, "Dispatcher started");
        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    // Cancellation wins over a simultaneous fire.
                    _ = &mut exit => {
                        debug!(log, "Dispatcher stopped");
                        return;
                    }
                    _ = listener.fired() => {}
                }

                let outcome = inner.lock().process_fire(id);
                let (value, finished) = match outcome {
                    FireOutcome::Stale => {
                        // Stopped between the fire and taking the lock.
                        debug!(log, "Dispatcher stopped");
                        return;
                    }
                    // A racing add/remove moved the next deadline into the
                    // future; the alarm was re-armed for it.
                    FireOutcome::NotDue => continue,
                    FireOutcome::Empty => {
                        // The arm/re-arm discipline guarantees the alarm only
                        // fires while an entry is pending.
                        crit!(log, "Alarm fired with an empty deadline store");
                        return;
                    }
                    FireOutcome::Popped { value, finished } => (value, finished),
                };

                // Deliver outside the lock, on its own task, so a slow
                // consumer never delays the next pop.
                let tx = expired_tx.clone();
                handle.spawn(async move {
                    let _ = tx.send(value).await;
                });

                if finished {
                    debug!(log, "Dispatcher finished");
                    return;
                }
            }
        });
    }

    /// Spawns a detached task delivering `value` on the expiry channel.
    fn spawn_delivery(&self, value: T) {
        let tx = self.expired_tx.clone();
        self.handle.spawn(async move {
            let _ = tx.send(value).await;
        });
    }
}

impl<T> Inner<T> {
    /// Handles a consumed fire for the dispatcher identified by `id`.
    ///
    /// A fire is only evidence that *some* armed deadline elapsed, not that
    /// the current minimum did: a caller's `remove` can win the lock between
    /// the fire and this call, delete the entry the fire was armed for and
    /// re-arm for a later minimum. The dueness check below keeps such a
    /// spent fire from popping an entry ahead of its deadline.
    fn process_fire(&mut self, id: u64) -> FireOutcome<T> {
        if self.dispatcher.as_ref().map(|d| d.id) != Some(id) {
            return FireOutcome::Stale;
        }

        match self.store.peek_first() {
            None => {
                self.dispatcher = None;
                FireOutcome::Empty
            }
            Some(min) if min.deadline() > Instant::now() => {
                if let Some(dispatcher) = &self.dispatcher {
                    dispatcher.alarm.rearm(remaining(min.deadline()));
                }
                FireOutcome::NotDue
            }
            Some(_) => {
                let Some((_, value)) = self.store.pop_first() else {
                    // Unreachable: the peek above saw an entry.
                    self.dispatcher = None;
                    return FireOutcome::Empty;
                };
                let finished = match self.store.peek_first() {
                    None => {
                        // Store emptied; leave the alarm disarmed and let a
                        // later add start a fresh dispatcher.
                        self.dispatcher = None;
                        true
                    }
                    Some(min) => {
                        if let Some(dispatcher) = &self.dispatcher {
                            dispatcher.alarm.rearm(remaining(min.deadline()));
                        }
                        false
                    }
                };
                FireOutcome::Popped { value, finished }
            }
        }
    }

    /// Tears down the live alarm/dispatcher pair, if any. Stopping the alarm
    /// drains a fired-but-unobserved signal; firing the exit stops a loop
    /// that is still waiting.
    fn stop_dispatcher(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.alarm.stop();
            dispatcher.exit_signal.fire();
        }
    }
}

impl<T> Drop for DeadlineQueue<T> {
    /// Stops the dispatcher so the background task is not leaked. Pending
    /// entries are discarded, as in [`purge`](Self::purge).
    fn drop(&mut self) {
        self.inner.lock().stop_dispatcher();
    }
}

//! Cross-thread scheduler (§4.6): a fixed pool of reactor threads, and the
//! only way code outside a reactor thread gets an object running or wakes
//! one that's already running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use futures::channel::oneshot;

use crate::config::SchedulerConfig;
use crate::error::{CapacityExceededSnafu, CoreError};
use crate::notifier::EpollNotifier;
use crate::object::ActiveObject;
use crate::reactor::{PendingAdd, Reactor, ReactorShared};
use crate::wake::{WakeChannel, SHUTDOWN_TOKEN};

/// Stable identity for an object placed with a [`Scheduler`]: which reactor,
/// which slot, and a generation counter to detect stale references once the
/// slot has been reused (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectUid {
    reactor_id: usize,
    slot: usize,
    generation: u64,
}

impl ObjectUid {
    pub fn reactor_id(&self) -> usize {
        self.reactor_id
    }
}

struct ReactorHandle {
    shared: Arc<ReactorShared>,
    join: Option<JoinHandle<()>>,
}

/// Owns a fixed pool of reactor threads and routes placement/wake requests
/// to them. Reactors themselves never reach back into the scheduler.
pub struct Scheduler {
    reactors: Vec<ReactorHandle>,
    next_reactor: AtomicUsize,
}

impl Scheduler {
    /// Start `config.worker_count` reactor threads, each configured with
    /// `config.reactor`.
    pub fn start(config: SchedulerConfig) -> Result<Self, CoreError> {
        let mut reactors = Vec::with_capacity(config.worker_count);
        for reactor_id in 0 .. config.worker_count {
            let wake = Arc::new(WakeChannel::new()?);
            let shared = Arc::new(ReactorShared::new(wake, config.reactor.capacity));
            let reactor_config = config.reactor;
            let shared_for_thread = shared.clone();
            let join = std::thread::Builder::new()
                .name(format!("solidframe-reactor-{}", reactor_id))
                .spawn(move || {
                    let clock: Arc<dyn crate::clock::Clock> = Arc::new(crate::clock::MonotonicClock);
                    let notifier = match EpollNotifier::new() {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::error!(reactor = reactor_id, error = %e, "failed to create notifier");
                            return;
                        }
                    };
                    match Reactor::new(reactor_id, reactor_config, clock, notifier, shared_for_thread) {
                        Ok(mut reactor) => {
                            tracing::info!(reactor = reactor_id, "reactor thread starting");
                            reactor.run();
                            tracing::info!(reactor = reactor_id, "reactor thread exiting");
                        }
                        Err(e) => {
                            tracing::error!(reactor = reactor_id, error = %e, "failed to start reactor");
                        }
                    }
                })
                .expect("failed to spawn reactor thread");
            reactors.push(ReactorHandle {
                shared,
                join: Some(join),
            });
        }
        tracing::info!(worker_count = config.worker_count, "scheduler started");
        Ok(Scheduler {
            reactors,
            next_reactor: AtomicUsize::new(0),
        })
    }

    /// Hand ownership of `object` to one of the pool's reactors. Reactors are
    /// probed round-robin starting from the next pick; the first one with a
    /// free slot takes the object. Fails with [`CoreError::CapacityExceeded`]
    /// only when every reactor's slot table is full (§4.6).
    pub fn push(&self, object: Box<dyn ActiveObject>) -> Result<ObjectUid, CoreError> {
        self.push_any(object, None)
    }

    /// Like [`Self::push`], but the object is handed back through the
    /// returned receiver if it ever returns [`crate::object::Disposition::Detach`].
    pub fn push_detachable(
        &self,
        object: Box<dyn ActiveObject>,
    ) -> Result<(ObjectUid, oneshot::Receiver<Box<dyn ActiveObject>>), CoreError> {
        let (tx, rx) = oneshot::channel();
        let uid = self.push_any(object, Some(tx))?;
        Ok((uid, rx))
    }

    fn pick_reactor(&self) -> usize {
        self.next_reactor.fetch_add(1, Ordering::Relaxed) % self.reactors.len()
    }

    /// Probe every reactor once, starting from the round-robin pick, and
    /// place the object in the first one with a free slot.
    fn push_any(
        &self,
        mut object: Box<dyn ActiveObject>,
        mut detach_sender: Option<oneshot::Sender<Box<dyn ActiveObject>>>,
    ) -> Result<ObjectUid, CoreError> {
        let start = self.pick_reactor();
        for offset in 0 .. self.reactors.len() {
            let reactor_id = (start + offset) % self.reactors.len();
            match self.try_push_to(reactor_id, object, detach_sender) {
                Ok(uid) => return Ok(uid),
                Err((returned_object, returned_sender)) => {
                    object = returned_object;
                    detach_sender = returned_sender;
                }
            }
        }
        CapacityExceededSnafu {
            capacity: self.reactors[start].shared.capacity,
        }
        .fail()
    }

    /// Attempt to place `object` in `reactor_id`'s slot table. On failure,
    /// hands the object (and detach sender) back to the caller so it can be
    /// retried against another reactor.
    #[allow(clippy::type_complexity)]
    fn try_push_to(
        &self,
        reactor_id: usize,
        object: Box<dyn ActiveObject>,
        detach_sender: Option<oneshot::Sender<Box<dyn ActiveObject>>>,
    ) -> Result<ObjectUid, (Box<dyn ActiveObject>, Option<oneshot::Sender<Box<dyn ActiveObject>>>)> {
        let handle = &self.reactors[reactor_id];
        let Some(slot) = handle.shared.free_stack.lock().pop() else {
            return Err((object, detach_sender));
        };
        let generation = handle.shared.generations[slot].fetch_add(1, Ordering::AcqRel) + 1;
        handle.shared.incoming.push(PendingAdd {
            slot,
            generation,
            object,
            detach_sender,
        });
        handle.shared.wake.signal(slot as u32);
        Ok(ObjectUid {
            reactor_id,
            slot,
            generation,
        })
    }

    /// Merge `mask` into the object's cross-thread signal mask and wake its
    /// reactor iff that transitioned the mask from zero to non-zero. Stale
    /// (already-reused) `uid`s are silently ignored.
    pub fn signal(&self, uid: ObjectUid, mask: u32) {
        let Some(handle) = self.reactors.get(uid.reactor_id) else {
            return;
        };
        if handle.shared.generations[uid.slot].load(Ordering::Acquire) != uid.generation {
            return;
        }
        if handle.shared.signal_masks[uid.slot].signal(mask) {
            handle.shared.wake.signal(uid.slot as u32);
        }
    }

    /// Request every reactor to shut down. If `wait` is `true`, blocks until
    /// all reactor threads have exited.
    pub fn stop(mut self, wait: bool) {
        tracing::info!(reactors = self.reactors.len(), "scheduler shutdown requested");
        for handle in &self.reactors {
            handle.shared.wake.signal(SHUTDOWN_TOKEN);
        }
        if wait {
            for handle in &mut self.reactors {
                if let Some(join) = handle.join.take() {
                    let _ = join.join();
                }
            }
        }
    }
}

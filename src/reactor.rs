//! The per-thread event loop (§4.4) — the core of SolidFrame.
//!
//! One `Reactor` owns exactly one OS thread. It multiplexes a fixed-capacity
//! table of active-object slots onto a single readiness notifier, draining a
//! run queue, a timer store and a cross-thread wake channel each iteration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::clock::{Clock, Instant};
use crate::config::ReactorConfig;
use crate::error::CoreError;
use crate::notifier::{Interest, ReadinessNotifier, ReadyEvent, Readiness};
use crate::object::{ActiveObject, Disposition, Events, PendingRequest, SignalMask};
use crate::wake::{WakeChannel, SHUTDOWN_TOKEN};

/// Sentinel `user_data` value identifying the wake channel's own
/// registration, distinct from any `(slot, socket)` encoding (slot indices
/// never reach `u32::MAX` in a realistically sized reactor).
const WAKE_USER_DATA: u64 = u64::MAX;

fn encode_user_data(slot: usize, socket_index: usize) -> u64 {
    ((slot as u64) << 32) | (socket_index as u64 & 0xffff_ffff)
}

fn decode_user_data(v: u64) -> (usize, usize) {
    ((v >> 32) as usize, (v & 0xffff_ffff) as usize)
}

/// Direction a timer-store entry belongs to, letting the reactor know which
/// of a socket's two independent deadlines just fired (§9, Open Question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    In,
    Out,
}

type TimerValue = (usize, usize, Dir);

/// An object plus bookkeeping handed from the scheduler into a reactor's
/// incoming queue (mirrors the engine crate's `Reactor::incoming:
/// SegQueue<Thread>`, generalized to carry slot/generation with the object).
pub(crate) struct PendingAdd {
    pub slot: usize,
    pub generation: u64,
    pub object: Box<dyn ActiveObject>,
    pub detach_sender: Option<oneshot::Sender<Box<dyn ActiveObject>>>,
}

struct Slot {
    object: Box<dyn ActiveObject>,
    in_run_queue: bool,
    detach_sender: Option<oneshot::Sender<Box<dyn ActiveObject>>>,
}

/// Shared, cross-thread-visible state a [`crate::scheduler::Scheduler`]
/// needs to place objects into this reactor and wake them by slot. Kept
/// separate from [`Reactor`] itself so the hot loop touches no locks beyond
/// the free-stack pop/push on admit/retire.
pub(crate) struct ReactorShared {
    pub wake: Arc<WakeChannel>,
    pub free_stack: Mutex<Vec<usize>>,
    pub generations: Vec<AtomicU64>,
    pub signal_masks: Vec<SignalMask>,
    pub incoming: SegQueue<PendingAdd>,
    pub capacity: usize,
}

impl ReactorShared {
    pub fn new(wake: Arc<WakeChannel>, capacity: usize) -> Self {
        let mut generations = Vec::with_capacity(capacity + 1);
        let mut signal_masks = Vec::with_capacity(capacity + 1);
        for _ in 0 ..= capacity {
            generations.push(AtomicU64::new(0));
            signal_masks.push(SignalMask::new());
        }
        ReactorShared {
            wake,
            free_stack: Mutex::new((1 ..= capacity).rev().collect()),
            generations,
            signal_masks,
            incoming: SegQueue::new(),
            capacity,
        }
    }
}

pub struct Reactor<N: ReadinessNotifier> {
    reactor_id: usize,
    config: ReactorConfig,
    clock: Arc<dyn Clock>,
    notifier: N,
    shared: Arc<ReactorShared>,

    slots: Vec<Option<Slot>>,
    run_queue: VecDeque<usize>,
    occupied_count: usize,

    timers: crate::timer::TimerStore<TimerValue>,
    current_instant: Instant,
    next_deadline: Instant,
    clock_counter: u32,
    need_full_scan: bool,
    pending_events: Vec<ReadyEvent>,
    wake_pending: bool,
    shutdown_requested: bool,
}

impl<N: ReadinessNotifier> Reactor<N> {
    pub(crate) fn new(
        reactor_id: usize,
        config: ReactorConfig,
        clock: Arc<dyn Clock>,
        notifier: N,
        shared: Arc<ReactorShared>,
    ) -> Result<Self, CoreError> {
        notifier.add_level_triggered(shared.wake.read_fd(), Interest::READ, WAKE_USER_DATA)?;
        let capacity = config.capacity;
        Ok(Reactor {
            reactor_id,
            config,
            clock,
            notifier,
            shared,
            slots: (0 ..= capacity).map(|_| None).collect(),
            run_queue: VecDeque::new(),
            occupied_count: 0,
            timers: crate::timer::TimerStore::with_capacity(capacity),
            current_instant: Instant::NEVER,
            next_deadline: Instant::NEVER,
            clock_counter: 0,
            need_full_scan: false,
            pending_events: Vec::new(),
            wake_pending: false,
            shutdown_requested: false,
        })
    }

    pub fn id(&self) -> usize {
        self.reactor_id
    }

    /// Run the event loop until shutdown is requested. Blocks the calling
    /// thread; callers spawn one OS thread per reactor and call this from
    /// it (see [`crate::scheduler::Scheduler::start`]).
    pub fn run(&mut self) {
        tracing::info!(reactor = self.reactor_id, "reactor polling loop starting");
        self.current_instant = self.clock.now();
        // `-1` (blocking wait) forces a refresh on the very first iteration
        // too, same as any iteration that actually blocked.
        let mut last_poll_wait: isize = -1;
        loop {
            // Only throttle the `clock_gettime` call via `clock_counter` when
            // the previous iteration was a zero-wait busy spin (run queue
            // non-empty); any iteration that actually blocked in the
            // notifier must refresh unconditionally, since real time passed
            // while we were parked and a stale `current_instant` would make
            // `full_scan`'s expiry check miss deadlines indefinitely.
            if last_poll_wait != 0 || self.clock_counter == 0 {
                self.current_instant = self.clock.now();
                self.clock_counter = self.config.clock_refresh_interval;
            } else {
                self.clock_counter -= 1;
            }

            self.dispatch_pending_events();

            if self.need_full_scan || self.current_instant >= self.next_deadline {
                self.full_scan();
            }

            self.drain_run_queue_once();

            if self.wake_pending {
                self.drain_wake();
            }

            if self.shutdown_requested {
                tracing::debug!(reactor = self.reactor_id, "shutdown token observed, draining slots");
                break;
            }

            let poll_wait = self.compute_poll_wait();
            last_poll_wait = poll_wait;
            match self
                .notifier
                .wait(self.config.max_events, poll_wait)
            {
                Ok(events) => self.pending_events = events,
                Err(_) => {
                    // Notifier failure is fatal to the reactor (§4.4 Error policy).
                    tracing::error!(reactor = self.reactor_id, "readiness notifier failed, shutting down");
                    break;
                }
            }
        }
        self.teardown_all();
        tracing::info!(reactor = self.reactor_id, "reactor polling loop exited");
    }

    fn compute_poll_wait(&self) -> isize {
        if !self.run_queue.is_empty() {
            return 0;
        }
        if self.next_deadline.is_never() {
            return -1;
        }
        let remaining = self.next_deadline.saturating_sub(self.current_instant);
        let ms = remaining.as_millis().min(self.config.max_wait.as_millis()) as isize;
        ms
    }

    fn dispatch_pending_events(&mut self) {
        if self.pending_events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending_events);
        for ev in events {
            if ev.user_data == WAKE_USER_DATA {
                self.wake_pending = true;
                continue;
            }
            let (slot_idx, socket_idx) = decode_user_data(ev.user_data);
            let Some(slot) = self.slots.get_mut(slot_idx).and_then(|s| s.as_mut()) else {
                continue;
            };
            if socket_idx >= slot.object.socket_count() {
                continue;
            }
            let stub = slot.object.stub_mut(socket_idx);
            let mut reported = stub.reported_events;
            if ev.readiness.contains(Readiness::HANGUP) || ev.readiness.contains(Readiness::ERROR) {
                reported.insert(Events::ERR_DONE);
            }
            if ev.readiness.contains(Readiness::READABLE)
                && stub.requested_events.contains(Interest::READ)
            {
                reported.insert(Events::IN_DONE);
            }
            if ev.readiness.contains(Readiness::WRITABLE)
                && stub.requested_events.contains(Interest::WRITE)
            {
                reported.insert(Events::OUT_DONE);
            }
            stub.reported_events = reported;
            if !reported.is_empty() && !slot.in_run_queue {
                slot.in_run_queue = true;
                self.run_queue.push_back(slot_idx);
            }
        }
    }

    fn full_scan(&mut self) {
        self.need_full_scan = false;
        let now = self.current_instant;
        let reactor_id = self.reactor_id;
        let slots = &mut self.slots;
        self.timers.pop_expired(
            now,
            |_idx, value| {
                let (slot_idx, socket_idx, dir) = *value;
                if let Some(Some(slot)) = slots.get_mut(slot_idx) {
                    if socket_idx < slot.object.socket_count() {
                        let stub = slot.object.stub_mut(socket_idx);
                        stub.reported_events.insert(Events::TIMEOUT);
                        match dir {
                            Dir::In => stub.timeout_in_idx = None,
                            Dir::Out => stub.timeout_out_idx = None,
                        }
                        tracing::trace!(reactor = reactor_id, slot = slot_idx, socket = socket_idx, "deadline expired");
                    }
                }
            },
            |_new_idx, _old_idx| {},
        );
        self.next_deadline = self.timers.next();

        // A full scan is the recovery path for batched readiness dispatch
        // that may have missed something — most notably a coalesced signal
        // still sitting in the wake queue after `drain_wake` exhausted its
        // drain budget (§4.4 step 3, Glossary "Full scan"). Re-enqueue every
        // occupied slot, not just the ones whose deadline just expired.
        for (slot_idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(slot) = slot {
                if !slot.in_run_queue {
                    slot.in_run_queue = true;
                    self.run_queue.push_back(slot_idx);
                }
            }
        }
    }

    fn drain_wake(&mut self) {
        self.wake_pending = false;
        let (tokens, exhausted) = self.shared.wake.drain(256);
        if exhausted {
            self.need_full_scan = true;
        }
        self.admit_incoming();
        for token in tokens {
            if token == SHUTDOWN_TOKEN {
                self.shutdown_requested = true;
                continue;
            }
            let slot_idx = token as usize;
            if let Some(Some(slot)) = self.slots.get_mut(slot_idx) {
                if !slot.in_run_queue {
                    slot.in_run_queue = true;
                    self.run_queue.push_back(slot_idx);
                }
            }
        }
    }

    fn admit_incoming(&mut self) {
        while let Some(add) = self.shared.incoming.pop() {
            let slot_idx = add.slot;
            self.slots[slot_idx] = Some(Slot {
                object: add.object,
                in_run_queue: true,
                detach_sender: add.detach_sender,
            });
            self.occupied_count += 1;
            self.run_queue.push_back(slot_idx);
            tracing::debug!(reactor = self.reactor_id, slot = slot_idx, occupied = self.occupied_count, "object admitted");
        }
    }

    fn drain_run_queue_once(&mut self) {
        // Drain up to the queue's size at loop start; entries re-added
        // during this pass run on the next iteration, bounding per-tick
        // latency (§4.4 step 4).
        let budget = self.run_queue.len();
        for _ in 0 .. budget {
            let Some(slot_idx) = self.run_queue.pop_front() else {
                break;
            };
            self.execute_slot(slot_idx);
        }
    }

    fn execute_slot(&mut self, slot_idx: usize) {
        let Some(slot) = self.slots[slot_idx].as_mut() else {
            return;
        };
        slot.in_run_queue = false;

        let signalled = self.shared.signal_masks[slot_idx].take();
        let mut events = Events::empty();
        if signalled != 0 {
            events.insert(Events::SIGNALLED);
        }
        for i in 0 .. slot.object.socket_count() {
            events |= slot.object.stub(i).reported_events;
        }

        let mut timeout = Instant::NEVER;
        let disposition = slot.object.execute(events, &mut timeout);

        for i in 0 .. slot.object.socket_count() {
            slot.object.stub_mut(i).clear_reported_events();
        }

        match disposition {
            Disposition::Done => {
                self.apply_pending_requests(slot_idx);
                self.rearm_if_deadlines_exist(slot_idx);
            }
            Disposition::Continue => {
                self.apply_pending_requests(slot_idx);
                if let Some(slot) = self.slots[slot_idx].as_mut() {
                    if !slot.in_run_queue {
                        slot.in_run_queue = true;
                        self.run_queue.push_back(slot_idx);
                    }
                }
            }
            Disposition::Wait(next_timeout) => {
                self.apply_pending_requests(slot_idx);
                if !next_timeout.is_never() {
                    self.arm_deadline(slot_idx, next_timeout);
                }
            }
            Disposition::Close => {
                self.teardown_slot(slot_idx, false);
            }
            Disposition::Detach => {
                self.teardown_slot(slot_idx, true);
            }
        }
    }

    fn rearm_if_deadlines_exist(&mut self, slot_idx: usize) {
        // Deadlines already live in the timer store from a previous `Wait`;
        // nothing to do here beyond leaving them armed.
        let _ = slot_idx;
    }

    fn arm_deadline(&mut self, slot_idx: usize, deadline: Instant) {
        let Some(slot) = self.slots[slot_idx].as_mut() else {
            return;
        };
        for i in 0 .. slot.object.socket_count() {
            let wants_in = slot.object.stub(i).requested_events.contains(Interest::READ);
            let wants_out = slot.object.stub(i).requested_events.contains(Interest::WRITE);
            if wants_in {
                let stub = slot.object.stub_mut(i);
                match stub.timeout_in_idx {
                    Some(idx) => self.timers.change(idx, deadline),
                    None => {
                        let idx = self.timers.push(deadline, (slot_idx, i, Dir::In));
                        slot.object.stub_mut(i).timeout_in_idx = Some(idx);
                    }
                }
                slot.object.stub_mut(i).deadline_in = deadline;
            }
            if wants_out {
                let stub = slot.object.stub_mut(i);
                match stub.timeout_out_idx {
                    Some(idx) => self.timers.change(idx, deadline),
                    None => {
                        let idx = self.timers.push(deadline, (slot_idx, i, Dir::Out));
                        slot.object.stub_mut(i).timeout_out_idx = Some(idx);
                    }
                }
                slot.object.stub_mut(i).deadline_out = deadline;
            }
        }
        if deadline < self.next_deadline {
            self.next_deadline = deadline;
        }
    }

    fn apply_pending_requests(&mut self, slot_idx: usize) {
        let Some(slot) = self.slots[slot_idx].as_mut() else {
            return;
        };
        for i in 0 .. slot.object.socket_count() {
            let request = slot.object.stub(i).pending_request;
            if request == PendingRequest::None {
                continue;
            }
            let fd = match slot.object.stub(i).socket() {
                Some(s) => s.raw_fd(),
                None => {
                    slot.object.stub_mut(i).pending_request = PendingRequest::None;
                    continue;
                }
            };
            let interest = slot.object.stub(i).requested_events;
            let result = match request {
                PendingRequest::RegisterSocket => {
                    let r = self.notifier.add(fd, interest, encode_user_data(slot_idx, i));
                    if r.is_ok() {
                        slot.object.stub_mut(i).registered = true;
                    }
                    r
                }
                PendingRequest::UpdateInterest => {
                    self.notifier.modify(fd, interest, encode_user_data(slot_idx, i))
                }
                PendingRequest::UnregisterSocket => {
                    let r = self.notifier.remove(fd);
                    slot.object.stub_mut(i).registered = false;
                    r
                }
                PendingRequest::None => unreachable!(),
            };
            slot.object.stub_mut(i).pending_request = PendingRequest::None;
            if let Err(e) = result {
                // Registration failure is non-fatal: signal the socket and
                // re-enqueue so the object observes ErrDone (§4.4).
                tracing::warn!(reactor = self.reactor_id, slot = slot_idx, socket = i, error = %e, "notifier request failed");
                slot.object.stub_mut(i).reported_events.insert(Events::ERR_DONE);
                if !slot.in_run_queue {
                    slot.in_run_queue = true;
                    self.run_queue.push_back(slot_idx);
                }
            }
        }
    }

    fn teardown_slot(&mut self, slot_idx: usize, detach: bool) {
        let Some(mut slot) = self.slots[slot_idx].take() else {
            return;
        };
        for i in 0 .. slot.object.socket_count() {
            let stub = slot.object.stub_mut(i);
            if stub.registered {
                if let Some(socket) = stub.socket() {
                    let _ = self.notifier.remove(socket.raw_fd());
                }
                stub.registered = false;
            }
            if let Some(idx) = stub.timeout_in_idx.take() {
                self.remove_timer(idx);
            }
            if let Some(idx) = stub.timeout_out_idx.take() {
                self.remove_timer(idx);
            }
        }
        self.occupied_count -= 1;
        self.shared.free_stack.lock().push(slot_idx);
        tracing::debug!(reactor = self.reactor_id, slot = slot_idx, detach, occupied = self.occupied_count, "object retired");

        if detach {
            if let Some(sender) = slot.detach_sender.take() {
                let _ = sender.send(slot.object);
            }
        }
        // else: `slot` (and its object) drops here.
    }

    fn remove_timer(&mut self, idx: usize) {
        let slots = &mut self.slots;
        self.timers.pop_by_index(idx, |_new_idx, _old_idx| {});
        // After a swap-remove, whichever entry moved into `idx` must have
        // its stored timer index corrected.
        if idx < self.timers.len() {
            let (slot_idx, socket_idx, dir) = *self.timers.value(idx);
            if let Some(Some(slot)) = slots.get_mut(slot_idx) {
                if socket_idx < slot.object.socket_count() {
                    let stub = slot.object.stub_mut(socket_idx);
                    match dir {
                        Dir::In => stub.timeout_in_idx = Some(idx),
                        Dir::Out => stub.timeout_out_idx = Some(idx),
                    }
                }
            }
        }
        self.next_deadline = self.timers.next();
    }

    fn teardown_all(&mut self) {
        let indices: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect();
        for idx in indices {
            self.teardown_slot(idx, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::object::SocketStub;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc as StdArc;

    struct CountingObject {
        stub: SocketStub,
        calls: StdArc<AtomicUsize>,
        dispositions: std::collections::VecDeque<Disposition>,
    }

    impl ActiveObject for CountingObject {
        fn execute(&mut self, _events: Events, _timeout: &mut Instant) -> Disposition {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.dispositions.pop_front().unwrap_or(Disposition::Close)
        }
        fn socket_count(&self) -> usize {
            1
        }
        fn stub(&self, _index: usize) -> &SocketStub {
            &self.stub
        }
        fn stub_mut(&mut self, _index: usize) -> &mut SocketStub {
            &mut self.stub
        }
    }

    #[test]
    fn scheduler_push_executes_object_until_close() {
        let scheduler = Scheduler::start(crate::config::SchedulerConfig {
            worker_count: 1,
            reactor: crate::config::ReactorConfig {
                capacity: 8,
                ..Default::default()
            },
        })
        .unwrap();

        let calls = StdArc::new(AtomicUsize::new(0));
        let obj = CountingObject {
            stub: SocketStub::default(),
            calls: calls.clone(),
            dispositions: vec![Disposition::Continue, Disposition::Close].into(),
        };
        scheduler.push(Box::new(obj)).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while calls.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        scheduler.stop(true);
    }

    #[test]
    fn encode_decode_user_data_roundtrip() {
        let v = encode_user_data(12, 3);
        assert_eq!(decode_user_data(v), (12, 3));
    }
}

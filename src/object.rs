//! The active-object contract (§4.5) and its per-socket stub state (§3).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::clock::Instant;
use crate::notifier::Interest;
use crate::socket::{Outcome, Socket};

bitflags::bitflags! {
    /// Event bits an `execute()` call may observe, and the bits an object
    /// may merge into its cross-thread signal mask.
    pub struct Events: u16 {
        const IN_DONE   = 0b00001;
        const OUT_DONE  = 0b00010;
        const TIMEOUT   = 0b00100;
        const ERR_DONE  = 0b01000;
        const SIGNALLED = 0b10000;
    }
}

/// A deferred request an object makes of the reactor; applied once the
/// object suspends (returns from `execute`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
    None,
    RegisterSocket,
    UnregisterSocket,
    UpdateInterest,
}

/// Per-(object, socket) slot state (§3).
pub struct SocketStub {
    socket: Option<Socket>,
    pub(crate) deadline_in: Instant,
    pub(crate) deadline_out: Instant,
    pub(crate) timeout_in_idx: Option<usize>,
    pub(crate) timeout_out_idx: Option<usize>,
    pub(crate) requested_events: Interest,
    pub(crate) reported_events: Events,
    pub(crate) pending_request: PendingRequest,
    /// Whether this stub is currently registered with the notifier.
    pub(crate) registered: bool,
    state: u16,
}

impl Default for SocketStub {
    fn default() -> Self {
        SocketStub {
            socket: None,
            deadline_in: Instant::NEVER,
            deadline_out: Instant::NEVER,
            timeout_in_idx: None,
            timeout_out_idx: None,
            requested_events: Interest::empty(),
            reported_events: Events::empty(),
            pending_request: PendingRequest::None,
            registered: false,
            state: 0,
        }
    }
}

impl SocketStub {
    pub fn is_occupied(&self) -> bool {
        self.socket.is_some()
    }

    pub fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    pub fn socket_mut(&mut self) -> Option<&mut Socket> {
        self.socket.as_mut()
    }

    pub fn set_socket(&mut self, socket: Socket) {
        self.socket = Some(socket);
        self.pending_request = PendingRequest::RegisterSocket;
    }

    pub fn take_socket(&mut self) -> Option<Socket> {
        self.socket.take()
    }

    pub fn state(&self) -> u16 {
        self.state
    }

    pub fn set_state(&mut self, v: u16) {
        self.state = v;
    }

    pub fn request_register(&mut self) {
        self.pending_request = PendingRequest::RegisterSocket;
    }

    pub fn request_unregister(&mut self) {
        self.pending_request = PendingRequest::UnregisterSocket;
    }

    fn request_update_interest(&mut self) {
        if self.registered && self.pending_request == PendingRequest::None {
            self.pending_request = PendingRequest::UpdateInterest;
        }
    }

    pub fn set_requested_events(&mut self, events: Interest) {
        if self.requested_events != events {
            self.requested_events = events;
            self.request_update_interest();
        }
    }

    pub fn clear_reported_events(&mut self) {
        self.reported_events = Events::empty();
    }
}

/// Disposition an [`ActiveObject::execute`] returns, driving what the
/// reactor does with the slot next (§4.4 "Slot execution").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// No more work scheduled for now.
    Done,
    /// Re-enqueue this slot for the next iteration (cooperative yield).
    Continue,
    /// Arm the given deadline (may be [`Instant::NEVER`] to wait purely on
    /// readiness).
    Wait(Instant),
    /// Tear the slot down: unregister sockets, drop the object.
    Close,
    /// Like `Close`, but hand the object back to the caller instead of
    /// dropping it.
    Detach,
}

/// The cross-thread signal mask each active object carries (§4.5, §5). The
/// only operation touched from outside the owning reactor.
#[derive(Default)]
pub struct SignalMask(AtomicU32);

impl SignalMask {
    pub fn new() -> Self {
        SignalMask(AtomicU32::new(0))
    }

    /// Merge `mask` into the signal mask. Returns `true` iff this call
    /// observed a transition from "no pending wake" to "pending wake" — the
    /// scheduler uses this to decide whether to post a wake token.
    pub fn signal(&self, mask: u32) -> bool {
        let prev = self.0.fetch_or(mask, Ordering::AcqRel);
        prev == 0 && mask != 0
    }

    /// Atomically read and clear the mask. Called once per `execute()`.
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// The contract every active object fulfills (§4.5).
///
/// All `socket_*` and state operations are single-threaded: only the
/// owning reactor ever calls them. `signal` is the sole cross-thread
/// operation.
pub trait ActiveObject: Send {
    /// Cooperative step. Must not block. May set `*timeout` to request a
    /// wake-up deadline (`Instant::NEVER` = none); the return value is the
    /// authoritative disposition (§4.4).
    fn execute(&mut self, events: Events, timeout: &mut Instant) -> Disposition;

    /// Number of socket stub slots this object was constructed with.
    fn socket_count(&self) -> usize;

    fn stub(&self, index: usize) -> &SocketStub;
    fn stub_mut(&mut self, index: usize) -> &mut SocketStub;

    fn socket_state(&self, index: usize) -> u16 {
        self.stub(index).state()
    }

    fn socket_state_set(&mut self, index: usize, value: u16) {
        self.stub_mut(index).set_state(value);
    }

    /// Attempt a receive on socket `index`; updates `requested_events` so
    /// the next `Wait` disposition arms the correct interest.
    fn socket_recv(&mut self, index: usize, buf: &mut [u8]) -> Result<Outcome, crate::error::CoreError> {
        let outcome = {
            let stub = self.stub_mut(index);
            let socket = stub.socket_mut().expect("recv on vacant slot");
            let result = match socket {
                Socket::Tcp(s) => s.recv(buf),
                Socket::Udp(s) => s.recv_from(buf).map(|(o, _)| o),
                Socket::Acceptor(_) => panic!("recv on an acceptor socket"),
            };
            result?
        };
        let stub = self.stub_mut(index);
        let mut ev = stub.requested_events;
        if outcome == Outcome::Pending {
            ev.insert(Interest::READ);
        } else {
            ev.remove(Interest::READ);
        }
        stub.set_requested_events(ev);
        Ok(outcome)
    }

    fn socket_send(&mut self, index: usize, buf: &[u8]) -> Result<Outcome, crate::error::CoreError> {
        let outcome = {
            let stub = self.stub_mut(index);
            let socket = stub.socket_mut().expect("send on vacant slot");
            let result = match socket {
                Socket::Tcp(s) => s.send(buf),
                Socket::Udp(_) => panic!("send requires an address, use send_to"),
                Socket::Acceptor(_) => panic!("send on an acceptor socket"),
            };
            result?
        };
        let stub = self.stub_mut(index);
        let mut ev = stub.requested_events;
        if outcome == Outcome::Pending {
            ev.insert(Interest::WRITE);
        } else {
            ev.remove(Interest::WRITE);
        }
        stub.set_requested_events(ev);
        Ok(outcome)
    }

    fn socket_request_register(&mut self, index: usize) {
        self.stub_mut(index).request_register();
    }

    fn socket_request_unregister(&mut self, index: usize) {
        self.stub_mut(index).request_unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_reports_zero_to_nonzero_transition_once() {
        let mask = SignalMask::new();
        assert!(mask.signal(0x1));
        assert!(!mask.signal(0x2)); // already nonzero, no transition
        assert_eq!(mask.take(), 0x3);
        assert_eq!(mask.take(), 0);
    }

    #[test]
    fn signal_after_take_transitions_again() {
        let mask = SignalMask::new();
        assert!(mask.signal(0x1));
        mask.take();
        assert!(mask.signal(0x4));
    }

    #[test]
    fn socket_stub_default_is_vacant() {
        let stub = SocketStub::default();
        assert!(!stub.is_occupied());
        assert_eq!(stub.pending_request, PendingRequest::None);
    }
}

//! Readiness notifier (§6): the epoll-class capability the reactor
//! multiplexes sockets through.

use std::os::unix::io::RawFd;

use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;
use snafu::ResultExt;

use crate::error::{CoreError, NotifierErrorSnafu, ReactorConfigureFailedSnafu};

bitflags::bitflags! {
    /// I/O interest requested by an object for one socket.
    pub struct Interest: u8 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

bitflags::bitflags! {
    /// Flags delivered by the notifier for one descriptor.
    pub struct Readiness: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const HANGUP   = 0b0100;
        const ERROR    = 0b1000;
    }
}

/// One delivered readiness event: the opaque user data registered at
/// `add`/`modify` time, plus the flags observed.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub user_data: u64,
    pub readiness: Readiness,
}

/// The capability the reactor uses to learn which descriptors are ready.
/// Sockets are registered edge-triggered; the wake pipe is registered
/// level-triggered (see [`ReadinessNotifier::add_level_triggered`]).
pub trait ReadinessNotifier {
    fn add(&self, fd: RawFd, interest: Interest, user_data: u64) -> Result<(), CoreError>;
    fn add_level_triggered(
        &self,
        fd: RawFd,
        interest: Interest,
        user_data: u64,
    ) -> Result<(), CoreError>;
    fn modify(&self, fd: RawFd, interest: Interest, user_data: u64) -> Result<(), CoreError>;
    fn remove(&self, fd: RawFd) -> Result<(), CoreError>;
    /// Block for up to `timeout_ms` (negative = indefinite) and return the
    /// events observed.
    fn wait(&self, capacity: usize, timeout_ms: isize) -> Result<Vec<ReadyEvent>, CoreError>;
}

fn interest_to_epoll(interest: Interest, edge_triggered: bool) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.contains(Interest::READ) {
        flags |= EpollFlags::EPOLLIN;
    }
    if interest.contains(Interest::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    if edge_triggered {
        flags |= EpollFlags::EPOLLET;
    }
    flags
}

fn epoll_to_readiness(flags: EpollFlags) -> Readiness {
    let mut r = Readiness::empty();
    if flags.contains(EpollFlags::EPOLLIN) {
        r |= Readiness::READABLE;
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        r |= Readiness::WRITABLE;
    }
    if flags.contains(EpollFlags::EPOLLHUP) || flags.contains(EpollFlags::EPOLLRDHUP) {
        r |= Readiness::HANGUP;
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        r |= Readiness::ERROR;
    }
    r
}

/// Linux `epoll` implementation of [`ReadinessNotifier`].
pub struct EpollNotifier {
    epfd: RawFd,
}

impl EpollNotifier {
    pub fn new() -> Result<Self, CoreError> {
        let epfd =
            epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).context(ReactorConfigureFailedSnafu)?;
        Ok(EpollNotifier { epfd })
    }

    fn add_with_flags(&self, fd: RawFd, flags: EpollFlags, user_data: u64) -> Result<(), CoreError> {
        let mut ev = EpollEvent::new(flags, user_data);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, Some(&mut ev)).context(NotifierErrorSnafu)
    }
}

impl ReadinessNotifier for EpollNotifier {
    fn add(&self, fd: RawFd, interest: Interest, user_data: u64) -> Result<(), CoreError> {
        self.add_with_flags(fd, interest_to_epoll(interest, true), user_data)
    }

    fn add_level_triggered(
        &self,
        fd: RawFd,
        interest: Interest,
        user_data: u64,
    ) -> Result<(), CoreError> {
        self.add_with_flags(fd, interest_to_epoll(interest, false), user_data)
    }

    fn modify(&self, fd: RawFd, interest: Interest, user_data: u64) -> Result<(), CoreError> {
        let mut ev = EpollEvent::new(interest_to_epoll(interest, true), user_data);
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, Some(&mut ev)).context(NotifierErrorSnafu)
    }

    fn remove(&self, fd: RawFd) -> Result<(), CoreError> {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None).context(NotifierErrorSnafu)
    }

    fn wait(&self, capacity: usize, timeout_ms: isize) -> Result<Vec<ReadyEvent>, CoreError> {
        let mut buf = vec![EpollEvent::empty(); capacity];
        let n = epoll_wait(self.epfd, &mut buf, timeout_ms as isize).context(NotifierErrorSnafu)?;
        Ok(buf[.. n]
            .iter()
            .map(|ev| ReadyEvent {
                user_data: ev.data(),
                readiness: epoll_to_readiness(ev.events()),
            })
            .collect())
    }
}

impl Drop for EpollNotifier {
    fn drop(&mut self) {
        let _ = close(self.epfd);
    }
}

/// In-memory stand-in for [`ReadinessNotifier`], used only under `#[cfg(test)]`
/// where a scenario needs to hand the reactor pre-scripted readiness without
/// going through a real epoll instance.
#[cfg(test)]
pub(crate) struct FakeNotifier {
    queued: parking_lot::Mutex<std::collections::VecDeque<ReadyEvent>>,
}

#[cfg(test)]
impl FakeNotifier {
    pub(crate) fn new(events: Vec<ReadyEvent>) -> Self {
        FakeNotifier {
            queued: parking_lot::Mutex::new(events.into()),
        }
    }
}

#[cfg(test)]
impl ReadinessNotifier for FakeNotifier {
    fn add(&self, _fd: RawFd, _interest: Interest, _user_data: u64) -> Result<(), CoreError> {
        Ok(())
    }

    fn add_level_triggered(
        &self,
        _fd: RawFd,
        _interest: Interest,
        _user_data: u64,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    fn modify(&self, _fd: RawFd, _interest: Interest, _user_data: u64) -> Result<(), CoreError> {
        Ok(())
    }

    fn remove(&self, _fd: RawFd) -> Result<(), CoreError> {
        Ok(())
    }

    fn wait(&self, capacity: usize, _timeout_ms: isize) -> Result<Vec<ReadyEvent>, CoreError> {
        let mut queued = self.queued.lock();
        let n = capacity.min(queued.len());
        Ok(queued.drain(.. n).collect())
    }
}

//! Cross-thread wake channel (§4.2).
//!
//! An unbounded queue of 32-bit wake tokens, exposed to the reactor through
//! a self-pipe readable by the readiness notifier (level-triggered). Token
//! `0` is reserved to mean "reactor shutdown requested"; any other token is
//! the slot index of the object to wake.

use std::os::unix::io::RawFd;

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use nix::fcntl::OFlag;
use nix::unistd::{close, pipe2, read, write};
use snafu::ResultExt;

use crate::error::{CoreError, NotifierErrorSnafu};

/// Token posted to request reactor shutdown.
pub const SHUTDOWN_TOKEN: u32 = 0;

/// Thread-safe MPSC integer channel used to wake one reactor from any
/// thread. `signal` never blocks and never fails on back-pressure: the
/// underlying queue may coalesce repeated wakes of the same slot into fewer
/// pipe bytes, but every pushed token is still observable through `drain`.
pub struct WakeChannel {
    tx: Sender<u32>,
    rx: Receiver<u32>,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakeChannel {
    pub fn new() -> Result<Self, CoreError> {
        let (read_fd, write_fd) =
            pipe2(OFlag::O_NONBLOCK).context(NotifierErrorSnafu)?;
        let (tx, rx) = unbounded();
        Ok(WakeChannel {
            tx,
            rx,
            read_fd,
            write_fd,
        })
    }

    /// The file descriptor the reactor registers with its readiness
    /// notifier, level-triggered.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Post a wake token. Safe to call from any thread, never blocks.
    pub fn signal(&self, token: u32) {
        let _ = self.tx.send(token);
        let _ = write(self.write_fd, &[0u8]);
    }

    /// Drain up to `max_batch` tokens. Returns the tokens observed and
    /// whether the batch was exhausted (caller should trigger a full scan
    /// in that case, since the drain loop may not have drained everything).
    pub fn drain(&self, max_batch: usize) -> (Vec<u32>, bool) {
        let mut tokens = Vec::with_capacity(max_batch.min(64));
        loop {
            if tokens.len() >= max_batch {
                break;
            }
            match self.rx.try_recv() {
                Ok(t) => tokens.push(t),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    break
                }
            }
        }
        let exhausted = tokens.len() >= max_batch;

        // Drain the self-pipe bytes. Since writes and queue pushes are not
        // atomically paired, we drain everything currently readable rather
        // than trying to match byte-for-byte with `tokens.len()`.
        let mut buf = [0u8; 256];
        loop {
            match read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => break,
                Err(_) => break,
            }
        }

        (tokens, exhausted)
    }
}

impl Drop for WakeChannel {
    fn drop(&mut self) {
        let _ = close(self.read_fd);
        let _ = close(self.write_fd);
    }
}

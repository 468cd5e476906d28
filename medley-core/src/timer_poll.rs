//! Fused fd-readiness watcher + one-shot timer.
//!
//! Callers express "wait up to `timeout` for fd `F` to become readable or
//! writable, then notify me exactly once". Every blocking external operation
//! in the service (database sockets, broker polling intervals, local file
//! waits) rides on this primitive, so its lifecycle is deliberately strict:
//! an instance moves through `Uninit -> Armed -> Closing -> Closed` and each
//! successful [`TimerPoll::start`] resolves with exactly one outcome before
//! the next `start` may be issued.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum TimerPollError {
    /// Caller contract breach: negative fd, zero interest, or an operation
    /// issued against an instance that is not armed.
    #[error("invalid argument or instance state")]
    Arg,

    /// The instance still owns a live fd registration; `deinit` it first.
    #[error("timer-poll handle already in use")]
    InUse,

    /// The fd does not refer to an open file description.
    #[error("bad file descriptor")]
    BadFd,

    /// The fd cannot be polled for readiness (regular files are rejected by
    /// the poller on Linux).
    #[error("file descriptor not pollable")]
    Perm,

    #[error("poller error: {0}")]
    Os(#[from] io::Error),
}

/// Outcome of a single [`TimerPoll::start`] wait.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The fd became ready within the timeout and the caller's I/O closure
    /// ran to completion.
    Ready(T),
    /// The timer fired first. The readiness watcher is relinquished before
    /// this is returned.
    TimedOut,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Uninit,
    Armed,
    Closing,
    Closed,
}

#[derive(Debug)]
struct PollFd(RawFd);

impl AsRawFd for PollFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A readiness watcher and a one-shot timer fused into a single wait.
///
/// The instance never owns the fd; the caller keeps it open for at least as
/// long as the instance stays armed.
#[derive(Debug, Default)]
pub struct TimerPoll {
    inner: Option<AsyncFd<PollFd>>,
    state: State,
}

fn validate_fd(fd: RawFd) -> Result<(), TimerPollError> {
    if fd < 0 {
        return Err(TimerPollError::Arg);
    }
    let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(TimerPollError::BadFd);
    }
    // epoll refuses regular files; surface that before registration
    if (st.st_mode & libc::S_IFMT) == libc::S_IFREG {
        return Err(TimerPollError::Perm);
    }
    Ok(())
}

fn register(fd: RawFd) -> Result<AsyncFd<PollFd>, TimerPollError> {
    AsyncFd::with_interest(PollFd(fd), Interest::READABLE | Interest::WRITABLE).map_err(|e| {
        if e.raw_os_error() == Some(libc::EPERM) {
            TimerPollError::Perm
        } else {
            TimerPollError::Os(e)
        }
    })
}

impl TimerPoll {
    /// Arm a fresh instance against `fd`.
    pub fn init(fd: RawFd) -> Result<Self, TimerPollError> {
        let mut this = Self::default();
        this.rearm(fd)?;
        Ok(this)
    }

    /// Arm (or re-arm after `deinit`) against `fd`. Fails with [`TimerPollError::InUse`]
    /// while a previous registration has not been released.
    pub fn rearm(&mut self, fd: RawFd) -> Result<(), TimerPollError> {
        match self.state {
            State::Armed | State::Closing => return Err(TimerPollError::InUse),
            State::Uninit | State::Closed => {}
        }
        validate_fd(fd)?;
        self.inner = Some(register(fd)?);
        self.state = State::Armed;
        Ok(())
    }

    /// Swap the watched fd without tearing the instance down. The previous
    /// registration is released first.
    pub fn change_fd(&mut self, fd: RawFd) -> Result<(), TimerPollError> {
        match self.state {
            State::Uninit | State::Closing => return Err(TimerPollError::Arg),
            State::Armed | State::Closed => {}
        }
        validate_fd(fd)?;
        self.inner = None;
        self.inner = Some(register(fd)?);
        self.state = State::Armed;
        Ok(())
    }

    /// Wait up to `timeout` for `interest` on the watched fd, then run `io`
    /// against the raw fd. `io` may be retried when it reports
    /// `WouldBlock` (spurious readiness); the wait as a whole resolves with
    /// exactly one [`PollOutcome`].
    pub async fn start<T>(
        &mut self,
        timeout: Duration,
        interest: Interest,
        mut io: impl FnMut(RawFd) -> io::Result<T>,
    ) -> Result<PollOutcome<T>, TimerPollError> {
        if self.state != State::Armed {
            return Err(TimerPollError::Arg);
        }
        let inner = self.inner.as_ref().ok_or(TimerPollError::Arg)?;
        let deadline = Instant::now() + timeout;
        loop {
            let ready = tokio::time::timeout_at(deadline, inner.ready(interest)).await;
            let mut guard = match ready {
                // dropping the readiness future relinquished the watcher
                // before the timeout is reported
                Err(_elapsed) => return Ok(PollOutcome::TimedOut),
                Ok(res) => res?,
            };
            match guard.try_io(|afd| io(afd.as_raw_fd())) {
                Ok(res) => return Ok(PollOutcome::Ready(res?)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Wait up to `timeout` for `interest` without performing any I/O.
    /// Readiness is cleared on wake; the caller is expected to drain the fd
    /// until `WouldBlock` before waiting again.
    pub async fn wait(
        &mut self,
        timeout: Duration,
        interest: Interest,
    ) -> Result<PollOutcome<()>, TimerPollError> {
        if self.state != State::Armed {
            return Err(TimerPollError::Arg);
        }
        let inner = self.inner.as_ref().ok_or(TimerPollError::Arg)?;
        match tokio::time::timeout(timeout, inner.ready(interest)).await {
            Err(_elapsed) => Ok(PollOutcome::TimedOut),
            Ok(res) => {
                let mut guard = res?;
                guard.clear_ready();
                Ok(PollOutcome::Ready(()))
            }
        }
    }

    /// Idempotent cancel. Keeps the registration and all memory; the next
    /// `start` observes a quiescent watcher.
    pub fn stop(&mut self) -> Result<(), TimerPollError> {
        match self.state {
            State::Uninit => Err(TimerPollError::Arg),
            // a pending wait is cancelled by dropping its future; nothing
            // else is armed between starts
            State::Armed | State::Closing | State::Closed => Ok(()),
        }
    }

    /// Release the fd registration. The instance reports `is_closing` until
    /// both inner handles are down, then `is_closed`; it may be re-armed
    /// afterwards via [`TimerPoll::rearm`].
    pub fn deinit(&mut self) -> Result<(), TimerPollError> {
        if self.state == State::Uninit {
            return Err(TimerPollError::Arg);
        }
        self.state = State::Closing;
        self.inner = None;
        self.state = State::Closed;
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.state == State::Closing
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn is_armed(&self) -> bool {
        self.state == State::Armed
    }
}

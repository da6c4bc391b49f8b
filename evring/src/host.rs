//! The host's "sleep until notified or until time T" primitive.
//!
//! Blocking is delegated to a [`Host`]: the scheduler asks it to sleep on the
//! context's wake word, notifiers ask it to wake whoever sleeps there.
//! [`FutexHost`] implements this with Linux futexes. The futexes are not
//! process-private, so a wake word inside a shared mapping works between
//! processes too.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use rustix::io::Errno;
use rustix::thread::futex;
use rustix::time::Timespec;

use crate::sched::Deadline;

/// Errors reported by a [`Host`]. Always fatal for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("host wait failed: {0}")]
    Wait(#[source] Errno),
    #[error("host wake failed: {0}")]
    Wake(#[source] Errno),
}

/// Sleep/wake primitive the blocking scheduler is built on.
pub trait Host {
    /// Sleep while `*word == expected`, until woken or `deadline` passes.
    ///
    /// Returns at once if the word already differs. May return spuriously;
    /// callers re-check their condition. The deadline is soft.
    ///
    /// # Errors
    ///
    /// [`HostError::Wait`] when the host cannot sleep at all.
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Deadline) -> Result<(), HostError>;

    /// Wake every sleeper on `word`.
    ///
    /// # Errors
    ///
    /// [`HostError::Wake`] when the host cannot deliver the wake.
    fn wake(&self, word: &AtomicU32) -> Result<(), HostError>;
}

impl<H: Host + ?Sized> Host for &H {
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Deadline) -> Result<(), HostError> {
        (**self).wait(word, expected, deadline)
    }

    fn wake(&self, word: &AtomicU32) -> Result<(), HostError> {
        (**self).wake(word)
    }
}

impl<H: Host + ?Sized> Host for Arc<H> {
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Deadline) -> Result<(), HostError> {
        (**self).wait(word, expected, deadline)
    }

    fn wake(&self, word: &AtomicU32) -> Result<(), HostError> {
        (**self).wake(word)
    }
}

/// [`Host`] backed by `futex(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FutexHost;

impl FutexHost {
    // FUTEX_WAKE takes a signed count.
    const WAKE_ALL: u32 = i32::MAX as u32;
}

impl Host for FutexHost {
    fn wait(&self, word: &AtomicU32, expected: u32, deadline: Deadline) -> Result<(), HostError> {
        let timeout = match deadline.remaining() {
            None => None,
            Some(remaining) if remaining.is_zero() => return Ok(()),
            Some(remaining) => Some(Timespec {
                tv_sec: i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX),
                tv_nsec: remaining.subsec_nanos().into(),
            }),
        };

        match futex::wait(word, futex::Flags::empty(), expected, timeout.as_ref()) {
            Ok(()) => Ok(()),
            // Word already changed, signal, or timeout: all ordinary returns.
            Err(err) if err == Errno::AGAIN || err == Errno::INTR || err == Errno::TIMEDOUT => {
                Ok(())
            }
            Err(err) => Err(HostError::Wait(err)),
        }
    }

    fn wake(&self, word: &AtomicU32) -> Result<(), HostError> {
        futex::wake(word, futex::Flags::empty(), Self::WAKE_ALL)
            .map(drop)
            .map_err(HostError::Wake)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use minstant::Instant;

    #[test]
    fn wait_returns_when_word_differs() {
        let word = AtomicU32::new(1);
        FutexHost.wait(&word, 0, Deadline::Never).unwrap();
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        FutexHost
            .wait(&word, 0, Deadline::after(Duration::from_millis(20)))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn past_deadline_does_not_sleep() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        FutexHost
            .wait(&word, 0, Deadline::At(Instant::now()))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wake_releases_sleeper() {
        let word = Arc::new(AtomicU32::new(0));
        let sleeper = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.load(Ordering::SeqCst) == 0 {
                    FutexHost.wait(&word, 0, Deadline::Never).unwrap();
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::SeqCst);
        FutexHost.wake(&word).unwrap();
        sleeper.join().unwrap();
    }

    #[test]
    fn wake_without_sleepers_is_fine() {
        let word = AtomicU32::new(0);
        FutexHost.wake(&word).unwrap();
    }
}

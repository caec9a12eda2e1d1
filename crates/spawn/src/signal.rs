//! The Signal Guard. From before a child is created until it has been
//! reaped, **SIGINT** and **SIGQUIT** are ignored, **SIGCHLD** runs its
//! default disposition, and **SIGCHLD** is blocked on the spawning thread.
//!
//! Dispositions are process-wide, so they are shared between every spawn in
//! flight. The first guard saves the original dispositions and installs the
//! overrides; later guards reuse them; the last guard to leave restores the
//! originals. A single lock covers the holder count, the save, and the
//! restore, so a spawn can never record another spawn's override as the
//! disposition it must put back.
//!
//! The signal mask is per thread, and each guard restores its own.
//!
//! ```rust
//! let guard = spawn::signal::SignalGuard::enter().unwrap();
//! // create, wait
//! guard.release().unwrap();
//! ```

use crate::spawn::{Error, Step};
use log::warn;
use nix::{
    errno::Errno,
    sys::signal::{
        SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask, sigaction,
    },
};
use parking_lot::Mutex;
use std::sync::LazyLock;

/// The dispositions in place before the first guard was entered.
#[derive(Clone)]
struct Disposition {
    interrupt: SigAction,
    quit: SigAction,
    child: SigAction,
}
impl Disposition {
    /// Put every saved disposition back, attempting all three even if one
    /// fails, and returning the first error.
    fn restore(&self) -> Result<(), Errno> {
        let results = unsafe {
            [
                sigaction(Signal::SIGINT, &self.interrupt),
                sigaction(Signal::SIGQUIT, &self.quit),
                sigaction(Signal::SIGCHLD, &self.child),
            ]
        };
        results.into_iter().try_for_each(|result| result.map(|_| ()))
    }
}

/// Process-wide override state.
struct Shared {
    /// Guards currently alive.
    holders: usize,

    /// The original dispositions, while any guard is alive.
    saved: Option<Disposition>,
}

/// The lock over every change this module makes to signal dispositions.
static SHARED: LazyLock<Mutex<Shared>> = LazyLock::new(|| {
    Mutex::new(Shared {
        holders: 0,
        saved: None,
    })
});

/// Install the overrides, returning what they replaced.
/// On failure, anything already replaced is put back.
fn override_dispositions() -> Result<Disposition, Errno> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());

    let child = unsafe { sigaction(Signal::SIGCHLD, &default) }?;
    let interrupt = match unsafe { sigaction(Signal::SIGINT, &ignore) } {
        Ok(interrupt) => interrupt,
        Err(e) => {
            let _ = unsafe { sigaction(Signal::SIGCHLD, &child) };
            return Err(e);
        }
    };
    let quit = match unsafe { sigaction(Signal::SIGQUIT, &ignore) } {
        Ok(quit) => quit,
        Err(e) => {
            let _ = unsafe { sigaction(Signal::SIGINT, &interrupt) };
            let _ = unsafe { sigaction(Signal::SIGCHLD, &child) };
            return Err(e);
        }
    };

    Ok(Disposition {
        interrupt,
        quit,
        child,
    })
}

/// Drop one holder, restoring the original dispositions if it was the last.
fn leave() -> Result<(), Errno> {
    let mut shared = SHARED.lock();
    shared.holders = shared.holders.saturating_sub(1);
    if shared.holders == 0
        && let Some(saved) = shared.saved.take()
    {
        saved.restore()
    } else {
        Ok(())
    }
}

/// Run `f` while no guard can enter or leave, passing the signals a child
/// created directly by the kernel must reset to their default disposition.
///
/// While a guard is alive, **SIGINT** and **SIGQUIT** are ignored process-wide,
/// and a new image would inherit that. Any of the three signals that was not
/// originally ignored is listed; with no guard alive, the set is empty.
///
/// A **SIGCHLD** that was originally ignored cannot be expressed this way, so
/// such a child starts with **SIGCHLD** at its default.
pub fn with_original_dispositions<T>(f: impl FnOnce(&SigSet) -> T) -> T {
    let shared = SHARED.lock();
    let mut defaults = SigSet::empty();
    if let Some(saved) = &shared.saved {
        for (signal, action) in [
            (Signal::SIGINT, &saved.interrupt),
            (Signal::SIGQUIT, &saved.quit),
            (Signal::SIGCHLD, &saved.child),
        ] {
            if action.handler() != SigHandler::SigIgn {
                defaults.add(signal);
            }
        }
    }
    f(&defaults)
}

/// A scoped override of **SIGINT**, **SIGQUIT** and **SIGCHLD** handling.
///
/// Release it with `release()` to observe restoration errors. Dropping an
/// unreleased guard restores on a best-effort basis.
pub struct SignalGuard {
    /// What the child must put back before exec.
    saved: Disposition,

    /// The calling thread's mask before **SIGCHLD** was blocked.
    mask: SigSet,

    /// Whether restoration has already run.
    released: bool,
}
impl SignalGuard {
    /// Enter the critical section.
    pub fn enter() -> Result<Self, Error> {
        let saved = {
            let mut shared = SHARED.lock();
            let saved = match &shared.saved {
                Some(saved) => saved.clone(),
                None => {
                    let saved = override_dispositions()
                        .map_err(|e| Error::spawn(Step::Signal, e))?;
                    shared.saved = Some(saved.clone());
                    saved
                }
            };
            shared.holders += 1;
            saved
        };

        let mut block = SigSet::empty();
        block.add(Signal::SIGCHLD);
        let mut mask = SigSet::empty();
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut mask)) {
            if let Err(restore) = leave() {
                warn!("Failed to restore signal disposition: {restore}");
            }
            return Err(Error::spawn(Step::Signal, e));
        }

        Ok(Self {
            saved,
            mask,
            released: false,
        })
    }

    /// Leave the critical section, restoring this thread's mask and, if no
    /// other spawn is in flight, the original dispositions.
    pub fn release(mut self) -> Result<(), Error> {
        self.restore()
            .map_err(|e| Error::spawn(Step::SignalRestore, e))
    }

    /// The calling thread's mask from before the guard was entered.
    pub fn mask(&self) -> &SigSet {
        &self.mask
    }

    /// Undo the overrides in a freshly forked child.
    ///
    /// Only async-signal-safe calls are made here. The child is the sole
    /// thread of its process, so no lock is taken.
    pub fn restore_in_child(&self) -> Result<(), Errno> {
        self.saved.restore()?;
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.mask), None)
    }

    /// Restore the mask, then release the shared dispositions.
    fn restore(&mut self) -> Result<(), Errno> {
        self.released = true;
        let mask = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.mask), None);
        let shared = leave();
        mask.and(shared)
    }
}
impl Drop for SignalGuard {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.restore()
        {
            warn!("Failed to restore signal disposition: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn blocks_child_signal() -> Result<()> {
        let guard = SignalGuard::enter()?;

        let mut current = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current))?;
        assert!(current.contains(Signal::SIGCHLD));

        let blocked_before = guard.mask.contains(Signal::SIGCHLD);
        guard.release()?;

        pthread_sigmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current))?;
        assert_eq!(current.contains(Signal::SIGCHLD), blocked_before);
        Ok(())
    }

    #[test]
    fn nested_guards_share_dispositions() -> Result<()> {
        let outer = SignalGuard::enter()?;
        let inner = SignalGuard::enter()?;
        assert!(SHARED.lock().holders >= 2);
        assert!(SHARED.lock().saved.is_some());

        inner.release()?;
        assert!(SHARED.lock().saved.is_some());
        outer.release()?;
        Ok(())
    }

    #[test]
    fn defaults_follow_saved_dispositions() -> Result<()> {
        let guard = SignalGuard::enter()?;
        let expected = guard.saved.interrupt.handler() != SigHandler::SigIgn;
        let listed = with_original_dispositions(|defaults| defaults.contains(Signal::SIGINT));
        assert_eq!(listed, expected);
        guard.release()?;
        Ok(())
    }

    #[test]
    fn drop_releases() -> Result<()> {
        {
            let _guard = SignalGuard::enter()?;
        }
        let mut current = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current))?;
        assert!(!current.contains(Signal::SIGCHLD));
        Ok(())
    }
}

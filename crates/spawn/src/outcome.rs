//! Translation of a raw termination status into the caller-visible result.

use crate::spawn::Error;
use log::warn;
use nix::sys::{signal::Signal, wait::WaitStatus};
use std::fmt;

/// How a child that ran to completion failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The child exited with a nonzero code.
    Exited(i32),

    /// The child was terminated by a signal.
    Signaled(Signal),
}

/// The result of a child that was created and observed.
///
/// A spawn that could not create or observe its child is an `Err` instead,
/// so `Result<Outcome, SpawnError>` is the complete three-way result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The child exited with status 0.
    Success,

    /// The child exited nonzero, or died by a signal.
    Failure(Failure),
}
impl Outcome {
    /// Whether the child exited with status 0.
    pub fn success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The exit code, if the child exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::Failure(Failure::Exited(code)) => Some(*code),
            Self::Failure(Failure::Signaled(_)) => None,
        }
    }

    /// The terminating signal, if the child was killed by one.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Self::Failure(Failure::Signaled(signal)) => Some(*signal),
            _ => None,
        }
    }
}
impl TryFrom<WaitStatus> for Outcome {
    type Error = Error;

    fn try_from(status: WaitStatus) -> Result<Self, Self::Error> {
        match status {
            WaitStatus::Exited(_, 0) => Ok(Self::Success),
            WaitStatus::Exited(_, code) => Ok(Self::Failure(Failure::Exited(code))),
            WaitStatus::Signaled(pid, signal, _) => {
                warn!("Child {pid} may be signaled: {}", signal as i32);
                Ok(Self::Failure(Failure::Signaled(signal)))
            }
            status => Err(Error::Status(status)),
        }
    }
}
impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Success => write!(f, "exited successfully"),
            Self::Failure(Failure::Exited(code)) => write!(f, "exited with status {code}"),
            Self::Failure(Failure::Signaled(signal)) => write!(f, "terminated by {signal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn exit_codes() {
        let pid = Pid::from_raw(4242);
        assert_eq!(
            Outcome::try_from(WaitStatus::Exited(pid, 0)).ok(),
            Some(Outcome::Success)
        );
        assert_eq!(
            Outcome::try_from(WaitStatus::Exited(pid, 42)).ok(),
            Some(Outcome::Failure(Failure::Exited(42)))
        );
    }

    #[test]
    fn signaled() {
        let pid = Pid::from_raw(4242);
        let outcome = Outcome::try_from(WaitStatus::Signaled(pid, Signal::SIGKILL, false));
        let outcome = outcome.ok();
        assert_eq!(outcome, Some(Outcome::Failure(Failure::Signaled(Signal::SIGKILL))));
        assert_eq!(outcome.and_then(|o| o.signal()), Some(Signal::SIGKILL));
        assert_eq!(outcome.and_then(|o| o.code()), None);
    }

    #[test]
    fn anomalies() {
        let pid = Pid::from_raw(4242);
        for status in [
            WaitStatus::Stopped(pid, Signal::SIGSTOP),
            WaitStatus::Continued(pid),
            WaitStatus::StillAlive,
        ] {
            assert!(matches!(Outcome::try_from(status), Err(Error::Status(_))));
        }
    }

    #[test]
    fn display() {
        assert_eq!(Outcome::Success.to_string(), "exited successfully");
        assert_eq!(
            Outcome::Failure(Failure::Exited(3)).to_string(),
            "exited with status 3"
        );
        assert!(!Outcome::Failure(Failure::Exited(3)).success());
    }
}

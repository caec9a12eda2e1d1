//! The Descriptor Sanitizer. Finds every descriptor above standard error,
//! and either marks it close-on-exec inside a forked child, or registers a
//! close action for it with `posix_spawn`.
//!
//! Enumeration reads the process' own descriptor table through a
//! pseudo-filesystem where one exists. The directory handle it opens is
//! left out of the result and closed before the caller ever forks. Where no
//! such view exists, every number up to the soft descriptor limit is a
//! candidate instead.
//!
//! Descriptors opened by other threads after enumeration are not covered.
//! Callers that open descriptors concurrently with a spawn should open them
//! close-on-exec.

use crate::spawn::{Error, Step};
use log::debug;
use nix::{
    dir::Dir,
    errno::Errno,
    fcntl::OFlag,
    libc,
    sys::{
        resource::{Resource, getrlimit},
        stat::Mode,
    },
};
use std::{
    fmt,
    os::fd::{AsRawFd, RawFd},
    str::FromStr,
};

/// The first descriptor that is not stdin, stdout, or stderr.
const FIRST: RawFd = 3;

/// Cap on the fallback range, so an unlimited descriptor limit does not
/// mean billions of `fcntl` calls.
const RANGE_CAP: u64 = 1 << 20;

/// Where the list of open descriptors comes from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Try `/proc/self/fd`, then `/dev/fd`, then the full range.
    #[default]
    Auto,

    /// Linux' `/proc/self/fd`.
    Proc,

    /// `/dev/fd`, as found on macOS and some BSDs.
    DevFd,

    /// Every number from 3 up to the soft `RLIMIT_NOFILE`.
    Range,
}
impl Source {
    /// The directory this source reads, if any.
    fn path(&self) -> Option<&'static str> {
        match self {
            Self::Proc => Some("/proc/self/fd"),
            Self::DevFd => Some("/dev/fd"),
            Self::Auto | Self::Range => None,
        }
    }
}
impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "proc" => Ok(Self::Proc),
            "dev-fd" | "dev_fd" | "devfd" => Ok(Self::DevFd),
            "range" => Ok(Self::Range),
            other => Err(format!("Unknown descriptor source: {other}")),
        }
    }
}
impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Proc => write!(f, "proc"),
            Self::DevFd => write!(f, "dev-fd"),
            Self::Range => write!(f, "range"),
        }
    }
}

/// The descriptors that must not reach the new program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptors {
    /// Descriptors known to be open at enumeration time, ascending.
    Listed(Vec<RawFd>),

    /// Every descriptor from 3 up to, but not including, this bound.
    Range(RawFd),
}
impl Descriptors {
    /// Enumerate the descriptors above standard error.
    pub fn enumerate(source: Source) -> Result<Self, Error> {
        match source {
            Source::Proc | Source::DevFd => list(source),
            Source::Range => range(),
            Source::Auto => {
                for source in [Source::Proc, Source::DevFd] {
                    match list(source) {
                        Ok(descriptors) => return Ok(descriptors),
                        Err(e) => debug!("Cannot enumerate via {source}: {e}"),
                    }
                }
                debug!("Falling back to the descriptor range");
                range()
            }
        }
    }

    /// Mark every descriptor in the plan close-on-exec.
    ///
    /// This runs in a forked child, so it neither allocates nor locks.
    /// A descriptor that is no longer open is skipped. Any other failure
    /// returns the descriptor and the error.
    pub fn close_on_exec(&self) -> Result<(), (RawFd, Errno)> {
        match self {
            Self::Listed(fds) => {
                for &fd in fds {
                    mark(fd).map_err(|errno| (fd, errno))?;
                }
            }
            Self::Range(end) => {
                for fd in FIRST..*end {
                    mark(fd).map_err(|errno| (fd, errno))?;
                }
            }
        }
        Ok(())
    }

    /// Register a close action for every descriptor in the plan.
    ///
    /// # Safety
    /// `actions` must point to an initialized `posix_spawn_file_actions_t`.
    pub(crate) unsafe fn register_close(
        &self,
        actions: *mut libc::posix_spawn_file_actions_t,
    ) -> Result<(), Error> {
        let add = |fd: RawFd| match unsafe { libc::posix_spawn_file_actions_addclose(actions, fd) }
        {
            0 => Ok(()),
            code => Err(Error::spawn(Step::Descriptor(fd), Errno::from_raw(code))),
        };

        match self {
            Self::Listed(fds) => fds.iter().try_for_each(|&fd| add(fd)),
            Self::Range(end) => (FIRST..*end).try_for_each(add),
        }
    }
}

/// Set `FD_CLOEXEC` on a descriptor, if it is open and not already set.
///
/// The number may no longer name an open descriptor, so it is passed to
/// `fcntl` as a plain integer rather than borrowed.
fn mark(fd: RawFd) -> Result<(), Errno> {
    let flags = match Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) }) {
        Ok(flags) => flags,
        Err(Errno::EBADF) => return Ok(()),
        Err(e) => return Err(e),
    };

    if flags & libc::FD_CLOEXEC == 0 {
        let marked = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        let _ = Errno::result(marked)?;
    }
    Ok(())
}

/// Read the open descriptors from a directory view of the descriptor table.
fn list(source: Source) -> Result<Descriptors, Error> {
    let Some(path) = source.path() else {
        return range();
    };

    let mut dir = Dir::open(
        path,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| Error::spawn(Step::Enumerate, e))?;
    let own = dir.as_raw_fd();

    let mut fds = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| Error::spawn(Step::Enumerate, e))?;
        if let Ok(name) = entry.file_name().to_str()
            && let Ok(fd) = name.parse::<RawFd>()
            && fd >= FIRST
            && fd != own
        {
            fds.push(fd);
        }
    }
    fds.sort_unstable();

    debug!("Found {} descriptors above stderr in {path}", fds.len());
    Ok(Descriptors::Listed(fds))
}

/// Every number up to the soft descriptor limit.
fn range() -> Result<Descriptors, Error> {
    let (soft, _) =
        getrlimit(Resource::RLIMIT_NOFILE).map_err(|e| Error::spawn(Step::Enumerate, e))?;
    let end = RawFd::try_from(soft.min(RANGE_CAP)).unwrap_or(RawFd::MAX);
    debug!("Sanitizing descriptors {FIRST}..{end}");
    Ok(Descriptors::Range(end.max(FIRST)))
}

//! Spawn a program with a clean descriptor table, wait for it, and report
//! how it ended.
//!
//! Two strategies create the child:
//!
//! * `Strategy::PosixSpawn` registers a close action for every descriptor
//!   above stderr and lets `posix_spawn` create and exec the child in one
//!   step. The child is told to reset the guarded signals that were not
//!   originally ignored, and starts with the caller's original mask.
//! * `Strategy::Fork` marks descriptors close-on-exec in the child, and
//!   execs. Failures in the child are sent back over a close-on-exec pipe, so
//!   the parent can tell a missing program apart from a program that ran and
//!   failed.
//!
//! Both hold a `SignalGuard` from before the child exists until it has been
//! reaped. With **SIGCHLD** at its default, neither an ignoring disposition
//! nor a reaping handler in the host can take the child's status first.

use crate::{
    config,
    descriptor::{Descriptors, Source},
    outcome::Outcome,
    request::{self, SpawnRequest},
    signal::{self, SignalGuard},
};
use log::{debug, trace};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    libc::{self, c_char, c_int},
    sys::wait::{WaitStatus, waitpid},
    unistd::{ForkResult, Pid, fork, pipe2, setpgid, setsid},
};
use std::{
    borrow::Cow,
    ffi::NulError,
    fmt,
    fs::File,
    io::Read,
    mem::MaybeUninit,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    ptr,
    str::FromStr,
};
use thiserror::Error;

/// The exit status of a forked child that could not exec.
const EXEC_FAILED: c_int = 127;

/// Size of a child's failure report: step, errno, descriptor.
const REPORT_LEN: usize = 12;

/// The phase of a spawn that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Listing the open descriptors.
    Enumerate,

    /// Querying, marking, or registering a close for a descriptor.
    Descriptor(RawFd),

    /// Installing the signal overrides.
    Signal,

    /// Restoring the parent's signal disposition or mask.
    SignalRestore,

    /// Restoring signal disposition inside the child.
    ChildSignal,

    /// Detaching the child into its own session or process group.
    Session,

    /// Creating the child's status pipe, or reading from it.
    Pipe,

    /// Creating the child.
    Fork,

    /// Preparing the `posix_spawn` attributes and file actions.
    Attributes,

    /// Replacing the child's image with the program.
    Exec,

    /// Waiting for the child to terminate.
    Wait,
}
impl Step {
    /// Encode a failure so a forked child can send it to its parent.
    /// This does not allocate.
    fn report(self, errno: Errno) -> [u8; REPORT_LEN] {
        let (tag, fd): (u32, RawFd) = match self {
            Self::Enumerate => (1, -1),
            Self::Descriptor(fd) => (2, fd),
            Self::Signal => (3, -1),
            Self::SignalRestore => (4, -1),
            Self::ChildSignal => (5, -1),
            Self::Session => (6, -1),
            Self::Pipe => (7, -1),
            Self::Fork => (8, -1),
            Self::Attributes => (9, -1),
            Self::Exec => (10, -1),
            Self::Wait => (11, -1),
        };

        let mut buf = [0u8; REPORT_LEN];
        buf[0..4].copy_from_slice(&tag.to_ne_bytes());
        buf[4..8].copy_from_slice(&(errno as i32).to_ne_bytes());
        buf[8..12].copy_from_slice(&fd.to_ne_bytes());
        buf
    }

    /// Decode a report sent by `Step::report`.
    fn from_report(buf: &[u8]) -> Option<(Self, Errno)> {
        let tag = u32::from_ne_bytes(buf.get(0..4)?.try_into().ok()?);
        let errno = i32::from_ne_bytes(buf.get(4..8)?.try_into().ok()?);
        let fd = RawFd::from_ne_bytes(buf.get(8..12)?.try_into().ok()?);

        let step = match tag {
            1 => Self::Enumerate,
            2 => Self::Descriptor(fd),
            3 => Self::Signal,
            4 => Self::SignalRestore,
            5 => Self::ChildSignal,
            6 => Self::Session,
            7 => Self::Pipe,
            8 => Self::Fork,
            9 => Self::Attributes,
            10 => Self::Exec,
            11 => Self::Wait,
            _ => return None,
        };
        Some((step, Errno::from_raw(errno)))
    }
}
impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Enumerate => write!(f, "enumerate open descriptors"),
            Self::Descriptor(fd) => write!(f, "sanitize descriptor {fd}"),
            Self::Signal => write!(f, "set up signal disposition"),
            Self::SignalRestore => write!(f, "restore signal disposition"),
            Self::ChildSignal => write!(f, "restore signal disposition in child"),
            Self::Session => write!(f, "detach child session"),
            Self::Pipe => write!(f, "communicate with child"),
            Self::Fork => write!(f, "fork"),
            Self::Attributes => write!(f, "prepare spawn attributes"),
            Self::Exec => write!(f, "exec"),
            Self::Wait => write!(f, "wait for child"),
        }
    }
}

/// Errors related to spawning.
#[derive(Debug, Error)]
pub enum Error {
    /// The program path was empty.
    #[error("Program path is empty")]
    EmptyProgram,

    /// The program or an argument contained a NULL byte.
    #[error("Provided string contains null values: {0}")]
    Null(#[from] NulError),

    /// A step of the spawn failed with an OS error.
    #[error("Failed to {step}: {errno}")]
    Spawn {
        step: Step,
        #[source]
        errno: Errno,
    },

    /// The child's termination status was neither an exit nor a signal.
    #[error("Unrecognized termination status: {0:?}")]
    Status(WaitStatus),
}
impl Error {
    /// Construct a step failure.
    pub(crate) fn spawn(step: Step, errno: Errno) -> Self {
        Self::Spawn { step, errno }
    }

    /// Whether the input was rejected before any process was created.
    pub fn is_argument(&self) -> bool {
        matches!(self, Self::EmptyProgram | Self::Null(_))
    }

    /// The failing step, if the error came from the OS.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Spawn { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The underlying OS error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Spawn { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

/// How the child is created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `fork`, then sanitize and `execv` in the child, under a `SignalGuard`.
    Fork,

    /// A single `posix_spawn` with pre-registered close actions.
    #[default]
    PosixSpawn,
}
impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fork" => Ok(Self::Fork),
            "posix-spawn" | "posix_spawn" | "spawn" => Ok(Self::PosixSpawn),
            other => Err(format!("Unknown spawn strategy: {other}")),
        }
    }
}
impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Fork => write!(f, "fork"),
            Self::PosixSpawn => write!(f, "posix-spawn"),
        }
    }
}

/// Spawn a child and wait for it.
///
/// ## Thread Safety
/// A `Spawner` can be used from any thread, and any number of spawns may
/// run concurrently. Each waits only for its own child.
///
/// ## Examples
/// ```rust
/// use spawn::{Failure, Outcome, Spawner, Strategy};
/// let outcome = Spawner::new("/bin/sh")
///     .args(["-c", "exit 42"])
///     .strategy(Strategy::Fork)
///     .spawn()
///     .unwrap();
/// assert_eq!(outcome, Outcome::Failure(Failure::Exited(42)));
/// ```
pub struct Spawner {
    /// The program path. It is not resolved against **PATH**.
    program: String,

    /// Arguments following `argv[0]`.
    args: Vec<String>,

    /// How to create the child.
    strategy: Strategy,

    /// How to find the descriptors to sanitize.
    source: Source,
}
impl Spawner {
    /// Construct a `Spawner` for the program at *program*.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            strategy: *config::STRATEGY,
            source: *config::FD_SOURCE,
        }
    }

    /// Append an argument.
    pub fn arg<'a>(mut self, arg: impl Into<Cow<'a, str>>) -> Self {
        self.arg_i(arg);
        self
    }

    /// Append arguments, in order.
    pub fn args<'a, I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'a, str>>,
    {
        self.args_i(args);
        self
    }

    /// Choose how the child is created.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Choose how open descriptors are enumerated.
    pub fn descriptors(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Append an argument without consuming the `Spawner`.
    pub fn arg_i<'a>(&mut self, arg: impl Into<Cow<'a, str>>) {
        self.args.push(arg.into().into_owned());
    }

    /// Append arguments without consuming the `Spawner`.
    pub fn args_i<'a, I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'a, str>>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.into().into_owned()));
    }

    /// Spawn the child and block until it terminates.
    ///
    /// ## Errors
    /// * `EmptyProgram` or `Null` if the input is malformed. No process is created.
    /// * `Spawn` if any step fails, naming the step and the OS error. A program
    ///   that does not exist or cannot be executed is `Spawn` with `Step::Exec`.
    /// * `Status` if the child's status is neither an exit nor a signal.
    ///
    /// A child that runs and fails is not an error: it is `Outcome::Failure`.
    pub fn spawn(self) -> Result<Outcome, Error> {
        let request = SpawnRequest::new(self.program, self.args)?;

        if log::max_level() == log::Level::Trace {
            trace!("{}", request.display());
        }
        debug!(
            "Spawning {} via {}",
            request.program().to_string_lossy(),
            self.strategy
        );

        let status = match self.strategy {
            Strategy::Fork => fork_exec(&request, self.source)?,
            Strategy::PosixSpawn => posix_spawn(&request, self.source)?,
        };
        Outcome::try_from(status)
    }
}

/// Spawn *program* with *args* using the configured defaults, and wait for it.
///
/// `Ok(Outcome::Success)` means the child exited 0, `Ok(Outcome::Failure)`
/// that it ran and failed, and `Err` that it could not be spawned or observed.
pub fn clean_spawn<S: AsRef<str>>(program: &str, args: &[S]) -> Result<Outcome, Error> {
    Spawner::new(program)
        .args(args.iter().map(AsRef::as_ref))
        .spawn()
}

/// Fork under a `SignalGuard`, sanitize and exec in the child, then reap it.
fn fork_exec(request: &SpawnRequest, source: Source) -> Result<WaitStatus, Error> {
    let guard = SignalGuard::enter()?;
    let descriptors = Descriptors::enumerate(source)?;
    let (reader, writer) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::spawn(Step::Pipe, e))?;

    let child = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            let (step, errno) = exec_child(&guard, &descriptors, request);
            let report = step.report(errno);
            unsafe {
                let _ = libc::write(writer.as_raw_fd(), report.as_ptr().cast(), report.len());
                libc::_exit(EXEC_FAILED)
            }
        }
        Err(e) => return Err(Error::spawn(Step::Fork, e)),
    };
    drop(writer);

    let report = read_report(reader);
    let status = waitpid(child, None).map_err(|e| Error::spawn(Step::Wait, e));
    guard.release()?;

    if let Some((step, errno)) = report? {
        return Err(Error::spawn(step, errno));
    }
    status
}

/// Everything the forked child does. Only returns if something failed.
///
/// Nothing here may allocate or lock: the parent may have had other threads
/// holding locks at the moment of the fork.
fn exec_child(
    guard: &SignalGuard,
    descriptors: &Descriptors,
    request: &SpawnRequest,
) -> (Step, Errno) {
    if let Err(e) = guard.restore_in_child() {
        return (Step::ChildSignal, e);
    }
    if let Err(e) = detach() {
        return (Step::Session, e);
    }
    if let Err((fd, e)) = descriptors.close_on_exec() {
        return (Step::Descriptor(fd), e);
    }

    unsafe { libc::execv(request.program().as_ptr(), request.argv_ptrs().as_ptr()) };
    (Step::Exec, Errno::last())
}

/// Move the calling process into a new session, or failing that, a new
/// process group.
fn detach() -> Result<(), Errno> {
    match setsid() {
        Ok(_) => Ok(()),
        Err(_) => setpgid(Pid::from_raw(0), Pid::from_raw(0)),
    }
}

/// Read the child's failure report. An empty pipe means exec succeeded.
fn read_report(reader: OwnedFd) -> Result<Option<(Step, Errno)>, Error> {
    let mut buf = Vec::with_capacity(REPORT_LEN);
    let _ = File::from(reader).read_to_end(&mut buf).map_err(|e| {
        let errno = e.raw_os_error().map_or(Errno::EIO, Errno::from_raw);
        Error::spawn(Step::Pipe, errno)
    })?;

    match buf.len() {
        0 => Ok(None),
        REPORT_LEN => Step::from_report(&buf)
            .map(Some)
            .ok_or_else(|| Error::spawn(Step::Pipe, Errno::EIO)),
        _ => Err(Error::spawn(Step::Pipe, Errno::EIO)),
    }
}

/// Destroys a `posix_spawn_file_actions_t` when dropped.
struct FileActions<'a>(&'a mut MaybeUninit<libc::posix_spawn_file_actions_t>);
impl Drop for FileActions<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(self.0.as_mut_ptr());
        }
    }
}

/// Destroys a `posix_spawnattr_t` when dropped.
struct Attributes<'a>(&'a mut MaybeUninit<libc::posix_spawnattr_t>);
impl Drop for Attributes<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(self.0.as_mut_ptr());
        }
    }
}

/// Map a `posix_spawn*` return code to a step failure.
fn check(code: c_int, step: Step) -> Result<(), Error> {
    match code {
        0 => Ok(()),
        code => Err(Error::spawn(step, Errno::from_raw(code))),
    }
}

/// Create the child with `posix_spawn`, closing every descriptor above
/// stderr before the program runs, then reap it under a `SignalGuard`.
fn posix_spawn(request: &SpawnRequest, source: Source) -> Result<WaitStatus, Error> {
    let descriptors = Descriptors::enumerate(source)?;
    let environment = request::environment();
    let envp: Vec<*const c_char> = environment
        .iter()
        .map(|entry| entry.as_ptr())
        .chain([ptr::null()])
        .collect();

    let guard = SignalGuard::enter()?;

    // The guard is alive, so the overrides are in place: every guarded signal
    // that was not originally ignored is listed for reset.
    let pid = signal::with_original_dispositions(|defaults| -> Result<libc::pid_t, Error> {
        unsafe {
            let mut actions = MaybeUninit::uninit();
            check(
                libc::posix_spawn_file_actions_init(actions.as_mut_ptr()),
                Step::Attributes,
            )?;
            let actions = FileActions(&mut actions);
            descriptors.register_close(actions.0.as_mut_ptr())?;

            let mut attributes = MaybeUninit::uninit();
            check(
                libc::posix_spawnattr_init(attributes.as_mut_ptr()),
                Step::Attributes,
            )?;
            let attributes = Attributes(&mut attributes);

            // Group 0 puts the child in a new process group of its own.
            check(
                libc::posix_spawnattr_setpgroup(attributes.0.as_mut_ptr(), 0),
                Step::Session,
            )?;
            let mask = guard.mask();
            check(
                libc::posix_spawnattr_setsigmask(attributes.0.as_mut_ptr(), mask.as_ref()),
                Step::Attributes,
            )?;
            check(
                libc::posix_spawnattr_setsigdefault(attributes.0.as_mut_ptr(), defaults.as_ref()),
                Step::Attributes,
            )?;
            let flags = libc::POSIX_SPAWN_SETPGROUP
                | libc::POSIX_SPAWN_SETSIGMASK
                | libc::POSIX_SPAWN_SETSIGDEF;
            check(
                libc::posix_spawnattr_setflags(attributes.0.as_mut_ptr(), flags as _),
                Step::Attributes,
            )?;

            let mut pid: libc::pid_t = 0;
            check(
                libc::posix_spawn(
                    &mut pid,
                    request.program().as_ptr(),
                    actions.0.as_ptr(),
                    attributes.0.as_ptr(),
                    request.argv_ptrs().as_ptr() as *const *mut c_char,
                    envp.as_ptr() as *const *mut c_char,
                ),
                Step::Exec,
            )?;
            Ok(pid)
        }
    })?;

    let status = waitpid(Pid::from_raw(pid), None).map_err(|e| Error::spawn(Step::Wait, e));
    guard.release()?;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Failure;
    use anyhow::Result;
    use nix::sys::signal::Signal;
    use std::thread;

    const STRATEGIES: [Strategy; 2] = [Strategy::Fork, Strategy::PosixSpawn];

    fn sh(strategy: Strategy, script: &str) -> Result<Outcome, Error> {
        Spawner::new("/bin/sh")
            .args(["-c", script])
            .strategy(strategy)
            .spawn()
    }

    #[test]
    fn true_succeeds() -> Result<()> {
        for strategy in STRATEGIES {
            let outcome = Spawner::new("/bin/true").strategy(strategy).spawn()?;
            assert_eq!(outcome, Outcome::Success, "{strategy}");
        }
        Ok(())
    }

    #[test]
    fn false_fails() -> Result<()> {
        for strategy in STRATEGIES {
            let outcome = Spawner::new("/bin/false").strategy(strategy).spawn()?;
            assert!(!outcome.success(), "{strategy}");
        }
        Ok(())
    }

    #[test]
    fn exit_code() -> Result<()> {
        for strategy in STRATEGIES {
            let outcome = sh(strategy, "exit 42")?;
            assert_eq!(outcome, Outcome::Failure(Failure::Exited(42)), "{strategy}");
        }
        Ok(())
    }

    #[test]
    fn command_not_found() -> Result<()> {
        for strategy in STRATEGIES {
            let outcome = sh(strategy, "nonexist 2>/dev/null")?;
            assert!(!outcome.success(), "{strategy}");
        }
        Ok(())
    }

    #[test]
    fn signaled() -> Result<()> {
        for strategy in STRATEGIES {
            let outcome = sh(strategy, "kill -KILL $$")?;
            assert_eq!(outcome.signal(), Some(Signal::SIGKILL), "{strategy}");
        }
        Ok(())
    }

    #[test]
    fn nonexistent_program() {
        for strategy in STRATEGIES {
            let result = Spawner::new("/nonexistent/path")
                .strategy(strategy)
                .spawn();
            assert!(!matches!(result, Ok(Outcome::Success)), "{strategy}");
            if let Err(e) = result {
                assert_eq!(e.step(), Some(Step::Exec), "{strategy}");
                assert_eq!(e.errno(), Some(Errno::ENOENT), "{strategy}");
            }
        }
    }

    #[test]
    fn not_executable() {
        let result = Spawner::new("/dev/null").strategy(Strategy::Fork).spawn();
        assert!(matches!(
            result,
            Err(Error::Spawn {
                step: Step::Exec,
                errno: Errno::EACCES
            })
        ));
    }

    #[test]
    fn arguments_are_passed() -> Result<()> {
        for strategy in STRATEGIES {
            let outcome = Spawner::new("/bin/sh")
                .args(["-c", r#"[ "$0" = "first" ] && [ "$1" = "second arg" ]"#])
                .args(["first", "second arg"])
                .strategy(strategy)
                .spawn()?;
            assert_eq!(outcome, Outcome::Success, "{strategy}");
        }
        Ok(())
    }

    #[test]
    fn environment_is_inherited() -> Result<()> {
        let Ok(path) = std::env::var("PATH") else {
            return Ok(());
        };
        for strategy in STRATEGIES {
            let outcome = Spawner::new("/bin/sh")
                .args(["-c", r#"[ "$PATH" = "$0" ]"#, path.as_str()])
                .strategy(strategy)
                .spawn()?;
            assert_eq!(outcome, Outcome::Success, "{strategy}");
        }
        Ok(())
    }

    #[test]
    fn new_process_group() -> Result<()> {
        if !std::path::Path::new("/proc/self/stat").exists() {
            return Ok(());
        }
        // The child leads its own process group: field five of its stat is its pid.
        for strategy in STRATEGIES {
            let script = r#"read -r _ _ _ _ group _ < /proc/$$/stat; [ "$group" = "$$" ]"#;
            let outcome = sh(strategy, script)?;
            assert_eq!(outcome, Outcome::Success, "{strategy}");
        }
        Ok(())
    }

    #[test]
    fn argument_errors() {
        assert!(matches!(
            Spawner::new("").spawn(),
            Err(Error::EmptyProgram)
        ));

        let result = Spawner::new("/bin/echo").arg("a\0b").spawn();
        assert!(result.as_ref().is_err_and(Error::is_argument));
    }

    #[test]
    fn concurrent_spawns() -> Result<()> {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                thread::spawn(move || {
                    let strategy = STRATEGIES[i % STRATEGIES.len()];
                    sh(strategy, &format!("exit {i}")).map(|outcome| (i, outcome))
                })
            })
            .collect();

        for handle in handles {
            let (i, outcome) = handle.join().map_err(|_| anyhow::anyhow!("panicked"))??;
            assert_eq!(outcome.code(), Some(i32::try_from(i)?));
        }
        Ok(())
    }

    #[test]
    fn report_decoding() {
        let report = Step::Descriptor(17).report(Errno::EPERM);
        assert_eq!(
            Step::from_report(&report),
            Some((Step::Descriptor(17), Errno::EPERM))
        );
        assert_eq!(Step::from_report(&[0; REPORT_LEN]), None);
        assert_eq!(Step::from_report(&[1, 2, 3]), None);
    }

    #[test]
    fn parse_strategy() {
        assert_eq!("fork".parse(), Ok(Strategy::Fork));
        assert_eq!("POSIX_SPAWN".parse(), Ok(Strategy::PosixSpawn));
        assert!("vfork".parse::<Strategy>().is_err());
    }

    #[test]
    fn clean_spawn_defaults() -> Result<()> {
        assert!(clean_spawn("/bin/true", &[] as &[&str])?.success());
        assert!(!clean_spawn("/bin/sh", &["-c", "exit 3"])?.success());
        Ok(())
    }
}

//! Clean process spawning: launch a program with no descriptors beyond
//! stdin/stdout/stderr, with interactive and child-termination signals held
//! steady around process creation, and wait for it to finish.
//!
//! ```rust
//! use spawn::{Outcome, clean_spawn};
//! assert_eq!(clean_spawn("/bin/true", &[] as &[&str]).unwrap(), Outcome::Success);
//! ```

pub mod config;
pub mod descriptor;
mod outcome;
mod request;
pub mod signal;
mod spawn;

pub use nix::sys::signal::Signal;
pub use outcome::{Failure, Outcome};
pub use request::SpawnRequest;
pub use spawn::Error as SpawnError;
pub use spawn::{Spawner, Step, Strategy, clean_spawn};

//! Run a program with no inherited descriptors beyond stdin, stdout and
//! stderr, and exit with its status.
//!
//! The exit code mirrors the child: its own code if it exited, `128 + signal`
//! if it was killed, 127 if it could not be spawned at all, and 2 if the
//! command line itself was unusable.
use clap::Parser;
use log::{LevelFilter, error, info};
use spawn::{Failure, Outcome, SpawnError, Spawner, Strategy, descriptor::Source};
use std::process::ExitCode;

/// The code for a program that could not be run.
const SPAWN_FAILED: u8 = 127;

/// The code for an unusable command line.
const USAGE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "cleanspawn")]
#[command(version)]
#[command(about = "Run a program without leaking descriptors or signal handlers into it")]
pub struct Cli {
    /// How to create the child: fork or posix-spawn.
    /// Defaults to CLEANSPAWN_STRATEGY, or posix-spawn.
    #[arg(short, long)]
    pub strategy: Option<Strategy>,

    /// How to find open descriptors: auto, proc, dev-fd or range.
    /// Defaults to CLEANSPAWN_FD_SOURCE, or auto.
    #[arg(long)]
    pub fd_source: Option<Source>,

    /// Log spawn decisions. RUST_LOG takes precedence.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// The path to the program. It is not searched for in PATH.
    pub program: String,

    /// Arguments to pass to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Map the child's result onto our own exit code.
fn exit_code(result: &Result<Outcome, SpawnError>) -> u8 {
    match result {
        Ok(Outcome::Success) => 0,
        Ok(Outcome::Failure(Failure::Exited(code))) => u8::try_from(code & 0xff).unwrap_or(1),
        Ok(Outcome::Failure(Failure::Signaled(signal))) => {
            u8::try_from(128 + (*signal as i32 & 0x7f)).unwrap_or(SPAWN_FAILED)
        }
        Err(e) if e.is_argument() => USAGE,
        Err(_) => SPAWN_FAILED,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::new();
    let _ = builder.filter_level(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    let _ = builder.parse_default_env();
    builder.init();

    let mut spawner = Spawner::new(cli.program);
    spawner.args_i(cli.args);
    if let Some(strategy) = cli.strategy {
        spawner = spawner.strategy(strategy);
    }
    if let Some(source) = cli.fd_source {
        spawner = spawner.descriptors(source);
    }

    let result = spawner.spawn();
    match &result {
        Ok(outcome) => info!("Child {outcome}"),
        Err(e) => error!("{e}"),
    }
    ExitCode::from(exit_code(&result))
}

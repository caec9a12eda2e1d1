//! Process-wide defaults, read once from the environment.
//!
//! * `CLEANSPAWN_STRATEGY`: `fork` or `posix-spawn` (the default).
//! * `CLEANSPAWN_FD_SOURCE`: `auto` (the default), `proc`, `dev-fd` or `range`.
//!
//! Unknown values are logged and ignored.

use crate::{descriptor::Source, spawn::Strategy};
use log::warn;
use std::{env, str::FromStr, sync::LazyLock};

/// The default way children are created.
pub static STRATEGY: LazyLock<Strategy> = LazyLock::new(|| from_env("CLEANSPAWN_STRATEGY"));

/// The default way open descriptors are enumerated.
pub static FD_SOURCE: LazyLock<Source> = LazyLock::new(|| from_env("CLEANSPAWN_FD_SOURCE"));

/// Parse an environment variable, falling back to the type's default.
fn from_env<T>(key: &str) -> T
where
    T: FromStr<Err = String> + Default,
{
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|e| {
            warn!("Ignoring {key}: {e}");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_uses_default() {
        let strategy: Strategy = from_env("CLEANSPAWN_TEST_UNSET_VARIABLE");
        assert_eq!(strategy, Strategy::PosixSpawn);

        let source: Source = from_env("CLEANSPAWN_TEST_UNSET_VARIABLE");
        assert_eq!(source, Source::Auto);
    }
}

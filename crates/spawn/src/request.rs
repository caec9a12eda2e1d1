//! Validated input for a single spawn.

use crate::spawn::Error;
use nix::libc::c_char;
use std::{
    borrow::Cow,
    env,
    ffi::{CStr, CString},
    os::unix::ffi::OsStrExt,
    ptr,
};

/// A program and its arguments, converted to C strings before any process
/// is created.
///
/// The program path becomes `argv[0]`; `args` follow it in order. Every
/// pointer table the child needs is built here, so nothing between process
/// creation and exec has to allocate.
pub struct SpawnRequest {
    /// The program path, also `argv[0]`.
    program: CString,

    /// The complete argument vector, `argv[0]` included.
    argv: Vec<CString>,

    /// NULL-terminated pointers into `argv`.
    argv_ptrs: Vec<*const c_char>,
}
impl SpawnRequest {
    /// Validate a program path and its arguments.
    ///
    /// Fails with `Error::EmptyProgram` if the path is empty, or
    /// `Error::Null` if any string contains a NULL byte.
    pub fn new<'a, I, S>(program: impl Into<Cow<'a, str>>, args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'a, str>>,
    {
        let program = program.into();
        if program.is_empty() {
            return Err(Error::EmptyProgram);
        }
        let program = CString::new(program.as_ref())?;

        let mut argv = vec![program.clone()];
        for arg in args {
            argv.push(CString::new(arg.into().as_ref())?);
        }

        let argv_ptrs = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain([ptr::null()])
            .collect();

        Ok(Self {
            program,
            argv,
            argv_ptrs,
        })
    }

    /// The program path.
    pub fn program(&self) -> &CStr {
        &self.program
    }

    /// The full argument vector, starting with the program path.
    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// NULL-terminated `argv` for the exec family.
    pub(crate) fn argv_ptrs(&self) -> &[*const c_char] {
        &self.argv_ptrs
    }

    /// The argument vector joined for logging.
    pub(crate) fn display(&self) -> String {
        self.argv
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The calling process' environment as `KEY=VALUE` strings.
///
/// Entries that cannot be represented (a NULL byte in the key or value)
/// cannot exist in a real environment block, and are skipped.
pub(crate) fn environment() -> Vec<CString> {
    env::vars_os()
        .filter_map(|(key, value)| {
            let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
            entry.extend_from_slice(key.as_bytes());
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn argv_starts_with_program() -> Result<()> {
        let request = SpawnRequest::new("/bin/sh", ["-c", "exit 42"])?;
        let argv: Vec<_> = request
            .argv()
            .iter()
            .map(|arg| arg.to_str())
            .collect::<Result<_, _>>()?;

        assert_eq!(argv, ["/bin/sh", "-c", "exit 42"]);
        assert_eq!(request.program().to_str()?, "/bin/sh");
        Ok(())
    }

    #[test]
    fn pointers_are_terminated() -> Result<()> {
        let request = SpawnRequest::new("/bin/true", Vec::<String>::new())?;
        let ptrs = request.argv_ptrs();
        assert_eq!(ptrs.len(), 2);
        assert_eq!(ptrs[0], request.program().as_ptr());
        assert!(ptrs[1].is_null());
        Ok(())
    }

    #[test]
    fn empty_program() {
        let result = SpawnRequest::new("", ["arg"]);
        assert!(matches!(result, Err(Error::EmptyProgram)));
    }

    #[test]
    fn null_argument() {
        assert!(matches!(
            SpawnRequest::new("/bin/echo", ["fine", "not\0fine"]),
            Err(Error::Null(_))
        ));
        assert!(matches!(
            SpawnRequest::new("/bin/\0echo", ["fine"]),
            Err(Error::Null(_))
        ));
    }

    #[test]
    fn environment_is_inherited() {
        let path = env::var_os("PATH").map(|path| {
            let mut entry = b"PATH=".to_vec();
            entry.extend_from_slice(path.as_bytes());
            entry
        });

        let environment = environment();
        if let Some(path) = path {
            assert!(environment.iter().any(|entry| entry.as_bytes() == path));
        }
    }
}

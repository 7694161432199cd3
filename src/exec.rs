//! Command lookup and execution

use crate::error::{DoasError, Result};
use crate::output;
use nix::errno::Errno;
use nix::libc;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Resolve `program` the way a shell would, against `search_path`.
///
/// Names containing `/` are taken relative to `cwd`. Returns `None` when
/// nothing executable is found.
pub fn resolve_command(
    program: &str,
    search_path: Option<&OsStr>,
    cwd: &Path,
) -> Option<PathBuf> {
    match which::which_in(program, search_path, cwd) {
        Ok(path) => {
            debug!("Resolved {} to {}", program, path.display());
            Some(path)
        }
        Err(e) => {
            debug!("Could not resolve {}: {}", program, e);
            None
        }
    }
}

/// Run the command in a child process and wait for it.
///
/// `become_target` runs in the child only, before the command is executed;
/// the calling process keeps its identity so it can close the session
/// afterwards. Returns the exit code to report: the command's own code, 128
/// plus the signal number if it was killed, or the code of the error that
/// stopped the child before the command started.
pub fn run_as<F>(program: &Path, args: &[String], become_target: F) -> Result<i32>
where
    F: FnOnce() -> Result<()>,
{
    info!("Executing: {} {:?}", program.display(), args);

    let mut command = Command::new(program);
    command.args(args);

    // SAFETY: the process is single-threaded when a command is run; the
    // child only switches identity and replaces itself with the command.
    match unsafe { fork() }? {
        ForkResult::Child => {
            let code = match become_target() {
                Ok(()) => {
                    let e = command.exec();
                    let name = program.display().to_string();
                    if e.kind() == ErrorKind::NotFound {
                        report(DoasError::CommandNotFound(name))
                    } else {
                        report(DoasError::CommandExecution {
                            program: name,
                            source: e,
                        })
                    }
                }
                Err(e) => report(e),
            };
            // SAFETY: leaves the child without running the parent's exit handlers.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => wait_for(child),
    }
}

fn report(error: DoasError) -> i32 {
    output::print_error(&error);
    error.exit_code()
}

fn wait_for(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(status) => debug!("Ignoring wait status {:?}", status),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

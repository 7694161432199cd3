//! Audit trail
//!
//! Every audit line goes to syslog (authpriv) and to the `doas::audit`
//! tracing target.

use nix::libc;
use std::ffi::CString;
use std::path::Path;
use tracing::info;

fn syslog(priority: libc::c_int, message: &str) {
    let Ok(msg) = CString::new(message.replace('\0', "")) else {
        return;
    };
    // SAFETY: "%s" consumes exactly one NUL-terminated string argument.
    unsafe {
        libc::syslog(
            libc::LOG_AUTHPRIV | priority,
            c"%s".as_ptr(),
            msg.as_ptr(),
        );
    }
}

pub fn command_line(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Record an authorized command just before it runs.
pub fn command_executed(invoker: &str, target: &str, command: &str) {
    let cwd = std::env::current_dir()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|_| "(failed)".to_string());
    let msg = format!("{} ran command {} as {} from {}", invoker, command, target, cwd);
    info!(target: "doas::audit", "{}", msg);
    syslog(libc::LOG_INFO, &msg);
}

/// Record a refused request.
pub fn command_refused(invoker: &str, target: &str, command: &str) {
    let msg = format!("command not permitted for {} as {}: {}", invoker, target, command);
    info!(target: "doas::audit", "{}", msg);
    syslog(libc::LOG_NOTICE, &msg);
}

/// Record a failed authentication.
pub fn authentication_failed(invoker: &str) {
    let msg = format!("failed auth for {}", invoker);
    info!(target: "doas::audit", "{}", msg);
    syslog(libc::LOG_NOTICE, &msg);
}

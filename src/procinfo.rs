//! Login-session identity derived from kernel process metadata

use crate::error::{DoasError, Result};
use nix::unistd::{getppid, getsid, getuid, Pid};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

/// Upper bound on the size of a `/proc/<pid>/stat` record
const STAT_MAX: usize = 1024;

/// Index of `tty_nr` among the fields following the command name
const TTY_NR_FIELD: usize = 4;
/// Index of `starttime` among the fields following the command name
const START_TIME_FIELD: usize = 19;

/// Identifies one login session for the persist timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKey {
    pub ppid: i32,
    pub sid: i32,
    pub tty_nr: i32,
    pub start_time: u64,
    pub uid: u32,
}

impl SessionKey {
    /// Derive the key for the calling process.
    ///
    /// The parent is the shell the user typed the command into; its start
    /// time distinguishes it from a later process reusing the same pid.
    pub fn current() -> Result<Self> {
        let ppid = getppid();
        let sid = getsid(None)?;
        let stat = read_stat(ppid)?;
        Ok(Self {
            ppid: ppid.as_raw(),
            sid: sid.as_raw(),
            tty_nr: stat.tty_nr,
            start_time: stat.start_time,
            uid: getuid().as_raw(),
        })
    }
}

/// Renders as the timestamp record file name.
impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            self.ppid, self.sid, self.tty_nr, self.start_time, self.uid
        )
    }
}

/// Fields of interest from a process status record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub tty_nr: i32,
    pub start_time: u64,
}

/// Read `/proc/<pid>/stat` for `pid`.
pub fn read_stat(pid: Pid) -> Result<ProcStat> {
    let path = PathBuf::from(format!("/proc/{}/stat", pid));
    let err = |reason: String| DoasError::ProcStat {
        path: path.clone(),
        reason,
    };

    let file = File::options()
        .read(true)
        .custom_flags(nix::libc::O_NOFOLLOW)
        .open(&path)
        .map_err(|e| err(e.to_string()))?;

    let mut buf = Vec::with_capacity(STAT_MAX);
    file.take(STAT_MAX as u64)
        .read_to_end(&mut buf)
        .map_err(|e| err(e.to_string()))?;

    parse_stat(&buf).map_err(|reason| err(reason.to_string()))
}

/// Parse the body of a `/proc/<pid>/stat` record.
///
/// The command name sits in parentheses and may itself contain spaces or
/// `)`, so fields are only split after the last closing parenthesis.
pub fn parse_stat(buf: &[u8]) -> std::result::Result<ProcStat, &'static str> {
    if buf.len() >= STAT_MAX {
        return Err("record too large");
    }
    if buf.contains(&0) {
        return Err("NUL byte in record");
    }

    let close = buf
        .iter()
        .rposition(|&b| b == b')')
        .ok_or("missing end of command name")?;
    let rest = std::str::from_utf8(&buf[close + 1..]).map_err(|_| "record is not UTF-8")?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    let tty_nr = fields
        .get(TTY_NR_FIELD)
        .ok_or("missing tty_nr")?
        .parse::<i32>()
        .map_err(|_| "invalid tty_nr")?;
    let start_time = fields
        .get(START_TIME_FIELD)
        .ok_or("missing starttime")?
        .parse::<u64>()
        .map_err(|_| "invalid starttime")?;

    Ok(ProcStat { tty_nr, start_time })
}

use crate::error::{DoasError, Result};
use nix::unistd::{Gid, Uid, User};
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[cfg(target_os = "linux")]
mod linux;

/// Set once the process has switched identity
static TRANSITIONED: AtomicBool = AtomicBool::new(false);

/// The identity-changing primitives a platform must provide.
///
/// [`apply`] is the only caller and fixes the order in which these run.
pub trait IdentityOps {
    /// Set real, effective and saved group ids.
    fn set_gid(&mut self, gid: Gid) -> Result<()>;
    /// Load the supplementary groups of `user`. Needs the original privilege.
    fn init_groups(&mut self, user: &CStr, gid: Gid) -> Result<()>;
    /// Set real, effective and saved user ids.
    fn set_uid(&mut self, uid: Uid) -> Result<()>;
    /// Set `PATH` for the command about to run.
    fn set_path(&mut self, path: &str) -> Result<()>;
}

/// The account the command will run as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIdentity {
    pub name: CString,
    pub uid: Uid,
    pub gid: Gid,
}

impl TargetIdentity {
    pub fn from_user(user: &User) -> Result<Self> {
        let name = CString::new(user.name.as_bytes())
            .map_err(|_| DoasError::Privilege("user name contains NUL byte".to_string()))?;
        Ok(Self {
            name,
            uid: user.uid,
            gid: user.gid,
        })
    }
}

/// Where the target command's `PATH` comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPolicy<'a> {
    /// Configured safe directories
    Safe(&'a [String]),
    /// The invoking principal's own `PATH` (`keepenv`)
    Keep(&'a str),
}

impl PathPolicy<'_> {
    fn value(&self) -> String {
        match self {
            PathPolicy::Safe(dirs) => dirs.join(":"),
            PathPolicy::Keep(path) => path.to_string(),
        }
    }
}

/// Switch to `target` in the only safe order.
///
/// Groups are set first and supplementary groups loaded while the process
/// still holds its original privilege; the user id goes last. The first
/// failing step aborts the sequence and the caller must exit without running
/// the command.
pub fn apply<O: IdentityOps>(
    ops: &mut O,
    target: &TargetIdentity,
    path: PathPolicy<'_>,
) -> Result<()> {
    ops.set_gid(target.gid)?;
    ops.init_groups(&target.name, target.gid)?;
    ops.set_uid(target.uid)?;
    ops.set_path(&path.value())?;
    debug!("Switched to uid {} gid {}", target.uid, target.gid);
    Ok(())
}

/// Switch this process to `target` using the platform primitives.
///
/// Irreversible. A second call in the same process is refused.
pub fn transition(target: &TargetIdentity, path: PathPolicy<'_>) -> Result<()> {
    if !claim_once() {
        return Err(DoasError::Privilege("identity already changed".to_string()));
    }

    #[cfg(target_os = "linux")]
    {
        apply(&mut linux::SystemIdentity, target, path)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (target, path);
        Err(DoasError::Privilege(format!(
            "platform '{}' is not supported",
            std::env::consts::OS
        )))
    }
}

/// Drop the elevated effective ids and keep only the invoker's own.
///
/// Supplementary groups are left alone: they already belong to the invoker.
pub fn relinquish<O: IdentityOps>(ops: &mut O, uid: Uid, gid: Gid) -> Result<()> {
    ops.set_gid(gid)?;
    ops.set_uid(uid)?;
    debug!("Reverted to real uid {} gid {}", uid, gid);
    Ok(())
}

/// Make the process run with the invoker's real ids only.
///
/// Used before touching files the invoker names. Shares the once-guard with
/// [`transition`], so no identity switch can follow.
pub fn revert_to_invoker() -> Result<()> {
    if !claim_once() {
        return Err(DoasError::Privilege("identity already changed".to_string()));
    }

    #[cfg(target_os = "linux")]
    {
        use nix::unistd::{getgid, getuid};
        relinquish(&mut linux::SystemIdentity, getuid(), getgid())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(DoasError::Privilege(format!(
            "platform '{}' is not supported",
            std::env::consts::OS
        )))
    }
}

fn claim_once() -> bool {
    TRANSITIONED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

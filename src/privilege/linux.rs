use super::IdentityOps;
use crate::error::{DoasError, Result};
use nix::unistd::{getresgid, getresuid, initgroups, setresgid, setresuid, Gid, Uid};
use std::ffi::CStr;
use tracing::debug;

/// Identity primitives of the running Linux process
pub(super) struct SystemIdentity;

impl IdentityOps for SystemIdentity {
    fn set_gid(&mut self, gid: Gid) -> Result<()> {
        setresgid(gid, gid, gid)
            .map_err(|e| DoasError::Privilege(format!("setresgid({}): {}", gid, e)))?;

        let ids = getresgid().map_err(|e| DoasError::Privilege(format!("getresgid: {}", e)))?;
        if ids.real != gid || ids.effective != gid || ids.saved != gid {
            return Err(DoasError::Privilege(format!("group id is not {}", gid)));
        }
        debug!("Set gid to {}", gid);
        Ok(())
    }

    fn init_groups(&mut self, user: &CStr, gid: Gid) -> Result<()> {
        initgroups(user, gid).map_err(|e| {
            DoasError::Privilege(format!("initgroups({}): {}", user.to_string_lossy(), e))
        })
    }

    fn set_uid(&mut self, uid: Uid) -> Result<()> {
        setresuid(uid, uid, uid)
            .map_err(|e| DoasError::Privilege(format!("setresuid({}): {}", uid, e)))?;

        let ids = getresuid().map_err(|e| DoasError::Privilege(format!("getresuid: {}", e)))?;
        if ids.real != uid || ids.effective != uid || ids.saved != uid {
            return Err(DoasError::Privilege(format!("user id is not {}", uid)));
        }
        debug!("Set uid to {}", uid);
        Ok(())
    }

    fn set_path(&mut self, path: &str) -> Result<()> {
        // single-threaded at this point
        std::env::set_var("PATH", path);
        Ok(())
    }
}

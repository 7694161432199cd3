//! Integration points for the external credential gateway
//!
//! doas never checks credentials itself. It drives a gateway through three
//! ordered calls: an account check (which verifies the principal's
//! credentials), session open before the command runs, and session close
//! after it exits.

use crate::error::{DoasError, Result};
use tracing::{debug, warn};

pub trait Authenticator {
    /// Verify the principal and check that the account may be used.
    fn account_management(&mut self) -> Result<()>;
    fn open_session(&mut self) -> Result<()>;
    fn close_session(&mut self) -> Result<()>;
}

/// Run the two calls that must succeed before the command may run.
pub fn authenticate(auth: &mut dyn Authenticator) -> Result<()> {
    auth.account_management()?;
    auth.open_session()?;
    debug!("Authentication succeeded");
    Ok(())
}

/// Close the session after the command has exited. Returns whether it
/// closed cleanly.
///
/// A failure here cannot undo anything that ran, so it is only reported.
pub fn finish(auth: &mut dyn Authenticator) -> bool {
    match auth.close_session() {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to close session: {}", e);
            eprintln!("doas: failed to close session: {}", e);
            false
        }
    }
}

/// Gateway for builds without PAM support. Rejects every principal.
#[derive(Debug, Default)]
pub struct UnavailableAuthenticator;

impl Authenticator for UnavailableAuthenticator {
    fn account_management(&mut self) -> Result<()> {
        Err(DoasError::Authentication(
            "built without authentication support".to_string(),
        ))
    }

    fn open_session(&mut self) -> Result<()> {
        Err(DoasError::Authentication(
            "built without authentication support".to_string(),
        ))
    }

    fn close_session(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "pam")]
pub use pam_gateway::PamAuthenticator;

#[cfg(feature = "pam")]
mod pam_gateway {
    //! Linux-PAM transaction driven through libpam directly, so every step
    //! (session close included) reports its own status.

    use super::Authenticator;
    use crate::error::{DoasError, Result};
    use nix::libc::{self, c_char, c_int, c_void};
    use std::ffi::{CStr, CString};
    use std::io::{BufRead, Write};
    use std::ptr;

    const PAM_SUCCESS: c_int = 0;
    const PAM_BUF_ERR: c_int = 5;
    const PAM_CONV_ERR: c_int = 19;

    const PAM_PROMPT_ECHO_OFF: c_int = 1;
    const PAM_PROMPT_ECHO_ON: c_int = 2;
    const PAM_ERROR_MSG: c_int = 3;
    const PAM_TEXT_INFO: c_int = 4;

    const PAM_ESTABLISH_CRED: c_int = 0x0002;
    const PAM_DELETE_CRED: c_int = 0x0004;

    #[repr(C)]
    struct PamHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    struct PamMessage {
        msg_style: c_int,
        msg: *const c_char,
    }

    #[repr(C)]
    struct PamResponse {
        resp: *mut c_char,
        resp_retcode: c_int,
    }

    type ConvFn = unsafe extern "C" fn(
        c_int,
        *mut *const PamMessage,
        *mut *mut PamResponse,
        *mut c_void,
    ) -> c_int;

    #[repr(C)]
    struct PamConv {
        conv: Option<ConvFn>,
        appdata_ptr: *mut c_void,
    }

    #[link(name = "pam")]
    extern "C" {
        fn pam_start(
            service: *const c_char,
            user: *const c_char,
            conv: *const PamConv,
            pamh: *mut *mut PamHandle,
        ) -> c_int;
        fn pam_end(pamh: *mut PamHandle, status: c_int) -> c_int;
        fn pam_authenticate(pamh: *mut PamHandle, flags: c_int) -> c_int;
        fn pam_acct_mgmt(pamh: *mut PamHandle, flags: c_int) -> c_int;
        fn pam_setcred(pamh: *mut PamHandle, flags: c_int) -> c_int;
        fn pam_open_session(pamh: *mut PamHandle, flags: c_int) -> c_int;
        fn pam_close_session(pamh: *mut PamHandle, flags: c_int) -> c_int;
        fn pam_strerror(pamh: *mut PamHandle, errnum: c_int) -> *const c_char;
    }

    fn answer(style: c_int, text: &str) -> Option<Option<String>> {
        match style {
            PAM_PROMPT_ECHO_OFF => rpassword::prompt_password(text).ok().map(Some),
            PAM_PROMPT_ECHO_ON => {
                eprint!("{}", text);
                std::io::stderr().flush().ok()?;
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line).ok()?;
                Some(Some(line.trim_end_matches('\n').to_string()))
            }
            PAM_ERROR_MSG | PAM_TEXT_INFO => {
                eprintln!("{}", text);
                Some(None)
            }
            _ => None,
        }
    }

    /// Frees the first `filled` replies and the reply array itself.
    unsafe fn free_replies(replies: *mut PamResponse, filled: usize) {
        for i in 0..filled {
            libc::free((*replies.add(i)).resp as *mut c_void);
        }
        libc::free(replies as *mut c_void);
    }

    unsafe extern "C" fn converse(
        num_msg: c_int,
        msg: *mut *const PamMessage,
        resp: *mut *mut PamResponse,
        _appdata: *mut c_void,
    ) -> c_int {
        if num_msg <= 0 || msg.is_null() || resp.is_null() {
            return PAM_CONV_ERR;
        }
        let count = num_msg as usize;

        // libpam frees the replies with free(3)
        let replies =
            libc::calloc(count, std::mem::size_of::<PamResponse>()) as *mut PamResponse;
        if replies.is_null() {
            return PAM_BUF_ERR;
        }

        for i in 0..count {
            let message = &**msg.add(i);
            let text = if message.msg.is_null() {
                String::new()
            } else {
                CStr::from_ptr(message.msg).to_string_lossy().into_owned()
            };

            let reply = match answer(message.msg_style, &text) {
                Some(Some(reply)) => reply,
                Some(None) => continue,
                None => {
                    free_replies(replies, i);
                    return PAM_CONV_ERR;
                }
            };
            let Ok(reply) = CString::new(reply) else {
                free_replies(replies, i);
                return PAM_CONV_ERR;
            };
            (*replies.add(i)).resp = libc::strdup(reply.as_ptr());
        }

        *resp = replies;
        PAM_SUCCESS
    }

    /// PAM-backed gateway. Prompts come from the PAM stack and are answered
    /// on the controlling terminal.
    pub struct PamAuthenticator {
        service: String,
        user: String,
        handle: *mut PamHandle,
        conv: Box<PamConv>,
        session_open: bool,
        last_status: c_int,
    }

    impl PamAuthenticator {
        pub fn new(service: &str, user: &str) -> Self {
            Self {
                service: service.to_string(),
                user: user.to_string(),
                handle: ptr::null_mut(),
                conv: Box::new(PamConv {
                    conv: Some(converse),
                    appdata_ptr: ptr::null_mut(),
                }),
                session_open: false,
                last_status: PAM_SUCCESS,
            }
        }

        fn check(&mut self, step: &str, status: c_int) -> Result<()> {
            self.last_status = status;
            if status == PAM_SUCCESS {
                return Ok(());
            }
            // SAFETY: pam_strerror returns a static string for any status.
            let reason = unsafe { CStr::from_ptr(pam_strerror(self.handle, status)) };
            Err(DoasError::Authentication(format!(
                "{}: {}",
                step,
                reason.to_string_lossy()
            )))
        }

        fn handle(&self) -> Result<*mut PamHandle> {
            if self.handle.is_null() {
                return Err(DoasError::Authentication("not authenticated".to_string()));
            }
            Ok(self.handle)
        }
    }

    impl Authenticator for PamAuthenticator {
        fn account_management(&mut self) -> Result<()> {
            let service = CString::new(self.service.as_str())
                .map_err(|_| DoasError::Authentication("invalid service name".to_string()))?;
            let user = CString::new(self.user.as_str())
                .map_err(|_| DoasError::Authentication("invalid user name".to_string()))?;

            let mut handle = ptr::null_mut();
            // SAFETY: all pointers are valid for the call; `conv` outlives the handle.
            let status =
                unsafe { pam_start(service.as_ptr(), user.as_ptr(), &*self.conv, &mut handle) };
            if status != PAM_SUCCESS || handle.is_null() {
                return Err(DoasError::Authentication(format!(
                    "pam_start failed with status {}",
                    status
                )));
            }
            self.handle = handle;

            // SAFETY: `handle` came from a successful pam_start.
            let status = unsafe { pam_authenticate(handle, 0) };
            self.check("pam_authenticate", status)?;
            let status = unsafe { pam_acct_mgmt(handle, 0) };
            self.check("pam_acct_mgmt", status)
        }

        fn open_session(&mut self) -> Result<()> {
            let handle = self.handle()?;
            // SAFETY: `handle` is live until Drop.
            let status = unsafe { pam_setcred(handle, PAM_ESTABLISH_CRED) };
            self.check("pam_setcred", status)?;
            let status = unsafe { pam_open_session(handle, 0) };
            self.check("pam_open_session", status)?;
            self.session_open = true;
            Ok(())
        }

        fn close_session(&mut self) -> Result<()> {
            let handle = self.handle()?;
            if !self.session_open {
                return Ok(());
            }
            self.session_open = false;

            // SAFETY: `handle` is live until Drop.
            let closed = unsafe { pam_close_session(handle, 0) };
            let deleted = unsafe { pam_setcred(handle, PAM_DELETE_CRED) };
            self.check("pam_close_session", closed)?;
            self.check("pam_setcred", deleted)
        }
    }

    impl Drop for PamAuthenticator {
        fn drop(&mut self) {
            if self.handle.is_null() {
                return;
            }
            // SAFETY: ends the transaction started in account_management.
            unsafe {
                if self.session_open {
                    pam_close_session(self.handle, 0);
                }
                pam_end(self.handle, self.last_status);
            }
            self.handle = ptr::null_mut();
        }
    }
}

/// Gateway for this build.
pub fn gateway(service: &str, user: &str) -> Box<dyn Authenticator> {
    #[cfg(feature = "pam")]
    {
        Box::new(PamAuthenticator::new(service, user))
    }

    #[cfg(not(feature = "pam"))]
    {
        debug!("No gateway for {} ({}), authentication will fail", user, service);
        Box::new(UnavailableAuthenticator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scripted {
        calls: Vec<&'static str>,
        reject_account: bool,
        reject_open: bool,
        reject_close: bool,
    }

    impl Authenticator for Scripted {
        fn account_management(&mut self) -> Result<()> {
            self.calls.push("account");
            if self.reject_account {
                return Err(DoasError::Authentication("bad password".to_string()));
            }
            Ok(())
        }

        fn open_session(&mut self) -> Result<()> {
            self.calls.push("open");
            if self.reject_open {
                return Err(DoasError::Authentication("session refused".to_string()));
            }
            Ok(())
        }

        fn close_session(&mut self) -> Result<()> {
            self.calls.push("close");
            if self.reject_close {
                return Err(DoasError::Authentication("close failed".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_authenticate_order() {
        let mut auth = Scripted::default();
        authenticate(&mut auth).unwrap();
        assert!(finish(&mut auth));
        assert_eq!(auth.calls, vec!["account", "open", "close"]);
    }

    #[test]
    fn test_rejected_account_skips_session() {
        let mut auth = Scripted {
            reject_account: true,
            ..Default::default()
        };
        assert!(matches!(authenticate(&mut auth), Err(DoasError::Authentication(_))));
        assert_eq!(auth.calls, vec!["account"]);
    }

    #[test]
    fn test_rejected_session_open_fails() {
        let mut auth = Scripted {
            reject_open: true,
            ..Default::default()
        };
        assert!(authenticate(&mut auth).is_err());
        assert_eq!(auth.calls, vec!["account", "open"]);
    }

    #[test]
    fn test_close_failure_is_reported_only() {
        let mut auth = Scripted {
            reject_close: true,
            ..Default::default()
        };
        authenticate(&mut auth).unwrap();
        assert!(!finish(&mut auth));
        assert_eq!(auth.calls.last(), Some(&"close"));
    }

    #[test]
    fn test_unavailable_gateway_rejects() {
        let mut auth = UnavailableAuthenticator;
        assert!(matches!(authenticate(&mut auth), Err(DoasError::Authentication(_))));
    }
}

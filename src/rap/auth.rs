//! AUTHENTICATE handling: drive PAM, then drop privileges irrevocably
//! (spec §4.2 "AUTHENTICATE", §9 "PAM conversation").

use std::ffi::{CStr, CString};
use std::io;

use crate::pam;
use crate::wire::{Kind, Message};

/// State a RAP carries once it has successfully authenticated. Everything
/// after this point runs as `user`.
pub struct Session {
    pub user: String,
}

/// Handle one `AUTHENTICATE` request. On success, the calling process has
/// already dropped to the target uid/gid by the time this returns -- there
/// is no path back to the privileged identity (spec §4.2: "Subsequent
/// failure to drop privileges is fatal").
pub fn handle(msg: &Message, pam_service: &str) -> Result<Session, Message> {
    let user = msg.buf_str(0).unwrap_or("");
    let password = msg.buf_str(1).unwrap_or("");
    let rhost = msg.buf_str(2).unwrap_or("");

    if user.is_empty() {
        return Err(Message::new(Kind::AuthFailed));
    }

    let pam_session = match pam::authenticate(pam_service, user, password, rhost) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("PAM authentication failed for {user}: {e}");
            return Err(Message::new(Kind::AuthFailed));
        }
    };

    if let Err(e) = drop_privileges(&pam_session.user, &pam_session.env) {
        // Spec §4.2: a RAP that cannot drop privileges after a successful
        // PAM conversation must not continue running with ambient
        // privilege. There is no recoverable reply for this; exit.
        log::error!("fatal: could not drop privileges to {}: {e}", pam_session.user);
        std::process::exit(1);
    }

    Ok(Session { user: pam_session.user })
}

/// Resolve `user` to a uid/gid, drop supplementary groups to just that
/// user's, set gid then uid (order matters: uid must drop last), clear the
/// process environment and replace it with PAM's (spec §4.2).
fn drop_privileges(user: &str, env: &[(String, String)]) -> io::Result<()> {
    let (uid, gid) = lookup_user(user)?;

    let user_c = CString::new(user).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let rc = unsafe { libc::initgroups(user_c.as_ptr(), gid) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::setgid(gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // Irrevocability check: if we still had privilege to regain root, one of
    // the above would not have taken effect as expected. Verify we can no
    // longer get back to uid 0.
    if unsafe { libc::setuid(0) } == 0 {
        return Err(io::Error::new(io::ErrorKind::Other, "privilege drop did not stick"));
    }

    for (k, _) in std::env::vars() {
        std::env::remove_var(k);
    }
    for (k, v) in env {
        std::env::set_var(k, v);
    }

    Ok(())
}

fn lookup_user(user: &str) -> io::Result<(libc::uid_t, libc::gid_t)> {
    let user_c = CString::new(user).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0i8; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwnam_r(
            user_c.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    if result.is_null() {
        return Err(io::Error::new(io::ErrorKind::NotFound, format!("no such user: {user}")));
    }
    let _ = unsafe { CStr::from_ptr(pwd.pw_name) };
    Ok((pwd.pw_uid, pwd.pw_gid))
}

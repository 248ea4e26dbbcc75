//! Raw `libpam` bindings and a minimal safe authenticator (spec §4.2,
//! §9 "PAM conversation").
//!
//! No Rust PAM crate appears anywhere in the reference corpus, so this
//! follows the same raw-`extern "C"` FFI approach already used for
//! `SCM_RIGHTS` fd passing in `wire.rs`: bind the handful of functions the
//! conversation actually needs, nothing more.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;

const PAM_SUCCESS: c_int = 0;
const PAM_PROMPT_ECHO_OFF: c_int = 1;
const PAM_SILENT: c_int = 0x8000;
const PAM_ESTABLISH_CRED: c_int = 2;

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

#[repr(C)]
struct PamConv {
    conv: extern "C" fn(
        num_msg: c_int,
        msg: *mut *const PamMessage,
        resp: *mut *mut PamResponse,
        appdata_ptr: *mut c_void,
    ) -> c_int,
    appdata_ptr: *mut c_void,
}

#[allow(non_camel_case_types)]
enum pam_handle_t {}

#[link(name = "pam")]
extern "C" {
    fn pam_start(
        service_name: *const c_char,
        user: *const c_char,
        pam_conversation: *const PamConv,
        pamh: *mut *mut pam_handle_t,
    ) -> c_int;
    fn pam_authenticate(pamh: *mut pam_handle_t, flags: c_int) -> c_int;
    fn pam_acct_mgmt(pamh: *mut pam_handle_t, flags: c_int) -> c_int;
    fn pam_setcred(pamh: *mut pam_handle_t, flags: c_int) -> c_int;
    fn pam_open_session(pamh: *mut pam_handle_t, flags: c_int) -> c_int;
    fn pam_end(pamh: *mut pam_handle_t, pam_status: c_int) -> c_int;
    fn pam_set_item(pamh: *mut pam_handle_t, item_type: c_int, item: *const c_void) -> c_int;
    fn pam_get_item(pamh: *const pam_handle_t, item_type: c_int, item: *mut *const c_void) -> c_int;
    fn pam_getenvlist(pamh: *mut pam_handle_t) -> *mut *mut c_char;
    fn pam_strerror(pamh: *mut pam_handle_t, errnum: c_int) -> *const c_char;
}

const PAM_USER: c_int = 2;
const PAM_RHOST: c_int = 4;

/// Answers the PAM conversation with a single stored password, matching
/// the source's `appdata_ptr`-carried-password, `num_msg == 1` assumption.
/// Logs and fails on anything else (spec §9).
extern "C" fn conversation_fn(
    num_msg: c_int,
    msg: *mut *const PamMessage,
    resp: *mut *mut PamResponse,
    appdata_ptr: *mut c_void,
) -> c_int {
    if num_msg != 1 {
        log::error!("PAM conversation requested {num_msg} messages, expected 1");
        return 1; // PAM_CONV_ERR
    }
    unsafe {
        let message = &**msg;
        if message.msg_style != PAM_PROMPT_ECHO_OFF {
            log::error!("unexpected PAM message style {}", message.msg_style);
            return 1;
        }
        let password = &*(appdata_ptr as *const CString);
        let reply = libc::malloc(std::mem::size_of::<PamResponse>()) as *mut PamResponse;
        if reply.is_null() {
            return 1;
        }
        (*reply).resp = libc::strdup(password.as_ptr());
        (*reply).resp_retcode = 0;
        let responses = libc::malloc(std::mem::size_of::<PamResponse>()) as *mut PamResponse;
        if responses.is_null() {
            libc::free(reply as *mut c_void);
            return 1;
        }
        ptr::copy_nonoverlapping(reply, responses, 1);
        libc::free(reply as *mut c_void);
        *resp = responses;
    }
    PAM_SUCCESS
}

#[derive(Debug)]
pub struct PamError(pub String);

impl std::fmt::Display for PamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PAM error: {}", self.0)
    }
}

impl std::error::Error for PamError {}

/// The outcome of a successful authentication: the canonicalized user name
/// and the environment PAM wants installed in the process (spec §4.2:
/// "reads the resulting environment list, clears the process environment
/// and replaces it with PAM's").
pub struct PamSession {
    pub user: String,
    pub env: Vec<(String, String)>,
}

/// Drive one PAM conversation to completion: authenticate, account
/// management, credential establishment, session open (spec §4.2).
/// Consumes the password (kept alive only long enough for the
/// conversation callback to read it).
pub fn authenticate(service: &str, user: &str, password: &str, rhost: &str) -> Result<PamSession, PamError> {
    let service_c = CString::new(service).map_err(|e| PamError(e.to_string()))?;
    let user_c = CString::new(user).map_err(|e| PamError(e.to_string()))?;
    let password_c = CString::new(password).map_err(|e| PamError(e.to_string()))?;
    let rhost_c = CString::new(rhost).map_err(|e| PamError(e.to_string()))?;

    let conv = PamConv {
        conv: conversation_fn,
        appdata_ptr: &password_c as *const CString as *mut c_void,
    };

    let mut pamh: *mut pam_handle_t = ptr::null_mut();
    let rc = unsafe { pam_start(service_c.as_ptr(), user_c.as_ptr(), &conv, &mut pamh) };
    if rc != PAM_SUCCESS {
        return Err(PamError(format!("pam_start failed with code {rc}")));
    }

    let result = drive_session(pamh, &rhost_c, user);
    let end_status = match &result {
        Ok(_) => PAM_SUCCESS,
        Err(_) => 1,
    };
    unsafe { pam_end(pamh, end_status) };
    result
}

fn drive_session(pamh: *mut pam_handle_t, rhost_c: &CString, user: &str) -> Result<PamSession, PamError> {
    unsafe {
        let rc = pam_set_item(pamh, PAM_RHOST, rhost_c.as_ptr() as *const c_void);
        if rc != PAM_SUCCESS {
            return Err(pam_err(pamh, rc, "pam_set_item(PAM_RHOST)"));
        }

        let rc = pam_authenticate(pamh, PAM_SILENT);
        if rc != PAM_SUCCESS {
            return Err(pam_err(pamh, rc, "pam_authenticate"));
        }

        let rc = pam_acct_mgmt(pamh, PAM_SILENT);
        if rc != PAM_SUCCESS {
            return Err(pam_err(pamh, rc, "pam_acct_mgmt"));
        }

        let rc = pam_setcred(pamh, PAM_ESTABLISH_CRED);
        if rc != PAM_SUCCESS {
            return Err(pam_err(pamh, rc, "pam_setcred"));
        }

        let rc = pam_open_session(pamh, PAM_SILENT);
        if rc != PAM_SUCCESS {
            return Err(pam_err(pamh, rc, "pam_open_session"));
        }

        let canonical_user = get_canonical_user(pamh).unwrap_or_else(|| user.to_string());
        let env = read_envlist(pamh);
        Ok(PamSession { user: canonical_user, env })
    }
}

/// Read back `PAM_USER` after a successful conversation, matching `rap.c`'s
/// `pamAuthenticate`'s `pam_get_item(pamh, PAM_USER, (const void **) &user)`
/// call used for `lockToUser`. A module can rewrite the username during
/// `pam_authenticate`/`pam_acct_mgmt` (e.g. case-folding, aliasing), so the
/// canonicalized value -- not the raw Basic-auth input -- is what the RAP
/// locks itself to and what the pool/access-log key on (spec §3: "`user`
/// (canonicalized by PAM)").
unsafe fn get_canonical_user(pamh: *const pam_handle_t) -> Option<String> {
    let mut item: *const c_void = ptr::null();
    let rc = pam_get_item(pamh, PAM_USER, &mut item);
    if rc != PAM_SUCCESS || item.is_null() {
        return None;
    }
    CStr::from_ptr(item as *const c_char).to_str().ok().map(str::to_string)
}

unsafe fn read_envlist(pamh: *mut pam_handle_t) -> Vec<(String, String)> {
    let list = pam_getenvlist(pamh);
    if list.is_null() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut i = 0isize;
    loop {
        let entry = *list.offset(i);
        if entry.is_null() {
            break;
        }
        if let Ok(s) = CStr::from_ptr(entry).to_str() {
            if let Some((k, v)) = s.split_once('=') {
                out.push((k.to_string(), v.to_string()));
            }
        }
        libc::free(entry as *mut c_void);
        i += 1;
    }
    libc::free(list as *mut c_void);
    out
}

unsafe fn pam_err(pamh: *mut pam_handle_t, rc: c_int, what: &str) -> PamError {
    let msg = pam_strerror(pamh, rc);
    let desc = if msg.is_null() {
        "unknown".to_string()
    } else {
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    };
    PamError(format!("{what}: {desc}"))
}

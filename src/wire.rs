//! Framed control protocol and fd-passing wire format between the server
//! and a RAP child (spec §3, §4.1).
//!
//! The transport is a `SOCK_SEQPACKET` UNIX-domain socket: every `send`
//! writes exactly one datagram, every `recv` reads exactly one. The
//! standard library does not expose `SOCK_SEQPACKET`, so [`Channel`] wraps
//! a raw fd obtained from `libc::socketpair` and speaks to it directly with
//! `sendmsg`/`recvmsg`, the same ancillary-data dance used for SCM_RIGHTS
//! fd passing elsewhere in this codebase's lineage.

use std::io;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::errors::WireError;

/// Up to this many length-prefixed buffers travel inline in one message
/// (spec §3: "an ordered sequence of up to N (implementation constant,
/// >=4)").
pub const MAX_BUFFERS: usize = 4;

/// Scratch space a caller must supply to `Channel::recv`; ample for any
/// control message (bulk data never travels inline, only via the attached
/// fd).
pub const INCOMING_BUFFER_SIZE: usize = 64 * 1024;

/// The tagged kind of a [`Message`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Kind {
    // Requests, server -> RAP
    Authenticate = 0,
    ReadFile = 1,
    WriteFile = 2,
    Propfind = 3,
    // Responses, RAP -> server
    Success = 10,
    Multistatus = 11,
    Continue = 12,
    AccessDenied = 13,
    NotFound = 14,
    BadClientRequest = 15,
    BadRapRequest = 16,
    AuthFailed = 17,
    InternalError = 18,
    InsufficientStorage = 19,
    Conflict = 20,
}

impl Kind {
    fn from_u32(v: u32) -> Result<Kind, WireError> {
        use Kind::*;
        Ok(match v {
            0 => Authenticate,
            1 => ReadFile,
            2 => WriteFile,
            3 => Propfind,
            10 => Success,
            11 => Multistatus,
            12 => Continue,
            13 => AccessDenied,
            14 => NotFound,
            15 => BadClientRequest,
            16 => BadRapRequest,
            17 => AuthFailed,
            18 => InternalError,
            19 => InsufficientStorage,
            20 => Conflict,
            other => return Err(WireError::Framing(format!("unknown message kind {other}"))),
        })
    }
}

/// One framed message: a kind, up to [`MAX_BUFFERS`] length-prefixed byte
/// buffers (meaning is positional and kind-specific, spec §3's table), and
/// at most one attached file descriptor.
///
/// Ownership of `fd` transfers on send: `Channel::send` always consumes it,
/// closing it whether or not the send succeeds (spec §4.1, §9 "fd ownership
/// discipline"). `Channel::recv` hands back an owned fd the caller must
/// eventually close or pass on.
#[derive(Debug)]
pub struct Message {
    pub kind: Kind,
    pub buffers: Vec<Vec<u8>>,
    pub fd: Option<OwnedFd>,
}

impl Message {
    pub fn new(kind: Kind) -> Message {
        Message {
            kind,
            buffers: Vec::new(),
            fd: None,
        }
    }

    pub fn with_buffers(kind: Kind, buffers: Vec<Vec<u8>>) -> Message {
        Message {
            kind,
            buffers,
            fd: None,
        }
    }

    pub fn with_fd(mut self, fd: OwnedFd) -> Message {
        self.fd = Some(fd);
        self
    }

    pub fn buf_str(&self, i: usize) -> Option<&str> {
        self.buffers.get(i).and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// A `SOCK_SEQPACKET` endpoint, either end of a socketpair created for one
/// server<->RAP session.
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Create a connected pair suitable for handing one end to a forked
    /// child (stdin/stdout, per spec §6 "RAP invocation").
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: socketpair() just populated both fds; each is valid and owned
        // exclusively by us from here on.
        unsafe {
            Ok((
                Channel { fd: OwnedFd::from_raw_fd(fds[0]) },
                Channel { fd: OwnedFd::from_raw_fd(fds[1]) },
            ))
        }
    }

    /// Wrap a fd this process already owns (e.g. stdin in the RAP child).
    ///
    /// # Safety
    /// `fd` must be a valid, open, exclusively-owned descriptor.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Channel {
        Channel { fd: OwnedFd::from_raw_fd(fd) }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicate the underlying fd without consuming `self`, useful when a
    /// value must be moved into a forked child that still shares the parent
    /// end's lifetime management.
    pub fn try_clone(&self) -> io::Result<Channel> {
        let fd = self.fd.as_raw_fd();
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Channel { fd: unsafe { OwnedFd::from_raw_fd(dup) } })
    }

    /// Send one message, atomically. Always consumes `msg.fd` (closed by
    /// virtue of `OwnedFd`'s drop, whether or not sendmsg succeeds -- the fd
    /// is moved into this call's scope, so a `?` bail-out still drops it).
    pub fn send(&self, msg: Message) -> Result<(), WireError> {
        if msg.buffers.len() > MAX_BUFFERS {
            return Err(WireError::Framing(format!(
                "{} buffers exceeds MAX_BUFFERS",
                msg.buffers.len()
            )));
        }

        let mut header = Vec::with_capacity(8 + MAX_BUFFERS * 4);
        header.extend_from_slice(&(msg.kind as u32).to_be_bytes());
        header.extend_from_slice(&(msg.buffers.len() as u32).to_be_bytes());
        for b in &msg.buffers {
            header.extend_from_slice(&(b.len() as u32).to_be_bytes());
        }

        let mut payload = header;
        for b in &msg.buffers {
            payload.extend_from_slice(b);
        }

        let fd = msg.fd; // owned here; dropped (closed) at end of scope regardless of outcome.
        self.send_raw(&payload, fd.as_ref().map(|f| f.as_raw_fd()))?;
        Ok(())
    }

    fn send_raw(&self, data: &[u8], fd: Option<RawFd>) -> Result<(), WireError> {
        let mut iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };

        let mut cmsg_buf;
        let (control_ptr, control_len) = match fd {
            Some(fd) => {
                let space = unsafe { libc::CMSG_SPACE(size_of::<libc::c_int>() as u32) } as usize;
                cmsg_buf = vec![0u8; space];
                let msg_ptr = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
                // Build a throwaway msghdr just so CMSG_FIRSTHDR has something to
                // anchor on; msg_control/msg_controllen are filled below too.
                let mut tmp_msg = libc::msghdr {
                    msg_name: std::ptr::null_mut(),
                    msg_namelen: 0,
                    msg_iov: &mut iov,
                    msg_iovlen: 1,
                    msg_control: msg_ptr,
                    msg_controllen: space as _,
                    msg_flags: 0,
                };
                unsafe {
                    let cmsg = libc::CMSG_FIRSTHDR(&tmp_msg);
                    (*cmsg).cmsg_level = libc::SOL_SOCKET;
                    (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                    (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<libc::c_int>() as u32) as _;
                    let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
                    std::ptr::write_unaligned(data_ptr, fd);
                }
                let _ = &mut tmp_msg;
                (msg_ptr, space)
            }
            None => (std::ptr::null_mut(), 0),
        };

        let msg = libc::msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: control_ptr,
            msg_controllen: control_len as _,
            msg_flags: 0,
        };

        let n = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if n < 0 {
            return Err(WireError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Read exactly one packet and parse it. `scratch` is reused across
    /// calls by the caller to avoid reallocating; at least
    /// [`INCOMING_BUFFER_SIZE`] bytes are recommended.
    pub fn recv(&self, scratch: &mut Vec<u8>) -> Result<Message, WireError> {
        if scratch.len() < INCOMING_BUFFER_SIZE {
            scratch.resize(INCOMING_BUFFER_SIZE, 0);
        }

        let fd_size = size_of::<libc::c_int>();
        let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut iov = libc::iovec {
            iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
            iov_len: scratch.len(),
        };
        let mut msg = libc::msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
            msg_controllen: cmsg_space as _,
            msg_flags: 0,
        };

        let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            return Err(WireError::Io(io::Error::last_os_error()));
        }
        if n == 0 {
            return Err(WireError::Eof);
        }
        let n = n as usize;

        let mut fd = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let data_ptr = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                    let raw: RawFd = std::ptr::read_unaligned(data_ptr);
                    fd = Some(OwnedFd::from_raw_fd(raw));
                    break;
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        parse_message(&scratch[..n], fd)
    }
}

fn parse_message(data: &[u8], fd: Option<OwnedFd>) -> Result<Message, WireError> {
    if data.len() < 8 {
        return Err(WireError::Framing("packet shorter than header".into()));
    }
    let kind = Kind::from_u32(u32::from_be_bytes(data[0..4].try_into().unwrap()))?;
    let buffer_count = u32::from_be_bytes(data[4..8].try_into().unwrap()) as usize;
    if buffer_count > MAX_BUFFERS {
        return Err(WireError::Framing(format!(
            "buffer_count {buffer_count} exceeds MAX_BUFFERS"
        )));
    }

    let lens_end = 8 + buffer_count * 4;
    if data.len() < lens_end {
        return Err(WireError::Framing("packet truncated in length table".into()));
    }
    let mut lens = Vec::with_capacity(buffer_count);
    for i in 0..buffer_count {
        let off = 8 + i * 4;
        lens.push(u32::from_be_bytes(data[off..off + 4].try_into().unwrap()) as usize);
    }

    let mut buffers = Vec::with_capacity(buffer_count);
    let mut off = lens_end;
    for len in lens {
        let end = off.checked_add(len).ok_or_else(|| WireError::Framing("length overflow".into()))?;
        if data.len() < end {
            return Err(WireError::Framing("packet truncated in payload".into()));
        }
        buffers.push(data[off..end].to_vec());
        off = end;
    }

    Ok(Message { kind, buffers, fd })
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Channel {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_no_fd() {
        let (a, b) = Channel::pair().unwrap();
        let msg = Message::with_buffers(
            Kind::Authenticate,
            vec![b"alice".to_vec(), b"hunter2".to_vec(), b"client.example".to_vec()],
        );
        a.send(msg).unwrap();

        let mut scratch = Vec::new();
        let got = b.recv(&mut scratch).unwrap();
        assert_eq!(got.kind, Kind::Authenticate);
        assert_eq!(got.buf_str(0), Some("alice"));
        assert_eq!(got.buf_str(1), Some("hunter2"));
        assert_eq!(got.buf_str(2), Some("client.example"));
        assert!(got.fd.is_none());
    }

    #[test]
    fn roundtrip_with_fd() {
        let (a, b) = Channel::pair().unwrap();

        let (r, w) = Channel::pair().unwrap(); // just need some valid fd to pass
        drop(w);
        let passed_raw = r.as_raw_fd();
        let msg = Message::with_buffers(Kind::Success, vec![b"1700000000".to_vec()])
            .with_fd(unsafe { OwnedFd::from_raw_fd(r.into_raw_fd()) });
        a.send(msg).unwrap();

        let mut scratch = Vec::new();
        let got = b.recv(&mut scratch).unwrap();
        assert_eq!(got.kind, Kind::Success);
        let got_fd = got.fd.expect("fd should have been attached");
        assert_ne!(got_fd.as_raw_fd(), passed_raw, "receiver gets a distinct fd number");
    }

    #[test]
    fn oversized_buffer_count_is_framing_error() {
        let mut data = Vec::new();
        data.extend_from_slice(&(Kind::ReadFile as u32).to_be_bytes());
        data.extend_from_slice(&((MAX_BUFFERS as u32) + 1).to_be_bytes());
        let err = parse_message(&data, None).unwrap_err();
        assert!(matches!(err, WireError::Framing(_)));
    }

    #[test]
    fn unknown_kind_is_framing_error() {
        let mut data = Vec::new();
        data.extend_from_slice(&999u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        let err = parse_message(&data, None).unwrap_err();
        assert!(matches!(err, WireError::Framing(_)));
    }
}

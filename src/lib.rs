//! Privilege-separated WebDAV/HTTP(S) server.
//!
//! Two binaries share this crate: `webdavd`, the long-lived privileged
//! front-end that speaks HTTP/TLS and never touches a user's files
//! directly, and `rap`, a short-lived child that drops to one
//! authenticated user's uid/gid and performs the actual filesystem I/O.
//! They communicate over a `SOCK_SEQPACKET` control channel that also
//! carries passed file descriptors ([`wire`]).

pub mod accesslog;
pub mod config;
pub mod errorpages;
pub mod errors;
pub mod mime;
pub mod pam;
pub mod pool;
pub mod propfind;
pub mod rap;
pub mod server;
pub mod tls;
pub mod util;
pub mod wire;

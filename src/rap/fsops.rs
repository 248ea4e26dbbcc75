//! RAP-side filesystem operations: READ_FILE, WRITE_FILE, PROPFIND
//! (spec §4.2). Each handler owns sending its own reply (or replies, for
//! WRITE_FILE's CONTINUE/final pair) over the control channel.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::RapError;
use crate::mime::MimeTable;
use crate::propfind::{self, Depth, PropertySet, PropfindEntry};
use crate::wire::{Channel, Kind, Message};

// Matches the original rap.c upload loop's `char buffer[40960]`.
const COPY_CHUNK: usize = 40 * 1024;

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn error_reply(e: RapError) -> Message {
    let kind = match e {
        RapError::AccessDenied => Kind::AccessDenied,
        RapError::NotFound => Kind::NotFound,
        RapError::Conflict => Kind::Conflict,
        RapError::BadClientRequest => Kind::BadClientRequest,
        RapError::BadRapRequest => Kind::BadRapRequest,
        RapError::InternalError => Kind::InternalError,
        RapError::InsufficientStorage => Kind::InsufficientStorage,
    };
    Message::new(kind)
}

/// `GET` (spec §4.2 "READ_FILE"). Opens `path` read-only; a regular file is
/// attached directly, a directory gets a freshly generated HTML index
/// streamed through a pipe.
pub fn read_file(channel: &Channel, mime: &MimeTable, msg: Message) -> Result<(), crate::errors::WireError> {
    let path = msg.buf_str(1).unwrap_or("");

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => return channel.send(error_reply(RapError::from_io(&e, RapError::NotFound))),
    };
    let meta = match file.metadata() {
        Ok(m) => m,
        Err(e) => return channel.send(error_reply(RapError::from_io(&e, RapError::NotFound))),
    };

    if meta.is_dir() {
        let (read_fd, write_fd) = match make_pipe() {
            Ok(p) => p,
            Err(_) => return channel.send(error_reply(RapError::InternalError)),
        };
        // Directory listings are not cacheable: always "now", not the
        // directory's own mtime (spec §4.2).
        let reply = Message::with_buffers(
            Kind::Success,
            vec![now_secs().to_string().into_bytes(), b"text/html".to_vec(), path.as_bytes().to_vec()],
        )
        .with_fd(read_fd);
        channel.send(reply)?;
        write_directory_index(path, write_fd);
        Ok(())
    } else {
        let mtime = meta.mtime();
        let mime_type = mime.lookup(path);
        let reply = Message::with_buffers(
            Kind::Success,
            vec![mtime.to_string().into_bytes(), mime_type.as_bytes().to_vec(), path.as_bytes().to_vec()],
        )
        .with_fd(OwnedFd::from(file));
        channel.send(reply)
    }
}

/// Writes a minimal HTML index of non-dot entries to `write_fd`, closing it
/// when done (spec §4.2: "skip `.`, `..`, and hidden dot-files").
fn write_directory_index(path: &str, write_fd: OwnedFd) {
    let mut out = File::from(write_fd);
    let _ = writeln!(out, "<!DOCTYPE html><html><body><ul>");
    let entries = match fs::read_dir(path) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("could not list directory {path}: {e}");
            let _ = writeln!(out, "</ul></body></html>");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let href = if is_dir { format!("{name}/") } else { name.to_string() };
        let _ = writeln!(out, "<li><a href=\"{href}\">{href}</a></li>");
    }
    let _ = writeln!(out, "</ul></body></html>");
}

/// `PUT` (spec §4.2 "WRITE_FILE"). Opens `path` write-only -- deliberately
/// without `O_CREAT` (spec §9: "PUT opens without O_CREAT"), replies
/// `CONTINUE`, then copies from the attached body pipe until EOF.
pub fn write_file(channel: &Channel, msg: Message) -> Result<(), crate::errors::WireError> {
    let path = msg.buf_str(1).unwrap_or("").to_string();
    let body_fd = match msg.fd {
        Some(fd) => fd,
        None => return channel.send(error_reply(RapError::BadRapRequest)),
    };

    let mut file = match fs::OpenOptions::new().write(true).open(&path) {
        Ok(f) => f,
        Err(e) => return channel.send(error_reply(RapError::from_io(&e, RapError::Conflict))),
    };

    channel.send(Message::new(Kind::Continue))?;

    let mut body = File::from(body_fd);
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
            Err(_) => return channel.send(error_reply(RapError::InternalError)),
        };
        match file.write(&buf[..n]) {
            Ok(written) if written == n => {}
            Ok(_) => return channel.send(error_reply(RapError::InsufficientStorage)),
            Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => {
                return channel.send(error_reply(RapError::InsufficientStorage))
            }
            Err(_) => return channel.send(error_reply(RapError::InternalError)),
        }
    }

    channel.send(Message::new(Kind::Success))
}

/// `PROPFIND` (spec §4.2). Parses the attached XML body into a
/// [`PropertySet`], stats `path`, and streams a `<d:multistatus>` document
/// back through a pipe.
pub fn propfind(channel: &Channel, mime: &MimeTable, msg: Message) -> Result<(), crate::errors::WireError> {
    let path = msg.buf_str(1).unwrap_or("").to_string();
    let depth = Depth::parse(msg.buf_str(2).unwrap_or("infinity"));

    let mut body = Vec::new();
    if let Some(fd) = msg.fd {
        if let Err(e) = File::from(fd).read_to_end(&mut body) {
            log::warn!("failed to read PROPFIND body: {e}");
        }
    }

    let properties = match PropertySet::parse(&body) {
        Ok(p) => p,
        Err(e) => return channel.send(error_reply(e)),
    };

    let meta = match fs::metadata(&path) {
        Ok(m) => m,
        Err(e) => return channel.send(error_reply(RapError::from_io(&e, RapError::NotFound))),
    };

    let root = entry_for(&path, &meta, mime);
    let mut children = Vec::new();
    if depth == Depth::One && meta.is_dir() {
        if let Ok(dir) = fs::read_dir(&path) {
            for e in dir.flatten() {
                let name = e.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                if let Ok(child_meta) = e.metadata() {
                    let href = format!("{}/{name}", path.trim_end_matches('/'));
                    children.push(entry_for(&href, &child_meta, mime));
                }
            }
        }
    }

    let (read_fd, write_fd) = match make_pipe() {
        Ok(p) => p,
        Err(_) => return channel.send(error_reply(RapError::InternalError)),
    };
    let reply = Message::with_buffers(
        Kind::Multistatus,
        vec![
            now_secs().to_string().into_bytes(),
            b"application/xml; charset=utf-8".to_vec(),
            path.as_bytes().to_vec(),
        ],
    )
    .with_fd(read_fd);
    channel.send(reply)?;

    let out = File::from(write_fd);
    if let Err(e) = propfind::write_multistatus(out, &properties, &root, &children) {
        log::warn!("error writing multistatus document for {path}: {e}");
    }
    Ok(())
}

fn entry_for(href: &str, meta: &fs::Metadata, mime: &MimeTable) -> PropfindEntry {
    let is_dir = meta.is_dir();
    let (quota_used_bytes, quota_available_bytes) = if is_dir {
        statvfs_quota(href)
    } else {
        (None, None)
    };
    PropfindEntry {
        href: if is_dir && !href.ends_with('/') { format!("{href}/") } else { href.to_string() },
        is_dir,
        size: meta.len(),
        mtime_secs: meta.mtime(),
        ctime_secs: meta.ctime(),
        content_type: mime.lookup(href).to_string(),
        quota_available_bytes,
        quota_used_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("webdavd-fsops-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn req(kind: Kind, bufs: Vec<Vec<u8>>) -> Message {
        Message::with_buffers(kind, bufs)
    }

    #[test]
    fn read_file_attaches_fd_with_mime_type() {
        let dir = temp_dir("read-success");
        let path = dir.join("a.txt");
        fs::write(&path, b"hello").unwrap();
        let mime = MimeTable::parse("text/plain txt\n");

        let (server, rap) = Channel::pair().unwrap();
        let path_str = path.to_str().unwrap().to_string();
        let handle = thread::spawn(move || {
            let mut scratch = Vec::new();
            let msg = server.recv(&mut scratch).unwrap();
            read_file(&server, &mime, msg).unwrap();
        });

        let msg = req(Kind::ReadFile, vec![b"".to_vec(), path_str.into_bytes()]);
        rap.send(msg).unwrap();
        let mut scratch = Vec::new();
        let reply = rap.recv(&mut scratch).unwrap();
        handle.join().unwrap();

        assert_eq!(reply.kind, Kind::Success);
        assert_eq!(reply.buf_str(1), Some("text/plain"));
        let mut f = File::from(reply.fd.expect("file fd attached"));
        let mut contents = Vec::new();
        f.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello");
    }

    #[test]
    fn read_file_missing_path_is_not_found() {
        let dir = temp_dir("read-missing");
        let missing = dir.join("nope.txt");
        let mime = MimeTable::parse("text/plain txt\n");

        let (server, rap) = Channel::pair().unwrap();
        let path_str = missing.to_str().unwrap().to_string();
        let handle = thread::spawn(move || {
            let mut scratch = Vec::new();
            let msg = server.recv(&mut scratch).unwrap();
            read_file(&server, &mime, msg).unwrap();
        });

        let msg = req(Kind::ReadFile, vec![b"".to_vec(), path_str.into_bytes()]);
        rap.send(msg).unwrap();
        let mut scratch = Vec::new();
        let reply = rap.recv(&mut scratch).unwrap();
        handle.join().unwrap();

        assert_eq!(reply.kind, Kind::NotFound);
    }

    /// Spec §8 scenario F: PUT without `O_CREAT` on a path that does not
    /// exist yet fails with `Conflict` (409), the documented quirk.
    #[test]
    fn write_file_missing_path_is_conflict() {
        let dir = temp_dir("write-conflict");
        let path = dir.join("does-not-exist.txt");

        let (server, rap) = Channel::pair().unwrap();
        let path_str = path.to_str().unwrap().to_string();
        let handle = thread::spawn(move || {
            let mut scratch = Vec::new();
            let msg = server.recv(&mut scratch).unwrap();
            write_file(&server, msg).unwrap();
        });

        let (body_read, body_write) = make_pipe().unwrap();
        drop(body_write);
        let msg = req(Kind::WriteFile, vec![b"".to_vec(), path_str.into_bytes()]).with_fd(body_read);
        rap.send(msg).unwrap();
        let mut scratch = Vec::new();
        let reply = rap.recv(&mut scratch).unwrap();
        handle.join().unwrap();

        assert_eq!(reply.kind, Kind::Conflict);
        assert!(!path.exists(), "write_file must not create the file (no O_CREAT)");
    }

    /// Success path: an existing file is opened, `CONTINUE` is sent, then
    /// the body pipe's bytes are copied in and the final reply is `SUCCESS`.
    #[test]
    fn write_file_existing_path_succeeds() {
        let dir = temp_dir("write-success");
        let path = dir.join("existing.txt");
        fs::write(&path, b"old contents").unwrap();

        let (server, rap) = Channel::pair().unwrap();
        let path_str = path.to_str().unwrap().to_string();
        let handle = thread::spawn(move || {
            let mut scratch = Vec::new();
            let msg = server.recv(&mut scratch).unwrap();
            write_file(&server, msg).unwrap();
        });

        let (body_read, body_write) = make_pipe().unwrap();
        let msg = req(Kind::WriteFile, vec![b"".to_vec(), path_str.into_bytes()]).with_fd(body_read);
        rap.send(msg).unwrap();

        let mut scratch = Vec::new();
        let continue_reply = rap.recv(&mut scratch).unwrap();
        assert_eq!(continue_reply.kind, Kind::Continue);

        let mut writer = File::from(body_write);
        writer.write_all(b"new data").unwrap();
        drop(writer);

        let final_reply = rap.recv(&mut scratch).unwrap();
        handle.join().unwrap();

        assert_eq!(final_reply.kind, Kind::Success);
        assert_eq!(fs::read(&path).unwrap(), b"new data");
    }

    #[test]
    fn propfind_depth_one_lists_directory() {
        let dir = temp_dir("propfind-success");
        fs::write(dir.join("child.txt"), b"x").unwrap();
        let mime = MimeTable::parse("text/plain txt\n");

        let (server, rap) = Channel::pair().unwrap();
        let path_str = dir.to_str().unwrap().to_string();
        let handle = thread::spawn(move || {
            let mut scratch = Vec::new();
            let msg = server.recv(&mut scratch).unwrap();
            propfind(&server, &mime, msg).unwrap();
        });

        let msg = req(
            Kind::Propfind,
            vec![b"".to_vec(), path_str.clone().into_bytes(), b"1".to_vec()],
        );
        rap.send(msg).unwrap();
        let mut scratch = Vec::new();
        let reply = rap.recv(&mut scratch).unwrap();
        handle.join().unwrap();

        assert_eq!(reply.kind, Kind::Multistatus);
        let mut out = String::new();
        File::from(reply.fd.expect("propfind body pipe attached"))
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out.matches("<d:response>").count(), 2);
        assert!(out.contains(&format!("{path_str}/child.txt")));
    }
}

fn statvfs_quota(path: &str) -> (Option<u64>, Option<u64>) {
    let c_path = match std::ffi::CString::new(path) {
        Ok(c) => c,
        Err(_) => return (None, None),
    };
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
    if rc != 0 {
        return (None, None);
    }
    let block_size = vfs.f_frsize as u64;
    let total = vfs.f_blocks as u64 * block_size;
    let available = vfs.f_bavail as u64 * block_size;
    let used = total.saturating_sub(available);
    (Some(used), Some(available))
}

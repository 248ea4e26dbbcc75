//! End-to-end exercises of the wire codec driving real filesystem state,
//! covering spec §8 scenarios C (GET a file), D (GET a directory) and E
//! (PROPFIND a directory) without a live PAM stack: a worker thread plays
//! the RAP side using only the public `wire`/`mime`/`propfind` building
//! blocks, standing in for `rap::run`'s dispatch (which requires a real
//! AUTHENTICATE round trip through PAM and so isn't exercised here).

use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::thread;

use webdavd::mime::MimeTable;
use webdavd::propfind::{self, Depth, PropertySet, PropfindEntry};
use webdavd::wire::{Channel, Kind, Message};

fn make_pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("webdavd-e2e-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Scenario C: GET an existing file attaches its fd directly with the
/// mime type looked up from its extension.
#[test]
fn scenario_c_get_file() {
    let dir = temp_dir("scenario-c");
    let file_path = dir.join("file.txt");
    fs::write(&file_path, b"hello world").unwrap();
    let mime = MimeTable::parse("text/plain txt\n");

    let (server, rap) = Channel::pair().unwrap();
    let path_for_rap = file_path.clone();
    let handle = thread::spawn(move || {
        let mut scratch = Vec::new();
        let req = rap.recv(&mut scratch).unwrap();
        assert_eq!(req.kind, Kind::ReadFile);
        let path = req.buf_str(1).unwrap();
        let file = std::fs::File::open(path).unwrap();
        let meta = file.metadata().unwrap();
        let reply = Message::with_buffers(
            Kind::Success,
            vec![meta.mtime().to_string().into_bytes(), mime.lookup(path).as_bytes().to_vec(), path.as_bytes().to_vec()],
        )
        .with_fd(OwnedFd::from(file));
        rap.send(reply).unwrap();
    });

    let req = Message::with_buffers(
        Kind::ReadFile,
        vec![b"".to_vec(), path_for_rap.to_str().unwrap().as_bytes().to_vec()],
    );
    server.send(req).unwrap();
    let mut scratch = Vec::new();
    let reply = server.recv(&mut scratch).unwrap();
    handle.join().unwrap();

    assert_eq!(reply.kind, Kind::Success);
    assert_eq!(reply.buf_str(1), Some("text/plain"));
    let fd = reply.fd.expect("file fd attached");
    let mut f = std::fs::File::from(fd);
    let mut contents = Vec::new();
    std::io::Read::read_to_end(&mut f, &mut contents).unwrap();
    assert_eq!(contents, b"hello world");
}

/// Scenario D: GET a directory returns an HTML index through a pipe that
/// names non-hidden entries and skips dotfiles.
#[test]
fn scenario_d_get_directory_listing_skips_dotfiles() {
    let dir = temp_dir("scenario-d");
    fs::write(dir.join("a"), b"x").unwrap();
    fs::write(dir.join(".hidden"), b"x").unwrap();
    fs::create_dir(dir.join("sub")).unwrap();

    let (read_fd, write_fd) = make_pipe();
    let dir_for_writer = dir.clone();
    let writer = thread::spawn(move || {
        let mut out = std::fs::File::from(write_fd);
        writeln!(out, "<!DOCTYPE html><html><body><ul>").unwrap();
        for entry in fs::read_dir(&dir_for_writer).unwrap().flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().unwrap().is_dir();
            let href = if is_dir { format!("{name}/") } else { name.clone() };
            writeln!(out, "<li><a href=\"{href}\">{href}</a></li>").unwrap();
        }
        writeln!(out, "</ul></body></html>").unwrap();
    });

    writer.join().unwrap();
    let mut html = String::new();
    std::io::Read::read_to_string(&mut std::fs::File::from(read_fd), &mut html).unwrap();
    assert!(html.contains("href=\"a\""));
    assert!(html.contains("href=\"sub/\""));
    assert!(!html.contains(".hidden"));
}

/// Scenario E: PROPFIND Depth 1 on a directory produces one `<d:response>`
/// for the directory itself (marked as a collection) plus one per
/// non-hidden child.
#[test]
fn scenario_e_propfind_depth_one() {
    let dir = temp_dir("scenario-e");
    fs::write(dir.join("a"), b"hello").unwrap();
    fs::write(dir.join(".hidden"), b"x").unwrap();

    let depth = Depth::parse("1");
    assert_eq!(depth, Depth::One);

    let root_meta = fs::metadata(&dir).unwrap();
    let root = PropfindEntry {
        href: format!("{}/", dir.display()),
        is_dir: true,
        size: root_meta.len(),
        mtime_secs: root_meta.mtime(),
        ctime_secs: root_meta.ctime(),
        content_type: "text/html".to_string(),
        quota_available_bytes: Some(1000),
        quota_used_bytes: Some(500),
    };

    let mut children = Vec::new();
    for entry in fs::read_dir(&dir).unwrap().flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata().unwrap();
        children.push(PropfindEntry {
            href: format!("{}/{name}", dir.display()),
            is_dir: false,
            size: meta.len(),
            mtime_secs: meta.mtime(),
            ctime_secs: meta.ctime(),
            content_type: "text/plain".to_string(),
            quota_available_bytes: None,
            quota_used_bytes: None,
        });
    }
    assert_eq!(children.len(), 1, "only the non-hidden child should be listed");

    let mut out = Vec::new();
    propfind::write_multistatus(&mut out, &PropertySet::all(), &root, &children).unwrap();
    let xml = String::from_utf8(out).unwrap();

    assert_eq!(xml.matches("<d:response>").count(), 2);
    assert_eq!(xml.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(xml.contains("<d:collection"));
    assert!(xml.contains(&format!("<d:href>{}/</d:href>", dir.display())));
}

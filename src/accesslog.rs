//! Dedicated access-log sink, separate from the `log`-facade operational
//! log (spec §6: `<ISO8601-now> <client-ip> <user> <status> <method> <url>`).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::util::now_rfc3339;

pub struct AccessLog {
    file: Mutex<File>,
}

impl AccessLog {
    pub fn open(path: &Path) -> io::Result<AccessLog> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AccessLog { file: Mutex::new(file) })
    }

    /// Write one line and flush immediately, matching `logAccess`'s
    /// `fflush` after every write -- access-log lines must survive a crash
    /// of the server process.
    pub fn record(&self, client_ip: &str, user: &str, status: u16, method: &str, url: &str) {
        let line = format!("{} {} {} {} {} {}\n", now_rfc3339(), client_ip, user, status, method, url);
        let mut f = self.file.lock();
        if let Err(e) = f.write_all(line.as_bytes()).and_then(|_| f.flush()) {
            log::error!("failed to write access log line: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_request() {
        let dir = std::env::temp_dir().join(format!("webdavd-access-test-{}", std::process::id()));
        let log = AccessLog::open(&dir).unwrap();
        log.record("127.0.0.1", "alice", 200, "GET", "/file.txt");
        log.record("127.0.0.1", "alice", 404, "GET", "/missing");
        let contents = std::fs::read_to_string(&dir).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("200 GET /file.txt"));
        assert!(lines[1].ends_with("404 GET /missing"));
        let _ = std::fs::remove_file(&dir);
    }
}

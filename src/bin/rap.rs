//! RAP (Restricted-Access Processor) entry point.
//!
//! Invoked by the server as `<rap_binary> <pam_service> <mime_types_file>`
//! with stdin and stdout both set to the sequenced-packet control socket
//! (spec §6 "RAP invocation"). Loads the mime table once, then hands the
//! channel to the event loop in [`webdavd::rap`].

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::ExitCode;

use webdavd::mime::MimeTable;
use webdavd::wire::Channel;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let pam_service = match args.next() {
        Some(s) => s,
        None => {
            eprintln!("usage: rap <pam-service> <mime-types-file>");
            return ExitCode::FAILURE;
        }
    };
    let mime_file = match args.next() {
        Some(s) => PathBuf::from(s),
        None => {
            eprintln!("usage: rap <pam-service> <mime-types-file>");
            return ExitCode::FAILURE;
        }
    };

    let mime_table = match MimeTable::load(&mime_file) {
        Ok(t) => t,
        Err(e) => {
            log::error!("could not load mime types from {}: {e}", mime_file.display());
            return ExitCode::FAILURE;
        }
    };

    // Safety: the server execs us with the control socket duplicated onto
    // both stdin and stdout, and nothing else open; fd 0 is ours alone.
    let channel = unsafe { Channel::from_raw_fd(0 as RawFd) };

    webdavd::rap::run(channel, pam_service, mime_table);
    ExitCode::SUCCESS
}

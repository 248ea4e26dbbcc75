//! The RAP (Restricted-Access Processor) child: a single-threaded request
//! executor bound to one authenticated (user, password) pair (spec §4.2).
//!
//! `run` drives the event loop described in spec §4.2's pseudocode:
//! receive one message, reject anything that isn't a valid request for the
//! current authentication state, otherwise dispatch.

mod auth;
mod fsops;

use crate::errors::WireError;
use crate::mime::MimeTable;
use crate::wire::{Channel, Kind, Message};

/// Run the RAP event loop on `channel` until the peer closes it or a
/// protocol-fatal error occurs. Never returns on orderly shutdown; logs and
/// returns on the first unrecoverable wire error, at which point the
/// process should simply exit (its socket is its only connection to the
/// world).
pub fn run(channel: Channel, pam_service: String, mime_table: MimeTable) {
    let mut scratch = Vec::new();
    let mut session: Option<auth::Session> = None;

    loop {
        let msg = match channel.recv(&mut scratch) {
            Ok(m) => m,
            Err(WireError::Eof) => {
                log::debug!("control channel closed, exiting");
                return;
            }
            Err(e) => {
                log::error!("wire error receiving request: {e}");
                return;
            }
        };

        let result = dispatch(&channel, &mut session, msg, &mime_table, &pam_service);
        if let Err(e) = result {
            log::error!("wire error replying to request: {e}");
            return;
        }
    }
}

fn dispatch(
    channel: &Channel,
    session: &mut Option<auth::Session>,
    msg: Message,
    mime_table: &MimeTable,
    pam_service: &str,
) -> Result<(), WireError> {
    match (&session, msg.kind) {
        (None, Kind::Authenticate) => match auth::handle(&msg, pam_service) {
            Ok(s) => {
                log::info!("authenticated as {}", s.user);
                // Buffer 0 carries the PAM-canonicalized username back to the
                // server so the pool/access-log can key on it instead of the
                // raw Basic-auth input (spec §3: "`user` (canonicalized by
                // PAM)").
                channel.send(Message::with_buffers(Kind::Success, vec![s.user.as_bytes().to_vec()]))?;
                *session = Some(s);
                Ok(())
            }
            Err(reply) => channel.send(reply),
        },
        // A RAP that has authenticated cannot re-authenticate (spec §4.2).
        (Some(_), Kind::Authenticate) => channel.send(Message::new(Kind::BadRapRequest)),
        (None, _) => channel.send(Message::new(Kind::BadRapRequest)),
        (Some(_), Kind::ReadFile) => fsops::read_file(channel, mime_table, msg),
        (Some(_), Kind::WriteFile) => fsops::write_file(channel, msg),
        (Some(_), Kind::Propfind) => fsops::propfind(channel, mime_table, msg),
        (Some(_), _) => channel.send(Message::new(Kind::BadRapRequest)),
    }
}

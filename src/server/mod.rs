//! Server-side HTTP request lifecycle: brokers each authenticated request
//! to a leased RAP and translates its reply back into an HTTP response
//! (spec §4.4, §4.5).

pub mod daemon;
pub mod response;

use std::net::IpAddr;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::sync::Arc;

use base64::Engine;
use http::{HeaderMap, Method, StatusCode};
use hyper::{Body, Request, Response};

use crate::accesslog::AccessLog;
use crate::errorpages::StaticPages;
use crate::errors::{PoolError, WireError};
use crate::pool::{RapLease, RapPool};
use crate::wire::{Kind, Message};

/// Everything a request handler needs, built once at startup and shared
/// (by `Arc`) across every connection (spec §9 "global mutable state":
/// encapsulated instead of process-wide statics).
pub struct ServerContext {
    pub pool: Arc<RapPool>,
    pub pages: StaticPages,
    pub access_log: AccessLog,
}

enum RapMethod {
    Get,
    Propfind,
    Put,
}

/// Handle one HTTP request end to end (spec §4.4). Always returns a
/// response; there is no path that propagates an error to the caller --
/// every failure mode has an HTTP status mapped to it (spec §7).
pub async fn handle(ctx: Arc<ServerContext>, remote_ip: IpAddr, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let mut resp = if method == Method::OPTIONS {
        response::options_response()
    } else {
        let rap_method = match method.as_str() {
            "GET" => Some(RapMethod::Get),
            "PROPFIND" => Some(RapMethod::Propfind),
            "PUT" => Some(RapMethod::Put),
            _ => None,
        };
        match rap_method {
            None => response::method_not_allowed(&ctx.pages),
            Some(m) => handle_dav_request(&ctx, remote_ip, m, req, &path).await,
        }
    };

    response::add_common_headers(&mut resp);

    let user = resp
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|u| u.0.clone())
        .unwrap_or_else(|| "-".to_string());
    ctx.access_log.record(&remote_ip.to_string(), &user, resp.status().as_u16(), method.as_str(), &path);
    resp
}

/// Stashed in the response's extensions purely so the access-log line can
/// name the authenticated user without threading it through every return
/// path of `handle_dav_request`.
#[derive(Clone)]
struct AuthenticatedUser(String);

async fn handle_dav_request(
    ctx: &Arc<ServerContext>,
    remote_ip: IpAddr,
    method: RapMethod,
    req: Request<Body>,
    path: &str,
) -> Response<Body> {
    let (user, password) = match parse_basic_auth(req.headers()) {
        Some(up) => up,
        None => return response::unauthorized(&ctx.pages),
    };

    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let lease = match acquire(ctx.pool.clone(), user.clone(), password, remote_ip.to_string()).await {
        Ok(l) => l,
        Err(PoolError::AuthFailed) | Err(PoolError::Backoff) => return response::unauthorized(&ctx.pages),
        Err(PoolError::AuthError(e)) => {
            log::error!("could not bring up RAP for {user}: {e}");
            return response::static_response(&ctx.pages, StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    // The access log and `AuthenticatedUser` extension use the PAM-canonicalized
    // identity the lease authenticated as, not the raw Basic-auth input (spec §3).
    let canonical_user = lease.user().to_string();

    let mut resp = match method {
        RapMethod::Get => {
            let msg = Message::with_buffers(Kind::ReadFile, vec![host.into_bytes(), path.as_bytes().to_vec()]);
            match roundtrip(lease, msg).await {
                (_lease, Ok(reply)) => response::translate(reply, &ctx.pages),
                (lease, Err(e)) => {
                    log::error!("control channel error talking to rap {}: {e}", lease.pid());
                    lease.destroy();
                    response::static_response(&ctx.pages, StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        RapMethod::Propfind => {
            let depth = req
                .headers()
                .get("depth")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("infinity")
                .to_string();
            let body = match hyper::body::to_bytes(req.into_body()).await {
                Ok(b) => b,
                Err(_) => return response::static_response(&ctx.pages, StatusCode::BAD_REQUEST),
            };
            let msg = if body.is_empty() {
                Message::with_buffers(
                    Kind::Propfind,
                    vec![host.into_bytes(), path.as_bytes().to_vec(), depth.into_bytes()],
                )
            } else {
                match make_pipe() {
                    Ok((read_fd, write_fd)) => {
                        if let Err(e) = write_pipe_body(write_fd, &body).await {
                            log::warn!("error writing propfind body pipe: {e}");
                        }
                        Message::with_buffers(
                            Kind::Propfind,
                            vec![host.into_bytes(), path.as_bytes().to_vec(), depth.into_bytes()],
                        )
                        .with_fd(read_fd)
                    }
                    Err(e) => {
                        log::error!("could not create pipe: {e}");
                        return response::static_response(&ctx.pages, StatusCode::INTERNAL_SERVER_ERROR);
                    }
                }
            };
            match roundtrip(lease, msg).await {
                (_lease, Ok(reply)) => response::translate(reply, &ctx.pages),
                (lease, Err(e)) => {
                    log::error!("control channel error talking to rap {}: {e}", lease.pid());
                    lease.destroy();
                    response::static_response(&ctx.pages, StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        RapMethod::Put => handle_put(ctx, lease, host, path, req).await,
    };

    resp.extensions_mut().insert(AuthenticatedUser(canonical_user));
    resp
}

async fn handle_put(
    ctx: &Arc<ServerContext>,
    lease: RapLease,
    host: String,
    path: &str,
    req: Request<Body>,
) -> Response<Body> {
    let (read_fd, write_fd) = match make_pipe() {
        Ok(p) => p,
        Err(e) => {
            log::error!("could not create pipe: {e}");
            return response::static_response(&ctx.pages, StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let msg = Message::with_buffers(Kind::WriteFile, vec![host.into_bytes(), path.as_bytes().to_vec()])
        .with_fd(read_fd);

    let (lease, result) = roundtrip(lease, msg).await;
    let reply = match result {
        Ok(r) => r,
        Err(e) => {
            log::error!("control channel error talking to rap {}: {e}", lease.pid());
            lease.destroy();
            return response::static_response(&ctx.pages, StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    if reply.kind != Kind::Continue {
        return response::translate(reply, &ctx.pages);
    }

    if let Err(e) = stream_request_body(write_fd, req.into_body()).await {
        log::warn!("error streaming PUT body to rap {}: {e}", lease.pid());
    }

    let (lease, result) = recv_final(lease).await;
    match result {
        Ok(reply) => response::translate(reply, &ctx.pages),
        Err(e) => {
            log::error!("control channel error reading final reply from rap {}: {e}", lease.pid());
            lease.destroy();
            response::static_response(&ctx.pages, StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Run `RapPool::acquire` -- blocking fork/exec/PAM work -- off the async
/// runtime's worker threads (spec §4.3 notes this path blocks on I/O).
async fn acquire(pool: Arc<RapPool>, user: String, password: String, rhost: String) -> Result<RapLease, PoolError> {
    tokio::task::spawn_blocking(move || pool.acquire(&user, &password, &rhost))
        .await
        .expect("pool.acquire panicked")
}

/// Send one control message and receive its reply, synchronously, off the
/// async runtime (spec §5: "the pool lock must never be held across [this]
/// I/O", which holds here since the lease already carries no pool lock).
async fn roundtrip(lease: RapLease, msg: Message) -> (RapLease, Result<Message, WireError>) {
    tokio::task::spawn_blocking(move || {
        let mut scratch = Vec::new();
        let result = lease.channel().send(msg).and_then(|()| lease.channel().recv(&mut scratch));
        (lease, result)
    })
    .await
    .expect("rap roundtrip panicked")
}

async fn recv_final(lease: RapLease) -> (RapLease, Result<Message, WireError>) {
    tokio::task::spawn_blocking(move || {
        let mut scratch = Vec::new();
        let result = lease.channel().recv(&mut scratch);
        (lease, result)
    })
    .await
    .expect("rap roundtrip panicked")
}

fn make_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

async fn write_pipe_body(write_fd: OwnedFd, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::File::from_std(std::fs::File::from(write_fd));
    file.write_all(data).await
}

/// Stream the incoming request body straight into the RAP's write pipe,
/// closing the write end (EOF for the RAP) when the body is exhausted
/// (spec §4.4 "upload-streaming callbacks").
async fn stream_request_body(write_fd: OwnedFd, mut body: Body) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::File::from_std(std::fs::File::from(write_fd));
    while let Some(chunk) = hyper::body::HttpBody::data(&mut body).await {
        let chunk = chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.write_all(&chunk).await?;
    }
    Ok(())
}

fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

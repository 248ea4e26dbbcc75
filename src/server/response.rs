//! RAP reply -> HTTP response translation (spec §4.5) and the small set of
//! static responses the server produces without ever consulting a RAP
//! (OPTIONS, 401, 405).

use std::os::unix::io::{AsRawFd, OwnedFd};

use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use hyper::{Body, Response};

use crate::errorpages::StaticPages;
use crate::wire::{Kind, Message};

/// Headers present on every response regardless of outcome (spec §6).
pub fn add_common_headers(resp: &mut Response<Body>) {
    let h = resp.headers_mut();
    h.insert("DAV", HeaderValue::from_static("1"));
    h.insert("Accept-Ranges", HeaderValue::from_static("bytes"));
    h.insert("Server", HeaderValue::from_static(concat!("webdavd/", env!("CARGO_PKG_VERSION"))));
    h.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    h.insert("Pragma", HeaderValue::from_static("no-cache"));
    h.insert("Connection", HeaderValue::from_static("Keep-Alive"));
    h.insert("Keep-Alive", HeaderValue::from_static("timeout=30"));
    if let Ok(v) = HeaderValue::from_str(&crate::util::now_rfc3339()) {
        h.insert("Expires", v);
    }
}

/// Translate one RAP reply into the HTTP response it implies (spec §4.5's
/// table). Streaming bodies are read from the attached fd in a background
/// task so the fd is drained and closed even if the client disconnects
/// early (spec §5 "Cancellation").
pub fn translate(msg: Message, pages: &StaticPages) -> Response<Body> {
    match msg.kind {
        Kind::Success => success_response(msg),
        Kind::Multistatus => multistatus_response(msg),
        Kind::AccessDenied => static_response(pages, StatusCode::FORBIDDEN),
        Kind::NotFound => static_response(pages, StatusCode::NOT_FOUND),
        Kind::BadClientRequest => static_response(pages, StatusCode::BAD_REQUEST),
        Kind::InsufficientStorage => static_response(pages, StatusCode::INSUFFICIENT_STORAGE),
        Kind::Conflict => static_response(pages, StatusCode::CONFLICT),
        // BAD_RAP_REQUEST, INTERNAL_ERROR, and anything unexpected all map
        // to 500 (spec §4.5).
        _ => static_response(pages, StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn success_response(msg: Message) -> Response<Body> {
    let mime = msg.buf_str(1).unwrap_or("application/octet-stream").to_string();
    let fd = match msg.fd {
        Some(fd) => fd,
        None => {
            log::error!("SUCCESS reply carried no file descriptor");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap();
        }
    };

    let mut builder = Response::builder().status(StatusCode::OK).header(http::header::CONTENT_TYPE, mime);
    if is_regular_file(&fd) {
        if let Some(len) = fd_len(&fd) {
            builder = builder.header(http::header::CONTENT_LENGTH, len);
        }
    }
    builder.body(stream_fd(fd)).unwrap()
}

fn multistatus_response(msg: Message) -> Response<Body> {
    let path = msg.buf_str(2).unwrap_or("").to_string();
    let fd = match msg.fd {
        Some(fd) => fd,
        None => {
            log::error!("MULTISTATUS reply carried no file descriptor");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap();
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(207).unwrap())
        .header(http::header::CONTENT_TYPE, "application/xml; charset=utf-8");
    if let Ok(v) = HeaderValue::from_str(&path) {
        builder = builder.header("Location", v);
    }
    builder.body(stream_fd(fd)).unwrap()
}

pub fn static_response(pages: &StaticPages, status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/html")
        .body(Body::from(pages.for_status(status)))
        .unwrap()
}

pub fn unauthorized(pages: &StaticPages) -> Response<Body> {
    let mut resp = static_response(pages, StatusCode::UNAUTHORIZED);
    resp.headers_mut().insert(
        "WWW-Authenticate",
        HeaderValue::from_static("Basic realm=\"My Server\""),
    );
    resp
}

/// Superset of verbs this server knows about; used for OPTIONS and 405
/// responses (spec §6, test scenario A).
pub const SUPPORTED_METHODS: &str =
    "OPTIONS, GET, HEAD, DELETE, PROPFIND, PUT, PROPPATCH, COPY, MOVE, REPORT, LOCK, UNLOCK";

pub fn options_response() -> Response<Body> {
    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_LENGTH, 0)
        .body(Body::empty())
        .unwrap();
    resp.headers_mut().insert("Accept", HeaderValue::from_static(SUPPORTED_METHODS));
    resp
}

pub fn method_not_allowed(pages: &StaticPages) -> Response<Body> {
    let mut resp = static_response(pages, StatusCode::METHOD_NOT_ALLOWED);
    resp.headers_mut().insert("Allow", HeaderValue::from_static(SUPPORTED_METHODS));
    resp
}

fn is_regular_file(fd: &OwnedFd) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) };
    rc == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFREG
}

fn fd_len(fd: &OwnedFd) -> Option<u64> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) };
    if rc == 0 {
        Some(st.st_size as u64)
    } else {
        None
    }
}

/// Wrap a raw fd (regular file or pipe read end) as a chunked `hyper::Body`,
/// copying it to the client on a background task and closing the fd on EOF
/// or on send failure (e.g. the client disconnected -- spec §5
/// "Cancellation").
fn stream_fd(fd: OwnedFd) -> Body {
    let mut file = tokio::fs::File::from_std(std::fs::File::from(fd));
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if sender.send_data(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("error reading response body from fd: {e}");
                    sender.abort();
                    break;
                }
            }
        }
    });
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::FromRawFd;

    #[test]
    fn options_lists_supported_methods() {
        let resp = options_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("Accept").unwrap(), SUPPORTED_METHODS);
    }

    #[test]
    fn method_not_allowed_carries_allow_header() {
        let pages = StaticPages::default();
        let resp = method_not_allowed(&pages);
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers().get("Allow").unwrap(), SUPPORTED_METHODS);
    }

    #[test]
    fn unauthorized_carries_www_authenticate() {
        let pages = StaticPages::default();
        let resp = unauthorized(&pages);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers().get("WWW-Authenticate").unwrap(), "Basic realm=\"My Server\"");
    }

    #[test]
    fn translate_maps_error_kinds_to_status() {
        let pages = StaticPages::default();
        assert_eq!(translate(Message::new(Kind::AccessDenied), &pages).status(), StatusCode::FORBIDDEN);
        assert_eq!(translate(Message::new(Kind::NotFound), &pages).status(), StatusCode::NOT_FOUND);
        assert_eq!(translate(Message::new(Kind::BadClientRequest), &pages).status(), StatusCode::BAD_REQUEST);
        assert_eq!(translate(Message::new(Kind::Conflict), &pages).status(), StatusCode::CONFLICT);
        assert_eq!(
            translate(Message::new(Kind::InsufficientStorage), &pages).status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(translate(Message::new(Kind::BadRapRequest), &pages).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn success_response_streams_regular_file_with_content_length() {
        let tmp = tempfile_with(b"hello world");
        let fd = OwnedFd::from(tmp);

        let msg = Message::with_buffers(
            Kind::Success,
            vec![b"0".to_vec(), b"text/plain".to_vec(), b"/file.txt".to_vec()],
        )
        .with_fd(fd);
        let resp = success_response(msg);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(http::header::CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(resp.headers().get(http::header::CONTENT_LENGTH).unwrap(), "11");

        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn multistatus_response_carries_location_from_path_buffer() {
        let (read_fd, write_fd) = pipe_pair();
        let mut out = std::fs::File::from(write_fd);
        out.write_all(b"<d:multistatus/>").unwrap();
        drop(out);

        let msg = Message::with_buffers(
            Kind::Multistatus,
            vec![b"0".to_vec(), b"application/xml".to_vec(), b"/dir/".to_vec()],
        )
        .with_fd(read_fd);
        let resp = multistatus_response(msg);
        assert_eq!(resp.status().as_u16(), 207);
        assert_eq!(resp.headers().get("Location").unwrap(), "/dir/");

        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"<d:multistatus/>");
    }

    fn tempfile_with(data: &[u8]) -> std::fs::File {
        let mut f = tempfile();
        f.write_all(data).unwrap();
        use std::io::Seek;
        f.seek(std::io::SeekFrom::Start(0)).unwrap();
        f
    }

    fn tempfile() -> std::fs::File {
        let path = std::env::temp_dir().join(format!(
            "webdavd-response-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        std::fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path).unwrap()
    }

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }
}

//! Static HTML error pages, loaded once at startup and reused for every
//! response of that status (spec §1: "out of scope as content", but the
//! mechanism is ambient infrastructure -- mirrors `initializeStaticResponses`).

use bytes::Bytes;
use http::StatusCode;

/// In-memory bodies for the handful of status codes the server can itself
/// produce without consulting a RAP (403/404/400/500/507, and the 401
/// produced by the pool broker).
#[derive(Debug, Clone)]
pub struct StaticPages {
    forbidden: Bytes,
    not_found: Bytes,
    bad_request: Bytes,
    unauthorized: Bytes,
    internal_error: Bytes,
    insufficient_storage: Bytes,
}

impl Default for StaticPages {
    fn default() -> StaticPages {
        StaticPages {
            forbidden: page("403 Forbidden", "You do not have permission to access this resource."),
            not_found: page("404 Not Found", "The requested resource was not found."),
            bad_request: page("400 Bad Request", "The request could not be understood."),
            unauthorized: page("401 Unauthorized", "Authentication is required."),
            internal_error: page("500 Internal Server Error", "An internal error occurred."),
            insufficient_storage: page("507 Insufficient Storage", "There is not enough storage to complete the request."),
        }
    }
}

impl StaticPages {
    pub fn for_status(&self, status: StatusCode) -> Bytes {
        match status {
            StatusCode::FORBIDDEN => self.forbidden.clone(),
            StatusCode::NOT_FOUND => self.not_found.clone(),
            StatusCode::BAD_REQUEST => self.bad_request.clone(),
            StatusCode::UNAUTHORIZED => self.unauthorized.clone(),
            StatusCode::INSUFFICIENT_STORAGE => self.insufficient_storage.clone(),
            _ => self.internal_error.clone(),
        }
    }
}

fn page(title: &str, body: &str) -> Bytes {
    Bytes::from(format!(
        "<!DOCTYPE html>\n<html><head><title>{title}</title></head>\n<body><h1>{title}</h1><p>{body}</p></body></html>\n"
    ))
}

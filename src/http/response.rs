//! HTTP/1.1 response assembly.
//!
//! A closed status set (`{200, 400, 404, 500}`), `Date`/`Server`/`Connection`
//! default headers, and IMF-fixdate timestamps. Headers are kept in
//! insertion order (a `Vec<(String, String)>` rather than a `HashMap`) so
//! serialization is deterministic.

use chrono::Utc;

pub const SERVER_NAME: &str = "thttpd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    InternalServerError,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason_phrase(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// An outgoing response. Headers are stored in insertion order and
/// serialized in that order; setting an existing header (case-insensitively)
/// updates it in place rather than appending a duplicate.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: StatusCode,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Builds a response carrying the default header set (`Date`, `Server`,
    /// `Connection: keep-alive`), mirroring
    /// `HttpResponse::BuildWithDefaultHeaders` in the original.
    pub fn with_default_headers(status: StatusCode) -> Self {
        let mut res = HttpResponse {
            version: "HTTP/1.1".to_string(),
            status,
            headers: Vec::new(),
            body: Vec::new(),
        };
        res.set_header("Date", &format_http_date(Utc::now()));
        res.set_header("Server", SERVER_NAME);
        res.set_header("Connection", "keep-alive");
        res
    }

    /// Sets (or replaces, case-insensitively) a header.
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            existing.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Sets the body, `Content-Type` and `Content-Length` together.
    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) -> &mut Self {
        self.set_header("Content-Type", content_type);
        self.set_header("Content-Length", &body.len().to_string());
        self.body = body;
        self
    }

    pub fn set_connection_close(&mut self) -> &mut Self {
        self.set_header("Connection", "close");
        self
    }

    /// Serializes the status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.to_bytes_headers_only();
        out.extend_from_slice(&self.body);
        out
    }

    /// Serializes the status line and headers (trailing blank line
    /// included), without the body — used when the body is streamed
    /// separately from a [`crate::file_reader::Reader`].
    pub fn to_bytes_headers_only(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version,
            self.status.code(),
            self.status.reason_phrase()
        )
        .into_bytes();

        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Builds a plain-text error response for `status`, with `Connection:
    /// close` on 5xx and `keep-alive` otherwise (a malformed request still
    /// terminates the connection since the parser's state is unrecoverable;
    /// see [`crate::request_handler`]).
    pub fn error_response(status: StatusCode) -> Self {
        let mut res = HttpResponse::with_default_headers(status);
        let body = format!("{} {}", status.code(), status.reason_phrase()).into_bytes();
        res.set_body(body, "text/plain");
        if status == StatusCode::InternalServerError {
            res.set_connection_close();
        }
        res
    }
}

/// Formats `when` as an RFC 7231 IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(when: chrono::DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

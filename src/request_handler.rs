//! Per-connection state machine.
//!
//! The read/write loop shape follows a classic single-threaded reactor
//! handler: one phase enum driving what the next readiness event means.
//! Compressed-file lookups are asynchronous, so the handler must survive
//! until its cache callback fires without creating a reference cycle: the
//! acceptor (see [`crate::server`]'s `ConnectionHandle`) owns the only
//! strong reference, and the callback holds a `Weak` that simply fails to
//! upgrade if the connection closed first.

use std::io::{ErrorKind, Write as _};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use mio::net::TcpStream;

use crate::compression_cache::CompressionCache;
use crate::error::{Error, Result};
use crate::file_reader::{FileReader, Reader};
use crate::http::{format_http_date, HttpResponse, Method, ParsingState, RequestParser, StatusCode};
use crate::mime;
use crate::task_runner::TaskRunner;

const RECV_BUF_SIZE: usize = 8192;
const SEND_CHUNK_SIZE: usize = 64 * 1024;

/// Whether compression is attempted for compressible responses. Off by
/// default: the compression cache adds a hop through its own `TaskRunner`
/// for every cold path, which is only worth it once a workload actually
/// has repeat readers of the same file.
const COMPRESSION_ENABLED: bool = false;

#[derive(Debug)]
enum Phase {
    PendingRequest,
    OpeningCompressedStream,
    SendingResponseHeader,
    SendingResponseBody,
    SocketClosed,
}

pub struct RequestHandler {
    stream: TcpStream,
    path_to_serve: Arc<PathBuf>,
    compression_cache: Arc<CompressionCache>,
    task_runner: Arc<TaskRunner>,
    client_ip: String,

    parser: RequestParser,
    phase: Phase,

    response_header: Vec<u8>,
    header_offset: usize,

    reader: Option<Box<dyn Reader>>,
    body_chunk: Vec<u8>,
    body_offset: usize,
    body_len: usize,
}

/// Returned by the readiness callbacks so [`crate::server`] knows whether to
/// keep polling this socket or tear it down.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Open,
    Closed,
}

impl RequestHandler {
    pub fn new(
        stream: TcpStream,
        path_to_serve: Arc<PathBuf>,
        compression_cache: Arc<CompressionCache>,
        task_runner: Arc<TaskRunner>,
        client_ip: String,
    ) -> Self {
        RequestHandler {
            stream,
            path_to_serve,
            compression_cache,
            task_runner,
            client_ip,
            parser: RequestParser::new(),
            phase: Phase::PendingRequest,
            response_header: Vec::new(),
            header_offset: 0,
            reader: None,
            body_chunk: Vec::new(),
            body_offset: 0,
            body_len: 0,
        }
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Drives the state machine in response to a readiness event. Must be
    /// called from `self.task_runner`'s own thread.
    pub fn handle_update(
        this: &Arc<Mutex<RequestHandler>>,
        can_read: bool,
        can_write: bool,
    ) -> Disposition {
        if can_read {
            let disposition = this.lock().unwrap().pump_read(Arc::downgrade(this));
            if disposition == Disposition::Closed {
                return Disposition::Closed;
            }
        }
        if can_write {
            return this.lock().unwrap().pump_write();
        }
        Disposition::Open
    }

    fn pump_read(&mut self, weak_self: Weak<Mutex<RequestHandler>>) -> Disposition {
        if !matches!(self.phase, Phase::PendingRequest) {
            return Disposition::Open;
        }

        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            match std::io::Read::read(&mut self.stream, &mut buf) {
                Ok(0) => {
                    self.phase = Phase::SocketClosed;
                    return Disposition::Closed;
                }
                Ok(n) => {
                    let state = self.parser.add_data(&buf[..n]);
                    match state {
                        ParsingState::Invalid => {
                            self.begin_error_response(StatusCode::BadRequest);
                            return Disposition::Open;
                        }
                        ParsingState::Ready => {
                            self.handle_ready_request(weak_self.clone());
                            // handle_ready_request always moves self.phase out of
                            // PendingRequest (into an error/streaming phase or an
                            // async cache lookup), so any bytes of a pipelined
                            // next request already sitting in `buf` must wait:
                            // re-entering the loop here would let them jump the
                            // queue and clobber the response being built for
                            // this request before a single byte of it is sent.
                            return if matches!(self.phase, Phase::SocketClosed) {
                                Disposition::Closed
                            } else {
                                Disposition::Open
                            };
                        }
                        ParsingState::Pending => {}
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.phase = Phase::SocketClosed;
                    return Disposition::Closed;
                }
            }
        }
        Disposition::Open
    }

    fn handle_ready_request(&mut self, weak_self: Weak<Mutex<RequestHandler>>) {
        let request = self.parser.take_request();

        if request.method != Method::Get {
            self.begin_error_response(StatusCode::BadRequest);
            return;
        }

        let resolved = match self.resolve_path(&request.target) {
            Ok(path) => path,
            Err(Error::NotFound(_)) => {
                self.begin_error_response(StatusCode::NotFound);
                return;
            }
            Err(_) => {
                self.begin_error_response(StatusCode::BadRequest);
                return;
            }
        };

        let metadata = match std::fs::metadata(&resolved) {
            Ok(metadata) => metadata,
            Err(_) => {
                self.begin_error_response(StatusCode::NotFound);
                return;
            }
        };
        let last_modified = metadata
            .modified()
            .map(|modified| format_http_date(DateTime::<Utc>::from(modified)))
            .unwrap_or_else(|_| format_http_date(Utc::now()));

        let content_type = mime::for_filename(&resolved.to_string_lossy());

        if COMPRESSION_ENABLED && mime::should_compress(content_type) {
            self.phase = Phase::OpeningCompressedStream;
            let path_str = resolved.to_string_lossy().to_string();
            let caller = Arc::clone(&self.task_runner);
            let handler_runner = Arc::clone(&self.task_runner);
            self.compression_cache.request_file(path_str, caller, move |result| {
                // Posted back onto the handler's own runner: the cache invokes
                // this from its own TaskRunner thread, and RequestHandler's
                // phase/response fields may only be touched from the runner
                // that owns this connection.
                handler_runner.post_task(move || {
                    let Some(handle) = weak_self.upgrade() else {
                        return;
                    };
                    let mut this = handle.lock().unwrap();
                    this.on_compressed_file_read(result, content_type, &last_modified);
                });
            });
            return;
        }

        match FileReader::open(&resolved) {
            Ok(reader) => {
                self.start_streaming(
                    Box::new(reader),
                    content_type,
                    None,
                    metadata.len(),
                    &last_modified,
                );
            }
            Err(_) => self.begin_error_response(StatusCode::NotFound),
        }
    }

    fn on_compressed_file_read(
        &mut self,
        result: Result<crate::compression_cache::CacheFileCursor>,
        content_type: &str,
        last_modified: &str,
    ) {
        if !matches!(self.phase, Phase::OpeningCompressedStream) {
            return;
        }
        match result {
            Ok(cursor) => {
                let content_length = cursor.total_size();
                self.start_streaming(
                    Box::new(cursor),
                    content_type,
                    Some("gzip"),
                    content_length,
                    last_modified,
                );
            }
            Err(_) => {
                self.phase = Phase::PendingRequest;
                self.begin_error_response(StatusCode::BadRequest);
            }
        }
    }

    fn start_streaming(
        &mut self,
        reader: Box<dyn Reader>,
        content_type: &str,
        content_encoding: Option<&str>,
        content_length: u64,
        last_modified: &str,
    ) {
        let mut res = HttpResponse::with_default_headers(StatusCode::Ok);
        res.set_header("Content-Type", content_type);
        res.set_header("Content-Length", &content_length.to_string());
        res.set_header("Last-Modified", last_modified);
        if let Some(encoding) = content_encoding {
            res.set_header("Content-Encoding", encoding);
        }
        self.response_header = res.to_bytes_headers_only();
        self.header_offset = 0;
        self.reader = Some(reader);
        self.phase = Phase::SendingResponseHeader;
    }

    fn begin_error_response(&mut self, status: StatusCode) {
        let res = HttpResponse::error_response(status);
        self.response_header = res.to_bytes();
        self.header_offset = 0;
        self.reader = None;
        self.phase = Phase::SendingResponseHeader;
    }

    /// Resolves `target` against `path_to_serve`, rejecting anything that
    /// canonicalises outside of it. Directories get `/index.html` appended.
    fn resolve_path(&self, target: &str) -> Result<PathBuf> {
        let requested = self.path_to_serve.join(target.trim_start_matches('/'));
        let canonical = requested
            .canonicalize()
            .map_err(|_| Error::NotFound(requested.clone()))?;

        if !canonical.starts_with(self.path_to_serve.as_ref()) {
            return Err(Error::NotAllowed(format!(
                "{} escapes served root",
                canonical.display()
            )));
        }

        if canonical.is_dir() {
            let with_index = canonical.join("index.html");
            let canonical_index = with_index
                .canonicalize()
                .map_err(|_| Error::NotFound(with_index.clone()))?;
            if !canonical_index.starts_with(self.path_to_serve.as_ref()) {
                return Err(Error::NotAllowed(format!(
                    "{} escapes served root",
                    canonical_index.display()
                )));
            }
            return Ok(canonical_index);
        }

        Ok(canonical)
    }

    fn pump_write(&mut self) -> Disposition {
        loop {
            match self.phase {
                Phase::SendingResponseHeader => {
                    match self.drain_buffer(true) {
                        Disposition::Closed => return Disposition::Closed,
                        Disposition::Open => {}
                    }
                    if self.header_offset < self.response_header.len() {
                        return Disposition::Open; // would block, try again later
                    }
                    self.phase = if self.reader.is_some() {
                        Phase::SendingResponseBody
                    } else {
                        self.finish_response();
                        Phase::PendingRequest
                    };
                }
                Phase::SendingResponseBody => {
                    if self.body_offset == self.body_len {
                        match self.fill_body_chunk() {
                            Ok(true) => {}
                            Ok(false) => {
                                self.finish_response();
                                self.phase = Phase::PendingRequest;
                                continue;
                            }
                            Err(_) => {
                                self.phase = Phase::SocketClosed;
                                return Disposition::Closed;
                            }
                        }
                    }
                    match self.drain_body() {
                        Disposition::Closed => return Disposition::Closed,
                        Disposition::Open => {}
                    }
                    if self.body_offset < self.body_len {
                        return Disposition::Open;
                    }
                }
                _ => return Disposition::Open,
            }
        }
    }

    fn drain_buffer(&mut self, _is_header: bool) -> Disposition {
        while self.header_offset < self.response_header.len() {
            match self
                .stream
                .write(&self.response_header[self.header_offset..])
            {
                Ok(0) => return Disposition::Open,
                Ok(n) => self.header_offset += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Disposition::Open,
                Err(_) => {
                    self.phase = Phase::SocketClosed;
                    return Disposition::Closed;
                }
            }
        }
        Disposition::Open
    }

    fn fill_body_chunk(&mut self) -> Result<bool> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };
        if self.body_chunk.len() != SEND_CHUNK_SIZE {
            self.body_chunk.resize(SEND_CHUNK_SIZE, 0);
        }
        match reader.read(&mut self.body_chunk)? {
            None => Ok(false),
            Some(n) => {
                self.body_offset = 0;
                self.body_len = n;
                Ok(true)
            }
        }
    }

    fn drain_body(&mut self) -> Disposition {
        while self.body_offset < self.body_len {
            match self
                .stream
                .write(&self.body_chunk[self.body_offset..self.body_len])
            {
                Ok(0) => return Disposition::Open,
                Ok(n) => self.body_offset += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Disposition::Open,
                Err(_) => {
                    self.phase = Phase::SocketClosed;
                    return Disposition::Closed;
                }
            }
        }
        Disposition::Open
    }

    fn finish_response(&mut self) {
        self.response_header.clear();
        self.header_offset = 0;
        self.reader = None;
        self.body_offset = 0;
        self.body_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener as StdTcpListener;

    fn make_handler(served_root: &std::path::Path) -> (RequestHandler, std::net::TcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(server_side);

        let handler = RequestHandler::new(
            stream,
            Arc::new(served_root.to_path_buf()),
            CompressionCache::with_default_capacity(),
            TaskRunner::new(),
            "127.0.0.1".to_string(),
        );
        (handler, client)
    }

    #[test]
    fn serves_existing_file_with_ok_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();
        let served_root = dir.path().canonicalize().unwrap();

        let (handler, mut client) = make_handler(&served_root);
        let handler = Arc::new(Mutex::new(handler));

        client.write_all(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        RequestHandler::handle_update(&handler, true, false);
        RequestHandler::handle_update(&handler, false, true);

        let mut buf = [0u8; 4096];
        client.set_nonblocking(true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = client.read(&mut buf).unwrap_or(0);
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(text.contains("Last-Modified: "));
        assert!(text.ends_with("hi there"));
    }

    #[test]
    fn pipelined_request_bytes_do_not_clobber_the_in_flight_response() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"first").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"second").unwrap();
        let served_root = dir.path().canonicalize().unwrap();

        let (handler, mut client) = make_handler(&served_root);
        let handler = Arc::new(Mutex::new(handler));

        // Both requests land in one write, so a single `recv` on the server
        // side will have both sitting in its buffer at once.
        client
            .write_all(
                b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\nGET /b.txt HTTP/1.1\r\nHost: x\r\n\r\n",
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        RequestHandler::handle_update(&handler, true, false);
        RequestHandler::handle_update(&handler, false, true);

        let mut buf = [0u8; 4096];
        client.set_nonblocking(true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = client.read(&mut buf).unwrap_or(0);
        let text = String::from_utf8_lossy(&buf[..n]);

        // The first response must be the one fully written, unclobbered by
        // the second request's bytes being parsed early.
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with("first"));
        assert!(!text.contains("second"));
    }

    #[test]
    fn rejects_path_outside_served_root() {
        let dir = tempfile::tempdir().unwrap();
        let served_root = dir.path().canonicalize().unwrap();
        let (handler, mut client) = make_handler(&served_root);
        let handler = Arc::new(Mutex::new(handler));

        client
            .write_all(b"GET /../../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        RequestHandler::handle_update(&handler, true, false);
        RequestHandler::handle_update(&handler, false, true);

        let mut buf = [0u8; 4096];
        client.set_nonblocking(true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = client.read(&mut buf).unwrap_or(0);
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("HTTP/1.1 404") || text.starts_with("HTTP/1.1 400"));
    }
}

//! Acceptor: owns the listen socket, the `mio::Poll` readiness loop, and the
//! `fd -> ConnectionHandle` map.
//!
//! Grounded on `original_source/main/thttpd.{h,cc}` (bind/listen/epoll loop,
//! `AcceptNewClient`) — `kill-ux-01-server/src/server.rs` itself had nothing
//! reusable (a stray unrelated `Token` struct), so the loop shape comes
//! straight from the original C++.

use std::collections::HashMap;
use std::io::Read as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};

use crate::compression_cache::CompressionCache;
use crate::error::{Error, Result};
use crate::mpsc_queue::MpscQueue;
use crate::request_handler::{Disposition, RequestHandler};
use crate::task_runner::TaskRunner;
use crate::thread_pool::ThreadPool;

const LISTENER_TOKEN: Token = Token(0);
const CLOSE_PIPE_TOKEN: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

/// The acceptor-owned record for one live connection, holding only what the
/// acceptor thread itself needs: which runner owns it, a label for logging,
/// and the single strong handle to the per-connection state machine.
///
/// This replaces the original's design, where `RequestHandler` kept a
/// strong self-reference purely to survive an async compression-cache
/// callback — a cycle `original_source/main/request-handler.h`'s comments
/// never resolved. Here the acceptor is the only strong owner; the cache
/// callback captures a `Weak` (see `request_handler::handle_ready_request`),
/// so a connection that closes mid-lookup is simply dropped instead of
/// leaking.
struct ConnectionHandle {
    task_runner: Arc<TaskRunner>,
    client_ip: String,
    handler: Arc<Mutex<RequestHandler>>,
}

pub struct Server {
    listener: TcpListener,
    poll: Poll,
    close_tx: Arc<Mutex<pipe::Sender>>,
    close_rx: pipe::Receiver,
    closed_tokens: Arc<MpscQueue<Token>>,
    connections: HashMap<Token, ConnectionHandle>,
    next_token: usize,
    thread_pool: ThreadPool,
    path_to_serve: Arc<PathBuf>,
    compression_cache: Arc<CompressionCache>,
}

impl Server {
    pub fn new(
        port: u16,
        path_to_serve: PathBuf,
        num_worker_threads: usize,
        cache_bytes: u64,
    ) -> Result<Self> {
        let addr: SocketAddr = SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port);
        let mut listener =
            TcpListener::bind(addr).map_err(|e| Error::posix("bind/listen failed", e))?;

        let poll = Poll::new().map_err(|e| Error::posix("poll creation failed", e))?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|e| Error::posix("registering listen socket failed", e))?;

        let (close_tx, mut close_rx) =
            pipe::new().map_err(|e| Error::posix("pipe creation failed", e))?;
        poll.registry()
            .register(&mut close_rx, CLOSE_PIPE_TOKEN, Interest::READABLE)
            .map_err(|e| Error::posix("registering close pipe failed", e))?;

        proxy_log::info!("Listening on port {}", port);

        Ok(Server {
            listener,
            poll,
            close_tx: Arc::new(Mutex::new(close_tx)),
            close_rx,
            closed_tokens: Arc::new(MpscQueue::new()),
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            thread_pool: ThreadPool::new(num_worker_threads),
            path_to_serve: Arc::new(path_to_serve),
            compression_cache: CompressionCache::new(cache_bytes),
        })
    }

    /// Blocks forever, driving the readiness loop.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(4096);
        loop {
            self.poll
                .poll(&mut events, None)
                .map_err(|e| Error::posix("poll failed", e))?;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_new_clients(),
                    CLOSE_PIPE_TOKEN => self.drain_close_pipe(),
                    token => {
                        self.dispatch(token, event.is_readable(), event.is_writable());
                    }
                }
            }

            self.reap_closed();
        }
    }

    fn accept_new_clients(&mut self) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    proxy_log::error!("accept failed: {}", e);
                    break;
                }
            };

            let token = Token(self.next_token);
            self.next_token += 1;

            let mut stream = stream;
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                proxy_log::error!("registering connection socket failed: {}", e);
                continue;
            }

            let client_ip = addr.ip().to_string();
            proxy_log::trace!("connection from {}", client_ip);

            let task_runner = self.thread_pool.next_runner();
            self.spawn_connection(token, stream, client_ip, task_runner);
        }
    }

    fn spawn_connection(
        &mut self,
        token: Token,
        stream: TcpStream,
        client_ip: String,
        task_runner: Arc<TaskRunner>,
    ) {
        let handler = Arc::new(Mutex::new(RequestHandler::new(
            stream,
            Arc::clone(&self.path_to_serve),
            Arc::clone(&self.compression_cache),
            Arc::clone(&task_runner),
            client_ip.clone(),
        )));

        self.connections.insert(
            token,
            ConnectionHandle {
                task_runner,
                client_ip,
                handler,
            },
        );
    }

    fn dispatch(&mut self, token: Token, can_read: bool, can_write: bool) {
        let Some(conn) = self.connections.get(&token) else {
            return;
        };

        let handler = Arc::clone(&conn.handler);
        let closed_tokens = Arc::clone(&self.closed_tokens);
        let close_tx = Arc::clone(&self.close_tx);

        conn.task_runner.post_task(move || {
            let disposition = RequestHandler::handle_update(&handler, can_read, can_write);
            if disposition == Disposition::Closed {
                closed_tokens.push(token);
                notify_closed(&close_tx);
            }
        });
    }

    fn drain_close_pipe(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.close_rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn reap_closed(&mut self) {
        while !self.closed_tokens.empty() {
            let token = self.closed_tokens.pop();
            if let Some(conn) = self.connections.remove(&token) {
                proxy_log::trace!("closing connection from {}", conn.client_ip);
            }
        }
    }
}

/// Writes one byte to the close-notification pipe, waking the acceptor's
/// poll loop so it re-checks `closed_tokens`. This is the cross-thread
/// handoff for "a connection closed on some worker thread, the acceptor
/// needs to stop polling its socket": push the token, then nudge the
/// acceptor's poll loop awake. The pipe is shared (rather than duplicated
/// per connection) since every `TaskRunner` writes through it only on the
/// rare occasion its connection closes.
fn notify_closed(sender: &Mutex<pipe::Sender>) {
    use std::io::Write as _;
    let _ = sender.lock().unwrap().write_all(&[0u8]);
}

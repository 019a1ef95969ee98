//! In-memory cache of gzip-compressed file contents.
//!
//! Grounded on `original_source/main/compression-cache.{h,cc}`: files are
//! read once, deflated into 16 KiB chunks, and shared (`Arc`) across every
//! reader. Concurrent requests for a path that hasn't loaded yet collapse
//! into a single read (`PendingRead`); everyone waiting gets the same
//! result. Lookups have two tiers: a fast, lock-free snapshot any thread can
//! read, and an authoritative map owned by the cache's own [`TaskRunner`]
//! that the snapshot is republished from on every successful insert.

use std::collections::HashMap;
use std::io::Read as _;
use std::sync::Arc;

use arc_swap::ArcSwap;
use flate2::read::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::file_reader::{FileReader, Reader};
use crate::task_runner::TaskRunner;

const CHUNK_SIZE: usize = 16 * 1024;
const DEFAULT_MAX_TOTAL_BYTES: u64 = 256 * 1024 * 1024;

struct CachedFile {
    chunks: Vec<Vec<u8>>,
    total_size: u64,
    insertion_seq: u64,
}

/// A lazily-advancing view over one [`CachedFile`]'s chunks. Implements
/// [`Reader`] so it can be driven the same way as [`FileReader`].
pub struct CacheFileCursor {
    file: Arc<CachedFile>,
    chunk_idx: usize,
    chunk_offset: usize,
}

impl CacheFileCursor {
    /// Total compressed size in bytes, for the response's `Content-Length`.
    pub fn total_size(&self) -> u64 {
        self.file.total_size
    }
}

impl Reader for CacheFileCursor {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.chunk_idx >= self.file.chunks.len() {
            return Ok(None);
        }
        let mut written = 0;
        while written < buf.len() && self.chunk_idx < self.file.chunks.len() {
            let chunk = &self.file.chunks[self.chunk_idx];
            let available = chunk.len() - self.chunk_offset;
            let to_copy = available.min(buf.len() - written);
            buf[written..written + to_copy]
                .copy_from_slice(&chunk[self.chunk_offset..self.chunk_offset + to_copy]);
            written += to_copy;
            self.chunk_offset += to_copy;
            if self.chunk_offset == chunk.len() {
                self.chunk_idx += 1;
                self.chunk_offset = 0;
            }
        }
        if written == 0 {
            Ok(None)
        } else {
            Ok(Some(written))
        }
    }

    fn eof(&self) -> bool {
        self.chunk_idx >= self.file.chunks.len()
    }
}

type FileCallback = Box<dyn FnOnce(Result<CacheFileCursor>) + Send>;

struct PendingRead {
    callbacks: Vec<FileCallback>,
}

struct Snapshot {
    files: HashMap<String, Arc<CachedFile>>,
}

/// Caches gzip-compressed file bodies, keyed by path on disk. `request_file`
/// may be called from any [`TaskRunner`]. The callback's thread is *not*
/// guaranteed: a cache hit invokes it synchronously on the calling thread,
/// while a miss invokes it later from the cache's own runner. A caller that
/// touches non-thread-safe state from the callback must post back onto its
/// own runner itself rather than assume either case (see
/// `request_handler::handle_ready_request`).
pub struct CompressionCache {
    max_total_bytes: u64,
    task_runner: Arc<TaskRunner>,
    snapshot: ArcSwap<Snapshot>,
    // Owned by `task_runner` — only ever touched from callbacks posted to it.
    path_to_cached_file: std::cell::RefCell<HashMap<String, Arc<CachedFile>>>,
    path_to_pending_read: std::cell::RefCell<HashMap<String, PendingRead>>,
    next_insertion_seq: std::cell::Cell<u64>,
}

// SAFETY: the `RefCell`/`Cell` fields are only ever accessed from tasks
// posted to `task_runner`, i.e. from a single thread at a time, mirroring
// the original's single-owner discipline for its non-atomic maps.
unsafe impl Sync for CompressionCache {}

impl CompressionCache {
    pub fn new(max_total_bytes: u64) -> Arc<Self> {
        Arc::new(CompressionCache {
            max_total_bytes,
            task_runner: TaskRunner::new(),
            snapshot: ArcSwap::from_pointee(Snapshot {
                files: HashMap::new(),
            }),
            path_to_cached_file: std::cell::RefCell::new(HashMap::new()),
            path_to_pending_read: std::cell::RefCell::new(HashMap::new()),
            next_insertion_seq: std::cell::Cell::new(0),
        })
    }

    pub fn with_default_capacity() -> Arc<Self> {
        Self::new(DEFAULT_MAX_TOTAL_BYTES)
    }

    /// Requests the compressed bytes for `path`. `callback` is invoked
    /// exactly once, from `caller`, with either a ready [`CacheFileCursor`]
    /// or the error encountered loading the file.
    pub fn request_file(
        self: &Arc<Self>,
        path: String,
        caller: Arc<TaskRunner>,
        callback: impl FnOnce(Result<CacheFileCursor>) + Send + 'static,
    ) {
        if let Some(file) = self.snapshot.load().files.get(&path) {
            callback(Ok(cursor(Arc::clone(file))));
            return;
        }

        let this = Arc::clone(self);
        self.task_runner.post_task(move || {
            this.request_file_slow_path(path, caller, Box::new(callback));
        });
    }

    fn request_file_slow_path(
        self: &Arc<Self>,
        path: String,
        caller: Arc<TaskRunner>,
        callback: FileCallback,
    ) {
        debug_assert!(self.task_runner.is_current_thread());

        if let Some(file) = self.path_to_cached_file.borrow().get(&path) {
            callback(Ok(cursor(Arc::clone(file))));
            return;
        }

        let mut pending = self.path_to_pending_read.borrow_mut();
        let entry = pending.entry(path.clone()).or_insert_with(|| PendingRead {
            callbacks: Vec::new(),
        });
        entry.callbacks.push(callback);
        let is_first = entry.callbacks.len() == 1;
        drop(pending);

        if !is_first {
            return;
        }

        let this = Arc::clone(self);
        let my_thread = Arc::clone(&self.task_runner);
        caller.post_task(move || {
            this.read_file(path, my_thread);
        });
    }

    fn read_file(self: &Arc<Self>, path: String, my_thread: Arc<TaskRunner>) {
        let result = CachedFile::load(&path);
        let this = Arc::clone(self);
        my_thread.post_task(move || {
            this.on_read_file(path, result);
        });
    }

    fn on_read_file(self: &Arc<Self>, path: String, result: Result<CachedFile>) {
        debug_assert!(self.task_runner.is_current_thread());

        let Some(pending) = self.path_to_pending_read.borrow_mut().remove(&path) else {
            return;
        };

        match result {
            Err(err) => {
                for callback in pending.callbacks {
                    callback(Err(clone_error(&err)));
                }
            }
            Ok(mut file) => {
                let seq = self.next_insertion_seq.get();
                self.next_insertion_seq.set(seq + 1);
                file.insertion_seq = seq;
                let file = Arc::new(file);

                self.path_to_cached_file
                    .borrow_mut()
                    .insert(path.clone(), Arc::clone(&file));
                self.evict_if_needed();
                self.publish_snapshot();

                for callback in pending.callbacks {
                    callback(Ok(cursor(Arc::clone(&file))));
                }
            }
        }
    }

    /// Insertion-order eviction: while the cached total exceeds
    /// `max_total_bytes`, drop the oldest-inserted entry. The eviction
    /// policy itself is left open by the original ("enforce file size" is a
    /// TODO there); insertion order is the simplest interpretation of "the
    /// cache has a cap" that needs no extra bookkeeping beyond what's
    /// already tracked.
    fn evict_if_needed(&self) {
        let mut map = self.path_to_cached_file.borrow_mut();
        loop {
            let total: u64 = map.values().map(|f| f.total_size).sum();
            if total <= self.max_total_bytes || map.len() <= 1 {
                break;
            }
            let Some(oldest_path) = map
                .iter()
                .min_by_key(|(_, f)| f.insertion_seq)
                .map(|(path, _)| path.clone())
            else {
                break;
            };
            map.remove(&oldest_path);
        }
    }

    fn publish_snapshot(&self) {
        let files = self.path_to_cached_file.borrow().clone();
        self.snapshot.store(Arc::new(Snapshot { files }));
    }
}

fn cursor(file: Arc<CachedFile>) -> CacheFileCursor {
    CacheFileCursor {
        file,
        chunk_idx: 0,
        chunk_offset: 0,
    }
}

fn clone_error(err: &Error) -> Error {
    Error::Compression(err.to_string())
}

impl CachedFile {
    fn load(path: &str) -> Result<Self> {
        let file_reader = FileReader::open(path)?;
        let mut encoder = GzEncoder::new(ReaderAdapter(file_reader), Compression::default());

        let mut chunks = Vec::new();
        let mut total_size = 0u64;
        loop {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            let mut filled = 0;
            while filled < chunk.len() {
                let n = encoder
                    .read(&mut chunk[filled..])
                    .map_err(|e| Error::Compression(e.to_string()))?;
                if n == 0 {
                    break;
                }
                filled += n;
                total_size += n as u64;
            }
            chunk.truncate(filled);
            let is_last = filled < CHUNK_SIZE;
            chunks.push(chunk);
            if is_last {
                break;
            }
        }

        Ok(CachedFile {
            chunks,
            total_size,
            insertion_seq: 0,
        })
    }
}

/// Bridges our `Reader` trait to `std::io::Read` for `flate2::GzEncoder`.
struct ReaderAdapter(FileReader);

impl std::io::Read for ReaderAdapter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0
            .read(buf)
            .map(|opt| opt.unwrap_or(0))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

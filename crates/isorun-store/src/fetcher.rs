//! Priority-ordered, retrying pool of fetch workers.
//!
//! Items are served lowest effective priority first, FIFO among equals. The
//! public priorities occupy the high bits of the effective priority and the low
//! [`RETRY_BITS`] hold a retry counter, so a retried item sorts behind fresh work
//! of the same priority. Content is streamed into a temporary file next to the
//! destination and renamed into place only once it validates.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{error::FetchError, transport::Transport};

pub const INITIAL_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 16;
pub const RETRIES: u32 = 5;
const RETRY_BITS: u32 = (1 << 8) - 1;
#[cfg(unix)]
const BLOB_MODE: u32 = 0o644;

/// Externally visible priorities. Higher urgency sorts first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    #[must_use]
    pub const fn value(self) -> u32 {
        match self {
            Self::High => 1 << 8,
            Self::Medium => 2 << 8,
            Self::Low => 3 << 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherOptions {
    pub initial_workers: usize,
    pub max_workers: usize,
    pub retries: u32,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            initial_workers: INITIAL_WORKERS,
            max_workers: MAX_WORKERS,
            retries: RETRIES,
        }
    }
}

#[derive(Debug)]
struct QueuedItem {
    priority: u32,
    index: u64,
    key: String,
    dest: PathBuf,
    size: Option<u64>,
}

// BinaryHeap is a max-heap; invert so the smallest (priority, index) pops first.
impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.index == other.index
    }
}

impl Eq for QueuedItem {}

#[derive(Default)]
struct State {
    queue: BinaryHeap<QueuedItem>,
    next_index: u64,
    /// Submitted items whose outcome has not been reported yet.
    outstanding: usize,
    idle: usize,
    workers: usize,
    failures: VecDeque<FetchError>,
    completed: VecDeque<String>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    work: Condvar,
    done: Condvar,
    transport: Arc<dyn Transport>,
    options: FetcherOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, outcome: Result<String, FetchError>) {
        let mut state = self.lock();
        match outcome {
            Ok(key) => state.completed.push_back(key),
            Err(err) => state.failures.push_back(err),
        }
        state.outstanding -= 1;
        drop(state);
        self.done.notify_all();
    }
}

/// Concurrent fetcher of content-addressed items into local files.
pub struct ContentFetcher {
    shared: Arc<Shared>,
}

impl ContentFetcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, FetcherOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: FetcherOptions) -> Self {
        let max_workers = options.max_workers.max(1);
        let options = FetcherOptions {
            max_workers,
            initial_workers: options.initial_workers.clamp(1, max_workers),
            retries: options.retries.min(RETRY_BITS),
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work: Condvar::new(),
            done: Condvar::new(),
            transport,
            options,
        });
        for _ in 0..options.initial_workers {
            shared.lock().workers += 1;
            spawn_worker(&shared);
        }
        Self { shared }
    }

    /// Queue `key` for download into `dest`. Lower priorities are served first.
    pub fn add_item(
        &self,
        priority: Priority,
        key: impl Into<String>,
        dest: impl Into<PathBuf>,
        size: Option<u64>,
    ) {
        enqueue(
            &self.shared,
            QueuedItem {
                priority: priority.value(),
                index: 0,
                key: key.into(),
                dest: dest.into(),
                size,
            },
            true,
        );
    }

    /// Block until the next item completes and return its key.
    ///
    /// Permanent failures are reported ahead of successful completions. Returns
    /// `None` when nothing is queued or in flight, since waiting would never end.
    pub fn get_result(&self) -> Option<Result<String, FetchError>> {
        let mut state = self.shared.lock();
        loop {
            if let Some(err) = state.failures.pop_front() {
                return Some(Err(err));
            }
            if let Some(key) = state.completed.pop_front() {
                return Some(Ok(key));
            }
            if state.outstanding == 0 {
                return None;
            }
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until every queued item has completed or permanently failed.
    pub fn join(&self) {
        let mut state = self.shared.lock();
        while state.outstanding > 0 {
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.lock().workers
    }
}

impl Drop for ContentFetcher {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.work.notify_all();
    }
}

fn enqueue(shared: &Arc<Shared>, mut item: QueuedItem, fresh: bool) {
    let spawn = {
        let mut state = shared.lock();
        item.index = state.next_index;
        state.next_index += 1;
        state.queue.push(item);
        if fresh {
            state.outstanding += 1;
        }
        let spawn = state.idle == 0 && state.workers < shared.options.max_workers;
        if spawn {
            state.workers += 1;
        }
        spawn
    };
    shared.work.notify_one();
    if spawn {
        spawn_worker(shared);
    }
}

fn spawn_worker(shared: &Arc<Shared>) {
    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("isorun-fetch".into())
        .spawn(move || run_worker(&worker));
    if let Err(err) = spawned {
        warn!(%err, "failed to start fetch worker");
        shared.lock().workers -= 1;
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let item = {
            let mut state = shared.lock();
            loop {
                if let Some(item) = state.queue.pop() {
                    break item;
                }
                if state.shutdown {
                    state.workers -= 1;
                    return;
                }
                state.idle += 1;
                state = shared
                    .work
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                state.idle -= 1;
            }
        };

        match fetch_item(shared.transport.as_ref(), &item) {
            Ok(()) => shared.finish(Ok(item.key)),
            Err(err) if err.is_transient() && (item.priority & RETRY_BITS) < shared.options.retries => {
                warn!(key = %item.key, attempt = (item.priority & RETRY_BITS) + 1, %err, "retrying fetch");
                let retry = QueuedItem {
                    priority: item.priority + 1,
                    ..item
                };
                requeue(shared, retry);
            }
            Err(err) => {
                warn!(key = %item.key, %err, "fetch failed permanently");
                shared.finish(Err(err));
            }
        }
    }
}

fn requeue(shared: &Shared, mut item: QueuedItem) {
    let mut state = shared.lock();
    item.index = state.next_index;
    state.next_index += 1;
    state.queue.push(item);
    drop(state);
    shared.work.notify_one();
}

fn fetch_item(transport: &dyn Transport, item: &QueuedItem) -> Result<(), FetchError> {
    if item.key.is_empty() || item.key.contains(['/', '\\']) || item.key.starts_with('.') {
        return Err(FetchError::InvalidKey {
            key: item.key.clone(),
        });
    }
    let io_err = |source| FetchError::Io {
        key: item.key.clone(),
        source,
    };
    let parent = item
        .dest
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err)?;

    // Dropping the temp file on any early return removes the partial download.
    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    let written = transport.fetch(&item.key, tmp.as_file_mut())?;
    let actual = tmp.as_file().metadata().map_err(io_err)?.len();
    if let Some(expected) = item.size {
        if actual != expected {
            return Err(FetchError::SizeMismatch {
                key: item.key.clone(),
                expected,
                actual,
            });
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(BLOB_MODE))
            .map_err(io_err)?;
    }
    tmp.persist(&item.dest).map_err(|err| io_err(err.error))?;
    debug!(key = %item.key, bytes = written, dest = %item.dest.display(), "fetched item");
    Ok(())
}

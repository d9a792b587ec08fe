use crate::error::Result;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify, OnceCell};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".jsonl";

#[derive(Default)]
struct QueueState {
    head: VecDeque<String>,
    segments: VecDeque<PathBuf>,
    tail: VecDeque<String>,
    next_segment: u64,
}

/// Disk-spilling FIFO queue of lines.
pub struct SpillQueue {
    dir: PathBuf,
    memory_limit: usize,
    /// Disk-operation gate: held across segment flush/load so they cannot
    /// interleave with another push or pop.
    state: Mutex<QueueState>,
    signal: Notify,
    ready: OnceCell<()>,
    closed: AtomicBool,
    len: AtomicUsize,
}

impl SpillQueue {
    pub fn new(dir: impl Into<PathBuf>, memory_limit: usize) -> Self {
        Self {
            dir: dir.into(),
            memory_limit: memory_limit.max(1),
            state: Mutex::new(QueueState::default()),
            signal: Notify::new(),
            ready: OnceCell::new(),
            closed: AtomicBool::new(false),
            len: AtomicUsize::new(0),
        }
    }

    /// Creates the segment directory and clears segments left by an earlier
    /// process. Concurrent callers share a single setup run.
    pub async fn init_cache(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.dir).await?;
                let mut entries = tokio::fs::read_dir(&self.dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if is_segment(&entry.path()) {
                        tokio::fs::remove_file(entry.path()).await?;
                    }
                }
                tracing::debug!("Queue cache ready at {}", self.dir.display());
                Ok::<(), crate::error::ClusterError>(())
            })
            .await?;
        Ok(())
    }

    /// Appends a line, spilling the tail to disk when it reaches the limit.
    pub async fn push(&self, line: String) -> Result<()> {
        self.init_cache().await?;

        let mut state = self.state.lock().await;
        if state.segments.is_empty() && state.tail.is_empty() && state.head.len() < self.memory_limit
        {
            state.head.push_back(line);
        } else {
            state.tail.push_back(line);
            if state.tail.len() >= self.memory_limit {
                self.flush_tail(&mut state).await?;
            }
        }
        self.len.fetch_add(1, Ordering::SeqCst);
        drop(state);

        self.signal.notify_one();
        Ok(())
    }

    /// Removes the oldest entry, loading the oldest segment when memory runs dry.
    pub async fn pop(&self) -> Result<Option<String>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.head.is_empty() {
            if let Some(path) = state.segments.pop_front() {
                match read_segment(&path).await {
                    Ok(entries) => state.head = entries,
                    Err(e) => {
                        state.segments.push_front(path);
                        return Err(e);
                    }
                }
                tokio::fs::remove_file(&path).await?;
                tracing::trace!("Loaded queue segment {}", path.display());
            } else if !state.tail.is_empty() {
                std::mem::swap(&mut state.head, &mut state.tail);
            }
        }

        let item = state.head.pop_front();
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(item)
    }

    /// Waits until an entry is available. Returns `None` once the queue has
    /// been closed and fully drained. Meant for a single consumer.
    pub async fn pop_wait(&self) -> Result<Option<String>> {
        loop {
            if let Some(item) = self.pop().await? {
                return Ok(Some(item));
            }
            if self.closed.load(Ordering::SeqCst) {
                return self.pop().await;
            }
            self.signal.notified().await;
        }
    }

    /// Marks the producer side as finished and wakes the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.signal.notify_one();
        self.signal.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segments currently on disk.
    pub async fn segment_count(&self) -> usize {
        self.state.lock().await.segments.len()
    }

    /// Deletes the segment directory.
    pub async fn remove_cache(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn flush_tail(&self, state: &mut QueueState) -> Result<()> {
        let path = self.dir.join(format!(
            "{}{:020}{}",
            SEGMENT_PREFIX, state.next_segment, SEGMENT_SUFFIX
        ));

        let mut contents = String::new();
        for entry in &state.tail {
            contents.push_str(&serde_json::to_string(entry)?);
            contents.push('\n');
        }
        tokio::fs::write(&path, contents).await?;

        tracing::debug!(
            "Spilled {} queued entries to {}",
            state.tail.len(),
            path.display()
        );

        state.next_segment += 1;
        state.tail.clear();
        state.segments.push_back(path);
        Ok(())
    }
}

fn is_segment(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX))
        .unwrap_or(false)
}

async fn read_segment(path: &Path) -> Result<VecDeque<String>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut entries = VecDeque::new();
    for line in raw.lines().filter(|line| !line.is_empty()) {
        entries.push_back(serde_json::from_str::<String>(line)?);
    }
    Ok(entries)
}

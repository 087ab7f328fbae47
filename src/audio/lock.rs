use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::debug;

use super::processor::{ChunkProcessor, ProcessedChunk};
use crate::{cache::ChunkKey, error::ProcessingError};

/// Serializes every call into a stateful [`ChunkProcessor`].
///
/// Three call shapes share one mutex, so at most one processor call runs at
/// any time whichever entry point is used:
///
/// - [`ProcessingLock::process`]: async, waits for the lock on the blocking
///   pool and suspends the calling task meanwhile
/// - [`ProcessingLock::process_blocking`]: parks the current thread until the
///   lock is free, usable from sync code and from inside async tasks
/// - [`ProcessingLock::exclusive`]: takes the lock once and hands out an
///   [`ExclusiveProcessor`] whose calls need no further locking, for strictly
///   sequential jobs such as exports
pub struct ProcessingLock<P> {
    inner: Arc<Mutex<P>>,
}

impl<P> Clone for ProcessingLock<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ChunkProcessor> ProcessingLock<P> {
    pub fn new(processor: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(processor)),
        }
    }

    pub async fn process(&self, key: ChunkKey) -> Result<ProcessedChunk, ProcessingError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut processor = inner.lock();
            debug!("🔒 Procesando {}", key);
            processor.process(&key)
        })
        .await
        .map_err(|e| ProcessingError::Aborted(e.to_string()))?
    }

    pub fn process_blocking(&self, key: &ChunkKey) -> Result<ProcessedChunk, ProcessingError> {
        let mut processor = self.inner.lock();
        processor.process(key)
    }

    pub fn exclusive(&self) -> ExclusiveProcessor<'_, P> {
        ExclusiveProcessor {
            guard: self.inner.lock(),
        }
    }
}

/// Held lock on the processor; calls go straight through.
pub struct ExclusiveProcessor<'a, P> {
    guard: MutexGuard<'a, P>,
}

impl<P: ChunkProcessor> ExclusiveProcessor<'_, P> {
    pub fn process(&mut self, key: &ChunkKey) -> Result<ProcessedChunk, ProcessingError> {
        self.guard.process(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Preset;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    #[derive(Default)]
    struct Counters {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    // Deliberately non-reentrant: trips if two calls overlap.
    struct SlowProcessor {
        counters: Arc<Counters>,
    }

    impl ChunkProcessor for SlowProcessor {
        fn process(&mut self, _key: &ChunkKey) -> Result<ProcessedChunk, ProcessingError> {
            let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.counters.calls.fetch_add(1, Ordering::SeqCst);
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
            Ok(ProcessedChunk::new(vec![0.0; 4], 2, 44_100))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_call_shapes_are_mutually_exclusive() {
        let counters = Arc::new(Counters::default());
        let lock = ProcessingLock::new(SlowProcessor {
            counters: Arc::clone(&counters),
        });

        let mut handles = Vec::new();
        for i in 0..6u32 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move {
                lock.process(ChunkKey::new(1, Preset::Warm, i, 1.0)).await
            }));
        }
        for i in 0..3u32 {
            let lock = lock.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                lock.process_blocking(&ChunkKey::new(1, Preset::Bright, i, 1.0))
            }));
        }
        {
            let lock = lock.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let mut exclusive = lock.exclusive();
                for i in 0..3u32 {
                    exclusive.process(&ChunkKey::new(1, Preset::Gentle, i, 1.0))?;
                }
                Ok(ProcessedChunk::new(vec![], 2, 44_100))
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(counters.calls.load(Ordering::SeqCst), 12);
        assert_eq!(counters.max_active.load(Ordering::SeqCst), 1);
    }
}

use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BufferManager, ChunkRequest};
use crate::{
    audio::{ChunkProcessor, ProcessingLock},
    cache::ChunkKey,
    config::Config,
    error::ProcessingError,
    memory::DegradationManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Paused,
}

/// Polls the buffer for missing chunks and fills them through the processor.
///
/// Requests are deduplicated by [`ChunkKey`] while in flight. Pausing stops
/// new work only; calls already issued run to completion.
pub struct BackgroundWorker<P> {
    buffer: Arc<BufferManager>,
    processor: ProcessingLock<P>,
    degradation: Arc<DegradationManager>,
    state: watch::Receiver<WorkerState>,
    in_flight: Arc<DashMap<ChunkKey, Instant>>,
    poll_interval: Duration,
    max_in_flight: usize,
}

impl<P: ChunkProcessor> BackgroundWorker<P> {
    pub fn new(
        buffer: Arc<BufferManager>,
        processor: ProcessingLock<P>,
        degradation: Arc<DegradationManager>,
        state: watch::Receiver<WorkerState>,
        config: &Config,
    ) -> Self {
        Self {
            buffer,
            processor,
            degradation,
            state,
            in_flight: Arc::new(DashMap::new()),
            poll_interval: config.worker_poll_interval(),
            max_in_flight: config.worker_max_in_flight,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// One poll. Spawns processing for needed chunks that are not already in
    /// flight and returns how many were started.
    pub fn tick(&self, tasks: &mut JoinSet<()>) -> usize {
        if self.state() == WorkerState::Paused {
            return 0;
        }
        let Some(track_id) = self.buffer.active_track() else {
            return 0;
        };

        let mut started = 0;
        for request in self.buffer.needed_requests(track_id) {
            if self.in_flight.len() >= self.max_in_flight {
                break;
            }
            match self.in_flight.entry(request.key) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(Instant::now());
                }
            }
            tasks.spawn(self.fill(request));
            started += 1;
        }

        if started > 0 {
            debug!("🔧 Worker: {} chunks iniciados, {} en curso", started, self.in_flight.len());
        }
        started
    }

    fn fill(&self, request: ChunkRequest) -> impl std::future::Future<Output = ()> + Send + 'static {
        let buffer = Arc::clone(&self.buffer);
        let processor = self.processor.clone();
        let degradation = Arc::clone(&self.degradation);
        let in_flight = Arc::clone(&self.in_flight);

        async move {
            let started = Instant::now();
            let result = processor.process(request.key).await;
            degradation.record_latency(started.elapsed());

            match result {
                Ok(chunk) => {
                    buffer.complete_chunk(&request, chunk);
                }
                Err(ProcessingError::ChunkOutOfRange { track_id, chunk_idx }) => {
                    buffer.mark_track_end(track_id, chunk_idx);
                }
                Err(e) => {
                    warn!("⚠️ {} no disponible, se reintentará: {}", request.key, e);
                }
            }
            in_flight.remove(&request.key);
        }
    }

    /// Runs until `cancel` fires, then waits for in-flight calls.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "🔧 Worker en segundo plano iniciado (sondeo {}, máx. {} en curso)",
            humantime::format_duration(self.poll_interval),
            self.max_in_flight
        );

        let mut tasks = JoinSet::new();
        let mut last_state = self.state();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("❌ Tarea del worker falló: {}", e);
                }
            }

            let state = self.state();
            if state != last_state {
                info!("🔧 Worker {:?} → {:?}", last_state, state);
                last_state = state;
            }

            self.tick(&mut tasks);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("🛑 Deteniendo worker, {} chunks en curso", tasks.len());
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{Preset, ProcessedChunk},
        cache::TierName,
        memory::DegradationLevel,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls; fails on chunks at or past `fail_from`.
    struct FakeProcessor {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        fail_from: Option<(u32, bool)>,
    }

    impl ChunkProcessor for FakeProcessor {
        fn process(&mut self, key: &ChunkKey) -> Result<ProcessedChunk, ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            match self.fail_from {
                Some((from, true)) if key.chunk_idx >= from => Err(ProcessingError::ChunkOutOfRange {
                    track_id: key.track_id,
                    chunk_idx: key.chunk_idx,
                }),
                Some((from, false)) if key.chunk_idx >= from => {
                    Err(ProcessingError::Decode("corrupt frame".into()))
                }
                _ => Ok(ProcessedChunk::new(vec![0.2; 512], 2, 44_100)),
            }
        }
    }

    struct Harness {
        buffer: Arc<BufferManager>,
        degradation: Arc<DegradationManager>,
        worker: BackgroundWorker<FakeProcessor>,
        calls: Arc<AtomicUsize>,
    }

    fn harness(max_in_flight: usize, delay: Duration, fail_from: Option<(u32, bool)>) -> Harness {
        let config = Config {
            worker_max_in_flight: max_in_flight,
            worker_poll_interval_ms: 5,
            ..Default::default()
        };
        let buffer = Arc::new(BufferManager::new(&config));
        let (tx, rx) = watch::channel(WorkerState::Running);
        let degradation = Arc::new(DegradationManager::new(
            Arc::clone(&buffer),
            tx,
            config.tier_budgets(),
            config.worker_latency_threshold(),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let processor = ProcessingLock::new(FakeProcessor {
            calls: Arc::clone(&calls),
            delay,
            fail_from,
        });
        let worker = BackgroundWorker::new(
            Arc::clone(&buffer),
            processor,
            Arc::clone(&degradation),
            rx,
            &config,
        );
        Harness {
            buffer,
            degradation,
            worker,
            calls,
        }
    }

    async fn drain(tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test]
    async fn test_idle_buffer_starts_nothing() {
        let h = harness(4, Duration::ZERO, None);
        let mut tasks = JoinSet::new();
        assert_eq!(h.worker.tick(&mut tasks), 0);
    }

    #[tokio::test]
    async fn test_in_flight_chunks_are_not_requested_twice() {
        let h = harness(1_000, Duration::from_millis(20), None);
        h.buffer.update_position(1, 0.0, Preset::Adaptive, 1.0);
        let needed = h.buffer.needed_requests(1).len();

        let mut tasks = JoinSet::new();
        assert_eq!(h.worker.tick(&mut tasks), needed);
        assert_eq!(h.worker.tick(&mut tasks), 0);
        drain(&mut tasks).await;

        assert_eq!(h.calls.load(Ordering::SeqCst), needed);
        assert_eq!(h.worker.in_flight(), 0);
        assert!(h.buffer.get_needed_chunks(1).is_empty());
        assert!(h.degradation.average_latency().is_some());
    }

    #[tokio::test]
    async fn test_in_flight_limit() {
        let h = harness(3, Duration::from_millis(5), None);
        h.buffer.update_position(1, 0.0, Preset::Adaptive, 1.0);

        let mut tasks = JoinSet::new();
        assert_eq!(h.worker.tick(&mut tasks), 3);
        assert_eq!(h.worker.tick(&mut tasks), 0);
        drain(&mut tasks).await;
        assert_eq!(h.worker.tick(&mut tasks), 3);
        drain(&mut tasks).await;
    }

    #[tokio::test]
    async fn test_paused_worker_issues_no_work() {
        let h = harness(4, Duration::ZERO, None);
        h.buffer.update_position(1, 0.0, Preset::Adaptive, 1.0);
        h.degradation.apply(DegradationLevel::Emergency, 0.95);

        let mut tasks = JoinSet::new();
        assert_eq!(h.worker.state(), WorkerState::Paused);
        assert_eq!(h.worker.tick(&mut tasks), 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pausing_lets_in_flight_chunks_land() {
        let h = harness(3, Duration::from_millis(30), None);
        h.buffer.update_position(1, 0.0, Preset::Adaptive, 1.0);
        let issued: Vec<ChunkRequest> = h.buffer.needed_requests(1).into_iter().take(3).collect();
        assert!(issued.iter().all(|r| r.tier == TierName::L1));

        let mut tasks = JoinSet::new();
        assert_eq!(h.worker.tick(&mut tasks), 3);
        h.degradation.apply(DegradationLevel::Emergency, 0.95);
        assert_eq!(h.worker.state(), WorkerState::Paused);
        assert_eq!(h.worker.tick(&mut tasks), 0);
        drain(&mut tasks).await;

        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.worker.in_flight(), 0);
        for request in issued {
            let key = request.key;
            assert_eq!(
                h.buffer.is_cached(1, key.preset, key.chunk_idx, key.intensity()),
                Some(TierName::L1),
                "{key}"
            );
        }
    }

    #[tokio::test]
    async fn test_failed_chunks_stay_missing() {
        let h = harness(1_000, Duration::ZERO, Some((1, false)));
        h.buffer.update_position(1, 0.0, Preset::Adaptive, 1.0);

        let mut tasks = JoinSet::new();
        h.worker.tick(&mut tasks);
        drain(&mut tasks).await;

        let needed = h.buffer.get_needed_chunks(1);
        assert!(!needed[&Preset::Adaptive].contains(&0));
        assert!(needed[&Preset::Adaptive].contains(&1));
    }

    #[tokio::test]
    async fn test_out_of_range_chunks_end_the_track() {
        let h = harness(1_000, Duration::ZERO, Some((2, true)));
        h.buffer.update_position(1, 0.0, Preset::Adaptive, 1.0);

        let mut tasks = JoinSet::new();
        h.worker.tick(&mut tasks);
        drain(&mut tasks).await;

        assert!(h.buffer.get_needed_chunks(1).is_empty());
        assert_eq!(h.worker.tick(&mut tasks), 0);
    }

    #[tokio::test]
    async fn test_completions_after_a_track_switch_are_dropped() {
        let h = harness(1_000, Duration::from_millis(10), None);
        h.buffer.update_position(1, 0.0, Preset::Adaptive, 1.0);

        let mut tasks = JoinSet::new();
        h.worker.tick(&mut tasks);
        h.buffer.update_position(2, 0.0, Preset::Adaptive, 1.0);
        drain(&mut tasks).await;

        let stats = h.buffer.cache_stats();
        assert!(stats.tiers.iter().all(|t| !t.tracks.contains(&1)));
    }

    #[tokio::test]
    async fn test_run_fills_the_buffer_and_stops_on_cancel() {
        let h = harness(4, Duration::ZERO, None);
        h.buffer.update_position(7, 0.0, Preset::Warm, 0.5);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(h.worker.run(cancel.clone()));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !h.buffer.get_needed_chunks(7).is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(h.buffer.get_needed_chunks(7).is_empty());
        assert_eq!(h.buffer.is_cached(7, Preset::Warm, 0, 0.5), Some(TierName::L1));
    }
}

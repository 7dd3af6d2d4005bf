//! The translation pipeline: ingestion, per-cycle batching and callback fan-out.
//!
//! All shared state lives in one `Core` behind a `parking_lot::Mutex` that is
//! never held across an `.await`. Consumer callbacks always run after the lock
//! is released, so a callback may submit again.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchState, BatchTranslator, Delivery};
use crate::config::PipelineConfig;
use crate::handles::{ContainerId, HandleId, HandleRegistry, TextConsumer};
use crate::metrics::{MetricsSnapshot, PipelineMetrics, Stage};
use crate::queue::{deduplicate, strip_submitted_prefix, CycleBudget, RequestQueue, TranslationRequest};
use crate::scheduler::run_translation_loop;
use crate::state_machine::{PipelineStatus, StatusBoard};
use crate::translate::cache::{CacheFileError, CacheStats, FrequencyCache, ResultCache};
use crate::translate::fragment::FragmentSplitter;
use crate::translate::normalize::TextFilter;
use crate::translate::{Backend, TranslationBackend};

/// What `submit` did with a text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Disabled, filtered out, or nothing left after prefix stripping.
    Dropped,
    /// Served from the cache; the callback already ran.
    Delivered,
    /// Queued as this many chunks.
    Queued(usize),
}

/// Summary of one scheduler cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Requests absorbed from the queue.
    pub taken: usize,
    /// Texts resolved entirely from the cache.
    pub cached: usize,
    /// Fragments sent to the backend.
    pub sent: usize,
    /// Texts delivered after the backend call.
    pub translated: usize,
    /// The backend call failed after retries.
    pub failed: bool,
    /// The character circuit breaker fired instead of sending.
    pub tripped: bool,
}

struct Core {
    queue: RequestQueue,
    registry: HandleRegistry,
    cache: ResultCache,
    frequency: FrequencyCache,
    batch: BatchState,
    chars_sent: u64,
}

type Callback = (Arc<dyn TextConsumer>, String, String);

impl Core {
    /// Resolve deliveries to live consumers and drop their handle references.
    fn collect_callbacks(&mut self, deliveries: Vec<Delivery>) -> Vec<Callback> {
        let mut callbacks = Vec::new();
        for delivery in deliveries {
            for handle in delivery.handles {
                if let Some(consumer) = self.registry.live_consumer(handle) {
                    callbacks.push((
                        consumer,
                        delivery.original.clone(),
                        delivery.translated.clone(),
                    ));
                }
                self.registry.release(handle);
            }
        }
        callbacks
    }

    /// Drop undelivered texts. Their consumers' prefix memory goes too, so a
    /// later edit queues the whole text again.
    fn abandon_batch(&mut self, translator: &BatchTranslator) {
        for handle in translator.abandon(&mut self.batch) {
            self.registry.forget_submitted(handle);
            self.registry.release(handle);
        }
        self.batch.clear();
    }
}

fn run_callbacks(callbacks: Vec<Callback>) -> usize {
    let count = callbacks.len();
    for (consumer, original, translated) in callbacks {
        consumer.apply_translation(&original, &translated);
    }
    count
}

/// Closes the status cycle when `tick` returns or its future is dropped. A
/// dropped cycle also abandons the batch it had built.
struct CycleGuard<'a> {
    shared: &'a Shared,
    completed: bool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let mut core = self.shared.core.lock();
            let texts = core.batch.texts().len();
            core.abandon_batch(&self.shared.translator);
            warn!(texts, "translation cycle cancelled, batch abandoned");
        }
        self.shared.status.end_cycle();
    }
}

struct Shared {
    config: PipelineConfig,
    core: Mutex<Core>,
    status: StatusBoard,
    notify: Notify,
    backend: Option<Arc<dyn TranslationBackend>>,
    filter: TextFilter,
    translator: BatchTranslator,
    metrics: PipelineMetrics,
    cycle_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share one pipeline.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    /// Build a pipeline with the configured backend. Configuration problems
    /// leave it permanently disabled with a highlighted status instead of failing.
    pub fn new(config: PipelineConfig) -> Self {
        let backend = config
            .validate()
            .map_err(|e| e.to_string())
            .and_then(|_| {
                Backend::from_config(&config.backend, config.http_timeout())
                    .map_err(|e| e.to_string())
            })
            .map(|b| Arc::new(b) as Arc<dyn TranslationBackend>);
        Self::build(config, backend)
    }

    /// Build a pipeline around a caller-supplied backend.
    pub fn with_backend(config: PipelineConfig, backend: Arc<dyn TranslationBackend>) -> Self {
        let backend = config
            .validate_settings()
            .map(|_| backend)
            .map_err(|e| e.to_string());
        Self::build(config, backend)
    }

    fn build(config: PipelineConfig, backend: Result<Arc<dyn TranslationBackend>, String>) -> Self {
        let filter = TextFilter::from_config(&config.filters, config.backend.target_lang())
            .unwrap_or_default();
        let splitter = FragmentSplitter::new(config.filters.ignore_regex().ok().flatten());
        let status = StatusBoard::new(config.enabled);

        let backend = match backend {
            Ok(backend) => {
                info!(
                    backend = backend.name(),
                    enabled = config.enabled,
                    max_chars = config.max_chars_per_cycle,
                    "translation pipeline ready"
                );
                Some(backend)
            }
            Err(message) => {
                status.misconfigured(message);
                None
            }
        };

        let core = Core {
            queue: RequestQueue::new(),
            registry: HandleRegistry::new(),
            cache: ResultCache::new(config.cache_capacity),
            frequency: FrequencyCache::new(),
            batch: BatchState::new(),
            chars_sent: 0,
        };

        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                status,
                notify: Notify::new(),
                backend,
                filter,
                translator: BatchTranslator::new(splitter),
                metrics: PipelineMetrics::new(),
                cycle_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
                config,
            }),
        }
    }

    /// Spawn the scheduler task. Returns false when misconfigured or already running.
    pub fn start(&self) -> bool {
        if self.shared.backend.is_none() {
            warn!("translation scheduler not started: pipeline is misconfigured");
            return false;
        }
        let mut worker = self.shared.worker.lock();
        if worker.is_some() {
            return false;
        }
        let task = tokio::spawn(run_translation_loop(
            self.clone(),
            self.shared.cancel.child_token(),
        ));
        *worker = Some(task);
        true
    }

    /// Stop the scheduler, wait for it to exit and drop whatever is still queued.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let task = self.shared.worker.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "translation scheduler ended abnormally");
            }
        }
        let mut core = self.shared.core.lock();
        let abandoned = core.queue.drain();
        for request in &abandoned {
            core.registry.release(request.handle);
        }
        info!(abandoned = abandoned.len(), "translation pipeline shut down");
    }

    /// Offer a text shown by `consumer` for translation.
    pub fn submit(&self, text: &str, consumer: &Arc<dyn TextConsumer>) -> SubmitOutcome {
        let shared = &self.shared;
        if !shared.status.is_enabled() || !shared.filter.accepts(text) {
            return SubmitOutcome::Dropped;
        }

        let (original, translated) = {
            let mut core = shared.core.lock();
            let previous = core.registry.swap_last_submitted(consumer, text);
            let stripped = strip_submitted_prefix(text, previous.as_deref());
            if stripped.trim().is_empty() {
                return SubmitOutcome::Dropped;
            }

            match core.cache.get(stripped) {
                Some(translated) => (stripped.to_string(), translated),
                None => {
                    let chunks: Vec<String> = shared
                        .translator
                        .splitter()
                        .chunk(stripped, shared.config.max_chars_per_cycle)
                        .into_iter()
                        .filter(|c| !c.trim().is_empty())
                        .collect();
                    if chunks.is_empty() {
                        return SubmitOutcome::Dropped;
                    }
                    let handle = core.registry.acquire(consumer);
                    let count = chunks.len();
                    for (i, chunk) in chunks.into_iter().enumerate() {
                        if i > 0 {
                            core.registry.retain(handle);
                        }
                        core.queue.push(TranslationRequest::new(chunk, handle));
                    }
                    drop(core);
                    shared.notify.notify_one();
                    return SubmitOutcome::Queued(count);
                }
            }
        };

        consumer.apply_translation(&original, &translated);
        SubmitOutcome::Delivered
    }

    /// Run one cycle now. Cycles never overlap.
    pub async fn tick(&self) -> CycleReport {
        let shared = &self.shared;
        let _cycle = shared.cycle_lock.lock().await;
        let Some(backend) = shared.backend.clone() else {
            return CycleReport::default();
        };
        if !shared.status.begin_cycle() {
            return CycleReport::default();
        }

        let started = Instant::now();
        let mut guard = CycleGuard {
            shared: shared.as_ref(),
            completed: false,
        };
        let report = self.run_cycle(backend.as_ref()).await;
        guard.completed = true;
        drop(guard);

        if report.taken > 0 {
            shared.metrics.observe_duration(Stage::Cycle, started.elapsed());
            shared.metrics.cycle_finished();
        }
        report
    }

    async fn run_cycle(&self, backend: &dyn TranslationBackend) -> CycleReport {
        let shared = &self.shared;
        let translator = &shared.translator;
        let budget = CycleBudget {
            max_chars: shared.config.max_chars_per_cycle,
            max_items: shared.config.max_items_per_cycle,
        };
        let mut report = CycleReport::default();

        let (cached, pending, trip_message) = {
            let mut guard = shared.core.lock();
            let core = &mut *guard;
            let outcome = deduplicate(&mut core.queue, &budget, &mut core.registry, &mut core.batch);
            report.taken = outcome.taken;
            if outcome.taken == 0 {
                core.batch.clear();
                return report;
            }
            shared
                .metrics
                .observe_duration(Stage::QueueWait, outcome.max_wait);

            let deliveries =
                translator.resolve_cached(&mut core.batch, &mut core.cache, &mut core.frequency);
            report.cached = deliveries.len();
            let cached = core.collect_callbacks(deliveries);

            let pending = core.batch.pending().to_vec();
            let pending_chars = core.batch.pending_chars() as u64;
            let over_limit = shared
                .config
                .char_alert_threshold
                .filter(|&limit| core.chars_sent + pending_chars > limit);

            let trip_message = match over_limit {
                Some(limit) if !pending.is_empty() => {
                    core.abandon_batch(translator);
                    Some(format!(
                        "character limit {limit} reached: {} sent, next batch needs {pending_chars}",
                        core.chars_sent
                    ))
                }
                _ => {
                    core.chars_sent += pending_chars;
                    if pending.is_empty() {
                        core.batch.clear();
                    }
                    None
                }
            };
            (cached, pending, trip_message)
        };
        shared.metrics.callbacks_delivered(run_callbacks(cached));

        if let Some(message) = trip_message {
            shared.metrics.breaker_tripped();
            shared.status.trip(message);
            report.tripped = true;
            return report;
        }
        if pending.is_empty() {
            return report;
        }

        report.sent = pending.len();
        let chars: usize = pending.iter().map(|f| f.chars().count()).sum();
        shared
            .metrics
            .observe(Stage::BatchFragments, pending.len() as f64);
        shared.metrics.observe(Stage::BatchChars, chars as f64);
        debug!(backend = backend.name(), fragments = pending.len(), chars, "sending batch");

        let call_started = Instant::now();
        let result = backend.translate(&pending, &shared.config.retry).await;
        shared
            .metrics
            .observe_duration(Stage::BackendCall, call_started.elapsed());

        let callbacks = {
            let mut guard = shared.core.lock();
            let core = &mut *guard;
            let callbacks = match result {
                Ok(translated) => {
                    let deliveries = translator.apply_translations(
                        &mut core.batch,
                        translated,
                        &mut core.cache,
                    );
                    report.translated = deliveries.len();
                    core.collect_callbacks(deliveries)
                }
                Err(e) => {
                    warn!(
                        backend = backend.name(),
                        error = %e,
                        texts = core.batch.texts().len(),
                        "batch dropped after retries"
                    );
                    report.failed = true;
                    shared.metrics.batch_failed();
                    Vec::new()
                }
            };
            core.abandon_batch(translator);
            callbacks
        };
        shared.metrics.callbacks_delivered(run_callbacks(callbacks));
        report
    }

    /// Flip translation on/off. Returns whether it is now enabled.
    pub fn toggle(&self) -> bool {
        let enabled = self.shared.status.toggle();
        if enabled {
            self.shared.notify.notify_one();
        }
        enabled
    }

    pub fn force_enable(&self, enable: bool) -> bool {
        let enabled = self.shared.status.force_enable(enable);
        if enabled {
            self.shared.notify.notify_one();
        }
        enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.status.is_enabled()
    }

    /// The consumer was destroyed; pending results for it are dropped.
    pub fn mark_dead(&self, consumer: &Arc<dyn TextConsumer>) {
        self.shared.core.lock().registry.mark_dead(consumer);
    }

    /// Take a host-held reference on `consumer`'s handle, keeping the handle
    /// registered while no request is queued for it. Pair with `release`.
    pub fn acquire(&self, consumer: &Arc<dyn TextConsumer>) -> HandleId {
        self.shared.core.lock().registry.acquire_host(consumer)
    }

    /// Give back a reference taken with `acquire`. References owned by queued
    /// requests are never touched; returns false when the host holds none.
    pub fn release(&self, handle: HandleId) -> bool {
        self.shared.core.lock().registry.release_host(handle)
    }

    /// Every consumer registered under `container` is now dead.
    pub fn notify_container_destroyed(&self, container: ContainerId) -> usize {
        self.shared
            .core
            .lock()
            .registry
            .notify_container_destroyed(container)
    }

    /// Merge a cache file into the result cache.
    pub fn load_cache(&self, path: &Path) -> Result<usize, CacheFileError> {
        self.shared.core.lock().cache.load_file(path)
    }

    /// Persist up to `capacity` cache entries, most recently used first.
    pub fn save_cache(&self, path: &Path, capacity: usize) -> Result<usize, CacheFileError> {
        self.shared.core.lock().cache.save_file(path, capacity)
    }

    pub fn cached_translation(&self, text: &str) -> Option<String> {
        self.shared.core.lock().cache.get(text)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PipelineStatus> {
        self.shared.status.subscribe()
    }

    pub fn status(&self) -> PipelineStatus {
        self.shared.status.current()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.core.lock().cache.stats()
    }

    /// Characters sent to the backend since startup.
    pub fn chars_sent(&self) -> u64 {
        self.shared.core.lock().chars_sent
    }

    /// Texts waiting for a cycle, head first.
    pub fn queued_texts(&self) -> Vec<String> {
        self.shared.core.lock().queue.texts()
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.shared.core.lock().queue.is_empty()
    }

    pub(crate) fn cycle_interval(&self) -> Duration {
        self.shared.config.cycle_interval()
    }

    /// Resolves once new work has been submitted or translation re-enabled.
    pub(crate) async fn work_available(&self) {
        self.shared.notify.notified().await;
    }
}

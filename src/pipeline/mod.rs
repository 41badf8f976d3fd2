//! Texture pipeline orchestrator
//!
//! The pipeline owns one lane per variant: thumbnails, originals and one
//! converted lane per enabled GPU family. A lane is a dedup queue plus a
//! single-slot runner. Requests are answered from the cache when possible,
//! otherwise turned into jobs; workers report back over a bounded channel
//! that [`Pipeline::pump`] drains on the owning thread, where the cache is
//! updated, observers are notified and the next job of the lane starts.
//!
//! Everything here is single-threaded from the caller's point of view: only
//! the worker bodies run elsewhere.

mod events;
mod work;

pub use events::{BatchReport, ConvertProgress, LaneStatus, PipelineEvent, RequestOutcome};
pub use work::{WorkContext, WorkOutput};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{ObserverId, RequestCoalescer, TextureCache, ThumbnailObserver};
use crate::config::PipelineConfig;
use crate::descriptor::{DescriptorStore, TextureDescriptor};
use crate::job::{Completion, FreshnessPolicy, GpuFamily, Job, JobId, JobQueue, JobRunner, ResourceKey, Variant, WorkFn};
use crate::textures::{TextureCodec, TextureInfo};

struct Lane {
    queue: JobQueue,
    runner: JobRunner<WorkOutput>,
    /// Cancellation epoch at the time the in-flight job was started
    dispatched_epoch: u64,
}

/// Progress of the current conversion batch
#[derive(Default)]
struct BatchState {
    active: bool,
    report: BatchReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn DescriptorStore>,
    codec: Arc<dyn TextureCodec>,
    cache: TextureCache,
    coalescer: RequestCoalescer,
    lanes: BTreeMap<Variant, Lane>,
    completions: Receiver<Completion<WorkOutput>>,
    epoch: u64,
    batch: BatchState,
    outbox: Vec<PipelineEvent>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn DescriptorStore>, codec: Arc<dyn TextureCodec>) -> Self {
        let mut variants = vec![Variant::Thumbnail, Variant::Original];
        for family in &config.families {
            let variant = Variant::Converted(*family);
            if !variants.contains(&variant) {
                variants.push(variant);
            }
        }

        // One in-flight completion per lane at most, so senders never block
        let (tx, completions) = sync_channel(variants.len());

        let ctx = Arc::new(WorkContext {
            store: Arc::clone(&store),
            codec: Arc::clone(&codec),
            thumbnail_size: config.thumbnail_size,
            quality: config.quality,
        });
        let work: WorkFn<WorkOutput> = Arc::new(move |job: &Job| work::execute(&ctx, job));

        let lanes = variants
            .into_iter()
            .map(|variant| {
                let lane = Lane {
                    queue: JobQueue::new(),
                    runner: JobRunner::new(variant, Arc::clone(&work), tx.clone()),
                    dispatched_epoch: 0,
                };
                (variant, lane)
            })
            .collect::<BTreeMap<_, _>>();

        info!(
            "Texture pipeline ready with {} lanes (thumbnail size {}, quality {:?})",
            lanes.len(),
            config.thumbnail_size,
            config.quality
        );

        Self {
            cache: TextureCache::new(config.budgets()),
            config,
            store,
            codec,
            coalescer: RequestCoalescer::new(),
            lanes,
            completions,
            epoch: 0,
            batch: BatchState::default(),
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TextureCache {
        &mut self.cache
    }

    pub fn coalescer(&self) -> &RequestCoalescer {
        &self.coalescer
    }

    /// GPU families with a converted lane
    pub fn families(&self) -> Vec<GpuFamily> {
        self.lanes
            .keys()
            .filter_map(|variant| match variant {
                Variant::Converted(family) => Some(*family),
                _ => None,
            })
            .collect()
    }

    fn descriptor(&self, key: &ResourceKey) -> Option<Arc<TextureDescriptor>> {
        let descriptor = self.store.descriptor(key);
        if descriptor.is_none() {
            warn!("Unknown texture {}", key);
        }
        descriptor
    }

    /// Ask for a thumbnail on behalf of `observer`.
    ///
    /// A cached thumbnail is sent to the observer immediately. Otherwise the
    /// observer joins the pending request for `key`, which is created (and a
    /// job queued) if this is the first observer.
    pub fn request_thumbnail(&mut self, key: &ResourceKey, observer: ThumbnailObserver) -> RequestOutcome {
        if let Some(info) = self.cache.thumbnail(key) {
            observer.notify(key, &info);
            return RequestOutcome::Cached(info);
        }

        if self.store.descriptor(key).is_none() {
            warn!("Unknown texture {}", key);
            return RequestOutcome::Skipped;
        }

        if self.coalescer.subscribe(key.clone(), observer) {
            self.enqueue(Job::new(key.clone(), Variant::Thumbnail, FreshnessPolicy::OnlyIfMissing))
        } else {
            RequestOutcome::Coalesced
        }
    }

    /// Stop notifying one observer of a pending thumbnail
    pub fn cancel_thumbnail(&mut self, key: &ResourceKey, observer: ObserverId) -> bool {
        self.coalescer.unsubscribe(key, observer)
    }

    pub fn request_original(&mut self, key: &ResourceKey, policy: FreshnessPolicy) -> RequestOutcome {
        let Some(descriptor) = self.descriptor(key) else {
            return RequestOutcome::Skipped;
        };

        let cached = match policy {
            FreshnessPolicy::Force => None,
            FreshnessPolicy::OnlyIfStale => {
                let fresh = match (self.cache.original_modified(key), descriptor.source_modified()) {
                    (Some(cached), Some(source)) => cached >= source,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if fresh {
                    self.cache.original(key)
                } else {
                    None
                }
            }
            FreshnessPolicy::OnlyIfMissing | FreshnessPolicy::SkipIfAbsent => self.cache.original(key),
        };

        if let Some(info) = cached {
            return RequestOutcome::Cached(info);
        }
        if policy == FreshnessPolicy::SkipIfAbsent {
            return RequestOutcome::Skipped;
        }

        self.enqueue(Job::new(key.clone(), Variant::Original, policy))
    }

    pub fn request_converted(
        &mut self,
        key: &ResourceKey,
        family: GpuFamily,
        policy: FreshnessPolicy,
    ) -> RequestOutcome {
        let Some(descriptor) = self.descriptor(key) else {
            return RequestOutcome::Skipped;
        };
        if descriptor.format_for(family).is_none() {
            debug!("{} has no compression format for {}", key, family);
            return RequestOutcome::Skipped;
        }
        if !self.lanes.contains_key(&Variant::Converted(family)) {
            warn!("GPU family {} is not enabled", family);
            return RequestOutcome::Skipped;
        }

        match policy {
            FreshnessPolicy::SkipIfAbsent => {
                if let Some(info) = self.cache.converted(key, family) {
                    return RequestOutcome::Cached(info);
                }
                if self.cache.try_preload(&descriptor, family, self.codec.as_ref()) {
                    if let Some(info) = self.cache.converted(key, family) {
                        return RequestOutcome::Cached(info);
                    }
                }
                RequestOutcome::Skipped
            }
            FreshnessPolicy::OnlyIfMissing => match self.cache.converted(key, family) {
                Some(info) => RequestOutcome::Cached(info),
                None => self.enqueue(Job::new(key.clone(), Variant::Converted(family), policy)),
            },
            // The worker decides whether the artifact needs re-encoding
            FreshnessPolicy::OnlyIfStale | FreshnessPolicy::Force => {
                self.enqueue(Job::new(key.clone(), Variant::Converted(family), policy))
            }
        }
    }

    /// Queue a converted job for every descriptor and enabled family with a format.
    ///
    /// Returns the number of jobs created.
    pub fn reconvert_all(&mut self, policy: FreshnessPolicy) -> usize {
        let families = self.families();
        let mut created = 0;

        for key in self.store.keys() {
            let Some(descriptor) = self.store.descriptor(&key) else {
                continue;
            };
            for family in &families {
                if descriptor.format_for(*family).is_none() {
                    continue;
                }
                if let RequestOutcome::Queued { merged: false, .. } = self.request_converted(&key, *family, policy) {
                    created += 1;
                }
            }
        }

        info!("Queued {} conversions ({})", created, policy.name());
        created
    }

    /// Drop all pending work. Jobs already running finish but their results are discarded.
    ///
    /// Returns the number of queued jobs that were dropped.
    pub fn cancel_all(&mut self) -> usize {
        self.epoch += 1;
        let mut dropped = 0;
        let mut dropped_converted = 0;

        for (variant, lane) in self.lanes.iter_mut() {
            let count = lane.queue.clear();
            dropped += count;
            if matches!(variant, Variant::Converted(_)) {
                dropped_converted += count;
            }
        }
        let observers = self.coalescer.clear();

        if self.batch.active {
            let report = &mut self.batch.report;
            report.total = report.total.saturating_sub(dropped_converted);
            report.cancelled = true;
        }

        info!(
            "Cancelled {} queued jobs and {} pending thumbnail requests",
            dropped, observers
        );
        self.check_batch_done();
        dropped
    }

    /// Drain completions, update the cache and start the next jobs.
    ///
    /// Never blocks. Returns the events produced since the previous call.
    pub fn pump(&mut self) -> Vec<PipelineEvent> {
        while let Ok(completion) = self.completions.try_recv() {
            self.handle_completion(completion);
        }
        std::mem::take(&mut self.outbox)
    }

    /// Process completions until the pipeline is idle.
    ///
    /// With `blocking` unset this is a single [`pump`](Self::pump). When
    /// `cancel` is raised, pending work is cancelled and the call returns once
    /// in-flight jobs have drained. Returns the report of the last finished
    /// conversion batch, or the current one if none finished.
    pub fn wait_all<F>(&mut self, blocking: bool, cancel: &AtomicBool, mut on_event: F) -> BatchReport
    where
        F: FnMut(&PipelineEvent),
    {
        let mut last_report = None;
        let mut cancelled = false;
        let poll = self.config.wait_poll_interval();

        loop {
            for event in self.pump() {
                if let PipelineEvent::ConvertedAllDone(report) = &event {
                    last_report = Some(report.clone());
                }
                on_event(&event);
            }

            if !blocking || self.is_idle() {
                break;
            }

            if !cancelled && cancel.load(Ordering::Relaxed) {
                cancelled = true;
                self.cancel_all();
                continue;
            }

            match self.completions.recv_timeout(poll) {
                Ok(completion) => self.handle_completion(completion),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        last_report.unwrap_or_else(|| self.batch.report.clone())
    }

    /// Empty every cache store
    pub fn clear_cache(&mut self) {
        self.cache.clear_all();
        self.outbox.push(PipelineEvent::CacheCleared);
        info!("Texture cache cleared");
    }

    /// Drop one texture from every cache store
    pub fn invalidate(&mut self, key: &ResourceKey) {
        self.cache.invalidate(key);
    }

    /// Load an existing converted artifact from disk into the cache
    pub fn try_preload(&mut self, key: &ResourceKey, family: GpuFamily) -> bool {
        match self.descriptor(key) {
            Some(descriptor) => self.cache.try_preload(&descriptor, family, self.codec.as_ref()),
            None => false,
        }
    }

    pub fn status(&self) -> Vec<LaneStatus> {
        self.lanes
            .iter()
            .map(|(variant, lane)| LaneStatus {
                lane: *variant,
                busy: !lane.runner.is_idle(),
                pending: lane.queue.len(),
            })
            .collect()
    }

    /// No job running or queued on any lane
    pub fn is_idle(&self) -> bool {
        self.lanes
            .values()
            .all(|lane| lane.runner.is_idle() && lane.queue.is_empty())
    }

    fn enqueue(&mut self, job: Job) -> RequestOutcome {
        let variant = job.variant;
        let Some(lane) = self.lanes.get_mut(&variant) else {
            warn!("No lane for {}", variant);
            return RequestOutcome::Skipped;
        };

        // A running original covers later loads of the same texture, but a
        // forced request must read the inputs again. Converted jobs always queue.
        if variant == Variant::Original && job.policy < FreshnessPolicy::Force && lane.dispatched_epoch == self.epoch {
            if let Some(current) = lane.runner.current_job() {
                if current.key == job.key && job.policy <= current.policy && !lane.queue.contains(&job.key, variant) {
                    debug!("{} {} already in flight as job {}", variant, job.key, current.id);
                    return RequestOutcome::Queued {
                        job_id: current.id,
                        merged: true,
                    };
                }
            }
        }

        let job_id = job.id;
        let accepted = lane.queue.push(job);
        if accepted && matches!(variant, Variant::Converted(_)) {
            self.batch.active = true;
            self.batch.report.total += 1;
        }

        self.dispatch(variant);
        RequestOutcome::Queued {
            job_id,
            merged: !accepted,
        }
    }

    /// Start the next job of a lane if its runner is idle
    fn dispatch(&mut self, variant: Variant) {
        let Some(lane) = self.lanes.get_mut(&variant) else {
            return;
        };
        if !lane.runner.is_idle() {
            return;
        }

        while let Some(job) = lane.queue.pop() {
            // An original may have produced this thumbnail meanwhile
            if variant == Variant::Thumbnail
                && !self.coalescer.is_pending(&job.key)
                && self.cache.thumbnail_size(&job.key).is_some()
            {
                debug!("Thumbnail for {} already cached, skipping job {}", job.key, job.id);
                continue;
            }

            debug!("Starting {} job {} for {}", variant, job.id, job.key);
            lane.dispatched_epoch = self.epoch;
            lane.runner.run(job);
            return;
        }
    }

    fn handle_completion(&mut self, completion: Completion<WorkOutput>) {
        let Completion { lane: variant, job, payload } = completion;
        let Some(lane) = self.lanes.get_mut(&variant) else {
            return;
        };

        lane.runner.finish(job.id);
        if lane.dispatched_epoch != self.epoch {
            debug!("Discarding result of cancelled {} job {} for {}", variant, job.id, job.key);
            if matches!(variant, Variant::Converted(_)) && self.batch.active {
                self.batch.report.total = self.batch.report.total.saturating_sub(1);
            }
        } else {
            self.deliver(job, payload);
        }

        self.dispatch(variant);
        self.check_batch_done();
    }

    /// Store a fresh result and tell everyone waiting for it
    fn deliver(&mut self, job: Job, output: WorkOutput) {
        let key = job.key;
        let WorkOutput {
            info,
            thumbnail,
            reconverted,
        } = output;

        match job.variant {
            Variant::Thumbnail => {
                if !info.is_stub() {
                    self.cache.set_thumbnail(key.clone(), info.clone());
                }
                self.notify_thumbnail(key, info);
            }
            Variant::Original => {
                if !info.is_stub() {
                    self.cache.set_original(key.clone(), info.clone());
                    if let Some(thumbnail) = thumbnail {
                        self.cache.set_thumbnail(key.clone(), thumbnail.clone());
                        self.notify_thumbnail(key.clone(), thumbnail);
                    }
                }
                self.outbox.push(PipelineEvent::OriginalLoaded { key, payload: info });
            }
            Variant::Converted(family) => {
                let path = self
                    .store
                    .descriptor(&key)
                    .map(|d| d.path.clone())
                    .unwrap_or_else(|| key.to_path_buf());

                let report = &mut self.batch.report;
                report.completed += 1;
                if reconverted {
                    report.reconverted += 1;
                }
                if info.is_stub() {
                    report.failed.push(path.clone());
                } else {
                    self.cache.set_converted(key.clone(), family, info.clone());
                }

                let progress = ConvertProgress {
                    completed: report.completed,
                    total: report.total.max(report.completed),
                    current_path: path,
                    family,
                };
                self.outbox.push(PipelineEvent::ConvertedLoaded {
                    key,
                    family,
                    payload: info,
                });
                self.outbox.push(PipelineEvent::ConvertProgress(progress));
            }
        }
    }

    fn notify_thumbnail(&mut self, key: ResourceKey, info: TextureInfo) {
        let delivered = self.coalescer.resolve(&key, &info);
        if delivered > 0 {
            debug!("Thumbnail {} delivered to {} observers", key, delivered);
        }
        self.outbox.push(PipelineEvent::ThumbnailLoaded { key, payload: info });
    }

    /// Emit the batch report once every converted lane is drained
    fn check_batch_done(&mut self) {
        if !self.batch.active {
            return;
        }

        let drained = self
            .lanes
            .iter()
            .filter(|(variant, _)| matches!(variant, Variant::Converted(_)))
            .all(|(_, lane)| lane.runner.is_idle() && lane.queue.is_empty());
        if !drained {
            return;
        }

        let report = std::mem::take(&mut self.batch).report;
        info!("{}", report.summary());
        self.outbox.push(PipelineEvent::ConvertedAllDone(report));
    }

    /// Id of the job running on a lane, if any
    pub fn running_job(&self, variant: Variant) -> Option<JobId> {
        self.lanes
            .get(&variant)
            .and_then(|lane| lane.runner.current_job())
            .map(|job| job.id)
    }
}

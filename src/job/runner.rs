//! Single-slot job runner
//!
//! Each lane owns one runner. A runner executes at most one job at a time on
//! a short-lived worker thread and hands the result back through the lane
//! owner's completion channel. The runner stays busy until the owner has
//! received the completion and called [`JobRunner::finish`], so completions
//! of one lane are strictly sequential.
//!
//! The in-flight job lives in a mutex-guarded slot shared with the worker.
//! Dropping the runner marks the slot dead; a worker that finishes afterwards
//! sees this under the lock and drops its result instead of sending it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, error};

use super::{Job, JobId, Variant};

/// Work executed on the worker thread for every job of a lane
pub type WorkFn<T> = Arc<dyn Fn(&Job) -> T + Send + Sync>;

/// Result of one job, delivered to the lane owner
#[derive(Debug)]
pub struct Completion<T> {
    pub lane: Variant,
    pub job: Job,
    pub payload: T,
}

struct Slot {
    alive: bool,
    job: Option<Job>,
}

fn lock_slot(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    // A worker never panics while holding the lock, but don't let poisoning
    // wedge a lane if it ever does.
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct JobRunner<T> {
    lane: Variant,
    slot: Arc<Mutex<Slot>>,
    work: WorkFn<T>,
    completions: SyncSender<Completion<T>>,
}

impl<T: Default + Send + 'static> JobRunner<T> {
    pub fn new(lane: Variant, work: WorkFn<T>, completions: SyncSender<Completion<T>>) -> Self {
        Self {
            lane,
            slot: Arc::new(Mutex::new(Slot {
                alive: true,
                job: None,
            })),
            work,
            completions,
        }
    }

    pub fn lane(&self) -> Variant {
        self.lane
    }

    pub fn is_idle(&self) -> bool {
        lock_slot(&self.slot).job.is_none()
    }

    /// The job currently attached to this runner, if any
    pub fn current_job(&self) -> Option<Job> {
        lock_slot(&self.slot).job.clone()
    }

    /// Start `job` on a worker thread and return immediately.
    ///
    /// # Panics
    ///
    /// Panics if the runner is busy. Callers must check [`is_idle`] first.
    ///
    /// [`is_idle`]: JobRunner::is_idle
    pub fn run(&mut self, job: Job) {
        {
            let mut slot = lock_slot(&self.slot);
            assert!(
                slot.job.is_none(),
                "{} runner started job {} while busy",
                self.lane,
                job.id
            );
            slot.job = Some(job.clone());
        }

        let lane = self.lane;
        let slot = Arc::clone(&self.slot);
        let work = Arc::clone(&self.work);
        let completions = self.completions.clone();
        let worker_job = job.clone();

        let spawned = thread::Builder::new()
            .name(format!("texconv-{}", lane.name()))
            .spawn(move || {
                let job = worker_job;
                let payload = match panic::catch_unwind(AssertUnwindSafe(|| work(&job))) {
                    Ok(payload) => payload,
                    Err(_) => {
                        error!("Worker for {} panicked on job {} ({})", lane, job.id, job.key);
                        T::default()
                    }
                };

                let slot = lock_slot(&slot);
                if !slot.alive {
                    debug!("{} runner was torn down, dropping result of job {}", lane, job.id);
                    return;
                }
                // Capacity covers one completion per lane, so this never blocks
                if completions.send(Completion { lane, job, payload }).is_err() {
                    debug!("{} completion channel closed", lane);
                }
            });

        if let Err(e) = spawned {
            error!("Failed to spawn {} worker: {}", lane, e);
            self.fail_to_start(job);
        }
    }

    /// Report a job that never reached a worker as a default payload.
    ///
    /// If even that cannot be delivered the job is detached, so the lane
    /// goes back to idle instead of waiting for a completion forever.
    fn fail_to_start(&self, job: Job) {
        let mut slot = lock_slot(&self.slot);
        if !slot.alive {
            return;
        }

        let job_id = job.id;
        let completion = Completion {
            lane: self.lane,
            job,
            payload: T::default(),
        };
        if let Err(e) = self.completions.try_send(completion) {
            error!(
                "Could not report failed {} job {}, detaching it: {}",
                self.lane, job_id, e
            );
            slot.job = None;
        }
    }

    /// Detach the finished job and return to idle.
    ///
    /// Returns `false` if `job_id` is not the job attached to this runner.
    pub fn finish(&mut self, job_id: JobId) -> bool {
        let mut slot = lock_slot(&self.slot);
        match slot.job.as_ref() {
            Some(job) if job.id == job_id => {
                slot.job = None;
                true
            }
            _ => false,
        }
    }
}

impl<T> Drop for JobRunner<T> {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        slot.alive = false;
        if let Some(job) = slot.job.take() {
            debug!("{} runner dropped with job {} in flight", self.lane, job.id);
        }
    }
}

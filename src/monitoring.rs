//! In this module, we implement all the monitoring logic for the acquisition worker.
//! The worker bumps lock-free counters as it runs; the controller and the binary
//! read them back as a plain snapshot.

use std::{
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
pub struct Monitor {
    batches: AtomicU64,
    samples: AtomicU64,
    read_errors: AtomicU64,
    empty_reads: AtomicU64,
    refused_commits: AtomicU64,
    lost_samples: AtomicU64,
    oversized_reads: AtomicU64,
    purges: AtomicU64,
    spawns: AtomicU64,
    workers_alive: AtomicUsize,
    peak_workers: AtomicUsize,
}

impl Monitor {
    pub fn record_batch(&self, samples: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_read(&self) {
        self.empty_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refused_commit(&self) {
        self.refused_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Samples the device reports it dropped
    pub fn record_sample_loss(&self, lost: u64) {
        self.lost_samples.fetch_add(lost, Ordering::Relaxed);
    }

    /// A read claimed more samples than the buffer holds
    pub fn record_oversized_read(&self) {
        self.oversized_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_purge(&self) {
        self.purges.fetch_add(1, Ordering::Relaxed);
    }

    /// Called by a worker as its first action. Returns a guard that marks the
    /// worker as gone when dropped, including on unwind.
    pub fn worker_entered(&self) -> WorkerGuard<'_> {
        self.spawns.fetch_add(1, Ordering::Relaxed);
        let alive = self.workers_alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_workers.fetch_max(alive, Ordering::SeqCst);
        WorkerGuard { monitor: self }
    }

    pub fn workers_alive(&self) -> usize {
        self.workers_alive.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            batches: self.batches.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            refused_commits: self.refused_commits.load(Ordering::Relaxed),
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
            oversized_reads: self.oversized_reads.load(Ordering::Relaxed),
            purges: self.purges.load(Ordering::Relaxed),
            spawns: self.spawns.load(Ordering::Relaxed),
            workers_alive: self.workers_alive.load(Ordering::SeqCst),
            peak_workers: self.peak_workers.load(Ordering::SeqCst),
            running_since: None,
        }
    }
}

pub struct WorkerGuard<'a> {
    monitor: &'a Monitor,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.monitor.workers_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub batches: u64,
    pub samples: u64,
    pub read_errors: u64,
    pub empty_reads: u64,
    pub refused_commits: u64,
    pub lost_samples: u64,
    pub oversized_reads: u64,
    pub purges: u64,
    pub spawns: u64,
    pub workers_alive: usize,
    /// Most workers ever alive at once. Anything above one is a bug.
    pub peak_workers: usize,
    /// Start of the current run, filled in by the controller
    pub running_since: Option<DateTime<Utc>>,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batches={} samples={} read_errors={} empty_reads={} refused={} lost={} spawns={} alive={}",
            self.batches,
            self.samples,
            self.read_errors,
            self.empty_reads,
            self.refused_commits,
            self.lost_samples,
            self.spawns,
            self.workers_alive,
        )?;
        if let Some(since) = self.running_since {
            let up = Utc::now().signed_duration_since(since);
            write!(f, " up={}.{:03}s", up.num_seconds(), up.num_milliseconds() % 1000)?;
        }
        Ok(())
    }
}

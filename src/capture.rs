//! This module contains all the capture logic

// The acquisition thread will do one thing, as fast as possible:
// Pull raw IQ from the device, normalize it into the channel's write slot,
// and commit. Everything else (tuning, restarts) happens on the controller's
// thread and reaches us only through the run flag, the device halt and the
// channel stop.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    channel::SampleWriter,
    complex::normalize_into,
    device::{DeviceStatus, SdrDevice},
    error::ReadError,
    monitoring::Monitor,
};

/// Back-off when there is nothing to read
pub const IDLE_WAIT: Duration = Duration::from_millis(1);

/// `purge` is a request flag: when set, the worker clears it and has the
/// device discard its buffered IQ before the next read.
pub fn run_worker<D: SdrDevice>(
    device: Arc<D>,
    mut writer: SampleWriter,
    run: Arc<AtomicBool>,
    purge: Arc<AtomicBool>,
    monitor: Arc<Monitor>,
) {
    let _guard = monitor.worker_entered();
    let batch = writer.acquire_write_slot().len();
    let mut raw = vec![D::Sample::default(); 2 * batch];
    // Warn once per streak, not once per read
    let mut disconnected = false;
    let mut losing = false;
    let mut oversized = false;
    debug!(device = %device.serial(), batch, "acquisition worker started");

    while run.load(Ordering::SeqCst) {
        if !device.is_open() {
            thread::sleep(IDLE_WAIT);
            continue;
        }
        if purge.swap(false, Ordering::SeqCst) {
            device.purge();
            monitor.record_purge();
            debug!(device = %device.serial(), "purged buffered IQ");
        }
        let n = match device.read(&mut raw) {
            Ok(n) => n,
            Err(e) => {
                // A halt during stop surfaces here as an error, that's our cue
                if !run.load(Ordering::SeqCst) {
                    break;
                }
                monitor.record_read_error();
                trace!(error = %e, "read failed, retrying");
                if device.status() == DeviceStatus::Disconnected {
                    if !disconnected {
                        warn!(device = %device.serial(), "device disconnected, waiting for it");
                        disconnected = true;
                    }
                } else {
                    disconnected = false;
                }
                if e == ReadError::NotStreaming {
                    thread::sleep(IDLE_WAIT);
                }
                continue;
            }
        };
        disconnected = false;
        let lost = device.take_sample_loss();
        if lost > 0 {
            monitor.record_sample_loss(lost);
            if !losing {
                warn!(device = %device.serial(), lost, "device dropped samples");
                losing = true;
            }
        } else {
            losing = false;
        }
        if n == 0 {
            monitor.record_empty_read();
            thread::sleep(IDLE_WAIT);
            continue;
        }
        if n > batch {
            monitor.record_oversized_read();
            if !oversized {
                warn!(
                    reported = n,
                    capacity = batch,
                    "device returned more samples than the buffer holds"
                );
                oversized = true;
            }
        } else {
            oversized = false;
        }
        let n = n.min(batch);
        let written = normalize_into(&raw[..2 * n], writer.acquire_write_slot());
        if !writer.commit(written) {
            monitor.record_refused_commit();
            break;
        }
        monitor.record_batch(written);
    }
    debug!(device = %device.serial(), "acquisition worker exiting");
}

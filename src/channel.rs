//! Double-buffered hand-off of normalized sample batches from the acquisition
//! worker to whoever consumes them.
//!
//! The writer fills one slot while at most one committed batch waits for the
//! consumer. Committing into a full pipe waits for the consumer, but the stop
//! flag is polled while waiting so a stopped channel never wedges the worker.
//! Consumed batches hand their buffers back through a free list, so in steady
//! state the hot path never allocates. A reset between runs discards whatever
//! the previous run left in the pipe.

use std::{
    mem,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use num_complex::Complex32;

/// Committed batches waiting for the consumer (on top of the slot being written)
const IN_FLIGHT: usize = 1;
/// Spare buffers kept around for reuse
const FREE_SLOTS: usize = 4;
/// How often a blocked commit re-checks the stop flag
const STOP_POLL: Duration = Duration::from_millis(5);

type Slot = Vec<Complex32>;

/// One published group of samples. Dropping it recycles the buffer.
pub struct Batch {
    samples: Slot,
    len: usize,
    seq: u64,
    recycle: Sender<Slot>,
}

impl Batch {
    /// Position of this batch in the stream since the channel was created
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Deref for Batch {
    type Target = [Complex32];

    fn deref(&self) -> &Self::Target {
        &self.samples[..self.len]
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        // A full free list just means this buffer gets deallocated
        let _ = self.recycle.try_send(mem::take(&mut self.samples));
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("seq", &self.seq)
            .field("len", &self.len)
            .finish()
    }
}

/// Control half of the channel. Owned by the lifecycle controller, which mints a
/// writer for each run and raises or clears the stop flag.
pub struct SampleChannel {
    capacity: usize,
    stopped: Arc<AtomicBool>,
    reader_alive: Arc<AtomicBool>,
    data_tx: Sender<Batch>,
    // Only used to drain leftovers between runs
    data_rx: Receiver<Batch>,
    free_tx: Sender<Slot>,
    free_rx: Receiver<Slot>,
    // Sequence numbers continue across runs
    seq: Arc<AtomicU64>,
}

impl SampleChannel {
    /// Create a channel whose slots hold `capacity` samples
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> (Self, SampleReader) {
        assert!(capacity > 0, "sample channel capacity must be non-zero");
        let (data_tx, data_rx) = bounded(IN_FLIGHT);
        let (free_tx, free_rx) = bounded(FREE_SLOTS);
        let reader_alive = Arc::new(AtomicBool::new(true));
        let chan = Self {
            capacity,
            stopped: Arc::new(AtomicBool::new(false)),
            reader_alive: reader_alive.clone(),
            data_tx,
            data_rx: data_rx.clone(),
            free_tx,
            free_rx,
            seq: Arc::new(Default::default()),
        };
        (
            chan,
            SampleReader {
                data_rx,
                alive: reader_alive,
            },
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A producer handle for one run. Only one should be alive at a time.
    pub fn writer(&self) -> SampleWriter {
        SampleWriter {
            slot: vec![Complex32::default(); self.capacity],
            capacity: self.capacity,
            stopped: self.stopped.clone(),
            reader_alive: self.reader_alive.clone(),
            data_tx: self.data_tx.clone(),
            free_tx: self.free_tx.clone(),
            free_rx: self.free_rx.clone(),
            seq: self.seq.clone(),
        }
    }

    /// Make every pending and future commit return `false`. Idempotent.
    pub fn signal_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Drop batches left over from the previous run and clear the stop flag.
    /// Only valid once the writer's thread has exited.
    pub fn reset_for_reuse(&self) {
        // Dropped batches go back to the free list
        while self.data_rx.try_recv().is_ok() {}
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Producer half, owned by the acquisition worker for the duration of a run
pub struct SampleWriter {
    slot: Slot,
    capacity: usize,
    stopped: Arc<AtomicBool>,
    reader_alive: Arc<AtomicBool>,
    data_tx: Sender<Batch>,
    free_tx: Sender<Slot>,
    free_rx: Receiver<Slot>,
    seq: Arc<AtomicU64>,
}

impl SampleWriter {
    /// The writable slot. Always `capacity` long; the same slot comes back until
    /// it is committed.
    pub fn acquire_write_slot(&mut self) -> &mut [Complex32] {
        &mut self.slot
    }

    /// Publish the first `count` samples of the current slot and swap in a fresh
    /// one. `false` means the channel is stopped (or the reader is gone) and the
    /// caller must stop producing.
    pub fn commit(&mut self, count: usize) -> bool {
        if self.stopped.load(Ordering::SeqCst) || !self.reader_alive.load(Ordering::SeqCst) {
            return false;
        }
        let fresh = self
            .free_rx
            .try_recv()
            .unwrap_or_else(|_| vec![Complex32::default(); self.capacity]);
        let mut batch = Batch {
            samples: mem::replace(&mut self.slot, fresh),
            len: count.min(self.capacity),
            seq: self.seq.load(Ordering::Relaxed),
            recycle: self.free_tx.clone(),
        };
        loop {
            match self.data_tx.send_timeout(batch, STOP_POLL) {
                Ok(()) => {
                    self.seq.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(SendTimeoutError::Timeout(pending)) => {
                    if self.stopped.load(Ordering::SeqCst)
                        || !self.reader_alive.load(Ordering::SeqCst)
                    {
                        return false;
                    }
                    batch = pending;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Consumer half
pub struct SampleReader {
    data_rx: Receiver<Batch>,
    alive: Arc<AtomicBool>,
}

impl Drop for SampleReader {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl SampleReader {
    /// Wait up to `timeout` for the next batch
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Batch> {
        match self.data_rx.recv_timeout(timeout) {
            Ok(batch) => Some(batch),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Batch> {
        self.data_rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Instant};

    fn fill(writer: &mut SampleWriter, value: f32) {
        for s in writer.acquire_write_slot() {
            *s = Complex32::new(value, -value);
        }
    }

    #[test]
    fn test_commit_publishes_count() {
        let (chan, reader) = SampleChannel::new(8);
        let mut writer = chan.writer();
        assert_eq!(writer.acquire_write_slot().len(), 8);
        fill(&mut writer, 0.5);
        assert!(writer.commit(5));
        let batch = reader.try_recv().unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.seq(), 0);
        assert!(batch.iter().all(|s| *s == Complex32::new(0.5, -0.5)));
    }

    #[test]
    fn test_count_clamped_to_capacity() {
        let (chan, reader) = SampleChannel::new(4);
        assert_eq!(chan.capacity(), 4);
        let mut writer = chan.writer();
        assert!(writer.commit(100));
        assert_eq!(reader.try_recv().unwrap().len(), 4);
    }

    #[test]
    fn test_same_slot_until_commit() {
        let (chan, _reader) = SampleChannel::new(4);
        let mut writer = chan.writer();
        writer.acquire_write_slot()[0] = Complex32::new(0.25, 0.0);
        assert_eq!(writer.acquire_write_slot()[0], Complex32::new(0.25, 0.0));
        assert!(writer.commit(1));
        // A fresh slot is swapped in, the old contents went to the consumer
        assert_eq!(writer.acquire_write_slot()[0], Complex32::default());
    }

    #[test]
    fn test_commit_after_stop_returns_false() {
        let (chan, reader) = SampleChannel::new(4);
        let mut writer = chan.writer();
        chan.signal_stop();
        chan.signal_stop();
        assert!(chan.is_stopped());
        for _ in 0..3 {
            assert!(!writer.commit(4));
        }
        assert!(reader.try_recv().is_none());
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn test_zero_capacity_panics() {
        let _ = SampleChannel::new(0);
    }

    #[test]
    fn test_reset_drops_leftover_batch() {
        let (chan, reader) = SampleChannel::new(4);
        let mut writer = chan.writer();
        assert!(writer.commit(4));
        chan.signal_stop();
        drop(writer);
        chan.reset_for_reuse();
        // The batch from the previous run never reaches the consumer
        assert!(reader.try_recv().is_none());
        let mut writer = chan.writer();
        assert!(writer.commit(2));
        let batch = reader.try_recv().unwrap();
        assert_eq!(batch.seq(), 1);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_reset_for_reuse() {
        let (chan, reader) = SampleChannel::new(4);
        chan.signal_stop();
        chan.reset_for_reuse();
        assert!(!chan.is_stopped());
        let mut writer = chan.writer();
        assert!(writer.commit(2));
        assert!(reader.try_recv().is_some());
    }

    #[test]
    fn test_blocked_commit_released_by_stop() {
        let (chan, _reader) = SampleChannel::new(4);
        let mut writer = chan.writer();
        // Fill the pipe so the next commit has to wait on a consumer that never reads
        assert!(writer.commit(4));
        let handle = thread::spawn(move || writer.commit(4));
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        chan.signal_stop();
        assert!(!handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_dropped_reader_refuses_commit() {
        let (chan, reader) = SampleChannel::new(4);
        let mut writer = chan.writer();
        drop(reader);
        assert!(!writer.commit(4));
    }

    #[test]
    fn test_blocked_commit_released_by_dropped_reader() {
        let (chan, reader) = SampleChannel::new(4);
        let mut writer = chan.writer();
        assert!(writer.commit(4));
        let handle = thread::spawn(move || writer.commit(4));
        thread::sleep(Duration::from_millis(30));
        drop(reader);
        assert!(!handle.join().unwrap());
        assert!(!chan.is_stopped());
    }

    #[test]
    fn test_buffers_recycled() {
        let (chan, reader) = SampleChannel::new(16);
        let mut writer = chan.writer();
        assert!(writer.commit(16));
        let batch = reader.try_recv().unwrap();
        let ptr = batch.as_ptr();
        drop(batch);
        // The recycled buffer becomes the slot after the next commit
        assert!(writer.commit(16));
        assert_eq!(writer.acquire_write_slot().as_ptr(), ptr);
        let next = reader.try_recv().unwrap();
        assert_eq!(next.seq(), 1);
    }

    #[test]
    fn test_consumer_drains_producer() {
        let (chan, reader) = SampleChannel::new(32);
        let mut writer = chan.writer();
        let producer = thread::spawn(move || {
            for i in 0..50 {
                fill(&mut writer, i as f32 / 100.0);
                assert!(writer.commit(32));
            }
        });
        let mut seen = 0u64;
        while seen < 50 {
            let batch = reader.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(batch.seq(), seen);
            assert_eq!(batch[0].re, seen as f32 / 100.0);
            seen += 1;
        }
        producer.join().unwrap();
    }
}

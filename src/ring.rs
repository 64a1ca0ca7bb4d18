//! Lock-free transport of raw metrics from workers to the aggregator.
//!
//! Each worker owns one single-producer single-consumer ring buffer: a fixed
//! region of 65,536 packed 32-byte slots behind a cache-line-aligned header.
//! The producer writes a slot and release-stores a monotonically increasing
//! `write_index`; the aggregator acquire-loads the index and reads everything
//! below it. The producer never blocks and never reads the consumer's
//! position — when the consumer falls more than one full ring behind, the
//! overwritten span is counted as dropped and skipped.
//!
//! The header also carries the worker's heartbeat and active-user gauge, the
//! only other memory shared across the worker boundary.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::metrics::{ErrorCategory, MethodCode, RequestMetric};

/// Size of one packed metric record.
pub const SLOT_SIZE: usize = 32;
/// Number of slots per ring; 65,536 × 32 bytes = 2 MiB.
pub const SLOT_COUNT: u64 = 65_536;

/// Shared header, aligned to its own cache line ahead of the slot array.
#[repr(C, align(64))]
struct RingHeader {
    /// Total records ever written; producer-only writes, consumer-readable.
    write_index: AtomicU64,
    /// Monotonic seconds, stored as `f64` bits; written every 250 ms.
    heartbeat: AtomicU64,
    /// Virtual users currently running on the producing worker.
    active_users: AtomicU64,
    worker_id: u8,
}

struct RingBuffer {
    header: RingHeader,
    slots: Box<[UnsafeCell<[u8; SLOT_SIZE]>]>,
}

// SAFETY: slots are only written by the single producer (below the next
// write_index, before the release store) and only read by the single consumer
// (below the acquired write_index). The consumer discards any record the
// producer could have lapped during a read, so a torn slot is never surfaced.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

/// Pack a metric into a ring slot: network byte order, fixed offsets, 3 bytes
/// of tail padding.
pub(crate) fn encode_slot(metric: &RequestMetric, slot: &mut [u8; SLOT_SIZE]) {
    slot[0..8].copy_from_slice(&metric.timestamp.to_be_bytes());
    slot[8..12].copy_from_slice(&metric.latency_ms.to_be_bytes());
    slot[12..14].copy_from_slice(&metric.status_code.to_be_bytes());
    slot[14..18].copy_from_slice(&metric.content_length.to_be_bytes());
    slot[18..26].copy_from_slice(&metric.name_hash.to_be_bytes());
    slot[26] = metric.worker_id;
    slot[27] = metric.error_category.as_u8();
    slot[28] = metric.method.as_u8();
}

/// Unpack a ring slot. Total: corrupt enum bytes decode to their fallback
/// variants rather than failing.
pub(crate) fn decode_slot(slot: &[u8; SLOT_SIZE]) -> RequestMetric {
    RequestMetric {
        timestamp: f64::from_be_bytes(read_array(&slot[0..8])),
        latency_ms: f32::from_be_bytes(read_array(&slot[8..12])),
        status_code: u16::from_be_bytes(read_array(&slot[12..14])),
        content_length: u32::from_be_bytes(read_array(&slot[14..18])),
        name_hash: u64::from_be_bytes(read_array(&slot[18..26])),
        worker_id: slot[26],
        error_category: ErrorCategory::from_u8(slot[27]),
        method: MethodCode::from_u8(slot[28]),
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(bytes);
    buf
}

/// Producer half of a ring. `Send` but not `Sync`: it moves into its worker
/// thread and is shared there behind an `Rc`, keeping the producer single.
pub struct RingProducer {
    ring: Arc<RingBuffer>,
    _single_thread: PhantomData<std::cell::Cell<()>>,
}

impl RingProducer {
    /// Write one metric and publish it. Wait-free, never blocks.
    pub fn push(&self, metric: &RequestMetric) {
        debug_assert!(metric.is_consistent());
        let write_index = self.ring.header.write_index.load(Ordering::Relaxed);
        let slot_index = (write_index % SLOT_COUNT) as usize;
        let mut buf = [0u8; SLOT_SIZE];
        encode_slot(metric, &mut buf);
        // SAFETY: sole producer; this slot is outside the consumer's window
        // until the release store below publishes it.
        unsafe {
            *self.ring.slots[slot_index].get() = buf;
        }
        self.ring
            .header
            .write_index
            .store(write_index + 1, Ordering::Release);
    }

    /// Record liveness, in monotonic seconds since the test epoch.
    pub fn beat(&self, monotonic_seconds: f64) {
        self.ring
            .header
            .heartbeat
            .store(monotonic_seconds.to_bits(), Ordering::Release);
    }

    pub fn set_active_users(&self, users: usize) {
        self.ring
            .header
            .active_users
            .store(users as u64, Ordering::Release);
    }

    pub fn worker_id(&self) -> u8 {
        self.ring.header.worker_id
    }
}

/// Consumer half of a ring, held by the aggregator. The read position lives
/// here, in the consumer's own memory — the producer never sees it.
pub struct RingConsumer {
    ring: Arc<RingBuffer>,
    read_index: u64,
    dropped: u64,
}

impl RingConsumer {
    /// Read every record published since the previous drain into `out`,
    /// returning how many records were lost to overflow during the interval.
    pub fn drain(&mut self, out: &mut Vec<RequestMetric>) -> u64 {
        let write_index = self.ring.header.write_index.load(Ordering::Acquire);
        let mut dropped_now = 0;

        // More than one full ring behind: the span below write_index - N has
        // been overwritten. Skip it and account the loss.
        if write_index - self.read_index > SLOT_COUNT {
            dropped_now += write_index - self.read_index - SLOT_COUNT;
            self.read_index = write_index - SLOT_COUNT;
        }

        let batch_start = out.len();
        let read_start = self.read_index;
        while self.read_index < write_index {
            let slot_index = (self.read_index % SLOT_COUNT) as usize;
            // SAFETY: this index is below the acquired write_index, so the
            // producer's write to it happened-before this read. Lapping during
            // the read is handled below.
            let buf = unsafe { *self.ring.slots[slot_index].get() };
            out.push(decode_slot(&buf));
            self.read_index += 1;
        }

        // If the producer lapped the batch while it was being read, the oldest
        // records may be torn. Discard exactly those.
        let write_after = self.ring.header.write_index.load(Ordering::Acquire);
        if write_after > read_start + SLOT_COUNT {
            let suspect = (write_after - SLOT_COUNT - read_start).min(self.read_index - read_start);
            out.drain(batch_start..batch_start + suspect as usize);
            dropped_now += suspect;
        }

        self.dropped += dropped_now;
        dropped_now
    }

    /// Total records lost to overflow since the start of the run.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn active_users(&self) -> usize {
        self.ring.header.active_users.load(Ordering::Acquire) as usize
    }

    pub fn worker_id(&self) -> u8 {
        self.ring.header.worker_id
    }
}

/// Read-only view of a ring's heartbeat and gauges, used by the coordinator
/// for health monitoring while the consumer lives in the aggregator.
#[derive(Clone)]
pub struct RingMonitor {
    ring: Arc<RingBuffer>,
}

impl RingMonitor {
    /// The producer's last heartbeat, in monotonic seconds since the epoch.
    pub fn heartbeat(&self) -> f64 {
        f64::from_bits(self.ring.header.heartbeat.load(Ordering::Acquire))
    }

    pub fn active_users(&self) -> usize {
        self.ring.header.active_users.load(Ordering::Acquire) as usize
    }

    pub fn worker_id(&self) -> u8 {
        self.ring.header.worker_id
    }
}

/// Allocate a ring and split it into its three handles. The heartbeat starts
/// at `now` so a freshly spawned worker is not instantly stale.
pub fn ring_channel(worker_id: u8, now: f64) -> (RingProducer, RingConsumer, RingMonitor) {
    let slots: Box<[UnsafeCell<[u8; SLOT_SIZE]>]> = (0..SLOT_COUNT)
        .map(|_| UnsafeCell::new([0u8; SLOT_SIZE]))
        .collect();
    let ring = Arc::new(RingBuffer {
        header: RingHeader {
            write_index: AtomicU64::new(0),
            heartbeat: AtomicU64::new(now.to_bits()),
            active_users: AtomicU64::new(0),
            worker_id,
        },
        slots,
    });
    (
        RingProducer {
            ring: ring.clone(),
            _single_thread: PhantomData,
        },
        RingConsumer {
            ring: ring.clone(),
            read_index: 0,
            dropped: 0,
        },
        RingMonitor { ring },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::fnv1a_hash;

    fn sample_metric(sequence: u64) -> RequestMetric {
        RequestMetric {
            timestamp: sequence as f64 * 0.001,
            name_hash: fnv1a_hash("index"),
            method: MethodCode::Get,
            status_code: 200,
            latency_ms: 12.5,
            content_length: 2048,
            worker_id: 3,
            error_category: ErrorCategory::None,
        }
    }

    #[test]
    fn slot_layout() {
        let metric = RequestMetric {
            timestamp: 1.5,
            name_hash: 0x0102030405060708,
            method: MethodCode::Post,
            status_code: 503,
            latency_ms: 250.0,
            content_length: 4096,
            worker_id: 7,
            error_category: ErrorCategory::HttpServerError,
        };
        let mut slot = [0u8; SLOT_SIZE];
        encode_slot(&metric, &mut slot);

        // Fixed offsets, network byte order.
        assert_eq!(slot[0..8], 1.5f64.to_be_bytes());
        assert_eq!(slot[8..12], 250.0f32.to_be_bytes());
        assert_eq!(slot[12..14], 503u16.to_be_bytes());
        assert_eq!(slot[14..18], 4096u32.to_be_bytes());
        assert_eq!(slot[18..26], 0x0102030405060708u64.to_be_bytes());
        assert_eq!(slot[26], 7);
        assert_eq!(slot[27], 7);
        assert_eq!(slot[28], 1);
        assert_eq!(slot[29..32], [0, 0, 0]);

        assert_eq!(decode_slot(&slot), metric);
    }

    #[test]
    fn produce_then_consume() {
        let (producer, mut consumer, _monitor) = ring_channel(3, 0.0);
        for sequence in 0..100 {
            producer.push(&sample_metric(sequence));
        }
        let mut drained = Vec::new();
        assert_eq!(consumer.drain(&mut drained), 0);
        assert_eq!(drained.len(), 100);
        // Records come out in completion order.
        for (sequence, metric) in drained.iter().enumerate() {
            assert_eq!(metric.timestamp, sequence as f64 * 0.001);
        }
        // A second drain finds nothing new.
        let mut empty = Vec::new();
        assert_eq!(consumer.drain(&mut empty), 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_span() {
        let (producer, mut consumer, _monitor) = ring_channel(0, 0.0);
        let extra = 10;
        for sequence in 0..SLOT_COUNT + extra {
            producer.push(&sample_metric(sequence));
        }
        let mut drained = Vec::new();
        let dropped = consumer.drain(&mut drained);
        assert_eq!(dropped, extra);
        assert_eq!(consumer.dropped(), extra);
        assert_eq!(drained.len(), SLOT_COUNT as usize);
        // The surviving window is the newest SLOT_COUNT records.
        assert_eq!(drained[0].timestamp, extra as f64 * 0.001);
    }

    #[test]
    fn heartbeat_and_gauges() {
        let (producer, consumer, monitor) = ring_channel(5, 1.0);
        assert_eq!(monitor.heartbeat(), 1.0);
        producer.beat(2.5);
        producer.set_active_users(42);
        assert_eq!(monitor.heartbeat(), 2.5);
        assert_eq!(monitor.active_users(), 42);
        assert_eq!(consumer.active_users(), 42);
        assert_eq!(monitor.worker_id(), 5);
    }

    #[test]
    fn cross_thread_transport() {
        let (producer, mut consumer, _monitor) = ring_channel(1, 0.0);
        let total = 10_000u64;
        let handle = std::thread::spawn(move || {
            for sequence in 0..total {
                producer.push(&sample_metric(sequence));
            }
        });

        let mut drained = Vec::new();
        while drained.len() < total as usize {
            consumer.drain(&mut drained);
        }
        handle.join().expect("producer thread panicked");

        assert_eq!(drained.len(), total as usize);
        for (sequence, metric) in drained.iter().enumerate() {
            assert_eq!(metric.timestamp, sequence as f64 * 0.001);
        }
    }
}

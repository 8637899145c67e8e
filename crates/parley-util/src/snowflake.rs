//! 64-bit time-ordered ids: 42 bits of milliseconds since 2025-01-01, 10
//! worker bits, 12 sequence bits. Message ids generated in one process are
//! strictly increasing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const EPOCH_MS: u64 = 1_735_689_600_000;
const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Last issued `(timestamp << SEQUENCE_BITS) | sequence`.
static LAST: AtomicU64 = AtomicU64::new(0);

fn millis_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS)
        .saturating_sub(EPOCH_MS)
}

pub fn generate(worker_id: u16) -> i64 {
    let now = millis_since_epoch() << SEQUENCE_BITS;
    let mut last = LAST.load(Ordering::Acquire);
    // A full sequence spills into the next millisecond, keeping ids unique.
    let stamp = loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break next,
            Err(actual) => last = actual,
        }
    };
    let timestamp = stamp >> SEQUENCE_BITS;
    let sequence = stamp & SEQUENCE_MASK;
    let worker = u64::from(worker_id) & ((1 << WORKER_BITS) - 1);
    ((timestamp << (WORKER_BITS + SEQUENCE_BITS)) | (worker << SEQUENCE_BITS) | sequence) as i64
}

#![no_main]

//! Fuzz target for admission queue bookkeeping.
//!
//! Drives an `AdmissionQueue` with arbitrary enqueue/remove/slot sequences and
//! checks it against a plain `Vec` model after every step:
//! - order is FIFO
//! - ids are unique
//! - removal is idempotent
//! - the bound is never exceeded
//! - dropping a slot always frees its entry

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pacegate::admission::{AdmissionError, AdmissionQueue, QueueSlot, RequestId};
use std::sync::Arc;

const IDS: usize = 16;

#[derive(Debug, Arbitrary)]
enum Op {
    Enqueue(u8),
    Remove(u8),
    Join(u8),
    ReleaseSlot(u8),
    DropSlot(u8),
}

#[derive(Debug, Arbitrary)]
struct Input {
    capacity: Option<u8>,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let capacity = input.capacity.map(|c| usize::from(c % 8) + 1);
    let queue = Arc::new(AdmissionQueue::with_capacity_limit(capacity));
    let ids: Vec<RequestId> = (0..IDS).map(|_| RequestId::new()).collect();
    let mut model: Vec<RequestId> = Vec::new();
    let mut slots: Vec<QueueSlot> = Vec::new();

    for op in input.ops.into_iter().take(256) {
        match op {
            Op::Enqueue(i) | Op::Join(i) => {
                let id = ids[usize::from(i) % IDS];
                let expected = if model.contains(&id) {
                    Err(AdmissionError::Duplicate { id })
                } else if capacity.is_some_and(|c| model.len() >= c) {
                    Err(AdmissionError::Full {
                        capacity: capacity.unwrap_or_default(),
                    })
                } else {
                    Ok(())
                };

                let result = if matches!(op, Op::Join(_)) {
                    queue.join(id).map(|slot| slots.push(slot))
                } else {
                    queue.enqueue(id).map(|_| ())
                };
                assert_eq!(result, expected);
                if result.is_ok() {
                    model.push(id);
                }
            }
            Op::Remove(i) => {
                let id = ids[usize::from(i) % IDS];
                let was_present = model.contains(&id);
                assert_eq!(queue.remove(id), was_present);
                model.retain(|&queued| queued != id);
                assert!(!queue.remove(id));
            }
            Op::ReleaseSlot(i) | Op::DropSlot(i) => {
                if slots.is_empty() {
                    continue;
                }
                let slot = slots.swap_remove(usize::from(i) % slots.len());
                let id = slot.id();
                if matches!(op, Op::ReleaseSlot(_)) {
                    slot.release();
                } else {
                    drop(slot);
                }
                model.retain(|&queued| queued != id);
            }
        }

        assert_eq!(queue.snapshot(), model);
        assert_eq!(queue.len(), model.len());
        if let Some(c) = capacity {
            assert!(queue.len() <= c);
        }
        for (position, &id) in model.iter().enumerate() {
            assert_eq!(queue.position(id), Some(position));
            assert_eq!(queue.is_head(id), position == 0);
        }
    }

    drop(slots);
    for id in model {
        queue.remove(id);
    }
    assert!(queue.is_empty());
});

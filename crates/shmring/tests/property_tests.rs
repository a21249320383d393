//! Property-based tests for the ring protocol, driven through the
//! single-direction channel over real shared memory.
//!
//! Coverage:
//! - byte-level FIFO: what the consumer sees is exactly what the producer
//!   committed, in order
//! - `used` accounting: always the sum of in-flight frames, never above
//!   capacity
//! - wrap-around spans reassemble every payload
//! - partial commits publish exactly the committed prefix

#![cfg(any(target_os = "linux", target_os = "macos", windows))]

use proptest::prelude::*;
use shmring::{Error, Pipe};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes one message of `len` payload bytes occupies on the wire.
fn frame(len: usize) -> usize {
    (4 + len + 3) & !3
}

fn fresh_pair(capacity: usize) -> (Pipe, Pipe, String) {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        "/shmring-prop-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let _ = Pipe::unlink(&name);
    let producer = Pipe::create(&name, 0, capacity).unwrap();
    let consumer = Pipe::attach(&name).unwrap();
    (producer, consumer, name)
}

proptest! {
    /// Any payload up to capacity - 4 round-trips bit-exactly, and `used`
    /// returns to zero afterwards.
    #[test]
    fn prop_round_trip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..=60)) {
        let (mut producer, mut consumer, name) = fresh_pair(64);

        producer.send(&payload).unwrap();
        prop_assert_eq!(producer.used(), frame(payload.len()));

        let received = consumer.recv().unwrap();
        prop_assert_eq!(received, payload);
        prop_assert_eq!(consumer.used(), 0);

        Pipe::unlink(&name).unwrap();
    }

    /// An arbitrary interleaving of pushes and pops matches a queue model
    /// exactly: same accept/reject decisions, same delivered bytes, and
    /// `used` always equals the modeled in-flight total.
    #[test]
    fn prop_fifo_against_queue_model(
        ops in proptest::collection::vec((any::<bool>(), 0usize..=32, any::<u8>()), 1..120)
    ) {
        const CAP: usize = 32;
        let (mut producer, mut consumer, name) = fresh_pair(CAP);

        let mut model: VecDeque<Vec<u8>> = VecDeque::new();
        let mut in_flight = 0usize;

        for (is_push, len, byte) in ops {
            if is_push {
                let payload = vec![byte; len];
                match producer.try_send(&payload) {
                    Ok(()) => {
                        prop_assert!(in_flight + frame(len) <= CAP,
                            "push accepted without space: used {} frame {}", in_flight, frame(len));
                        in_flight += frame(len);
                        model.push_back(payload);
                    }
                    Err(Error::TooBig { .. }) => prop_assert!(frame(len) > CAP),
                    Err(Error::Busy) => prop_assert!(in_flight + frame(len) > CAP),
                    Err(e) => prop_assert!(false, "unexpected push error: {e}"),
                }
            } else {
                match consumer.try_recv() {
                    Ok(received) => {
                        let expected = model.pop_front();
                        prop_assert_eq!(Some(&received), expected.as_ref());
                        in_flight -= frame(received.len());
                    }
                    Err(Error::Busy) => prop_assert!(model.is_empty()),
                    Err(e) => prop_assert!(false, "unexpected pop error: {e}"),
                }
            }
            prop_assert!(producer.used() <= CAP);
            prop_assert_eq!(producer.used(), in_flight);
        }

        // drain: everything still in flight arrives in order
        while let Some(expected) = model.pop_front() {
            prop_assert_eq!(consumer.recv().unwrap(), expected);
        }
        prop_assert_eq!(consumer.used(), 0);

        Pipe::unlink(&name).unwrap();
    }

    /// Payloads pushed at every possible cursor offset reassemble from
    /// their spans, wrapped or not.
    #[test]
    fn prop_wrap_spans_reassemble(
        prefill in 0usize..=12,
        payload in proptest::collection::vec(any::<u8>(), 0..=12),
    ) {
        const CAP: usize = 16;
        let (mut producer, mut consumer, name) = fresh_pair(CAP);

        // walk the cursors to an arbitrary aligned offset
        producer.send(&vec![0u8; prefill]).unwrap();
        consumer.recv().unwrap();

        producer.send(&payload).unwrap();
        let msg = consumer.try_pop().unwrap();
        let (a, b) = msg.as_slices();
        prop_assert_eq!(a.len() + b.len(), payload.len());
        prop_assert_eq!(msg.to_vec(), payload);

        Pipe::unlink(&name).unwrap();
    }

    /// Committing a prefix of a reservation publishes exactly that prefix.
    #[test]
    fn prop_partial_commit_publishes_prefix(
        reserve in 0usize..=28,
        commit_frac in 0.0f64..=1.0,
    ) {
        let (mut producer, mut consumer, name) = fresh_pair(32);
        let committed = (reserve as f64 * commit_frac) as usize;

        let mut slot = producer.try_push(reserve).unwrap();
        let bytes: Vec<u8> = (0..reserve as u8).collect();
        slot.fill(&bytes);
        slot.commit(committed).unwrap();

        prop_assert_eq!(producer.used(), frame(committed));
        prop_assert_eq!(consumer.recv().unwrap(), &bytes[..committed]);
        prop_assert_eq!(consumer.used(), 0);

        Pipe::unlink(&name).unwrap();
    }
}

//! Byte-level SPSC ring over cells in the shared mapping.
//!
//! One ring carries one direction. Frames are length-prefixed and 4-byte
//! aligned; `head` and `tail` are byte offsets and stay multiples of 4, so
//! every prefix is naturally aligned and never straddles the end of the
//! ring.

use crate::error::{Error, Result};
use crate::futex;
use crate::layout::{frame_size, is_aligned, max_payload, RingHdr, FRAME_HDR};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// The ring is a classic SPSC byte queue, shared between two processes
// through a mapped region. Only two cells synchronize the peers:
//
// ## `used`: published bytes
//
// **Producer (commit path):**
// 1. Write length prefix, payload and padding (plain writes; the producer
//    owns bytes past `tail` up to `head`)
// 2. Advance `tail` with Relaxed (only the producer writes tail)
// 3. `used.fetch_add(frame, Release)`: publishes the bytes
// 4. If the previous value was 0, wake one sleeper on `&used`
//
// **Consumer (pop path):**
// 1. `used.load(Acquire)`: synchronizes with the producer's Release add,
//    making prefix and payload visible
// 2. Read the frame (plain reads)
// 3. Advance `head` with Relaxed (only the consumer writes head)
// 4. `used.fetch_sub(frame, Release)`: returns the bytes; the producer's
//    next Acquire load may safely overwrite them
//
// ## `need`: producer deficit
//
// A producer that finds `free < frame` stores `frame - free` into `need`
// (Release) and sleeps on the cell. The consumer decrements `need` by every
// frame it releases (AcqRel) and wakes all sleepers once the value drops to
// or below zero (compared as signed: the cell keeps decrementing while no
// producer is waiting).
//
// ## Single-writer invariants
//
// - `tail` and the bytes in `[tail, tail + reserved)`: producer only
// - `head` and reads of `[head, head + used)`: consumer only
// - `used`: fetch_add by producer, fetch_sub by consumer
// - `need`: store by producer, fetch_sub by consumer
//
// `closed` is a one-shot monotonic flag: Relaxed store at teardown, Acquire
// checks; teardown wakes all sleepers on both cells afterwards.
//
// =============================================================================

/// One side's handle onto a ring: pointers to the shared cells plus the
/// payload bytes.
///
/// Strict SPSC: per ring there is one producing process and one consuming
/// process, and the push/pop methods take `&mut self` so a handle cannot be
/// driven from two threads at once.
pub(crate) struct RingCells {
    capacity: usize,
    head: NonNull<AtomicU32>,
    tail: NonNull<AtomicU32>,
    used: NonNull<AtomicU32>,
    need: NonNull<AtomicU32>,
    closed: NonNull<AtomicU32>,
    data: NonNull<u8>,
}

// Safety: the pointed-to cells are atomics in a mapping that outlives the
// handle (the owning Pipe/Channel keeps the mapping alive), and the payload
// region is only touched per the single-writer invariants above.
unsafe impl Send for RingCells {}

impl RingCells {
    /// Builds a handle from raw parts.
    ///
    /// # Safety
    ///
    /// All pointers must reference 4-byte-aligned cells inside a live
    /// mapping laid out per `layout`, `data` must be valid for `capacity`
    /// bytes, and `capacity` must be a non-zero multiple of 4.
    pub(crate) unsafe fn from_raw(
        capacity: usize,
        head: *const AtomicU32,
        tail: *const AtomicU32,
        used: *const AtomicU32,
        need: *const AtomicU32,
        closed: *const AtomicU32,
        data: *mut u8,
    ) -> Self {
        debug_assert!(capacity > 0 && is_aligned(capacity));
        Self {
            capacity,
            head: NonNull::new_unchecked(head.cast_mut()),
            tail: NonNull::new_unchecked(tail.cast_mut()),
            used: NonNull::new_unchecked(used.cast_mut()),
            need: NonNull::new_unchecked(need.cast_mut()),
            closed: NonNull::new_unchecked(closed.cast_mut()),
            data: NonNull::new_unchecked(data),
        }
    }

    /// Builds a handle over a bidirectional ring segment (`RingHdr` +
    /// payload).
    ///
    /// # Safety
    ///
    /// `segment` must point at an initialized `RingHdr` with `capacity`
    /// payload bytes behind it; `closed` must point at the channel-wide
    /// teardown flag in the same mapping.
    pub(crate) unsafe fn from_segment(segment: *mut u8, closed: *const AtomicU32) -> Self {
        let hdr = segment.cast::<RingHdr>();
        let capacity = (*hdr).size as usize;
        Self::from_raw(
            capacity,
            &(*hdr).head,
            &(*hdr).tail,
            &(*hdr).used,
            &(*hdr).need,
            closed,
            segment.add(std::mem::size_of::<RingHdr>()),
        )
    }

    #[inline]
    fn head_cell(&self) -> &AtomicU32 {
        unsafe { self.head.as_ref() }
    }

    #[inline]
    fn tail_cell(&self) -> &AtomicU32 {
        unsafe { self.tail.as_ref() }
    }

    #[inline]
    fn used_cell(&self) -> &AtomicU32 {
        unsafe { self.used.as_ref() }
    }

    #[inline]
    fn need_cell(&self) -> &AtomicU32 {
        unsafe { self.need.as_ref() }
    }

    #[inline]
    fn closed_cell(&self) -> &AtomicU32 {
        unsafe { self.closed.as_ref() }
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    /// Ring capacity in bytes.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Published bytes currently occupying the ring, frame headers included.
    #[inline]
    pub(crate) fn used_bytes(&self) -> usize {
        self.used_cell().load(Ordering::Acquire) as usize
    }

    /// Whether the channel carrying this ring has been torn down.
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed_cell().load(Ordering::Acquire) != 0
    }

    /// Releases every sleeper parked on this ring's cells.
    ///
    /// Called after the teardown flag is set so blocked peers re-check it
    /// and return [`Error::Closed`].
    pub(crate) fn wake_sleepers(&self) {
        futex::wake_all(self.used_cell());
        futex::wake_all(self.need_cell());
    }

    // ---------------------------------------------------------------------
    // PRODUCER
    // ---------------------------------------------------------------------

    /// Reserves space for a message of up to `len` payload bytes.
    ///
    /// Nothing is visible to the consumer until the returned slot commits;
    /// dropping the slot uncommitted abandons the reservation without
    /// publishing anything.
    pub(crate) fn try_push(&mut self, len: usize) -> Result<PushSlot<'_>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let cap = self.capacity;
        if len > max_payload(cap) {
            return Err(Error::TooBig { len, capacity: cap });
        }
        let frame = frame_size(len);
        let used = self.used_cell().load(Ordering::Acquire) as usize;
        let free = cap - used;
        if free < frame {
            // Publish how many bytes short we are; the consumer decrements
            // this on every pop and wakes us once it reaches zero.
            self.need_cell().store((frame - free) as u32, Ordering::Release);
            return Err(Error::Busy);
        }
        let tail = self.tail_cell().load(Ordering::Relaxed) as usize;
        debug_assert!(is_aligned(tail) && tail + FRAME_HDR <= cap);
        Ok(PushSlot { ring: self, tail, reserved: len })
    }

    /// Like [`try_push`](Self::try_push) but sleeps until space is
    /// available or the channel closes.
    pub(crate) fn push(&mut self, len: usize) -> Result<PushSlot<'_>> {
        self.wait_pushable(len, None)?;
        self.try_push(len)
    }

    /// Like [`push`](Self::push) with a deadline.
    pub(crate) fn push_until(&mut self, len: usize, timeout: Duration) -> Result<PushSlot<'_>> {
        self.wait_pushable(len, Instant::now().checked_add(timeout))?;
        self.try_push(len)
    }

    /// Sleeps on `&need` until a frame of `len` payload bytes fits.
    ///
    /// Every wait return re-evaluates free space before anything else; the
    /// deadline is only consulted once the ring is still short.
    fn wait_pushable(&mut self, len: usize, deadline: Option<Instant>) -> Result<()> {
        let cap = self.capacity;
        if len > max_payload(cap) {
            return Err(Error::TooBig { len, capacity: cap });
        }
        let frame = frame_size(len);
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            let used = self.used_cell().load(Ordering::Acquire) as usize;
            let free = cap - used;
            if free >= frame {
                return Ok(());
            }
            let deficit = (frame - free) as u32;
            self.need_cell().store(deficit, Ordering::Release);
            // Re-validate after publishing the deficit. A pop that committed
            // entirely before the store decremented the cell's previous
            // value, not ours; sleeping on a deficit computed from that
            // stale snapshot could miss the wake. Once free space is
            // unchanged here, every later pop hits the stored cell and the
            // wake accounting is exact.
            let free_now = cap - self.used_cell().load(Ordering::Acquire) as usize;
            if free_now >= frame {
                return Ok(());
            }
            if free_now != free {
                continue;
            }
            let timeout = match deadline {
                None => None,
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Err(Error::Timeout),
                },
            };
            // Parks only while the cell still holds the deficit we stored; a
            // racing pop either changed it (mismatch, retry) or wakes all
            // sleepers once the deficit reaches zero.
            futex::wait(self.need_cell(), deficit, timeout)?;
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER
    // ---------------------------------------------------------------------

    /// Takes the oldest message off the ring, if any.
    ///
    /// The returned [`Msg`] borrows the payload in place; dropping it
    /// releases the bytes back to the producer.
    pub(crate) fn try_pop(&mut self) -> Result<Msg<'_>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let used = self.used_cell().load(Ordering::Acquire) as usize;
        if used == 0 {
            return Err(Error::Busy);
        }
        debug_assert!(used >= FRAME_HDR);
        let cap = self.capacity;
        let head = self.head_cell().load(Ordering::Relaxed) as usize;
        debug_assert!(is_aligned(head) && head + FRAME_HDR <= cap);
        let mut prefix = [0u8; FRAME_HDR];
        // SAFETY: the prefix is inside the mapping and was published by the
        // Acquire load of `used` above.
        unsafe {
            self.data
                .as_ptr()
                .add(head)
                .copy_to_nonoverlapping(prefix.as_mut_ptr(), FRAME_HDR);
        }
        let len = u32::from_le_bytes(prefix) as usize;
        if len > max_payload(cap) || frame_size(len) > used {
            return Err(Error::Invalid("corrupt length prefix"));
        }
        Ok(Msg { ring: self, head, len })
    }

    /// Like [`try_pop`](Self::try_pop) but sleeps until a message arrives
    /// or the channel closes.
    pub(crate) fn pop(&mut self) -> Result<Msg<'_>> {
        self.wait_poppable(None)?;
        self.try_pop()
    }

    /// Like [`pop`](Self::pop) with a deadline.
    pub(crate) fn pop_until(&mut self, timeout: Duration) -> Result<Msg<'_>> {
        self.wait_poppable(Instant::now().checked_add(timeout))?;
        self.try_pop()
    }

    fn wait_poppable(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            if self.used_cell().load(Ordering::Acquire) != 0 {
                return Ok(());
            }
            let timeout = match deadline {
                None => None,
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Err(Error::Timeout),
                },
            };
            futex::wait(self.used_cell(), 0, timeout)?;
        }
    }
}

/// A pending reservation: up to two writable spans covering the payload
/// bytes of one message.
///
/// The spans may wrap the end of the ring, in which case the second one is
/// non-empty and continues at offset 0. [`commit`](PushSlot::commit)
/// publishes a prefix of the reservation to the consumer; dropping the slot
/// without committing publishes nothing.
pub struct PushSlot<'a> {
    ring: &'a RingCells,
    tail: usize,
    reserved: usize,
}

impl PushSlot<'_> {
    /// Number of payload bytes reserved.
    #[inline]
    pub fn len(&self) -> usize {
        self.reserved
    }

    /// Returns `true` if the reservation holds no payload bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reserved == 0
    }

    /// The reserved payload region as two contiguous spans.
    ///
    /// The second span is empty unless the payload wraps the end of the
    /// ring; together they are exactly [`len`](Self::len) bytes.
    pub fn as_mut_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        let cap = self.ring.capacity;
        let start = (self.tail + FRAME_HDR) % cap;
        let first = self.reserved.min(cap - start);
        // SAFETY: the producer owns [tail+4, tail+4+reserved) until commit;
        // the consumer only reads below `head + used`, which this region is
        // past.
        unsafe {
            let base = self.ring.data.as_ptr();
            (
                slice::from_raw_parts_mut(base.add(start), first),
                slice::from_raw_parts_mut(base, self.reserved - first),
            )
        }
    }

    /// Copies `data` to the start of the reservation.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than the reservation.
    pub fn fill(&mut self, data: &[u8]) {
        assert!(data.len() <= self.reserved, "fill exceeds reservation");
        let (a, b) = self.as_mut_slices();
        let split = data.len().min(a.len());
        a[..split].copy_from_slice(&data[..split]);
        b[..data.len() - split].copy_from_slice(&data[split..]);
    }

    /// Publishes the first `len` bytes of the reservation as one message.
    ///
    /// `len` may be anything from 0 to the reserved length; it becomes the
    /// message's length prefix. Committing more than was reserved is
    /// [`Error::Invalid`].
    pub fn commit(self, len: usize) -> Result<()> {
        if len > self.reserved {
            return Err(Error::Invalid("commit exceeds reservation"));
        }
        let ring = self.ring;
        let cap = ring.capacity;
        let frame = frame_size(len);
        // SAFETY: prefix and padding are inside the producer-owned region;
        // the prefix is 4-byte aligned and does not wrap.
        unsafe {
            let base = ring.data.as_ptr();
            base.add(self.tail)
                .copy_from_nonoverlapping((len as u32).to_le_bytes().as_ptr(), FRAME_HDR);
            let start = (self.tail + FRAME_HDR) % cap;
            let pad = frame - FRAME_HDR - len;
            for i in 0..pad {
                *base.add((start + len + i) % cap) = 0;
            }
        }
        ring.tail_cell()
            .store(((self.tail + frame) % cap) as u32, Ordering::Relaxed);
        let old = ring.used_cell().fetch_add(frame as u32, Ordering::Release);
        if old == 0 {
            // The consumer only parks on an empty ring.
            futex::wake_one(ring.used_cell());
        }
        Ok(())
    }

    /// Publishes the whole reservation.
    pub fn commit_all(self) -> Result<()> {
        let len = self.reserved;
        self.commit(len)
    }
}

/// One received message, borrowed in place from the ring.
///
/// Dropping the message commits the pop: the bytes return to the producer
/// and a parked producer whose deficit is now met is woken.
pub struct Msg<'a> {
    ring: &'a RingCells,
    head: usize,
    len: usize,
}

impl Msg<'_> {
    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty message.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The payload as two contiguous spans.
    ///
    /// The second span is empty unless the payload wraps the end of the
    /// ring; together they are exactly [`len`](Self::len) bytes.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        let cap = self.ring.capacity;
        let start = (self.head + FRAME_HDR) % cap;
        let first = self.len.min(cap - start);
        // SAFETY: [head+4, head+4+len) was published by the producer's
        // Release add to `used` and is not reused until this Msg drops.
        unsafe {
            let base = self.ring.data.as_ptr();
            (
                slice::from_raw_parts(base.add(start), first),
                slice::from_raw_parts(base, self.len - first),
            )
        }
    }

    /// Copies the payload into an owned buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let (a, b) = self.as_slices();
        let mut out = Vec::with_capacity(self.len);
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }
}

impl Drop for Msg<'_> {
    fn drop(&mut self) {
        let ring = self.ring;
        let cap = ring.capacity;
        let frame = frame_size(self.len);
        ring.head_cell()
            .store(((self.head + frame) % cap) as u32, Ordering::Relaxed);
        ring.used_cell().fetch_sub(frame as u32, Ordering::Release);
        // The deficit may go below zero while no producer is waiting; the
        // signed comparison keeps the wake condition monotonic.
        let after = ring
            .need_cell()
            .fetch_sub(frame as u32, Ordering::AcqRel)
            .wrapping_sub(frame as u32);
        if after as i32 <= 0 {
            futex::wake_all(ring.need_cell());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::segment_size;
    use std::mem::size_of;

    /// Owned heap segment standing in for the shared mapping: a `RingHdr`
    /// plus payload, in `u32` storage for alignment, and a separate
    /// teardown cell.
    struct Fixture {
        mem: Box<[u32]>,
        closed: Box<AtomicU32>,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            let words = segment_size(capacity) / 4;
            let mem = vec![0u32; words].into_boxed_slice();
            let fx = Self { mem, closed: Box::new(AtomicU32::new(0)) };
            // stamp the capacity the way a creator stamps the segment
            unsafe {
                let hdr = fx.base().cast::<RingHdr>();
                std::ptr::addr_of_mut!((*hdr).size).write(capacity as u32);
            }
            fx
        }

        fn base(&self) -> *mut u8 {
            self.mem.as_ptr().cast_mut().cast::<u8>()
        }

        /// A fresh handle; the fixture must outlive it.
        fn handle(&self) -> RingCells {
            unsafe { RingCells::from_segment(self.base(), &*self.closed) }
        }

        fn close(&self) {
            self.closed.store(1, Ordering::Relaxed);
            self.handle().wake_sleepers();
        }
    }

    #[test]
    fn test_roundtrip_hello() {
        let fx = Fixture::new(64);
        let mut p = fx.handle();
        let mut c = fx.handle();

        let mut slot = p.try_push(5).unwrap();
        slot.fill(b"hello");
        slot.commit(5).unwrap();
        assert_eq!(p.used_bytes(), 12); // 4 prefix + 5 payload + 3 pad

        let msg = c.try_pop().unwrap();
        assert_eq!(msg.len(), 5);
        assert_eq!(msg.to_vec(), b"hello");
        drop(msg);
        assert_eq!(c.used_bytes(), 0);
    }

    #[test]
    fn test_empty_message_is_a_four_byte_frame() {
        let fx = Fixture::new(16);
        let mut p = fx.handle();
        let mut c = fx.handle();

        p.try_push(0).unwrap().commit(0).unwrap();
        assert_eq!(p.used_bytes(), 4);
        let msg = c.try_pop().unwrap();
        assert!(msg.is_empty());
        assert_eq!(msg.to_vec(), b"");
    }

    #[test]
    fn test_busy_until_consumer_frees_space() {
        let fx = Fixture::new(16);
        let mut p = fx.handle();
        let mut c = fx.handle();

        // "ABCDE" frames to 12 of 16 bytes; "F" would need 8 more
        let mut slot = p.try_push(5).unwrap();
        slot.fill(b"ABCDE");
        slot.commit(5).unwrap();
        assert!(matches!(p.try_push(1), Err(Error::Busy)));

        assert_eq!(c.try_pop().unwrap().to_vec(), b"ABCDE");

        let mut slot = p.try_push(1).unwrap();
        slot.fill(b"F");
        slot.commit(1).unwrap();
        assert_eq!(c.try_pop().unwrap().to_vec(), b"F");
    }

    #[test]
    fn test_wraparound_spans_reassemble() {
        let fx = Fixture::new(16);
        let mut p = fx.handle();
        let mut c = fx.handle();

        // advance both cursors to 12
        let mut slot = p.try_push(5).unwrap();
        slot.fill(b"ABCDE");
        slot.commit(5).unwrap();
        drop(c.try_pop().unwrap());

        // prefix lands at offset 12, payload wraps to offset 0
        let mut slot = p.try_push(4).unwrap();
        slot.fill(b"GHIJ");
        slot.commit(4).unwrap();

        let msg = c.try_pop().unwrap();
        let (a, b) = msg.as_slices();
        assert_eq!(a.len() + b.len(), 4);
        assert_eq!(msg.to_vec(), b"GHIJ");
    }

    #[test]
    fn test_payload_straddling_the_boundary_yields_two_spans() {
        let fx = Fixture::new(16);
        let mut p = fx.handle();
        let mut c = fx.handle();

        // move cursors to 8
        p.try_push(4).unwrap().commit(4).unwrap();
        drop(c.try_pop().unwrap());

        // prefix at 8, payload [12..18) wraps: spans of 4 and 2
        let mut slot = p.try_push(6).unwrap();
        slot.fill(b"KLMNOP");
        let (a, b) = slot.as_mut_slices();
        assert_eq!((a.len(), b.len()), (4, 2));
        slot.commit(6).unwrap();

        let msg = c.try_pop().unwrap();
        let (a, b) = msg.as_slices();
        assert_eq!((a.len(), b.len()), (4, 2));
        assert_eq!(msg.to_vec(), b"KLMNOP");
    }

    #[test]
    fn test_largest_payload_fits_only_when_empty() {
        let fx = Fixture::new(16);
        let mut p = fx.handle();
        let mut c = fx.handle();

        // capacity - 4 fills the ring exactly
        let mut slot = p.try_push(12).unwrap();
        slot.fill(b"0123456789AB");
        slot.commit(12).unwrap();
        assert_eq!(p.used_bytes(), 16);
        assert!(matches!(p.try_push(0), Err(Error::Busy)));

        drop(c.try_pop().unwrap());
        assert!(p.try_push(12).is_ok());
    }

    #[test]
    fn test_oversized_payload_is_toobig_regardless_of_occupancy() {
        let fx = Fixture::new(16);
        let mut p = fx.handle();

        // capacity - 3 frames to 20 > 16
        assert!(matches!(p.try_push(13), Err(Error::TooBig { len: 13, capacity: 16 })));
        // still TooBig on a non-empty ring
        p.try_push(4).unwrap().commit(4).unwrap();
        assert!(matches!(p.try_push(13), Err(Error::TooBig { .. })));
    }

    #[test]
    fn test_pop_on_empty_is_busy() {
        let fx = Fixture::new(16);
        let mut c = fx.handle();
        assert!(matches!(c.try_pop(), Err(Error::Busy)));
    }

    #[test]
    fn test_commit_fewer_bytes_than_reserved() {
        let fx = Fixture::new(64);
        let mut p = fx.handle();
        let mut c = fx.handle();

        let mut slot = p.try_push(32).unwrap();
        slot.fill(b"abc");
        slot.commit(3).unwrap();

        let msg = c.try_pop().unwrap();
        assert_eq!(msg.to_vec(), b"abc");
        drop(msg);
        assert_eq!(c.used_bytes(), 0);
    }

    #[test]
    fn test_commit_more_than_reserved_is_invalid() {
        let fx = Fixture::new(64);
        let mut p = fx.handle();
        let slot = p.try_push(4).unwrap();
        assert!(matches!(slot.commit(5), Err(Error::Invalid(_))));
        // the failed commit published nothing
        assert_eq!(fx.handle().used_bytes(), 0);
    }

    #[test]
    fn test_abandoned_reservation_publishes_nothing() {
        let fx = Fixture::new(64);
        let mut p = fx.handle();
        let mut c = fx.handle();

        drop(p.try_push(8).unwrap());
        assert_eq!(p.used_bytes(), 0);
        assert!(matches!(c.try_pop(), Err(Error::Busy)));

        // the ring is still fully usable
        let mut slot = p.try_push(2).unwrap();
        slot.fill(b"ok");
        slot.commit(2).unwrap();
        assert_eq!(c.try_pop().unwrap().to_vec(), b"ok");
    }

    #[test]
    fn test_corrupt_length_prefix_is_invalid() {
        let fx = Fixture::new(16);
        let mut p = fx.handle();
        let mut c = fx.handle();
        p.try_push(4).unwrap().commit(4).unwrap();

        // scribble over the prefix at offset 0 of the payload region
        unsafe {
            let data = fx.base().add(size_of::<RingHdr>());
            data.copy_from_nonoverlapping(u32::MAX.to_le_bytes().as_ptr(), 4);
        }
        assert!(matches!(c.try_pop(), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_fifo_across_many_messages() {
        let fx = Fixture::new(64);
        let mut p = fx.handle();
        let mut c = fx.handle();

        let mut pushed = Vec::new();
        let mut popped = Vec::new();
        for i in 0u32..200 {
            let body = i.to_le_bytes();
            let payload = &body[..(i as usize % 5)];
            loop {
                match p.try_push(payload.len()) {
                    Ok(mut slot) => {
                        slot.fill(payload);
                        slot.commit(payload.len()).unwrap();
                        pushed.extend_from_slice(payload);
                        break;
                    }
                    Err(Error::Busy) => {
                        let msg = c.try_pop().unwrap();
                        popped.extend_from_slice(&msg.to_vec());
                    }
                    Err(e) => panic!("push failed: {e}"),
                }
            }
        }
        while let Ok(msg) = c.try_pop() {
            popped.extend_from_slice(&msg.to_vec());
        }
        assert_eq!(pushed, popped);
        assert_eq!(c.used_bytes(), 0);
    }

    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    mod blocking {
        use super::*;
        use std::thread;

        #[test]
        fn test_blocking_pop_is_woken_by_push() {
            let fx = Fixture::new(64);
            let mut p = fx.handle();
            let mut c = fx.handle();

            thread::scope(|s| {
                let popper = s.spawn(move || c.pop().map(|m| m.to_vec()));
                thread::sleep(Duration::from_millis(50));
                let mut slot = p.try_push(1).unwrap();
                slot.fill(b"x");
                slot.commit(1).unwrap();
                assert_eq!(popper.join().unwrap().unwrap(), b"x");
            });
        }

        #[test]
        fn test_pop_until_times_out_on_empty_ring() {
            let fx = Fixture::new(16);
            let mut c = fx.handle();
            let start = Instant::now();
            assert!(matches!(c.pop_until(Duration::from_millis(50)), Err(Error::Timeout)));
            assert!(start.elapsed() >= Duration::from_millis(50));
        }

        #[test]
        fn test_push_until_times_out_on_full_ring() {
            let fx = Fixture::new(16);
            let mut p = fx.handle();
            p.try_push(12).unwrap().commit(12).unwrap();
            assert!(matches!(
                p.push_until(8, Duration::from_millis(50)),
                Err(Error::Timeout)
            ));
        }

        #[test]
        fn test_blocked_push_is_woken_by_deficit_pop() {
            let fx = Fixture::new(16);
            let mut p = fx.handle();
            let mut c = fx.handle();

            let mut slot = p.try_push(5).unwrap();
            slot.fill(b"ABCDE");
            slot.commit(5).unwrap();

            thread::scope(|s| {
                let pusher = s.spawn(move || {
                    let mut slot = p.push(1)?;
                    slot.fill(b"F");
                    slot.commit(1)?;
                    Ok::<_, Error>(())
                });
                thread::sleep(Duration::from_millis(50));
                drop(c.try_pop().unwrap());
                pusher.join().unwrap().unwrap();
                assert_eq!(c.try_pop().unwrap().to_vec(), b"F");
            });
        }

        #[test]
        fn test_close_releases_blocked_pop() {
            let fx = Fixture::new(16);
            let mut c = fx.handle();

            thread::scope(|s| {
                let popper = s.spawn(move || match c.pop() {
                    Err(Error::Closed) => true,
                    other => panic!("expected Closed, got {:?}", other.map(|m| m.to_vec())),
                });
                thread::sleep(Duration::from_millis(50));
                fx.close();
                assert!(popper.join().unwrap());
            });
        }
    }
}

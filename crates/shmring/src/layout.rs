//! Wire layout of the shared region.
//!
//! Everything in the mapping is little-endian and 4-byte aligned. The header
//! structs here are plain-old-data views over the mapped bytes; their field
//! order and sizes are the protocol and must not change.

use std::mem::{offset_of, size_of};
use std::sync::atomic::AtomicU32;

/// Alignment unit for cursors, frames and header fields.
pub(crate) const ALIGN: usize = 4;

/// Bytes of the per-message length prefix.
pub(crate) const FRAME_HDR: usize = 4;

/// Rounds `n` up to the next multiple of [`ALIGN`].
#[inline]
pub(crate) const fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Returns `true` if `n` is a multiple of [`ALIGN`].
#[inline]
pub(crate) const fn is_aligned(n: usize) -> bool {
    n & (ALIGN - 1) == 0
}

/// Bytes one message of `len` payload bytes occupies on the ring:
/// length prefix + payload + zero padding up to alignment.
#[inline]
pub(crate) const fn frame_size(len: usize) -> usize {
    align_up(FRAME_HDR + len)
}

/// Largest payload a ring of `capacity` bytes can carry.
#[inline]
pub(crate) const fn max_payload(capacity: usize) -> usize {
    capacity - FRAME_HDR
}

/// Header of the single-direction region. Payload bytes follow immediately.
///
/// | offset | field        |
/// |--------|--------------|
/// | 0      | region size  |
/// | 4      | used         |
/// | 8      | ident        |
/// | 12     | creator pid  |
/// | 16     | attacher pid |
/// | 20     | closed       |
/// | 24     | head         |
/// | 28     | tail         |
/// | 32     | padding      |
/// | 64     | need         |
///
/// `used` and `need` sit on separate cache lines so the two sleep cells do
/// not false-share.
#[repr(C)]
pub(crate) struct PipeHdr {
    /// Total region size in bytes. Stamped once by the creator.
    pub size: u32,
    /// Published byte count, including frame headers.
    pub used: AtomicU32,
    /// Creator-chosen tag.
    pub ident: u32,
    /// Creator process id. Non-zero marks the region initialized.
    pub creator_pid: u32,
    /// Attacher process id. Claimed by compare-and-set; 0 when absent.
    pub attacher_pid: AtomicU32,
    /// One-shot teardown flag.
    pub closed: AtomicU32,
    /// Consumer read cursor.
    pub head: AtomicU32,
    /// Producer write cursor.
    pub tail: AtomicU32,
    pub _pad: [u32; 8],
    /// Producer deficit: bytes the producer is short of; 0 when idle.
    pub need: AtomicU32,
}

/// Descriptor of the bidirectional region. Two ring segments follow.
#[repr(C)]
pub(crate) struct ChannelHdr {
    /// Total region size in bytes.
    pub size: u32,
    /// Creator (sidecar) process id. Non-zero marks the region initialized.
    pub creator_pid: u32,
    /// Attacher (host) process id. Claimed by compare-and-set; 0 when absent.
    pub attacher_pid: AtomicU32,
    /// Creator-chosen tag.
    pub ident: u32,
    /// Capacity of the sidecar-to-host ring.
    pub net_size: u32,
    /// Capacity of the host-to-sidecar ring.
    pub host_size: u32,
    /// One-shot teardown flag, channel-wide.
    pub closed: AtomicU32,
    pub _pad: u32,
}

/// Per-ring header of a bidirectional segment. `size` payload bytes follow.
#[repr(C)]
pub(crate) struct RingHdr {
    /// Ring capacity in bytes.
    pub size: u32,
    /// Consumer read cursor.
    pub head: AtomicU32,
    /// Producer write cursor.
    pub tail: AtomicU32,
    /// Published byte count, including frame headers.
    pub used: AtomicU32,
    /// Producer deficit.
    pub need: AtomicU32,
}

/// Region size of a single-direction channel with the given ring capacity.
#[inline]
pub(crate) const fn pipe_region_size(capacity: usize) -> usize {
    size_of::<PipeHdr>() + capacity
}

/// Bytes one bidirectional ring segment occupies.
#[inline]
pub(crate) const fn segment_size(capacity: usize) -> usize {
    align_up(size_of::<RingHdr>() + capacity)
}

/// Region size of a bidirectional channel with the given ring capacities.
#[inline]
pub(crate) const fn channel_region_size(net_capacity: usize, host_capacity: usize) -> usize {
    size_of::<ChannelHdr>() + segment_size(net_capacity) + segment_size(host_capacity)
}

// The structs above ARE the wire format; a drifted field is a protocol break.
const _: () = assert!(size_of::<PipeHdr>() == 68);
const _: () = assert!(size_of::<ChannelHdr>() == 32);
const _: () = assert!(size_of::<RingHdr>() == 20);
const _: () = assert!(offset_of!(PipeHdr, used) == 4);
const _: () = assert!(offset_of!(PipeHdr, closed) == 20);
const _: () = assert!(offset_of!(PipeHdr, need) == 64);
const _: () = assert!(offset_of!(ChannelHdr, ident) == 12);
const _: () = assert!(offset_of!(RingHdr, need) == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 4);
        assert_eq!(align_up(4), 4);
        assert_eq!(align_up(5), 8);
        assert_eq!(align_up(7), 8);
    }

    #[test]
    fn test_frame_size() {
        // 4-byte prefix, padded to the next multiple of 4
        assert_eq!(frame_size(0), 4);
        assert_eq!(frame_size(1), 8);
        assert_eq!(frame_size(4), 8);
        assert_eq!(frame_size(5), 12);
        assert_eq!(frame_size(12), 16);
    }

    #[test]
    fn test_region_sizes() {
        assert_eq!(pipe_region_size(64), 132);
        assert_eq!(segment_size(64), 84);
        assert_eq!(channel_region_size(64, 32), 32 + 84 + 52);
    }

    #[test]
    fn test_max_payload_round_trip() {
        let cap = 64;
        assert_eq!(frame_size(max_payload(cap)), cap);
        // one byte more no longer fits
        assert!(frame_size(max_payload(cap) + 1) > cap);
    }
}

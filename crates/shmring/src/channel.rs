//! Bidirectional channel: two independent rings in one named region.
//!
//! The creating process is the "sidecar", the attaching process the
//! "host". Each side writes the ring it owns (sidecar → the net side,
//! host → the host side) and reads the other; the two directions share
//! nothing but the region and the teardown flag: no cross-ring ordering,
//! no cross-ring backpressure.

use crate::error::{Error, Result};
use crate::futex;
use crate::layout::{channel_region_size, is_aligned, segment_size, ChannelHdr, RingHdr};
use crate::ring::{Msg, PushSlot, RingCells};
use crate::shm::ShmObject;
use std::mem::size_of;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Which end of the channel a handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sidecar,
    Host,
}

/// A bidirectional, futex-coordinated message channel between two
/// processes.
///
/// [`Channel::create`] makes the sidecar end; [`Channel::open`] the host
/// end. Push always targets the ring this side owns as writer, pop the
/// opposite one. Dropping a handle tears the channel down; when the
/// sidecar detaches it also removes the OS name.
///
/// The name is passed to the OS verbatim; POSIX systems require a leading
/// `/`.
pub struct Channel {
    net: RingCells,
    host: RingCells,
    shm: ShmObject,
    name: String,
    role: Role,
}

impl Channel {
    /// Creates the named region with a sidecar-to-host ring of
    /// `net_capacity` bytes and a host-to-sidecar ring of `host_capacity`
    /// bytes, tagged with `ident`.
    ///
    /// Capacities must be non-zero multiples of 4. Fails if the name
    /// already exists, and on hosts without a wait-on-address primitive.
    pub fn create(
        name: &str,
        ident: u32,
        net_capacity: usize,
        host_capacity: usize,
    ) -> Result<Self> {
        for cap in [net_capacity, host_capacity] {
            if cap == 0 || !is_aligned(cap) {
                return Err(Error::Invalid("capacity must be a non-zero multiple of 4"));
            }
        }
        let total = channel_region_size(net_capacity, host_capacity);
        if total > u32::MAX as usize {
            return Err(Error::Invalid("capacities exceed the 4 GB region limit"));
        }
        futex::probe()?;

        let shm = ShmObject::create_exclusive(name, total)?;
        let base = shm.as_ptr();
        // The fresh mapping is zero-filled; stamp the descriptor and each
        // segment's capacity.
        unsafe {
            let hdr = base.cast::<ChannelHdr>();
            addr_of_mut!((*hdr).size).write(total as u32);
            addr_of_mut!((*hdr).creator_pid).write(std::process::id());
            addr_of_mut!((*hdr).ident).write(ident);
            addr_of_mut!((*hdr).net_size).write(net_capacity as u32);
            addr_of_mut!((*hdr).host_size).write(host_capacity as u32);

            let net_seg = base.add(size_of::<ChannelHdr>()).cast::<RingHdr>();
            addr_of_mut!((*net_seg).size).write(net_capacity as u32);
            let host_seg = base
                .add(size_of::<ChannelHdr>() + segment_size(net_capacity))
                .cast::<RingHdr>();
            addr_of_mut!((*host_seg).size).write(host_capacity as u32);
        }
        let (net, host) = unsafe { rings(&shm) };
        tracing::debug!(name, net_capacity, host_capacity, ident, "created channel");
        Ok(Self { net, host, shm, name: name.to_owned(), role: Role::Sidecar })
    }

    /// Attaches to an existing region as the host and claims the peer
    /// slot.
    ///
    /// Fails with [`Error::Busy`] if another host already claimed it,
    /// [`Error::Closed`] if the channel was torn down.
    pub fn open(name: &str) -> Result<Self> {
        futex::probe()?;
        let shm = ShmObject::open(name)?;
        if shm.len() < size_of::<ChannelHdr>() {
            return Err(Error::Invalid("region too small for a channel descriptor"));
        }
        let hdr = unsafe { &*shm.as_ptr().cast::<ChannelHdr>() };
        let size = hdr.size as usize;
        // The mapping may exceed the recorded size where the OS rounded the
        // object up; it must never be smaller.
        if size > shm.len() || size < size_of::<ChannelHdr>() {
            return Err(Error::Invalid("recorded size does not match the mapping"));
        }
        if hdr.creator_pid == 0 {
            return Err(Error::Invalid("region was never initialized"));
        }
        let (net_cap, host_cap) = (hdr.net_size as usize, hdr.host_size as usize);
        if net_cap == 0
            || host_cap == 0
            || !is_aligned(net_cap)
            || !is_aligned(host_cap)
            || channel_region_size(net_cap, host_cap) > size
        {
            return Err(Error::Invalid("descriptor ring sizes do not fit the region"));
        }
        let (net_seg_cap, host_seg_cap) = unsafe {
            let base = shm.as_ptr();
            let net_seg = base.add(size_of::<ChannelHdr>()).cast::<RingHdr>();
            let host_seg = base
                .add(size_of::<ChannelHdr>() + segment_size(net_cap))
                .cast::<RingHdr>();
            ((*net_seg).size as usize, (*host_seg).size as usize)
        };
        if net_seg_cap != net_cap || host_seg_cap != host_cap {
            return Err(Error::Invalid("segment headers disagree with the descriptor"));
        }
        if hdr.closed.load(Ordering::Acquire) != 0 {
            return Err(Error::Closed);
        }
        if hdr
            .attacher_pid
            .compare_exchange(0, std::process::id(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let (net, host) = unsafe { rings(&shm) };
        tracing::debug!(name, net_cap, host_cap, "attached to channel");
        Ok(Self { net, host, shm, name: name.to_owned(), role: Role::Host })
    }

    /// Clears a stale host claim so a new host can attach.
    ///
    /// For recovery after a host crash: the attacher slot stays claimed by
    /// the dead process, and [`Channel::open`] keeps returning
    /// [`Error::Busy`]. Only call this once the old host is known to be
    /// gone.
    pub fn evict_host(name: &str) -> Result<()> {
        let shm = ShmObject::open(name)?;
        if shm.len() < size_of::<ChannelHdr>() {
            return Err(Error::Invalid("region too small for a channel descriptor"));
        }
        let hdr = unsafe { &*shm.as_ptr().cast::<ChannelHdr>() };
        if hdr.creator_pid == 0 {
            return Err(Error::Invalid("region was never initialized"));
        }
        hdr.attacher_pid.store(0, Ordering::Release);
        tracing::debug!(name, "evicted host attacher");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // PRODUCER SIDE (the ring this role owns as writer)
    // ---------------------------------------------------------------------

    /// Reserves space for up to `len` payload bytes without blocking.
    pub fn try_push(&mut self, len: usize) -> Result<PushSlot<'_>> {
        self.outbound().try_push(len)
    }

    /// Reserves space for up to `len` payload bytes, sleeping while the
    /// outbound ring is short.
    pub fn push(&mut self, len: usize) -> Result<PushSlot<'_>> {
        self.outbound().push(len)
    }

    /// Like [`push`](Self::push), giving up after `timeout`.
    pub fn push_until(&mut self, len: usize, timeout: Duration) -> Result<PushSlot<'_>> {
        self.outbound().push_until(len, timeout)
    }

    /// Copies `data` out as one message without blocking.
    pub fn try_send(&mut self, data: &[u8]) -> Result<()> {
        let mut slot = self.outbound().try_push(data.len())?;
        slot.fill(data);
        slot.commit(data.len())
    }

    /// Copies `data` out as one message, sleeping while the outbound ring
    /// is short.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut slot = self.outbound().push(data.len())?;
        slot.fill(data);
        slot.commit(data.len())
    }

    /// Like [`send`](Self::send), giving up after `timeout`.
    pub fn send_until(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let mut slot = self.outbound().push_until(data.len(), timeout)?;
        slot.fill(data);
        slot.commit(data.len())
    }

    // ---------------------------------------------------------------------
    // CONSUMER SIDE (the peer's ring)
    // ---------------------------------------------------------------------

    /// Takes the oldest inbound message without blocking.
    pub fn try_pop(&mut self) -> Result<Msg<'_>> {
        self.inbound().try_pop()
    }

    /// Takes the oldest inbound message, sleeping while the ring is empty.
    pub fn pop(&mut self) -> Result<Msg<'_>> {
        self.inbound().pop()
    }

    /// Like [`pop`](Self::pop), giving up after `timeout`.
    pub fn pop_until(&mut self, timeout: Duration) -> Result<Msg<'_>> {
        self.inbound().pop_until(timeout)
    }

    /// Pops and copies the oldest inbound message without blocking.
    pub fn try_recv(&mut self) -> Result<Vec<u8>> {
        self.inbound().try_pop().map(|m| m.to_vec())
    }

    /// Pops and copies the oldest inbound message, sleeping while the ring
    /// is empty.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        self.inbound().pop().map(|m| m.to_vec())
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`.
    pub fn recv_until(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.inbound().pop_until(timeout).map(|m| m.to_vec())
    }

    /// Splits the handle into its two directions so one process can drive
    /// them from separate threads.
    ///
    /// ```ignore
    /// std::thread::scope(|s| {
    ///     let (mut tx, mut rx) = channel.split();
    ///     s.spawn(move || tx.send(b"ping"));
    ///     s.spawn(move || rx.recv());
    /// });
    /// ```
    pub fn split(&mut self) -> (Sender<'_>, Receiver<'_>) {
        let (out_ring, in_ring) = match self.role {
            Role::Sidecar => (&mut self.net, &mut self.host),
            Role::Host => (&mut self.host, &mut self.net),
        };
        (Sender { ring: out_ring }, Receiver { ring: in_ring })
    }

    // ---------------------------------------------------------------------
    // LIFECYCLE & INTROSPECTION
    // ---------------------------------------------------------------------

    /// Tears the channel down: every blocked peer call returns
    /// [`Error::Closed`], as does every later operation on either handle.
    pub fn close(&self) {
        self.hdr().closed.store(1, Ordering::Relaxed);
        self.net.wake_sleepers();
        self.host.wake_sleepers();
        tracing::debug!(name = %self.name, "closed channel");
    }

    /// Whether either side has torn the channel down.
    pub fn is_closed(&self) -> bool {
        self.hdr().closed.load(Ordering::Acquire) != 0
    }

    /// The OS name this channel rendezvoused on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The creator-chosen tag.
    pub fn ident(&self) -> u32 {
        self.hdr().ident
    }

    /// Whether this handle is the creating (sidecar) end.
    pub fn is_sidecar(&self) -> bool {
        self.role == Role::Sidecar
    }

    /// Whether this handle is the attaching (host) end.
    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    /// This process's id.
    pub fn self_pid(&self) -> u32 {
        std::process::id()
    }

    /// The peer's process id, 0 while absent.
    pub fn peer_pid(&self) -> u32 {
        match self.role {
            Role::Sidecar => self.hdr().attacher_pid.load(Ordering::Acquire),
            Role::Host => self.hdr().creator_pid,
        }
    }

    /// Capacity of the ring this side writes.
    pub fn send_capacity(&self) -> usize {
        self.outbound_ref().capacity()
    }

    /// Capacity of the ring this side reads.
    pub fn recv_capacity(&self) -> usize {
        self.inbound_ref().capacity()
    }

    /// Published bytes in the ring this side writes.
    pub fn send_used(&self) -> usize {
        self.outbound_ref().used_bytes()
    }

    /// Published bytes in the ring this side reads.
    pub fn recv_used(&self) -> usize {
        self.inbound_ref().used_bytes()
    }

    fn outbound(&mut self) -> &mut RingCells {
        match self.role {
            Role::Sidecar => &mut self.net,
            Role::Host => &mut self.host,
        }
    }

    fn inbound(&mut self) -> &mut RingCells {
        match self.role {
            Role::Sidecar => &mut self.host,
            Role::Host => &mut self.net,
        }
    }

    fn outbound_ref(&self) -> &RingCells {
        match self.role {
            Role::Sidecar => &self.net,
            Role::Host => &self.host,
        }
    }

    fn inbound_ref(&self) -> &RingCells {
        match self.role {
            Role::Sidecar => &self.host,
            Role::Host => &self.net,
        }
    }

    fn hdr(&self) -> &ChannelHdr {
        // SAFETY: the mapping outlives self and starts with a stamped
        // ChannelHdr.
        unsafe { &*self.shm.as_ptr().cast::<ChannelHdr>() }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
        // The sidecar owns the name; the host never unlinks.
        if self.role == Role::Sidecar {
            let _ = ShmObject::unlink(&self.name);
        }
    }
}

/// One process's sending end after [`Channel::split`].
///
/// Not `Clone`: a second sender on the same ring would break the
/// single-producer invariant.
pub struct Sender<'a> {
    ring: &'a mut RingCells,
}

impl Sender<'_> {
    /// Reserves space for up to `len` payload bytes without blocking.
    pub fn try_push(&mut self, len: usize) -> Result<PushSlot<'_>> {
        self.ring.try_push(len)
    }

    /// Reserves space, sleeping while the ring is short.
    pub fn push(&mut self, len: usize) -> Result<PushSlot<'_>> {
        self.ring.push(len)
    }

    /// Like [`push`](Self::push), giving up after `timeout`.
    pub fn push_until(&mut self, len: usize, timeout: Duration) -> Result<PushSlot<'_>> {
        self.ring.push_until(len, timeout)
    }

    /// Copies `data` out as one message without blocking.
    pub fn try_send(&mut self, data: &[u8]) -> Result<()> {
        let mut slot = self.ring.try_push(data.len())?;
        slot.fill(data);
        slot.commit(data.len())
    }

    /// Copies `data` out as one message, sleeping while the ring is short.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut slot = self.ring.push(data.len())?;
        slot.fill(data);
        slot.commit(data.len())
    }

    /// Like [`send`](Self::send), giving up after `timeout`.
    pub fn send_until(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let mut slot = self.ring.push_until(data.len(), timeout)?;
        slot.fill(data);
        slot.commit(data.len())
    }

    /// Capacity of this direction's ring.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Published bytes in this direction's ring.
    pub fn used(&self) -> usize {
        self.ring.used_bytes()
    }
}

/// One process's receiving end after [`Channel::split`].
pub struct Receiver<'a> {
    ring: &'a mut RingCells,
}

impl Receiver<'_> {
    /// Takes the oldest message without blocking.
    pub fn try_pop(&mut self) -> Result<Msg<'_>> {
        self.ring.try_pop()
    }

    /// Takes the oldest message, sleeping while the ring is empty.
    pub fn pop(&mut self) -> Result<Msg<'_>> {
        self.ring.pop()
    }

    /// Like [`pop`](Self::pop), giving up after `timeout`.
    pub fn pop_until(&mut self, timeout: Duration) -> Result<Msg<'_>> {
        self.ring.pop_until(timeout)
    }

    /// Pops and copies the oldest message without blocking.
    pub fn try_recv(&mut self) -> Result<Vec<u8>> {
        self.ring.try_pop().map(|m| m.to_vec())
    }

    /// Pops and copies the oldest message, sleeping while the ring is
    /// empty.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        self.ring.pop().map(|m| m.to_vec())
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`.
    pub fn recv_until(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.ring.pop_until(timeout).map(|m| m.to_vec())
    }

    /// Capacity of this direction's ring.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Published bytes in this direction's ring.
    pub fn used(&self) -> usize {
        self.ring.used_bytes()
    }
}

/// # Safety
///
/// The mapping must start with a stamped `ChannelHdr` whose ring sizes fit
/// the mapped length.
unsafe fn rings(shm: &ShmObject) -> (RingCells, RingCells) {
    let base = shm.as_ptr();
    let hdr = base.cast::<ChannelHdr>();
    let closed = &(*hdr).closed as *const AtomicU32;
    let net_seg = base.add(size_of::<ChannelHdr>());
    let host_seg = net_seg.add(segment_size((*hdr).net_size as usize));
    (
        RingCells::from_segment(net_seg, closed),
        RingCells::from_segment(host_seg, closed),
    )
}

//! Single-direction channel: one ring under a fixed header in a named
//! shared region.
//!
//! The creator sizes and stamps the region; the attacher claims the peer
//! slot. Which side produces and which consumes is the callers'
//! convention: the type exposes both ends, and strict SPSC per direction
//! still applies across the two processes.

use crate::error::{Error, Result};
use crate::futex;
use crate::layout::{is_aligned, pipe_region_size, PipeHdr, ALIGN};
use crate::ring::{Msg, PushSlot, RingCells};
use crate::shm::ShmObject;
use std::mem::size_of;
use std::ptr::addr_of_mut;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// A single-direction, futex-coordinated SPSC message channel between two
/// processes.
///
/// Created once with [`Pipe::create`], joined with [`Pipe::attach`].
/// Dropping either handle tears the channel down (the peer's blocked calls
/// return [`Error::Closed`]); the OS name persists until an explicit
/// [`Pipe::unlink`].
///
/// The name is passed to the OS verbatim; POSIX systems require a leading
/// `/`.
pub struct Pipe {
    ring: RingCells,
    shm: ShmObject,
    name: String,
    is_creator: bool,
}

impl Pipe {
    /// Creates the named region with a ring of `capacity` payload bytes
    /// and an arbitrary creator-chosen `ident` tag.
    ///
    /// `capacity` must be a non-zero multiple of 4. Fails if the name
    /// already exists, and on hosts without a wait-on-address primitive.
    pub fn create(name: &str, ident: u32, capacity: usize) -> Result<Self> {
        if capacity == 0 || !is_aligned(capacity) {
            return Err(Error::Invalid("capacity must be a non-zero multiple of 4"));
        }
        if pipe_region_size(capacity) > u32::MAX as usize {
            return Err(Error::Invalid("capacity exceeds the 4 GB region limit"));
        }
        futex::probe()?;

        let shm = ShmObject::create_exclusive(name, pipe_region_size(capacity))?;
        let hdr = shm.as_ptr().cast::<PipeHdr>();
        // The fresh mapping is zero-filled; only the identity fields need
        // stamping. The recorded size is the requested one (the OS may
        // round the object up, and the surplus is simply never used.
        unsafe {
            addr_of_mut!((*hdr).size).write(pipe_region_size(capacity) as u32);
            addr_of_mut!((*hdr).ident).write(ident);
            addr_of_mut!((*hdr).creator_pid).write(std::process::id());
        }
        let ring = unsafe { ring_handle(&shm) };
        tracing::debug!(name, capacity = ring.capacity(), ident, "created pipe");
        Ok(Self { ring, shm, name: name.to_owned(), is_creator: true })
    }

    /// Attaches to an existing region and claims the peer slot.
    ///
    /// Fails with [`Error::Busy`] if another attacher already claimed it,
    /// [`Error::Closed`] if the channel was torn down.
    pub fn attach(name: &str) -> Result<Self> {
        futex::probe()?;
        let shm = ShmObject::open(name)?;
        if shm.len() < size_of::<PipeHdr>() + ALIGN {
            return Err(Error::Invalid("region too small for a pipe header"));
        }
        let hdr = shm.as_ptr().cast::<PipeHdr>();
        let (size, creator) = unsafe { ((*hdr).size as usize, (*hdr).creator_pid) };
        // The mapping may exceed the recorded size where the OS rounded the
        // object up; it must never be smaller.
        if size > shm.len() || size < size_of::<PipeHdr>() + ALIGN {
            return Err(Error::Invalid("recorded size does not match the mapping"));
        }
        if creator == 0 {
            return Err(Error::Invalid("region was never initialized"));
        }
        let hdr = unsafe { &*hdr };
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
        let ring = unsafe { ring_handle(&shm) };
        tracing::debug!(name, capacity = ring.capacity(), "attached to pipe");
        Ok(Self { ring, shm, name: name.to_owned(), is_creator: false })
    }

    /// Removes the OS name. Existing handles keep working until dropped.
    ///
    /// By convention the creator calls this once the channel is retired.
    pub fn unlink(name: &str) -> Result<()> {
        ShmObject::unlink(name)
    }

    // ---------------------------------------------------------------------
    // PRODUCER SIDE
    // ---------------------------------------------------------------------

    /// Reserves space for up to `len` payload bytes without blocking.
    pub fn try_push(&mut self, len: usize) -> Result<PushSlot<'_>> {
        self.ring.try_push(len)
    }

    /// Reserves space for up to `len` payload bytes, sleeping while the
    /// ring is short.
    pub fn push(&mut self, len: usize) -> Result<PushSlot<'_>> {
        self.ring.push(len)
    }

    /// Like [`push`](Self::push), giving up after `timeout`.
    pub fn push_until(&mut self, len: usize, timeout: Duration) -> Result<PushSlot<'_>> {
        self.ring.push_until(len, timeout)
    }

    /// Copies `data` in as one message without blocking.
    pub fn try_send(&mut self, data: &[u8]) -> Result<()> {
        let mut slot = self.ring.try_push(data.len())?;
        slot.fill(data);
        slot.commit(data.len())
    }

    /// Copies `data` in as one message, sleeping while the ring is short.
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

    // ---------------------------------------------------------------------
    // CONSUMER SIDE
    // ---------------------------------------------------------------------

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

    // ---------------------------------------------------------------------
    // LIFECYCLE & INTROSPECTION
    // ---------------------------------------------------------------------

    /// Tears the channel down: every blocked peer call returns
    /// [`Error::Closed`], as does every later operation on either handle.
    pub fn close(&self) {
        self.hdr().closed.store(1, Ordering::Relaxed);
        self.ring.wake_sleepers();
        tracing::debug!(name = %self.name, "closed pipe");
    }

    /// Whether either side has torn the channel down.
    pub fn is_closed(&self) -> bool {
        self.ring.is_closed()
    }

    /// The OS name this channel rendezvoused on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The creator-chosen tag.
    pub fn ident(&self) -> u32 {
        self.hdr().ident
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Published bytes currently in the ring, frame headers included.
    pub fn used(&self) -> usize {
        self.ring.used_bytes()
    }

    /// Whether this handle created the region.
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// This process's id.
    pub fn self_pid(&self) -> u32 {
        std::process::id()
    }

    /// The peer's process id, 0 while absent.
    pub fn peer_pid(&self) -> u32 {
        if self.is_creator {
            self.hdr().attacher_pid.load(Ordering::Acquire)
        } else {
            self.hdr().creator_pid
        }
    }

    fn hdr(&self) -> &PipeHdr {
        // SAFETY: the mapping outlives self and starts with a stamped
        // PipeHdr.
        unsafe { &*self.shm.as_ptr().cast::<PipeHdr>() }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // Wake the peer out of any blocked call before the mapping goes
        // away on our side. The name itself survives until unlink().
        self.close();
    }
}

/// # Safety
///
/// The mapping must start with a stamped `PipeHdr` whose `size` does not
/// exceed the mapped length.
unsafe fn ring_handle(shm: &ShmObject) -> RingCells {
    let hdr = shm.as_ptr().cast::<PipeHdr>();
    let capacity = (*hdr).size as usize - size_of::<PipeHdr>();
    RingCells::from_raw(
        capacity,
        &(*hdr).head,
        &(*hdr).tail,
        &(*hdr).used,
        &(*hdr).need,
        &(*hdr).closed,
        shm.as_ptr().add(size_of::<PipeHdr>()),
    )
}

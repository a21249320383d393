//! shmring - futex-coordinated SPSC message channels over named shared
//! memory.
//!
//! Two unrelated processes rendezvous on an OS name, map one shared
//! region, and exchange length-prefixed messages through lock-free byte
//! rings, one ring per direction. Blocking calls never spin: each side
//! sleeps on a 32-bit cell inside the mapping via the kernel's
//! wait-on-address facility (Linux futex, macOS `os_sync_wait_on_address`,
//! Windows `WaitOnAddress`) and is woken by its peer.
//!
//! # Key properties
//!
//! - Strict SPSC per direction, byte-level FIFO
//! - Zero-copy reserve/commit on both ends; wrap-around exposed as two
//!   spans
//! - Producers block on a deficit counter the consumer pays down, so a
//!   wake fires exactly when the missing space exists
//! - Teardown wakes every sleeper; blocked peers return [`Error::Closed`]
//!
//! Two shapes are provided: [`Pipe`] is one ring under a single header;
//! [`Channel`] packs a sidecar-to-host and a host-to-sidecar ring into one
//! region and picks the right one by role.
//!
//! # Example
//!
//! ```
//! use shmring::Pipe;
//!
//! let name = format!("/shmring-doc-{}", std::process::id());
//! let mut creator = Pipe::create(&name, 0xC0FFEE, 1024)?;
//! let mut peer = Pipe::attach(&name)?;
//!
//! // copy-in convenience...
//! creator.send(b"hello")?;
//! assert_eq!(peer.recv()?, b"hello");
//!
//! // ...or zero-copy reserve/commit
//! let mut slot = creator.try_push(5)?;
//! slot.fill(b"world");
//! slot.commit(5)?;
//! let msg = peer.try_pop()?;
//! assert_eq!(msg.to_vec(), b"world");
//! drop(msg); // releases the bytes to the producer
//!
//! drop(peer);
//! drop(creator);
//! Pipe::unlink(&name)?;
//! # Ok::<(), shmring::Error>(())
//! ```

mod channel;
mod error;
mod futex;
mod layout;
mod pipe;
mod ring;
mod shm;

pub use channel::{Channel, Receiver, Sender};
pub use error::{Error, Result};
pub use pipe::Pipe;
pub use ring::{Msg, PushSlot};

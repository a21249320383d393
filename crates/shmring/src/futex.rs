//! Portable wait-on-address over 32-bit cells in the shared mapping.
//!
//! Both peers sleep on cells that live *inside* the mapped region, so the
//! opposite process can wake them: Linux `futex(2)`, macOS
//! `os_sync_wait_on_address` (falling back to `__ulock_wait`), Windows
//! `WaitOnAddress`. The cells are 4-byte aligned by the wire layout.
//!
//! Semantics, uniform across platforms:
//! - `wait` sleeps iff `*cell == expected` at entry; a value mismatch, a
//!   wake, and an interrupt all report [`WaitOutcome::Woken`]; callers
//!   re-evaluate their condition after every return.
//! - `wake_*` with zero sleepers is a no-op, not an error.
//! - A `None` timeout is indefinite. Where the kernel would make an
//!   untimed sleep uninterruptible, a very large finite timeout is
//!   substituted; the expiry surfaces as `TimedOut` and the caller's retry
//!   loop absorbs it.

use crate::error::{Error, Result};
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Why a [`wait`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Woken, interrupted, or the cell no longer held the expected value.
    Woken,
    /// The timeout expired with the cell still matching.
    TimedOut,
}

/// Sleeps while `*cell == expected`, up to `timeout` (`None` = indefinite).
#[inline]
pub(crate) fn wait(cell: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<WaitOutcome> {
    imp::wait(cell, expected, timeout)
}

/// Wakes one sleeper on `cell`, if any.
#[inline]
pub(crate) fn wake_one(cell: &AtomicU32) {
    imp::wake(cell, false);
}

/// Wakes every sleeper on `cell`.
#[inline]
pub(crate) fn wake_all(cell: &AtomicU32) {
    imp::wake(cell, true);
}

/// Verifies the platform primitive is usable.
///
/// Called at channel creation and attach so an unsupported host fails
/// there instead of at the first blocking call.
#[inline]
pub(crate) fn probe() -> Result<()> {
    imp::probe()
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{Error, Result, WaitOutcome};
    use std::io;
    use std::ptr;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn timespec_from_millis(millis: i32) -> libc::timespec {
        libc::timespec {
            tv_sec: libc::time_t::from(millis / 1000),
            tv_nsec: libc::c_long::from(millis % 1000) * 1_000_000,
        }
    }

    pub(super) fn wait(
        cell: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        // A NULL timeout would make the wait uninterruptible; substitute a
        // very large finite one and let the caller's loop retry.
        let millis = match timeout {
            None => i32::MAX,
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX).max(1),
        };
        let ts = timespec_from_millis(millis);

        // No FUTEX_PRIVATE_FLAG: the cell is shared between processes.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                cell as *const AtomicU32,
                libc::FUTEX_WAIT,
                expected,
                &ts as *const libc::timespec,
                ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return Ok(WaitOutcome::Woken);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN | libc::EINTR) => Ok(WaitOutcome::Woken),
            Some(libc::ETIMEDOUT) => Ok(WaitOutcome::TimedOut),
            Some(libc::ENOSYS) => Err(Error::Unsupported),
            _ => Err(Error::System(err)),
        }
    }

    pub(super) fn wake(cell: &AtomicU32, all: bool) {
        let count = if all { i32::MAX } else { 1 };
        // Waking zero sleepers is success; other failures have no caller
        // that could act on them.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                cell as *const AtomicU32,
                libc::FUTEX_WAKE,
                count,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                0u32,
            );
        }
    }

    pub(super) fn probe() -> Result<()> {
        let cell = AtomicU32::new(0);
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &cell as *const AtomicU32,
                libc::FUTEX_WAKE,
                0,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                0u32,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOSYS) {
                return Err(Error::Unsupported);
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use super::{Error, Result, WaitOutcome};
    use std::ffi::c_void;
    use std::io;
    use std::mem;
    use std::sync::atomic::AtomicU32;
    use std::sync::OnceLock;
    use std::time::Duration;

    // <os/os_sync_wait_on_address.h>, public since macOS 14.4
    const OS_SYNC_WAIT_ON_ADDRESS_SHARED: u32 = 1;
    const OS_SYNC_WAKE_BY_ADDRESS_SHARED: u32 = 1;
    const OS_CLOCK_MACH_ABSOLUTE_TIME: u32 = 32;

    // <bsd/sys/ulock.h>, private fallback for older systems
    const UL_COMPARE_AND_WAIT_SHARED: u32 = 3;
    const ULF_WAKE_ALL: u32 = 0x0000_0100;

    type OsWaitFn = unsafe extern "C" fn(*mut c_void, u64, usize, u32) -> i32;
    type OsWaitTimeoutFn = unsafe extern "C" fn(*mut c_void, u64, usize, u32, u32, u64) -> i32;
    type OsWakeFn = unsafe extern "C" fn(*mut c_void, usize, u32) -> i32;
    type UlockWaitFn = unsafe extern "C" fn(u32, *mut c_void, u64, u32) -> i32;
    type UlockWakeFn = unsafe extern "C" fn(u32, *mut c_void, u64) -> i32;

    /// Entry points resolved once per process. `None` fields mean the
    /// symbol is absent on this system.
    struct Adapter {
        os_wait: Option<OsWaitFn>,
        os_wait_timeout: Option<OsWaitTimeoutFn>,
        os_wake_any: Option<OsWakeFn>,
        os_wake_all: Option<OsWakeFn>,
        ulock_wait: Option<UlockWaitFn>,
        ulock_wake: Option<UlockWakeFn>,
    }

    unsafe fn resolve<F>(name: &'static [u8]) -> Option<F> {
        let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr().cast()) };
        if sym.is_null() {
            None
        } else {
            // SAFETY: the symbol, when present, has the transmuted signature.
            Some(unsafe { mem::transmute_copy::<*mut c_void, F>(&sym) })
        }
    }

    fn adapter() -> &'static Adapter {
        static ADAPTER: OnceLock<Adapter> = OnceLock::new();
        ADAPTER.get_or_init(|| unsafe {
            Adapter {
                os_wait: resolve(b"os_sync_wait_on_address\0"),
                os_wait_timeout: resolve(b"os_sync_wait_on_address_with_timeout\0"),
                os_wake_any: resolve(b"os_sync_wake_by_address_any\0"),
                os_wake_all: resolve(b"os_sync_wake_by_address_all\0"),
                ulock_wait: resolve(b"__ulock_wait\0"),
                ulock_wake: resolve(b"__ulock_wake\0"),
            }
        })
    }

    fn outcome_from(rc: i32) -> Result<WaitOutcome> {
        if rc >= 0 {
            return Ok(WaitOutcome::Woken);
        }
        // __ulock_* return -errno directly; the os_sync_* wrappers return
        // -1 and set errno.
        let err = if rc < -1 { -rc } else { io::Error::last_os_error().raw_os_error().unwrap_or(0) };
        match err {
            libc::ETIMEDOUT => Ok(WaitOutcome::TimedOut),
            libc::EAGAIN | libc::EINTR => Ok(WaitOutcome::Woken),
            _ => Err(Error::System(io::Error::from_raw_os_error(err))),
        }
    }

    pub(super) fn wait(
        cell: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        let a = adapter();
        let addr = cell as *const AtomicU32 as *mut c_void;
        if let (Some(wait_fn), Some(wait_timeout_fn)) = (a.os_wait, a.os_wait_timeout) {
            let rc = match timeout {
                None => unsafe {
                    wait_fn(addr, u64::from(expected), 4, OS_SYNC_WAIT_ON_ADDRESS_SHARED)
                },
                Some(t) => unsafe {
                    wait_timeout_fn(
                        addr,
                        u64::from(expected),
                        4,
                        OS_SYNC_WAIT_ON_ADDRESS_SHARED,
                        OS_CLOCK_MACH_ABSOLUTE_TIME,
                        u64::try_from(t.as_nanos()).unwrap_or(u64::MAX).max(1),
                    )
                },
            };
            return outcome_from(rc);
        }
        if let Some(wait_fn) = a.ulock_wait {
            let micros = match timeout {
                None => 0, // 0 means indefinite for ulock
                Some(t) => u32::try_from(t.as_micros()).unwrap_or(u32::MAX).max(1),
            };
            let rc = unsafe {
                wait_fn(UL_COMPARE_AND_WAIT_SHARED, addr, u64::from(expected), micros)
            };
            return outcome_from(rc);
        }
        Err(Error::Unsupported)
    }

    pub(super) fn wake(cell: &AtomicU32, all: bool) {
        let a = adapter();
        let addr = cell as *const AtomicU32 as *mut c_void;
        let os_fn = if all { a.os_wake_all } else { a.os_wake_any };
        if let Some(wake_fn) = os_fn {
            unsafe {
                wake_fn(addr, 4, OS_SYNC_WAKE_BY_ADDRESS_SHARED);
            }
        } else if let Some(wake_fn) = a.ulock_wake {
            let op = if all {
                UL_COMPARE_AND_WAIT_SHARED | ULF_WAKE_ALL
            } else {
                UL_COMPARE_AND_WAIT_SHARED
            };
            unsafe {
                wake_fn(op, addr, 0);
            }
        }
    }

    pub(super) fn probe() -> Result<()> {
        let a = adapter();
        let os_ok = a.os_wait.is_some()
            && a.os_wait_timeout.is_some()
            && a.os_wake_any.is_some()
            && a.os_wake_all.is_some();
        let ulock_ok = a.ulock_wait.is_some() && a.ulock_wake.is_some();
        if os_ok || ulock_ok {
            Ok(())
        } else {
            Err(Error::Unsupported)
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::{Error, Result, WaitOutcome};
    use std::ffi::c_void;
    use std::io;
    use std::mem;
    use std::sync::atomic::AtomicU32;
    use std::sync::OnceLock;
    use std::time::Duration;
    use windows_sys::Win32::Foundation::{GetLastError, ERROR_TIMEOUT};
    use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

    const INFINITE: u32 = u32::MAX;

    type WaitOnAddressFn =
        unsafe extern "system" fn(*const c_void, *const c_void, usize, u32) -> i32;
    type WakeByAddressFn = unsafe extern "system" fn(*const c_void);

    /// Entry points resolved from KernelBase.dll (Windows 8+) once per
    /// process. All-`None` means every wait/wake reports `Unsupported`.
    struct Adapter {
        wait: Option<WaitOnAddressFn>,
        wake_one: Option<WakeByAddressFn>,
        wake_all: Option<WakeByAddressFn>,
    }

    fn adapter() -> &'static Adapter {
        static ADAPTER: OnceLock<Adapter> = OnceLock::new();
        ADAPTER.get_or_init(|| unsafe {
            let lib = LoadLibraryA(c"KernelBase.dll".as_ptr().cast());
            if lib.is_null() {
                return Adapter { wait: None, wake_one: None, wake_all: None };
            }
            let get = |name: &'static core::ffi::CStr| {
                GetProcAddress(lib, name.as_ptr().cast())
            };
            Adapter {
                wait: get(c"WaitOnAddress").map(|f| mem::transmute::<_, WaitOnAddressFn>(f)),
                wake_one: get(c"WakeByAddressSingle")
                    .map(|f| mem::transmute::<_, WakeByAddressFn>(f)),
                wake_all: get(c"WakeByAddressAll")
                    .map(|f| mem::transmute::<_, WakeByAddressFn>(f)),
            }
        })
    }

    pub(super) fn wait(
        cell: &AtomicU32,
        expected: u32,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        let Some(wait_fn) = adapter().wait else {
            return Err(Error::Unsupported);
        };
        let millis = match timeout {
            None => INFINITE,
            Some(t) => u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1).max(1),
        };
        let compare = expected;
        let ok = unsafe {
            wait_fn(
                (cell as *const AtomicU32).cast(),
                (&compare as *const u32).cast(),
                4,
                millis,
            )
        };
        if ok != 0 {
            return Ok(WaitOutcome::Woken);
        }
        match unsafe { GetLastError() } {
            ERROR_TIMEOUT => Ok(WaitOutcome::TimedOut),
            _ => Err(Error::System(io::Error::last_os_error())),
        }
    }

    pub(super) fn wake(cell: &AtomicU32, all: bool) {
        let a = adapter();
        let wake_fn = if all { a.wake_all } else { a.wake_one };
        if let Some(wake_fn) = wake_fn {
            unsafe {
                wake_fn((cell as *const AtomicU32).cast());
            }
        }
    }

    pub(super) fn probe() -> Result<()> {
        let a = adapter();
        if a.wait.is_some() && a.wake_one.is_some() && a.wake_all.is_some() {
            Ok(())
        } else {
            Err(Error::Unsupported)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
mod imp {
    use super::{Error, Result, WaitOutcome};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    pub(super) fn wait(_: &AtomicU32, _: u32, _: Option<Duration>) -> Result<WaitOutcome> {
        Err(Error::Unsupported)
    }

    pub(super) fn wake(_: &AtomicU32, _: bool) {}

    pub(super) fn probe() -> Result<()> {
        Err(Error::Unsupported)
    }
}

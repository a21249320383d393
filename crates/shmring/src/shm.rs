//! Named shared-memory objects.
//!
//! Thin, creator/attacher-aware wrapper over the OS name table:
//! `shm_open`/`shm_unlink` + `mmap` on unix, named file mappings on
//! Windows. The name is used exactly as passed; POSIX requires it to start
//! with `/`.

use crate::error::{Error, Result};

/// A mapped, named shared-memory object.
///
/// Dropping unmaps the view and closes the descriptor; the OS name is only
/// removed by [`unlink`].
pub(crate) struct ShmObject {
    imp: imp::Mapping,
    len: usize,
}

impl ShmObject {
    /// Creates a fresh object of exactly `len` bytes and maps it.
    ///
    /// Fails if the name already exists. The mapping is zero-filled by the
    /// OS; `len` may come back larger where the kernel rounds the object
    /// size up.
    pub(crate) fn create_exclusive(name: &str, len: usize) -> Result<Self> {
        let (imp, actual) = imp::create_exclusive(name, len)?;
        Ok(Self { imp, len: actual })
    }

    /// Maps an existing object, taking its current size.
    pub(crate) fn open(name: &str) -> Result<Self> {
        let (imp, len) = imp::open(name)?;
        Ok(Self { imp, len })
    }

    /// Removes the OS name. Existing mappings stay valid until unmapped.
    pub(crate) fn unlink(name: &str) -> Result<()> {
        imp::unlink(name)
    }

    /// Base address of the mapping.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.imp.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[cfg(unix)]
mod imp {
    use super::{Error, Result};
    use memmap2::MmapRaw;
    use std::ffi::CString;
    use std::fs::File;
    use std::io;
    use std::os::fd::FromRawFd;

    pub(super) struct Mapping {
        map: MmapRaw,
        // keeps the shm descriptor open for the mapping's lifetime
        _file: File,
    }

    impl Mapping {
        pub(super) fn as_ptr(&self) -> *mut u8 {
            self.map.as_mut_ptr()
        }
    }

    fn shm_name(name: &str) -> Result<CString> {
        if name.is_empty() {
            return Err(Error::Invalid("empty shared memory name"));
        }
        CString::new(name).map_err(|_| Error::Invalid("shared memory name contains NUL"))
    }

    fn shm_open(name: &CString, oflag: libc::c_int) -> Result<File> {
        // shm_open is a mode-taking variadic on some libcs; pass it always.
        let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, 0o666 as libc::mode_t) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        // SAFETY: fd is a freshly opened descriptor we own.
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    pub(super) fn create_exclusive(name: &str, len: usize) -> Result<(Mapping, usize)> {
        let cname = shm_name(name)?;
        let file = shm_open(&cname, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;

        // O_EXCL success means a fresh object; a non-zero size would be
        // someone else's region slipping through a recycled name.
        let meta = file.metadata().map_err(Error::System)?;
        if meta.len() != 0 {
            let _ = unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(Error::System(io::Error::from(io::ErrorKind::AlreadyExists)));
        }

        file.set_len(len as u64).map_err(Error::System)?;
        // the kernel may round the object size up; take what it reports
        let actual = file.metadata().map_err(Error::System)?.len() as usize;

        let map = MmapRaw::map_raw(&file).map_err(Error::System)?;
        Ok((Mapping { map, _file: file }, actual))
    }

    pub(super) fn open(name: &str) -> Result<(Mapping, usize)> {
        let cname = shm_name(name)?;
        let file = shm_open(&cname, libc::O_RDWR)?;
        let len = file.metadata().map_err(Error::System)?.len() as usize;
        if len == 0 {
            // created but never sized: nothing to attach to
            return Err(Error::System(io::Error::from(io::ErrorKind::NotFound)));
        }
        let map = MmapRaw::map_raw(&file).map_err(Error::System)?;
        Ok((Mapping { map, _file: file }, len))
    }

    pub(super) fn unlink(name: &str) -> Result<()> {
        let cname = shm_name(name)?;
        let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(windows)]
mod imp {
    use super::{Error, Result};
    use std::ffi::c_void;
    use std::io;
    use std::iter;
    use std::mem;
    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
        FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
        PAGE_READWRITE,
    };

    pub(super) struct Mapping {
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        handle: HANDLE,
    }

    // Safety: the view stays valid until Drop; concurrent access goes
    // through the atomics of the wire layout.
    unsafe impl Send for Mapping {}

    impl Mapping {
        pub(super) fn as_ptr(&self) -> *mut u8 {
            self.view.Value.cast::<u8>()
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            unsafe {
                UnmapViewOfFile(self.view);
                CloseHandle(self.handle);
            }
        }
    }

    fn wide_name(name: &str) -> Result<Vec<u16>> {
        if name.is_empty() {
            return Err(Error::Invalid("empty shared memory name"));
        }
        Ok(name.encode_utf16().chain(iter::once(0)).collect())
    }

    fn map_view(handle: HANDLE) -> Result<(MEMORY_MAPPED_VIEW_ADDRESS, usize)> {
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view.Value.is_null() {
            let err = Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let rc = unsafe {
            VirtualQuery(
                view.Value as *const c_void,
                &mut info,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if rc == 0 {
            let err = Error::last_os_error();
            unsafe {
                UnmapViewOfFile(view);
                CloseHandle(handle);
            }
            return Err(err);
        }
        Ok((view, info.RegionSize))
    }

    pub(super) fn create_exclusive(name: &str, len: usize) -> Result<(Mapping, usize)> {
        let wname = wide_name(name)?;
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                (len as u64 >> 32) as u32,
                len as u32,
                wname.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(Error::last_os_error());
        }
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(Error::System(io::Error::from(io::ErrorKind::AlreadyExists)));
        }
        let (view, region) = map_view(handle)?;
        // the view is page-rounded; the region carries at least `len`
        Ok((Mapping { view, handle }, region.max(len)))
    }

    pub(super) fn open(name: &str) -> Result<(Mapping, usize)> {
        let wname = wide_name(name)?;
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wname.as_ptr()) };
        if handle.is_null() {
            return Err(Error::last_os_error());
        }
        let (view, region) = map_view(handle)?;
        Ok((Mapping { view, handle }, region))
    }

    pub(super) fn unlink(_name: &str) -> Result<()> {
        // Windows has no unlink: the mapping object disappears with its
        // last handle.
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/shmring-shm-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_create_open_unlink() {
        let name = unique_name("basic");
        let _ = ShmObject::unlink(&name);

        let created = ShmObject::create_exclusive(&name, 4096).unwrap();
        assert!(created.len() >= 4096);

        // creator writes, attacher observes the same bytes
        unsafe { created.as_ptr().write(0xA5) };
        let opened = ShmObject::open(&name).unwrap();
        assert_eq!(opened.len(), created.len());
        assert_eq!(unsafe { opened.as_ptr().read() }, 0xA5);

        ShmObject::unlink(&name).unwrap();
        assert!(ShmObject::open(&name).is_err());
    }

    #[test]
    fn test_create_twice_fails() {
        let name = unique_name("dup");
        let _ = ShmObject::unlink(&name);

        let _keep = ShmObject::create_exclusive(&name, 1024).unwrap();
        assert!(matches!(
            ShmObject::create_exclusive(&name, 1024),
            Err(Error::System(_))
        ));
        ShmObject::unlink(&name).unwrap();
    }

    #[test]
    fn test_open_missing_fails() {
        let name = unique_name("missing");
        let _ = ShmObject::unlink(&name);
        assert!(ShmObject::open(&name).is_err());
    }
}

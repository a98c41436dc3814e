//! Symbol resolution over the native dynamic linker
//!
//! Thin layer over `libloading`'s OS-specific libraries:
//! - `open` / `close` pass the open-mode flags through unchanged
//! - `lookup` returns 0 for a missing symbol instead of an error
//! - `error_message` reports the last failure on the calling thread
//!
//! Handles are plain tokens; the dynamic linker keeps the reference counts.
//! Opens and closes are serialized through the process registry, lookups
//! take no lock.

use crate::caller::Callable;
use crate::error::{FfiError, FfiResult};
use crate::registry::Registry;
use crate::types::Signature;
use dynacall_config::OpenFlag;
use std::cell::RefCell;
use std::ops::BitOr;
use tracing::{debug, warn};

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

/// Opaque token for an opened library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryHandle(usize);

impl LibraryHandle {
    /// Pseudo-handle searching the global symbol scope
    pub const DEFAULT: LibraryHandle = LibraryHandle(sys::DEFAULT_HANDLE);

    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Wrap a raw handle obtained elsewhere
    ///
    /// # Safety
    ///
    /// `raw` must be a handle returned by the native dynamic linker (or the
    /// platform's default pseudo-handle).
    pub const unsafe fn from_raw(raw: usize) -> Self {
        LibraryHandle(raw)
    }
}

/// Dynamic-linker open flags with the native values of this target
///
/// Windows has no dlfcn modes: the named flags are 0 there and `from_bits`
/// carries `LoadLibraryExW` flags instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode(i32);

impl OpenMode {
    pub const LAZY: OpenMode = OpenMode(sys::LAZY);
    pub const NOW: OpenMode = OpenMode(sys::NOW);
    pub const LOCAL: OpenMode = OpenMode(sys::LOCAL);
    pub const GLOBAL: OpenMode = OpenMode(sys::GLOBAL);

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn from_bits(bits: i32) -> Self {
        OpenMode(bits)
    }

    pub const fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combine symbolic configuration flags
    pub fn from_flags(flags: &[OpenFlag]) -> Self {
        flags.iter().fold(OpenMode(0), |mode, flag| {
            mode | match flag {
                OpenFlag::Lazy => OpenMode::LAZY,
                OpenFlag::Now => OpenMode::NOW,
                OpenFlag::Local => OpenMode::LOCAL,
                OpenFlag::Global => OpenMode::GLOBAL,
            }
        })
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::NOW | OpenMode::GLOBAL
    }
}

/// Open a shared library
///
/// Repeated opens of the same path return equal handles; each must be
/// balanced by a `close`.
pub fn open(path: &str, mode: OpenMode) -> FfiResult<LibraryHandle> {
    let result = Registry::global().with_resolver_lock(|| sys::open(path, mode.bits()));
    match result {
        Ok(raw) => {
            debug!(path, mode = mode.bits(), handle = raw, "opened library");
            Ok(LibraryHandle(raw))
        }
        Err(message) => {
            warn!(path, %message, "failed to open library");
            set_last_error(message.clone());
            Err(FfiError::Resolve {
                path: path.to_string(),
                message,
            })
        }
    }
}

/// Address of `name` in `handle`, or 0 when the symbol is missing
pub fn lookup(handle: LibraryHandle, name: &str) -> usize {
    match sys::lookup(handle.0, name) {
        Some(address) if address != 0 => address,
        _ => {
            set_last_error(format!("symbol '{}' not found", name));
            0
        }
    }
}

/// Release one reference to a library
///
/// Closing `LibraryHandle::DEFAULT` does nothing.
pub fn close(handle: LibraryHandle) -> FfiResult<()> {
    if handle == LibraryHandle::DEFAULT {
        return Ok(());
    }
    Registry::global()
        .with_resolver_lock(|| sys::close(handle.0))
        .map(|()| debug!(handle = handle.0, "closed library"))
        .map_err(|message| {
            warn!(handle = handle.0, %message, "failed to close library");
            set_last_error(message.clone());
            FfiError::Close(message)
        })
}

/// Take the most recent resolver diagnostic of this thread
pub fn error_message() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Resolve `name` and bind it to `signature`
///
/// # Safety
///
/// The symbol must be a function whose native signature matches `signature`.
pub unsafe fn bind_symbol(
    handle: LibraryHandle,
    name: &str,
    signature: Signature,
) -> FfiResult<Callable> {
    match lookup(handle, name) {
        0 => Err(FfiError::SymbolNotFound {
            symbol: name.to_string(),
        }),
        address => Callable::bind(address, signature),
    }
}

/// Platform file name for a library stem
///
/// - Linux and other Unix: lib{stem}.so
/// - macOS: lib{stem}.dylib
/// - Windows: {stem}.dll
pub fn library_file_name(stem: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.dll", stem)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", stem)
    } else {
        format!("lib{}.so", stem)
    }
}

/// An opened library, closed on drop
pub struct Library {
    handle: LibraryHandle,
    path: String,
}

impl Library {
    /// Open with the configured default mode
    pub fn open(path: &str) -> FfiResult<Self> {
        Self::open_with(path, Registry::global().default_open_mode())
    }

    pub fn open_with(path: &str, mode: OpenMode) -> FfiResult<Self> {
        Ok(Self {
            handle: open(path, mode)?,
            path: path.to_string(),
        })
    }

    pub fn handle(&self) -> LibraryHandle {
        self.handle
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Address of a symbol, if present
    pub fn symbol(&self, name: &str) -> Option<usize> {
        match lookup(self.handle, name) {
            0 => None,
            address => Some(address),
        }
    }

    /// Resolve and bind a function
    ///
    /// The returned `Callable` does not keep the library open.
    ///
    /// # Safety
    ///
    /// See [`bind_symbol`]; additionally the library must stay open while
    /// the callable is used.
    pub unsafe fn bind(&self, name: &str, signature: Signature) -> FfiResult<Callable> {
        bind_symbol(self.handle, name, signature)
    }

    /// Give up ownership without closing
    pub fn into_handle(self) -> LibraryHandle {
        let this = std::mem::ManuallyDrop::new(self);
        this.handle
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        if let Err(e) = close(self.handle) {
            debug!(path = %self.path, error = %e, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("path", &self.path)
            .field("handle", &format_args!("{:#x}", self.handle.0))
            .finish()
    }
}

#[cfg(unix)]
mod sys {
    use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};
    use std::ffi::c_void;
    use std::mem::ManuallyDrop;

    pub const LAZY: i32 = RTLD_LAZY;
    pub const NOW: i32 = RTLD_NOW;
    pub const LOCAL: i32 = RTLD_LOCAL;
    pub const GLOBAL: i32 = RTLD_GLOBAL;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const DEFAULT_HANDLE: usize = -2isize as usize;
    #[cfg(target_os = "freebsd")]
    pub const DEFAULT_HANDLE: usize = -3isize as usize;
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    pub const DEFAULT_HANDLE: usize = 0;

    pub fn open(path: &str, flags: i32) -> Result<usize, String> {
        // Safety: running library initializers is the documented effect
        unsafe { Library::open(Some(path), flags) }
            .map(|lib| lib.into_raw() as usize)
            .map_err(|e| e.to_string())
    }

    pub fn lookup(handle: usize, name: &str) -> Option<usize> {
        // The handle is borrowed: dropping it here would close the library
        let lib = ManuallyDrop::new(unsafe { Library::from_raw(handle as *mut c_void) });
        unsafe { lib.get::<*mut c_void>(name.as_bytes()) }
            .ok()
            .map(|symbol| symbol.into_raw() as usize)
    }

    pub fn close(handle: usize) -> Result<(), String> {
        unsafe { Library::from_raw(handle as *mut c_void) }
            .close()
            .map_err(|e| e.to_string())
    }
}

#[cfg(windows)]
mod sys {
    use libloading::os::windows::Library;
    use std::mem::ManuallyDrop;

    pub const LAZY: i32 = 0;
    pub const NOW: i32 = 0;
    pub const LOCAL: i32 = 0;
    pub const GLOBAL: i32 = 0;

    pub const DEFAULT_HANDLE: usize = 0;

    pub fn open(path: &str, flags: i32) -> Result<usize, String> {
        unsafe { Library::load_with_flags(path, flags as u32) }
            .map(|lib| lib.into_raw() as usize)
            .map_err(|e| e.to_string())
    }

    pub fn lookup(handle: usize, name: &str) -> Option<usize> {
        let lib = if handle == DEFAULT_HANDLE {
            ManuallyDrop::new(Library::this().ok()?)
        } else {
            ManuallyDrop::new(unsafe { Library::from_raw(handle as _) })
        };
        unsafe { lib.get::<*mut std::ffi::c_void>(name.as_bytes()) }
            .ok()
            .and_then(|symbol| symbol.into_raw())
            .map(|f| f as usize)
    }

    pub fn close(handle: usize) -> Result<(), String> {
        unsafe { Library::from_raw(handle as _) }
            .close()
            .map_err(|e| e.to_string())
    }
}

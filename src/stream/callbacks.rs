//! Four-function callback table handed to a pull-based media decoder
//!
//! The decoder calls `open`, `read`, `seek` and `close` on its own worker
//! threads with an opaque pointer to a [`CallbackContext`]. The callbacks
//! forward to the boxed [`SeekableStream`] and translate every outcome into
//! an integer sentinel. Nothing unwinds out of these functions.

use super::SeekableStream;
use parking_lot::Mutex;
use std::ffi::{c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// `open(opaque, datap, sizep) -> 0 | -1`
pub type OpenCallback =
    unsafe extern "C" fn(opaque: *mut c_void, datap: *mut *mut c_void, sizep: *mut u64) -> c_int;

/// `read(opaque, buf, len) -> bytes | 0 at end | -1`
pub type ReadCallback = unsafe extern "C" fn(opaque: *mut c_void, buf: *mut u8, len: usize) -> isize;

/// `seek(opaque, offset) -> 0 | -1`
pub type SeekCallback = unsafe extern "C" fn(opaque: *mut c_void, offset: u64) -> c_int;

/// `close(opaque)`
pub type CloseCallback = unsafe extern "C" fn(opaque: *mut c_void);

/// The callback functions registered with a decoder
#[derive(Debug, Clone, Copy)]
pub struct CallbackTable {
    pub open: OpenCallback,
    pub read: ReadCallback,
    pub seek: SeekCallback,
    pub close: CloseCallback,
}

impl CallbackTable {
    /// Table forwarding to a [`CallbackContext`]
    pub fn new() -> Self {
        Self {
            open: stream_open,
            read: stream_read,
            seek: stream_seek,
            close: stream_close,
        }
    }
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for the calls a decoder made through the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackStats {
    pub opens: u64,
    pub reads: u64,
    pub bytes_read: u64,
    pub seeks: u64,
    pub errors: u64,
}

/// State behind the opaque pointer
///
/// Holds the stream behind a mutex. Each callback locks it for the duration
/// of the call, so [`CallbackContext::detach`] cannot take the stream away
/// while a callback is still running. After detaching, callbacks fail with
/// `-1` instead of touching freed memory.
pub struct CallbackContext {
    stream: Mutex<Option<Box<dyn SeekableStream>>>,
    opens: AtomicU64,
    reads: AtomicU64,
    bytes_read: AtomicU64,
    seeks: AtomicU64,
    errors: AtomicU64,
}

impl CallbackContext {
    pub fn new(stream: Box<dyn SeekableStream>) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            opens: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            seeks: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Pointer to pass to the decoder as `opaque`
    ///
    /// Valid for as long as this context is neither moved nor dropped.
    pub fn as_opaque(&self) -> *mut c_void {
        self as *const CallbackContext as *mut c_void
    }

    pub fn is_attached(&self) -> bool {
        self.stream.lock().is_some()
    }

    pub fn stats(&self) -> CallbackStats {
        CallbackStats {
            opens: self.opens.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            seeks: self.seeks.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Take the stream out, waiting for any in-flight callback to return
    ///
    /// A read blocked on the network cannot be cancelled. If it is still
    /// running after `timeout` a warning is logged and the wait continues;
    /// the transport's own timeout bounds it.
    pub fn detach(&self, timeout: Duration) -> Option<Box<dyn SeekableStream>> {
        let mut guard = match self.stream.try_lock_for(timeout) {
            Some(guard) => guard,
            None => {
                warn!(
                    "Decoder callback still running after {:?}, waiting for it to return",
                    timeout
                );
                self.stream.lock()
            }
        };
        guard.take()
    }

    fn with_stream<T>(&self, detached: T, f: impl FnOnce(&mut dyn SeekableStream) -> T) -> T {
        let mut guard = self.stream.lock();
        match guard.as_mut() {
            Some(stream) => f(stream.as_mut()),
            None => detached,
        }
    }

    fn open(&self, sizep: *mut u64) -> c_int {
        self.opens.fetch_add(1, Ordering::Relaxed);
        // Size only; the decoder seeks explicitly when it wants a position
        let size = self.with_stream(-1, |s| s.size());
        if size < 0 {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return -1;
        }
        if !sizep.is_null() {
            // SAFETY: the decoder passes a valid out-pointer or null
            unsafe { *sizep = size as u64 };
        }
        0
    }

    fn read(&self, buf: &mut [u8]) -> isize {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let n = self.with_stream(-1, |s| s.read(buf));
        if n < 0 {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return -1;
        }
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        n as isize
    }

    fn seek(&self, offset: u64) -> c_int {
        self.seeks.fetch_add(1, Ordering::Relaxed);
        let Ok(offset) = i64::try_from(offset) else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return -1;
        };
        if self.with_stream(-1, |s| s.seek(offset)) < 0 {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return -1;
        }
        0
    }
}

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackContext")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Run `f` and turn a panic into `fallback`
fn guarded<T>(name: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!("Panic in decoder {} callback", name);
            fallback
        }
    }
}

/// # Safety
///
/// `opaque` must be null or point to a live [`CallbackContext`]; `datap` and
/// `sizep` must each be null or valid for writes.
unsafe extern "C" fn stream_open(
    opaque: *mut c_void,
    datap: *mut *mut c_void,
    sizep: *mut u64,
) -> c_int {
    guarded("open", -1, || {
        let Some(ctx) = (unsafe { (opaque as *const CallbackContext).as_ref() }) else {
            return -1;
        };
        if !datap.is_null() {
            unsafe { *datap = opaque };
        }
        ctx.open(sizep)
    })
}

/// # Safety
///
/// `opaque` must be null or point to a live [`CallbackContext`]; `buf` must
/// be null or valid for writes of `len` bytes.
unsafe extern "C" fn stream_read(opaque: *mut c_void, buf: *mut u8, len: usize) -> isize {
    guarded("read", -1, || {
        let Some(ctx) = (unsafe { (opaque as *const CallbackContext).as_ref() }) else {
            return -1;
        };
        if len == 0 {
            return 0;
        }
        if buf.is_null() {
            return -1;
        }
        let buf = unsafe { std::slice::from_raw_parts_mut(buf, len) };
        ctx.read(buf)
    })
}

/// # Safety
///
/// `opaque` must be null or point to a live [`CallbackContext`].
unsafe extern "C" fn stream_seek(opaque: *mut c_void, offset: u64) -> c_int {
    guarded("seek", -1, || {
        match unsafe { (opaque as *const CallbackContext).as_ref() } {
            Some(ctx) => ctx.seek(offset),
            None => -1,
        }
    })
}

/// The controller owns teardown; the decoder closing its input is a no-op.
///
/// # Safety
///
/// `opaque` must be null or point to a live [`CallbackContext`].
unsafe extern "C" fn stream_close(opaque: *mut c_void) {
    guarded("close", (), || {
        if !opaque.is_null() {
            debug!("Decoder closed its input stream");
        }
    })
}

/// Everything a decoder needs to pull bytes from a remote file
///
/// Carries the callback table, the opaque pointer and decoder option
/// strings. The safe `open`/`read`/`seek`/`close` helpers invoke the table
/// for decoders written in Rust.
#[derive(Debug, Clone)]
pub struct MediaSource {
    pub table: CallbackTable,
    pub opaque: *mut c_void,
    pub options: Vec<String>,
}

// SAFETY: `opaque` points to a `CallbackContext`, which is Sync (all access
// goes through its mutex and atomics). The controller keeps the context
// alive until the decoder has stopped.
unsafe impl Send for MediaSource {}

impl MediaSource {
    pub fn new(context: &CallbackContext, options: Vec<String>) -> Self {
        Self {
            table: CallbackTable::new(),
            opaque: context.as_opaque(),
            options,
        }
    }

    /// Invoke `open`; returns the stream size
    pub fn open(&self) -> Option<u64> {
        let mut data: *mut c_void = std::ptr::null_mut();
        let mut size = 0u64;
        // SAFETY: opaque was produced by `CallbackContext::as_opaque` and the
        // out-pointers are locals.
        let rc = unsafe { (self.table.open)(self.opaque, &mut data, &mut size) };
        (rc == 0).then_some(size)
    }

    /// Invoke `read`; negative on error, 0 at end of stream
    pub fn read(&self, buf: &mut [u8]) -> isize {
        // SAFETY: buf is a valid mutable slice of buf.len() bytes
        unsafe { (self.table.read)(self.opaque, buf.as_mut_ptr(), buf.len()) }
    }

    /// Invoke `seek`; true on success
    pub fn seek(&self, offset: u64) -> bool {
        // SAFETY: see `open`
        unsafe { (self.table.seek)(self.opaque, offset) == 0 }
    }

    pub fn close(&self) {
        // SAFETY: see `open`
        unsafe { (self.table.close)(self.opaque) }
    }
}

//! # Packet
//!
//! A reference-counted, fixed-capacity byte buffer with send/receive
//! metadata (timestamp, peer address, QoS priority and importance, user
//! data).
//!
//! Cloning a [`Packet`] adds a reference to the same packet object; dropping
//! the last handle destroys it. Data and metadata may only be mutated
//! through a handle that is the sole reference (`ref_count() == 1`); any
//! other attempt fails with [`Error::PermissionDenied`] and leaves the
//! packet untouched.
//!
//! [`Packet::duplicate`] creates a *new* packet object over the same
//! storage: a shared [`Buffer`] gains a reference, caller-provided memory
//! is shared by pointer. Either way the storage is read-only while more
//! than one packet points at it.

use std::any::Any;
use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Highest packet priority (lowest is 0).
pub const PRIORITY_MAX: u8 = 7;

/// Importance assigned to new packets (0 is the most important).
pub const DEFAULT_IMPORTANCE: u32 = 0;

/// Address reported by packets that have none set.
pub const UNSPECIFIED_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

// ─── Storage ────────────────────────────────────────────────────────────────

enum Storage {
    /// Shared, reference-counted backing buffer.
    Shared(Buffer),
    /// Caller-owned memory. Lifetime is the caller's responsibility.
    /// `sharers` counts the packets over this memory; writes need it at 1.
    Raw {
        ptr: NonNull<u8>,
        cap: usize,
        len: usize,
        writable: bool,
        sharers: Arc<()>,
    },
    /// Caller-owned read-only bytes.
    Bytes { bytes: Bytes, len: usize },
}

// SAFETY: `Raw` storage is only built through the unsafe constructors, whose
// contract makes the caller guarantee the memory outlives every packet that
// points at it and is not accessed concurrently while a packet writes to it.
// The other variants are Send + Sync on their own.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn capacity(&self) -> usize {
        match self {
            Storage::Shared(buf) => buf.capacity(),
            Storage::Raw { cap, .. } => *cap,
            Storage::Bytes { bytes, .. } => bytes.len(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Shared(buf) => buf.len(),
            Storage::Raw { len, .. } | Storage::Bytes { len, .. } => *len,
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            Storage::Shared(buf) => buf.as_slice(),
            // SAFETY: see the constructor contract; len <= cap.
            Storage::Raw { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
            Storage::Bytes { bytes, len } => &bytes[..*len],
        }
    }

    fn buf_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            Storage::Shared(buf) => buf.buf_mut(),
            // SAFETY: see the constructor contract. The sharer count is 1,
            // so no other packet can hand out a view of this memory.
            Storage::Raw {
                ptr,
                cap,
                writable: true,
                sharers,
                ..
            } if Arc::strong_count(sharers) == 1 => {
                Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), *cap) })
            }
            Storage::Raw { .. } | Storage::Bytes { .. } => Err(Error::PermissionDenied),
        }
    }

    /// Validates before touching anything so a failure leaves state as is.
    fn set_len(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.capacity() {
            return Err(Error::InvalidArgument("length exceeds capacity"));
        }
        match self {
            Storage::Shared(buf) => buf.set_len(new_len),
            Storage::Raw { len, .. } | Storage::Bytes { len, .. } => {
                *len = new_len;
                Ok(())
            }
        }
    }

    fn share(&self) -> Storage {
        match self {
            Storage::Shared(buf) => Storage::Shared(buf.clone()),
            Storage::Raw {
                ptr,
                cap,
                len,
                writable,
                sharers,
            } => Storage::Raw {
                ptr: *ptr,
                cap: *cap,
                len: *len,
                writable: *writable,
                sharers: Arc::clone(sharers),
            },
            Storage::Bytes { bytes, len } => Storage::Bytes {
                bytes: bytes.clone(),
                len: *len,
            },
        }
    }
}

// ─── User Data ──────────────────────────────────────────────────────────────

type AnyValue = Box<dyn Any + Send + Sync>;
type ReleaseFn = Box<dyn FnOnce(AnyValue) + Send + Sync>;

/// Opaque user value plus the callback releasing it. The callback runs
/// exactly once: when the value is replaced, cleared, or the packet dies.
struct UserData {
    value: Option<AnyValue>,
    release: Option<ReleaseFn>,
}

impl Drop for UserData {
    fn drop(&mut self) {
        if let (Some(value), Some(release)) = (self.value.take(), self.release.take()) {
            release(value);
        }
    }
}

// ─── Packet ─────────────────────────────────────────────────────────────────

/// List membership of a packet. `list == 0` means not linked.
#[derive(Default)]
pub(crate) struct Link {
    pub(crate) list: AtomicU64,
    pub(crate) node: AtomicUsize,
}

pub(crate) struct Inner {
    storage: Storage,
    addr: SocketAddr,
    timestamp_us: u64,
    priority: u8,
    importance: u32,
    user_data: Option<UserData>,
    pub(crate) link: Link,
}

impl Inner {
    fn new(storage: Storage) -> Self {
        Inner {
            storage,
            addr: UNSPECIFIED_ADDR,
            timestamp_us: 0,
            priority: 0,
            importance: DEFAULT_IMPORTANCE,
            user_data: None,
            link: Link::default(),
        }
    }
}

/// Reference-counted packet handle.
///
/// `Clone` is the reference operation and `Drop` the unreference.
#[derive(Clone)]
pub struct Packet {
    pub(crate) inner: Arc<Inner>,
}

impl Packet {
    fn from_storage(storage: Storage) -> Self {
        Packet {
            inner: Arc::new(Inner::new(storage)),
        }
    }

    /// Create a packet backed by a newly allocated buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::from_storage(Storage::Shared(Buffer::new(capacity)))
    }

    /// Create a packet over an existing shared buffer. The packet holds one
    /// reference to it; length and capacity are the buffer's.
    pub fn from_buffer(buffer: Buffer) -> Self {
        Self::from_storage(Storage::Shared(buffer))
    }

    /// Create a packet holding a copy of `data` in a new buffer; capacity and
    /// length are both `data.len()`.
    pub fn with_data(data: &[u8]) -> Self {
        Self::from_storage(Storage::Shared(Buffer::copy_from_slice(data)))
    }

    /// Create a read-only packet over caller-provided bytes. Length starts at
    /// the full capacity (`bytes.len()`); the data cannot be written.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = bytes.len();
        Self::from_storage(Storage::Bytes { bytes, len })
    }

    /// Create a packet over caller-owned read/write memory.
    ///
    /// The length starts at 0.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `cap` bytes for as long as
    /// this packet or any packet [duplicated](Packet::duplicate) from it is
    /// alive, and must not be accessed through other means while a packet
    /// writes to it.
    pub unsafe fn from_raw_parts_mut(ptr: *mut u8, cap: usize) -> Result<Self> {
        let ptr = Self::check_raw(ptr, cap)?;
        Ok(Self::from_storage(Storage::Raw {
            ptr,
            cap,
            len: 0,
            writable: true,
            sharers: Arc::new(()),
        }))
    }

    /// Create a read-only packet over caller-owned memory. Length starts at
    /// the full capacity.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `cap` bytes for as long as this
    /// packet or any packet duplicated from it is alive.
    pub unsafe fn from_raw_parts(ptr: *const u8, cap: usize) -> Result<Self> {
        let ptr = Self::check_raw(ptr as *mut u8, cap)?;
        Ok(Self::from_storage(Storage::Raw {
            ptr,
            cap,
            len: cap,
            writable: false,
            sharers: Arc::new(()),
        }))
    }

    fn check_raw(ptr: *mut u8, cap: usize) -> Result<NonNull<u8>> {
        match NonNull::new(ptr) {
            Some(ptr) => Ok(ptr),
            None if cap == 0 => Ok(NonNull::dangling()),
            None => Err(Error::InvalidArgument("null data with non-zero capacity")),
        }
    }

    /// Create a new packet object over the same storage.
    ///
    /// A shared buffer gains a reference (no copy). Caller-owned memory is
    /// shared by pointer, so its lifetime must cover both packets, and
    /// neither packet can write it until the other is gone. Address,
    /// timestamp, priority and importance are copied; user data and list
    /// membership are not. The new packet has a reference count of 1.
    pub fn duplicate(&self) -> Packet {
        let src = &self.inner;
        let mut inner = Inner::new(src.storage.share());
        inner.addr = src.addr;
        inner.timestamp_us = src.timestamp_us;
        inner.priority = src.priority;
        inner.importance = src.importance;
        Packet {
            inner: Arc::new(inner),
        }
    }

    /// Number of handles referencing this packet.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// Whether both handles refer to the same packet object.
    pub fn ptr_eq(&self, other: &Packet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the packet is currently linked into a list.
    pub fn in_list(&self) -> bool {
        self.inner.link.list.load(std::sync::atomic::Ordering::Acquire) != 0
    }

    fn exclusive(&mut self) -> Result<&mut Inner> {
        Arc::get_mut(&mut self.inner).ok_or(Error::PermissionDenied)
    }

    // ─── Data ───────────────────────────────────────────────────────────

    /// The shared backing buffer, if the packet has one.
    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.inner.storage {
            Storage::Shared(buf) => Some(buf),
            _ => None,
        }
    }

    /// Current data (read access is always permitted).
    pub fn data(&self) -> &[u8] {
        self.inner.storage.data()
    }

    pub fn len(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.storage.capacity()
    }

    /// Current data for writing (`len` bytes).
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let len = self.len();
        Ok(&mut self.exclusive()?.storage.buf_mut()?[..len])
    }

    /// Whole writable region (`capacity` bytes), e.g. to receive into.
    pub fn buf_mut(&mut self) -> Result<&mut [u8]> {
        self.exclusive()?.storage.buf_mut()
    }

    /// Set the data length in bytes.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        self.exclusive()?.storage.set_len(len)
    }

    /// Replace the data with a copy of `src`.
    pub fn set_data(&mut self, src: &[u8]) -> Result<()> {
        let inner = self.exclusive()?;
        if src.len() > inner.storage.capacity() {
            return Err(Error::InvalidArgument("data exceeds capacity"));
        }
        inner.storage.buf_mut()?[..src.len()].copy_from_slice(src);
        inner.storage.set_len(src.len())
    }

    /// Copy the current data out.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.data())
    }

    /// Scatter-gather view for writing to a socket: one entry covering the
    /// current data.
    pub fn io_slices(&self) -> [IoSlice<'_>; 1] {
        [IoSlice::new(self.data())]
    }

    /// Scatter-gather view for reading from a socket: one entry covering the
    /// whole capacity.
    pub fn io_slices_mut(&mut self) -> Result<[IoSliceMut<'_>; 1]> {
        Ok([IoSliceMut::new(self.buf_mut()?)])
    }

    // ─── Metadata ───────────────────────────────────────────────────────

    /// Peer address: destination when sending, source when received.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn set_addr(&mut self, addr: SocketAddr) -> Result<()> {
        self.exclusive()?.addr = addr;
        Ok(())
    }

    /// Monotonic timestamp in µs: send time for outbound packets, receive
    /// time for inbound ones.
    pub fn timestamp_us(&self) -> u64 {
        self.inner.timestamp_us
    }

    pub fn set_timestamp_us(&mut self, ts: u64) -> Result<()> {
        self.exclusive()?.timestamp_us = ts;
        Ok(())
    }

    /// QoS priority, 0 (lowest, default) to [`PRIORITY_MAX`] (highest).
    pub fn priority(&self) -> u8 {
        self.inner.priority
    }

    pub fn set_priority(&mut self, priority: u8) -> Result<()> {
        let inner = self.exclusive()?;
        if priority > PRIORITY_MAX {
            return Err(Error::InvalidArgument("priority out of range"));
        }
        inner.priority = priority;
        Ok(())
    }

    /// Importance, 0 (highest) to `u32::MAX` (lowest).
    pub fn importance(&self) -> u32 {
        self.inner.importance
    }

    pub fn set_importance(&mut self, importance: u32) -> Result<()> {
        self.exclusive()?.importance = importance;
        Ok(())
    }

    // ─── User Data ──────────────────────────────────────────────────────

    /// The user value, if one is set and has type `T`.
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.inner
            .user_data
            .as_ref()
            .and_then(|ud| ud.value.as_ref())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Attach a user value. A previous value is released first.
    pub fn set_user_data<T: Any + Send + Sync>(&mut self, value: T) -> Result<()> {
        self.replace_user_data(Some(UserData {
            value: Some(Box::new(value)),
            release: None,
        }))
    }

    /// Attach a user value together with the callback that releases it.
    ///
    /// `release` is invoked exactly once, with the value, when the value is
    /// replaced or cleared, or when the last packet reference is dropped.
    pub fn set_user_data_with_release<T, F>(&mut self, value: T, release: F) -> Result<()>
    where
        T: Any + Send + Sync,
        F: FnOnce(Box<dyn Any + Send + Sync>) + Send + Sync + 'static,
    {
        self.replace_user_data(Some(UserData {
            value: Some(Box::new(value)),
            release: Some(Box::new(release)),
        }))
    }

    /// Release and remove the user value.
    pub fn clear_user_data(&mut self) -> Result<()> {
        self.replace_user_data(None)
    }

    fn replace_user_data(&mut self, user_data: Option<UserData>) -> Result<()> {
        let old = std::mem::replace(&mut self.exclusive()?.user_data, user_data);
        drop(old);
        Ok(())
    }

    /// Clear length and metadata so the packet can be reused for receiving.
    pub fn reset(&mut self) -> Result<()> {
        let inner = self.exclusive()?;
        inner.storage.set_len(0)?;
        inner.addr = UNSPECIFIED_ADDR;
        inner.timestamp_us = 0;
        inner.priority = 0;
        inner.importance = DEFAULT_IMPORTANCE;
        inner.user_data = None;
        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("refs", &self.ref_count())
            .field("addr", &self.inner.addr)
            .field("timestamp_us", &self.inner.timestamp_us)
            .field("priority", &self.inner.priority)
            .field("importance", &self.inner.importance)
            .finish()
    }
}

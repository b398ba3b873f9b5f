//! # Asynchronous Resolver
//!
//! Hostname lookups run on worker threads; each result is posted to the
//! caller's reactor and handed to the request's callback there.
//!
//! `cancel` guarantees the callback of that request is not invoked after it
//! returns. When called from a thread other than the one delivering the
//! result, it waits for an in-progress delivery of that request to finish.
//! Dropping the last [`Resolver`] clone cancels all outstanding requests.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::reactor::{Reactor, ReactorHandle};

/// Identifier of one lookup, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(i32);

impl RequestId {
    /// Never returned for a live request.
    pub const INVALID: RequestId = RequestId(-1);

    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lookup failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ResolveError {
    #[error("temporary failure in name resolution")]
    Again,
    #[error("non-recoverable failure in name resolution")]
    Fail,
    #[error("out of memory")]
    Memory,
    #[error("host has no address")]
    NoData,
    #[error("unknown host")]
    NoName,
    #[error("system error")]
    System,
}

pub type ResolveResult = std::result::Result<Vec<Ipv4Addr>, ResolveError>;

/// Blocking lookup used by the resolver's worker threads.
pub trait ResolverBackend: Send + Sync + 'static {
    fn lookup(&self, hostname: &str) -> ResolveResult;
}

// ─── System backend ──────────────────────────────────────────────────────────

/// IPv4 lookup through the platform's `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
const EAI_NODATA: i32 = -5;
#[cfg(all(target_os = "linux", target_env = "gnu"))]
const EAI_ADDRFAMILY: i32 = -9;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
const EAI_NODATA: i32 = i32::MIN;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
const EAI_ADDRFAMILY: i32 = i32::MIN + 1;

impl ResolveError {
    fn from_gai(code: i32) -> Self {
        match code {
            libc::EAI_AGAIN => ResolveError::Again,
            libc::EAI_FAIL => ResolveError::Fail,
            libc::EAI_MEMORY => ResolveError::Memory,
            libc::EAI_NONAME => ResolveError::NoName,
            EAI_NODATA | EAI_ADDRFAMILY => ResolveError::NoData,
            _ => ResolveError::System,
        }
    }
}

impl ResolverBackend for SystemResolver {
    fn lookup(&self, hostname: &str) -> ResolveResult {
        let host = CString::new(hostname).map_err(|_| ResolveError::NoName)?;
        // SAFETY: zeroed addrinfo is a valid "no constraints" hints value.
        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_INET;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut res: *mut libc::addrinfo = ptr::null_mut();
        // SAFETY: host and hints are valid for the call; res is freed below.
        let rc = unsafe { libc::getaddrinfo(host.as_ptr(), ptr::null(), &hints, &mut res) };
        if rc != 0 {
            return Err(ResolveError::from_gai(rc));
        }

        let mut addrs = Vec::new();
        let mut cur = res;
        while !cur.is_null() {
            // SAFETY: cur walks the list returned by getaddrinfo.
            let ai = unsafe { &*cur };
            if ai.ai_family == libc::AF_INET && !ai.ai_addr.is_null() {
                let sin = unsafe { &*(ai.ai_addr as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                if !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
            cur = ai.ai_next;
        }
        // SAFETY: res came from a successful getaddrinfo.
        unsafe { libc::freeaddrinfo(res) };

        if addrs.is_empty() {
            return Err(ResolveError::NoData);
        }
        Ok(addrs)
    }
}

// ─── Resolver ────────────────────────────────────────────────────────────────

type Callback = Box<dyn FnOnce(RequestId, ResolveResult) + Send>;

struct Pending {
    hostname: String,
    callback: Callback,
}

struct State {
    pending: HashMap<i32, Pending>,
    /// Request whose callback is running, and the thread running it.
    delivering: Option<(i32, ThreadId)>,
    next_id: i32,
}

impl State {
    /// Next non-negative id not held by a pending or delivering request.
    fn allocate_id(&mut self) -> i32 {
        let advance = |id: i32| id.checked_add(1).unwrap_or(0);
        let mut id = self.next_id;
        let delivering = self.delivering.map(|(d, _)| d);
        while self.pending.contains_key(&id) || delivering == Some(id) {
            id = advance(id);
        }
        self.next_id = advance(id);
        id
    }
}

struct Shared {
    backend: Box<dyn ResolverBackend>,
    state: Mutex<State>,
    delivered: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, id: i32, result: ResolveResult) {
        let pending = {
            let mut state = self.lock();
            let Some(pending) = state.pending.remove(&id) else {
                trace!(id, "resolver result for cancelled request dropped");
                return;
            };
            state.delivering = Some((id, thread::current().id()));
            pending
        };
        debug!(id, hostname = %pending.hostname, ok = result.is_ok(), "resolver request completed");
        (pending.callback)(RequestId(id), result);
        self.lock().delivering = None;
        self.delivered.notify_all();
    }

    fn cancel(&self, id: i32) -> bool {
        let me = thread::current().id();
        let mut state = self.lock();
        let removed = state.pending.remove(&id);
        while matches!(state.delivering, Some((d, t)) if d == id && t != me) {
            state = self
                .delivered
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(state);
        removed.is_some()
    }

    fn cancel_all(&self) -> usize {
        let drained: Vec<Pending> = self.lock().pending.drain().map(|(_, p)| p).collect();
        drained.len()
    }
}

/// Releases the shared state; cancels whatever is still pending.
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        let cancelled = self.shared.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "resolver dropped with pending requests");
        }
    }
}

/// Cancellable asynchronous hostname resolver. Clones share one instance.
#[derive(Clone)]
pub struct Resolver {
    owner: Arc<Owner>,
}

impl Resolver {
    /// Resolver backed by the system `getaddrinfo`.
    pub fn new() -> Resolver {
        Resolver::with_backend(SystemResolver)
    }

    pub fn with_backend(backend: impl ResolverBackend) -> Resolver {
        Resolver {
            owner: Arc::new(Owner {
                shared: Arc::new(Shared {
                    backend: Box::new(backend),
                    state: Mutex::new(State {
                        pending: HashMap::new(),
                        delivering: None,
                        next_id: 0,
                    }),
                    delivered: Condvar::new(),
                }),
            }),
        }
    }

    /// Number of live handles.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.owner)
    }

    /// Number of requests not yet delivered or cancelled.
    pub fn pending(&self) -> usize {
        self.owner.shared.lock().pending.len()
    }

    /// Start resolving `hostname`. `cb` runs later on `reactor`'s thread.
    pub fn getaddrinfo<F>(&self, hostname: &str, reactor: &Reactor, cb: F) -> Result<RequestId>
    where
        F: FnOnce(RequestId, ResolveResult) + Send + 'static,
    {
        self.getaddrinfo_on(hostname, reactor.handle(), cb)
    }

    /// As [`Resolver::getaddrinfo`], delivering through a reactor handle, so
    /// it may be called from any thread.
    pub fn getaddrinfo_on<F>(&self, hostname: &str, reactor: ReactorHandle, cb: F) -> Result<RequestId>
    where
        F: FnOnce(RequestId, ResolveResult) + Send + 'static,
    {
        if hostname.is_empty() {
            return Err(Error::InvalidArgument("empty hostname"));
        }
        let shared = &self.owner.shared;
        let id = {
            let mut state = shared.lock();
            let id = state.allocate_id();
            state.pending.insert(
                id,
                Pending {
                    hostname: hostname.to_owned(),
                    callback: Box::new(cb),
                },
            );
            id
        };

        let weak: Weak<Shared> = Arc::downgrade(shared);
        let host = hostname.to_owned();
        let spawned = thread::Builder::new()
            .name("transit-resolv".into())
            .spawn(move || {
                let Some(shared) = weak.upgrade() else { return };
                if !shared.lock().pending.contains_key(&id) {
                    return;
                }
                let result = shared.backend.lookup(&host);
                drop(shared);
                reactor.post(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.deliver(id, result);
                    }
                });
            });
        if let Err(e) = spawned {
            shared.lock().pending.remove(&id);
            return Err(e.into());
        }
        debug!(id, hostname, "resolver request queued");
        Ok(RequestId(id))
    }

    /// Cancel a request. Returns whether it was still pending. After this
    /// returns, the request's callback will not run.
    pub fn cancel(&self, id: RequestId) -> Result<bool> {
        if id == RequestId::INVALID {
            return Err(Error::InvalidArgument("invalid request id"));
        }
        let cancelled = self.owner.shared.cancel(id.0);
        if cancelled {
            debug!(id = id.0, "resolver request cancelled");
        }
        Ok(cancelled)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::new()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("refs", &self.ref_count())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_wrap_past_live_requests() {
        let pending = |host: &str| Pending {
            hostname: host.to_owned(),
            callback: Box::new(|_, _| {}),
        };
        let mut state = State {
            pending: HashMap::new(),
            delivering: Some((1, thread::current().id())),
            next_id: i32::MAX,
        };
        state.pending.insert(0, pending("still-waiting"));
        state.pending.insert(2, pending("also-waiting"));

        assert_eq!(state.allocate_id(), i32::MAX);
        assert_eq!(state.allocate_id(), 3);
        assert_eq!(state.pending[&0].hostname, "still-waiting");
        assert_eq!(state.next_id, 4);
    }

    #[test]
    fn gai_codes_map() {
        assert_eq!(ResolveError::from_gai(libc::EAI_AGAIN), ResolveError::Again);
        assert_eq!(ResolveError::from_gai(libc::EAI_NONAME), ResolveError::NoName);
        assert_eq!(ResolveError::from_gai(libc::EAI_MEMORY), ResolveError::Memory);
        assert_eq!(ResolveError::from_gai(libc::EAI_FAIL), ResolveError::Fail);
        assert_eq!(ResolveError::from_gai(libc::EAI_SYSTEM), ResolveError::System);
    }

    #[test]
    fn numeric_host_resolves_without_dns() {
        let addrs = SystemResolver.lookup("127.0.0.1").unwrap();
        assert_eq!(addrs, vec![Ipv4Addr::LOCALHOST]);
    }

    #[test]
    fn nul_in_hostname_is_unknown() {
        assert_eq!(SystemResolver.lookup("bad\0host"), Err(ResolveError::NoName));
    }

    #[test]
    fn invalid_id_and_empty_host_rejected() {
        let reactor = Reactor::new().unwrap();
        let resolver = Resolver::new();
        assert!(resolver.cancel(RequestId::INVALID).is_err());
        assert!(resolver.getaddrinfo("", &reactor, |_, _| {}).is_err());
        assert!(!resolver.cancel(RequestId(42)).unwrap());
    }

    #[test]
    fn clones_share_state() {
        let a = Resolver::new();
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        drop(b);
        assert_eq!(a.ref_count(), 1);
    }
}

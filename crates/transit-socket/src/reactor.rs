//! # Event Reactor
//!
//! Single-threaded readiness loop over `mio`. Sockets register their file
//! descriptor with an interest mask and a callback; [`Reactor::run_once`]
//! polls and dispatches readiness to the callbacks on the calling thread.
//!
//! Dispatch is level-triggered: after a callback returns, the source is
//! re-armed, so readiness that was not fully consumed is reported again on
//! the next turn.
//!
//! Work from other threads reaches the loop through a [`ReactorHandle`]:
//! closures are queued on a channel and the poll is woken.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{trace, warn};

/// Token for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Events drained per poll.
const EVENTS_CAPACITY: usize = 256;

// ─── Readiness ───────────────────────────────────────────────────────────────

/// Readiness / interest bitmask.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Readiness(u32);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    /// Data to read.
    pub const IN: Readiness = Readiness(1);
    /// Urgent data.
    pub const PRI: Readiness = Readiness(2);
    /// Writable without blocking.
    pub const OUT: Readiness = Readiness(4);
    /// Error condition. Always reported.
    pub const ERR: Readiness = Readiness(8);
    /// Hang-up. Always reported.
    pub const HUP: Readiness = Readiness(16);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Readiness(bits & 0x1f)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn remove(self, other: Readiness) -> Self {
        Readiness(self.0 & !other.0)
    }

    fn from_event(event: &Event) -> Self {
        let mut r = Readiness::EMPTY;
        if event.is_readable() {
            r |= Readiness::IN;
        }
        if event.is_priority() {
            r |= Readiness::PRI;
        }
        if event.is_writable() {
            r |= Readiness::OUT;
        }
        if event.is_error() {
            r |= Readiness::ERR;
        }
        if event.is_read_closed() || event.is_write_closed() {
            r |= Readiness::HUP;
        }
        r
    }

    /// Error and hangup are always reported by epoll but need some
    /// registration to be seen; alone they ride on read interest and
    /// `dispatch` filters out the readable bit.
    fn interest(self) -> Option<Interest> {
        let read = self.intersects(Readiness::IN | Readiness::PRI);
        let write = self.contains(Readiness::OUT);
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) if self.intersects(Readiness::ERR | Readiness::HUP) => {
                Some(Interest::READABLE)
            }
            (false, false) => None,
        }
    }
}

impl BitOr for Readiness {
    type Output = Readiness;
    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Readiness {
    type Output = Readiness;
    fn bitand(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 & rhs.0)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Readiness, &str); 5] = [
            (Readiness::IN, "IN"),
            (Readiness::PRI, "PRI"),
            (Readiness::OUT, "OUT"),
            (Readiness::ERR, "ERR"),
            (Readiness::HUP, "HUP"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("EMPTY")?;
        }
        Ok(())
    }
}

// ─── Reactor ─────────────────────────────────────────────────────────────────

/// Readiness callback.
pub type EventCallback = Box<dyn FnMut(Readiness)>;

type Posted = Box<dyn FnOnce() + Send>;
type Deferred = Box<dyn FnOnce()>;

struct Source {
    fd: RawFd,
    events: Readiness,
    callback: Option<EventCallback>,
    /// Bumped by every `set_callback`, so a callback replaced while running
    /// is not restored.
    callback_gen: u64,
    generation: u64,
    armed: bool,
}

struct ReactorInner {
    poll: RefCell<Poll>,
    registry: Registry,
    events: RefCell<Events>,
    sources: RefCell<Slab<Source>>,
    next_generation: Cell<u64>,
    deferred: RefCell<VecDeque<Deferred>>,
    posted_tx: Sender<Posted>,
    posted_rx: Receiver<Posted>,
    waker: Arc<Waker>,
}

/// Event loop driving socket callbacks. Cloning yields another handle to
/// the same loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (posted_tx, posted_rx) = crossbeam_channel::unbounded();
        Ok(Reactor {
            inner: Rc::new(ReactorInner {
                poll: RefCell::new(poll),
                registry,
                events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
                sources: RefCell::new(Slab::new()),
                next_generation: Cell::new(1),
                deferred: RefCell::new(VecDeque::new()),
                posted_tx,
                posted_rx,
                waker,
            }),
        })
    }

    /// Sendable handle for posting work to this loop from other threads.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            tx: self.inner.posted_tx.clone(),
            waker: Arc::clone(&self.inner.waker),
        }
    }

    /// Watch `fd` for `events`. The registration lasts until the returned
    /// [`Registration`] is dropped.
    pub fn register(
        &self,
        fd: RawFd,
        events: Readiness,
        callback: EventCallback,
    ) -> io::Result<Registration> {
        let generation = self.inner.next_generation.get();
        self.inner.next_generation.set(generation + 1);
        let key = self.inner.sources.borrow_mut().insert(Source {
            fd,
            events,
            callback: Some(callback),
            callback_gen: 0,
            generation,
            armed: false,
        });
        if let Err(e) = self.arm(key) {
            self.inner.sources.borrow_mut().remove(key);
            return Err(e);
        }
        trace!(fd, key, ?events, "fd registered");
        Ok(Registration {
            reactor: self.clone(),
            key,
            generation,
        })
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> usize {
        self.inner.sources.borrow().len()
    }

    /// Run `f` on this thread at the end of the current (or next) turn.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.inner.deferred.borrow_mut().push_back(Box::new(f));
    }

    /// Wait up to `timeout` (forever if `None`) for readiness and dispatch it,
    /// then run posted and deferred work. Returns the number of callbacks
    /// and tasks run.
    pub fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = if self.inner.deferred.borrow().is_empty() && self.inner.posted_rx.is_empty()
        {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let ready: Vec<(Token, Readiness)> = {
            let mut poll = self.inner.poll.borrow_mut();
            let mut events = self.inner.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
                Err(e) => return Err(e),
            }
            events
                .iter()
                .map(|e| (e.token(), Readiness::from_event(e)))
                .collect()
        };

        let mut ran = 0;
        for (token, revents) in ready {
            if token != WAKER_TOKEN && self.dispatch(token.0, revents) {
                ran += 1;
            }
        }
        ran += self.run_tasks();
        Ok(ran)
    }

    /// Turn the loop until `done` returns true or `limit` elapses. Returns
    /// whether `done` was satisfied.
    pub fn run_until(&self, limit: Duration, mut done: impl FnMut() -> bool) -> io::Result<bool> {
        let deadline = Instant::now() + limit;
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.run_once(Some(deadline - now))?;
        }
        Ok(true)
    }

    fn dispatch(&self, key: usize, revents: Readiness) -> bool {
        let (generation, callback_gen, mut callback, delivered) = {
            let mut sources = self.inner.sources.borrow_mut();
            let Some(src) = sources.get_mut(key) else {
                return false;
            };
            let delivered = revents & (src.events | Readiness::ERR | Readiness::HUP);
            if delivered.is_empty() {
                return false;
            }
            let Some(callback) = src.callback.take() else {
                return false;
            };
            (src.generation, src.callback_gen, callback, delivered)
        };

        callback(delivered);

        let still_registered = {
            let mut sources = self.inner.sources.borrow_mut();
            match sources.get_mut(key) {
                Some(src) if src.generation == generation => {
                    if src.callback_gen == callback_gen {
                        src.callback = Some(callback);
                    }
                    true
                }
                _ => false,
            }
        };
        if still_registered {
            if let Err(e) = self.arm(key) {
                warn!(key, error = %e, "failed to re-arm fd");
            }
        }
        true
    }

    fn run_tasks(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.inner.posted_rx.try_recv() {
            task();
            ran += 1;
        }
        let batch: Vec<Deferred> = self.inner.deferred.borrow_mut().drain(..).collect();
        for task in batch {
            task();
            ran += 1;
        }
        ran
    }

    /// Sync the OS registration of `key` with its interest mask.
    fn arm(&self, key: usize) -> io::Result<()> {
        let mut sources = self.inner.sources.borrow_mut();
        let Some(src) = sources.get_mut(key) else {
            return Ok(());
        };
        let registry = &self.inner.registry;
        match (src.events.interest(), src.armed) {
            (Some(interest), true) => {
                registry.reregister(&mut SourceFd(&src.fd), Token(key), interest)
            }
            (Some(interest), false) => {
                registry.register(&mut SourceFd(&src.fd), Token(key), interest)?;
                src.armed = true;
                Ok(())
            }
            (None, true) => {
                src.armed = false;
                registry.deregister(&mut SourceFd(&src.fd))
            }
            (None, false) => Ok(()),
        }
    }

    fn set_events(&self, key: usize, generation: u64, events: Readiness) -> io::Result<()> {
        {
            let mut sources = self.inner.sources.borrow_mut();
            match sources.get_mut(key) {
                Some(src) if src.generation == generation => src.events = events,
                _ => return Err(io::Error::from(io::ErrorKind::NotFound)),
            }
        }
        self.arm(key)
    }

    fn events(&self, key: usize, generation: u64) -> Readiness {
        match self.inner.sources.borrow().get(key) {
            Some(src) if src.generation == generation => src.events,
            _ => Readiness::EMPTY,
        }
    }

    fn set_callback(&self, key: usize, generation: u64, callback: EventCallback) {
        let old = {
            let mut sources = self.inner.sources.borrow_mut();
            match sources.get_mut(key) {
                Some(src) if src.generation == generation => {
                    src.callback_gen += 1;
                    src.callback.replace(callback)
                }
                _ => None,
            }
        };
        drop(old);
    }

    fn deregister(&self, key: usize, generation: u64) {
        let removed = {
            let mut sources = self.inner.sources.borrow_mut();
            match sources.get(key) {
                Some(src) if src.generation == generation => Some(sources.remove(key)),
                _ => None,
            }
        };
        if let Some(mut src) = removed {
            if src.armed {
                if let Err(e) = self.inner.registry.deregister(&mut SourceFd(&src.fd)) {
                    trace!(fd = src.fd, error = %e, "deregister failed");
                }
            }
            trace!(fd = src.fd, key, "fd deregistered");
            // Drop the callback outside the borrow: it may own sockets.
            src.callback.take();
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("sources", &self.source_count())
            .finish()
    }
}

// ─── Registration ────────────────────────────────────────────────────────────

/// A file descriptor watched by a [`Reactor`]. Dropping it stops the watch.
pub struct Registration {
    reactor: Reactor,
    key: usize,
    generation: u64,
}

impl Registration {
    /// Current interest mask.
    pub fn events(&self) -> Readiness {
        self.reactor.events(self.key, self.generation)
    }

    /// Replace the interest mask.
    pub fn set_events(&self, events: Readiness) -> io::Result<()> {
        self.reactor.set_events(self.key, self.generation, events)
    }

    /// Add and remove interest bits.
    pub fn update_events(&self, add: Readiness, remove: Readiness) -> io::Result<()> {
        let events = (self.events() | add).remove(remove);
        self.set_events(events)
    }

    /// Replace the callback. Safe to call from inside the callback itself.
    pub fn set_callback(&self, callback: EventCallback) {
        self.reactor.set_callback(self.key, self.generation, callback);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.reactor.deregister(self.key, self.generation);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("events", &self.events())
            .finish()
    }
}

// ─── ReactorHandle ───────────────────────────────────────────────────────────

/// Thread-safe handle posting closures to a [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    tx: Sender<Posted>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Queue `f` to run on the reactor thread. Returns `false` if the
    /// reactor is gone.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> bool {
        if self.tx.send(Box::new(f)).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reactor");
        }
        true
    }
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle").finish_non_exhaustive()
    }
}

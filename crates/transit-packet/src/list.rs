//! # Packet List
//!
//! Ordered, doubly-linked sequence of packets used to batch packets between
//! sockets and their consumers. Nodes live in a slab arena and are linked by
//! index, so every insertion, move and removal is O(1).
//!
//! A packet can be linked into at most one list at a time. The packet carries
//! the id of its list (and its node index) as a back-reference; the claim is
//! taken with a compare-and-swap, so a second insertion anywhere fails with
//! [`Error::Busy`].
//!
//! Ownership: adding a packet takes a new reference to it. [`PacketList::remove`]
//! hands that reference back to the caller; [`PacketList::flush`] (and dropping
//! the list) releases it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use slab::Slab;
use tracing::trace;

use crate::error::{Error, Result};
use crate::packet::Packet;

static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

struct Node {
    packet: Packet,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Ordered packet list with at-most-one-list membership.
pub struct PacketList {
    id: u64,
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl PacketList {
    /// Create an empty list.
    pub fn new() -> Self {
        PacketList {
            id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }

    /// Number of packets in the list.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `pkt` is linked into this list.
    pub fn contains(&self, pkt: &Packet) -> bool {
        self.key_of(pkt).is_ok()
    }

    // ─── Traversal ──────────────────────────────────────────────────────

    pub fn first(&self) -> Option<&Packet> {
        self.head.map(|k| &self.nodes[k].packet)
    }

    pub fn last(&self) -> Option<&Packet> {
        self.tail.map(|k| &self.nodes[k].packet)
    }

    /// Packet following `prev`, or the first packet when `prev` is `None`.
    /// Returns `None` at the end, or if `prev` is not in this list.
    pub fn next(&self, prev: Option<&Packet>) -> Option<&Packet> {
        let key = match prev {
            None => self.head?,
            Some(p) => self.nodes[self.key_of(p).ok()?].next?,
        };
        Some(&self.nodes[key].packet)
    }

    /// Packet preceding `next`, or the last packet when `next` is `None`.
    /// Returns `None` at the start, or if `next` is not in this list.
    pub fn prev(&self, next: Option<&Packet>) -> Option<&Packet> {
        let key = match next {
            None => self.tail?,
            Some(n) => self.nodes[self.key_of(n).ok()?].prev?,
        };
        Some(&self.nodes[key].packet)
    }

    /// Iterate front to back.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    // ─── Insertion ──────────────────────────────────────────────────────

    /// Add `pkt` at the front. Takes a new reference to the packet.
    pub fn add_first(&mut self, pkt: &Packet) -> Result<()> {
        self.claim(pkt)?;
        let head = self.head;
        self.insert_before(pkt, head);
        Ok(())
    }

    /// Add `pkt` at the back. Takes a new reference to the packet.
    pub fn add_last(&mut self, pkt: &Packet) -> Result<()> {
        self.claim(pkt)?;
        self.insert_before(pkt, None);
        Ok(())
    }

    /// Add `pkt` before `next`; at the back when `next` is `None`.
    pub fn add_before(&mut self, next: Option<&Packet>, pkt: &Packet) -> Result<()> {
        if pkt.in_list() {
            return Err(Error::Busy);
        }
        let anchor = next.map(|n| self.key_of(n)).transpose()?;
        self.claim(pkt)?;
        self.insert_before(pkt, anchor);
        Ok(())
    }

    /// Add `pkt` after `prev`; at the front when `prev` is `None`.
    pub fn add_after(&mut self, prev: Option<&Packet>, pkt: &Packet) -> Result<()> {
        if pkt.in_list() {
            return Err(Error::Busy);
        }
        let anchor = prev.map(|p| self.key_of(p)).transpose()?;
        self.claim(pkt)?;
        let next = self.successor(anchor);
        self.insert_before(pkt, next);
        Ok(())
    }

    // ─── Moves ──────────────────────────────────────────────────────────

    pub fn move_first(&mut self, pkt: &Packet) -> Result<()> {
        self.move_after(None, pkt)
    }

    pub fn move_last(&mut self, pkt: &Packet) -> Result<()> {
        self.move_before(None, pkt)
    }

    /// Relocate `pkt` before `next` (at the back when `None`). No reference
    /// count change.
    pub fn move_before(&mut self, next: Option<&Packet>, pkt: &Packet) -> Result<()> {
        let key = self.key_of(pkt)?;
        let anchor = next.map(|n| self.key_of(n)).transpose()?;
        if anchor == Some(key) {
            return Ok(());
        }
        self.detach(key);
        self.attach_before(key, anchor);
        Ok(())
    }

    /// Relocate `pkt` after `prev` (at the front when `None`). No reference
    /// count change.
    pub fn move_after(&mut self, prev: Option<&Packet>, pkt: &Packet) -> Result<()> {
        let key = self.key_of(pkt)?;
        let anchor = prev.map(|p| self.key_of(p)).transpose()?;
        if anchor == Some(key) {
            return Ok(());
        }
        self.detach(key);
        let next = self.successor(anchor);
        self.attach_before(key, next);
        Ok(())
    }

    // ─── Removal ────────────────────────────────────────────────────────

    /// Unlink `pkt` and hand the list's reference back to the caller.
    ///
    /// The reference count is unchanged: dropping the returned handle is
    /// the caller's unreference.
    pub fn remove(&mut self, pkt: &Packet) -> Result<Packet> {
        let key = self.key_of(pkt)?;
        Ok(self.unlink(key))
    }

    /// Unlink the first packet, handing its reference to the caller.
    pub fn pop_first(&mut self) -> Option<Packet> {
        let key = self.head?;
        Some(self.unlink(key))
    }

    /// Unlink and release every packet.
    pub fn flush(&mut self) {
        let released = self.len();
        while let Some(pkt) = self.pop_first() {
            drop(pkt);
        }
        if released > 0 {
            trace!(list = self.id, released, "packet list flushed");
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn key_of(&self, pkt: &Packet) -> Result<usize> {
        let link = &pkt.inner.link;
        if link.list.load(Ordering::Acquire) != self.id {
            return Err(Error::NotFound);
        }
        Ok(link.node.load(Ordering::Acquire))
    }

    fn claim(&self, pkt: &Packet) -> Result<()> {
        pkt.inner
            .link
            .list
            .compare_exchange(0, self.id, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    fn release_claim(pkt: &Packet) {
        pkt.inner.link.list.store(0, Ordering::Release);
    }

    fn successor(&self, anchor: Option<usize>) -> Option<usize> {
        match anchor {
            Some(k) => self.nodes[k].next,
            None => self.head,
        }
    }

    fn insert_before(&mut self, pkt: &Packet, next: Option<usize>) {
        let key = self.nodes.insert(Node {
            packet: pkt.clone(),
            prev: None,
            next: None,
        });
        pkt.inner.link.node.store(key, Ordering::Release);
        self.attach_before(key, next);
    }

    fn attach_before(&mut self, key: usize, next: Option<usize>) {
        let prev = match next {
            Some(n) => self.nodes[n].prev,
            None => self.tail,
        };
        {
            let node = &mut self.nodes[key];
            node.prev = prev;
            node.next = next;
        }
        match prev {
            Some(p) => self.nodes[p].next = Some(key),
            None => self.head = Some(key),
        }
        match next {
            Some(n) => self.nodes[n].prev = Some(key),
            None => self.tail = Some(key),
        }
    }

    fn detach(&mut self, key: usize) {
        let (prev, next) = {
            let node = &mut self.nodes[key];
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn unlink(&mut self, key: usize) -> Packet {
        self.detach(key);
        let node = self.nodes.remove(key);
        Self::release_claim(&node.packet);
        node.packet
    }
}

impl Default for PacketList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PacketList {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for PacketList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Front-to-back iterator over a [`PacketList`].
pub struct Iter<'a> {
    list: &'a PacketList,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Packet;

    fn next(&mut self) -> Option<Self::Item> {
        let list = self.list;
        let node = &list.nodes[self.cursor?];
        self.cursor = node.next;
        Some(&node.packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.list.len()))
    }
}

impl<'a> IntoIterator for &'a PacketList {
    type Item = &'a Packet;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

//! Event source adapter
//!
//! Drivers that do not want to block on a reply hand their transport's
//! readiness primitive to an event loop they own. This module is the bridge:
//! it never runs a loop itself, it only translates a backend's waitable (a
//! file descriptor on unix) and the generic [`Interest`] vocabulary into calls
//! on the caller's [`Reactor`].
//!
//! ```text
//!  driver ──register_for_events──▶ TransportHandle ──event_source()──▶ backend
//!                                        │
//!                                        └──Reactor::register(key, fd, interest, timeout, cb)
//!  reactor ──cb(fd, observed)──▶ driver   (returns false to drop the registration)
//! ```
//!
//! A handle holds at most one live registration. Closing the handle makes an
//! outstanding registration inert: the wrapped callback stops forwarding and
//! asks the reactor to drop it on its next invocation.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{LinkError, LinkResult};

/// Native waitable a backend exposes to an event loop
#[cfg(unix)]
pub type RawSource = std::os::unix::io::RawFd;

/// Native waitable a backend exposes to an event loop
#[cfg(not(unix))]
pub type RawSource = u64;

/// Callback invoked by the reactor with the source and the observed events.
/// Returning `false` asks the reactor to remove the registration.
pub type EventCallback = Box<dyn FnMut(RawSource, Interest) -> bool>;

/// Readiness interest mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    pub const ERROR: Interest = Interest(0b100);

    pub const fn empty() -> Self {
        Interest(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub const fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// Stable identity of one transport handle, used as the registration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Externally owned, single-threaded event loop
///
/// The loop is expected to call the registered callback whenever the source
/// shows any of the requested events, or with [`Interest::empty`] when the
/// timeout elapses first.
pub trait Reactor {
    fn register(
        &mut self,
        key: HandleId,
        source: RawSource,
        interest: Interest,
        timeout: Option<Duration>,
        callback: EventCallback,
    ) -> LinkResult<()>;

    fn unregister(&mut self, key: HandleId) -> LinkResult<()>;
}

/// Flags shared between a slot and the callback it handed to the reactor
#[derive(Debug)]
struct Registration {
    /// The owner still wants events forwarded
    armed: Arc<AtomicBool>,
    /// The reactor still holds the entry; cleared once the callback returned `false`
    in_reactor: Arc<AtomicBool>,
}

/// The single registration slot of a transport handle
#[derive(Debug, Default)]
pub(crate) struct EventSlot {
    record: Option<Registration>,
}

impl EventSlot {
    /// A registration exists and its callback has not asked to be removed
    pub(crate) fn is_active(&self) -> bool {
        self.record
            .as_ref()
            .is_some_and(|r| r.armed.load(Ordering::Acquire))
    }

    pub(crate) fn register(
        &mut self,
        reactor: &mut dyn Reactor,
        key: HandleId,
        source: RawSource,
        interest: Interest,
        timeout: Option<Duration>,
        mut callback: EventCallback,
    ) -> LinkResult<()> {
        if self.is_active() {
            return Err(LinkError::argument(format!(
                "handle {} already has an active event registration",
                key
            )));
        }
        if interest.is_empty() {
            return Err(LinkError::argument("empty interest mask"));
        }

        // A disarmed entry the reactor never dropped must go before the key is reused
        if let Some(stale) = self.record.take() {
            if stale.in_reactor.swap(false, Ordering::AcqRel) {
                if let Err(e) = reactor.unregister(key) {
                    debug!("Dropping stale registration of handle {}: {}", key, e);
                }
            }
        }

        let armed = Arc::new(AtomicBool::new(true));
        let in_reactor = Arc::new(AtomicBool::new(true));
        let (armed_flag, reactor_flag) = (Arc::clone(&armed), Arc::clone(&in_reactor));
        let wrapped: EventCallback = Box::new(move |source, observed| {
            let keep = armed_flag.load(Ordering::Acquire) && callback(source, observed);
            if !keep {
                armed_flag.store(false, Ordering::Release);
                reactor_flag.store(false, Ordering::Release);
            }
            keep
        });

        reactor.register(key, source, interest, timeout, wrapped)?;
        debug!(
            "Registered handle {} (source {:?}) for events {:#05b}, timeout {:?}",
            key,
            source,
            interest.bits(),
            timeout
        );
        self.record = Some(Registration { armed, in_reactor });
        Ok(())
    }

    /// Remove the registration. When the reactor already dropped the entry
    /// because the callback returned `false`, the reactor is not called.
    pub(crate) fn unregister(&mut self, reactor: &mut dyn Reactor, key: HandleId) -> LinkResult<()> {
        let record = self.record.take().ok_or_else(|| {
            LinkError::argument(format!("handle {} has no event registration", key))
        })?;
        record.armed.store(false, Ordering::Release);
        if !record.in_reactor.swap(false, Ordering::AcqRel) {
            debug!("Handle {} was already dropped by the reactor", key);
            return Ok(());
        }
        debug!("Unregistered handle {} from events", key);
        reactor.unregister(key)
    }

    /// Make an outstanding registration inert without reaching the reactor.
    /// The record is kept so the owner can still unregister explicitly.
    pub(crate) fn disarm(&mut self) {
        if let Some(record) = &self.record {
            record.armed.store(false, Ordering::Release);
        }
    }
}

/// Minimal in-process reactor for driver tests: callbacks fire only when the
/// test calls [`ManualReactor::fire`].
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct ManualReactor {
    entries: std::collections::HashMap<HandleId, ManualEntry>,
}

#[cfg(any(test, feature = "test-utils"))]
struct ManualEntry {
    source: RawSource,
    interest: Interest,
    timeout: Option<Duration>,
    callback: EventCallback,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, key: HandleId) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn interest(&self, key: HandleId) -> Option<Interest> {
        self.entries.get(&key).map(|e| e.interest)
    }

    pub fn timeout(&self, key: HandleId) -> Option<Duration> {
        self.entries.get(&key).and_then(|e| e.timeout)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver `observed` to the registration under `key`. Returns the
    /// callback's verdict, removing the entry when it is `false`.
    pub fn fire(&mut self, key: HandleId, observed: Interest) -> Option<bool> {
        let entry = self.entries.get_mut(&key)?;
        let keep = (entry.callback)(entry.source, observed);
        if !keep {
            self.entries.remove(&key);
        }
        Some(keep)
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Reactor for ManualReactor {
    fn register(
        &mut self,
        key: HandleId,
        source: RawSource,
        interest: Interest,
        timeout: Option<Duration>,
        callback: EventCallback,
    ) -> LinkResult<()> {
        if self.entries.contains_key(&key) {
            return Err(LinkError::argument(format!(
                "handle {} is already registered",
                key
            )));
        }
        self.entries.insert(
            key,
            ManualEntry {
                source,
                interest,
                timeout,
                callback,
            },
        );
        Ok(())
    }

    fn unregister(&mut self, key: HandleId) -> LinkResult<()> {
        self.entries
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| LinkError::argument(format!("handle {} is not registered", key)))
    }
}

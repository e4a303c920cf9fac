//! Reference-counted transport sharing.
//!
//! Clients configured alike share one transport, and therefore one
//! connection pool. The registry maps a [`TransportKey`] to a slot holding
//! the transport and an atomic reference count. Acquiring an existing slot
//! only takes the read lock; the write lock is taken to create a slot and to
//! remove one whose count reached zero.
//!
//! A slot whose count reached zero is never revived: an acquire racing with
//! the last release sees the zero, creates a fresh transport and replaces
//! the slot, while the releaser closes the old transport and leaves the
//! replacement in place.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::address::Protocol;
use crate::config::ConnectionConfig;
use crate::transport::{PooledTransport, Transport};

/// Identity under which transports are shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportKey {
    /// Replica protocol.
    pub protocol: Protocol,
    /// Connection settings.
    pub connection: ConnectionConfig,
}

impl TransportKey {
    /// Create a key.
    pub fn new(protocol: Protocol, connection: ConnectionConfig) -> Self {
        Self {
            protocol,
            connection,
        }
    }
}

struct SharedSlot<T> {
    id: u64,
    transport: Arc<T>,
    refs: AtomicUsize,
}

impl<T> SharedSlot<T> {
    /// Increment the count unless it already reached zero.
    fn try_retain(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self
                .refs
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

type TransportFactory<T> = Box<dyn Fn(&TransportKey) -> T + Send + Sync>;

struct RegistryInner<T> {
    slots: RwLock<HashMap<TransportKey, Arc<SharedSlot<T>>>>,
    factory: TransportFactory<T>,
    next_id: AtomicU64,
}

impl<T: Transport> RegistryInner<T> {
    fn release(&self, key: &TransportKey, slot: &Arc<SharedSlot<T>>) {
        if slot.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        {
            let mut slots = self.slots.write();
            if slots
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                slots.remove(key);
            }
        }

        slot.transport.close();
        info!(
            instance = slot.id,
            protocol = %key.protocol,
            "released last reference, transport closed"
        );
    }
}

/// Registry handing out shared transports by [`TransportKey`].
pub struct SharedTransportRegistry<T: Transport = PooledTransport> {
    inner: Arc<RegistryInner<T>>,
}

impl<T: Transport + 'static> SharedTransportRegistry<T> {
    /// Create a registry building transports with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&TransportKey) -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(RegistryInner {
                slots: RwLock::new(HashMap::new()),
                factory: Box::new(factory),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Take a reference to the transport for `key`, creating it if none is
    /// live.
    pub fn acquire(&self, key: TransportKey) -> SharedTransportHandle<T> {
        let existing = self.inner.slots.read().get(&key).cloned();
        if let Some(slot) = existing {
            if slot.try_retain() {
                return self.handle(key, slot);
            }
        }

        let mut slots = self.inner.slots.write();
        if let Some(slot) = slots.get(&key).cloned() {
            if slot.try_retain() {
                drop(slots);
                return self.handle(key, slot);
            }
        }

        let slot = Arc::new(SharedSlot {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            transport: Arc::new((self.inner.factory)(&key)),
            refs: AtomicUsize::new(1),
        });
        slots.insert(key.clone(), slot.clone());
        drop(slots);

        info!(instance = slot.id, protocol = %key.protocol, "created shared transport");
        self.handle(key, slot)
    }

    fn handle(&self, key: TransportKey, slot: Arc<SharedSlot<T>>) -> SharedTransportHandle<T> {
        SharedTransportHandle {
            registry: self.inner.clone(),
            key,
            slot,
        }
    }

    /// Number of live transports.
    pub fn len(&self) -> usize {
        self.inner.slots.read().len()
    }

    /// Whether no transport is live.
    pub fn is_empty(&self) -> bool {
        self.inner.slots.read().is_empty()
    }

    /// References held on the live transport for `key`.
    pub fn ref_count(&self, key: &TransportKey) -> usize {
        self.inner
            .slots
            .read()
            .get(key)
            .map_or(0, |slot| slot.refs.load(Ordering::Acquire))
    }
}

impl<T: Transport + 'static> Clone for SharedTransportRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// One counted reference to a shared transport. Released on drop.
pub struct SharedTransportHandle<T: Transport = PooledTransport> {
    registry: Arc<RegistryInner<T>>,
    key: TransportKey,
    slot: Arc<SharedSlot<T>>,
}

impl<T: Transport> SharedTransportHandle<T> {
    /// The shared transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.slot.transport
    }

    /// Identity of the underlying instance; a new instance gets a new id.
    pub fn instance_id(&self) -> u64 {
        self.slot.id
    }

    /// References currently held on the instance.
    pub fn ref_count(&self) -> usize {
        self.slot.refs.load(Ordering::Acquire)
    }

    /// Key the transport is shared under.
    pub fn key(&self) -> &TransportKey {
        &self.key
    }

    /// Give the reference back. Same as dropping the handle.
    pub fn release(self) {}
}

impl<T: Transport> Clone for SharedTransportHandle<T> {
    fn clone(&self) -> Self {
        // the count is at least one while this handle lives
        self.slot.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            registry: self.registry.clone(),
            key: self.key.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<T: Transport> Drop for SharedTransportHandle<T> {
    fn drop(&mut self) {
        self.registry.release(&self.key, &self.slot);
    }
}

impl<T: Transport> fmt::Debug for SharedTransportHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTransportHandle")
            .field("instance", &self.slot.id)
            .field("protocol", &self.key.protocol)
            .field("refs", &self.ref_count())
            .finish()
    }
}

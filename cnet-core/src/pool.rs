//! Fixed-capacity object pools. One pool per object kind per stack instance.
//!
//! A pool is created once with its final capacity and never resized. Objects
//! are handed out as [`Handle`]s that carry the issuing pool's id, so a handle
//! can only go back to the pool that produced it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique pool identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

/// Stable small index of a slot inside one pool. Used as the identity of a
/// pooled object in the stack's collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owned reference to one object in a [`Pool`]. Not `Clone`: releasing
/// consumes it, so a handle cannot be released twice.
pub struct Handle<T> {
    pool: PoolId,
    slot: u32,
    gen: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn id(&self) -> SlotId {
        SlotId(self.slot)
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("pool", &self.pool)
            .field("slot", &self.slot)
            .field("gen", &self.gen)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool {0}: capacity must be non-zero")]
    ZeroCapacity(&'static str),
    #[error("pool {name}: capacity {capacity} exceeds the slot index range")]
    TooLarge { name: &'static str, capacity: usize },
    #[error("pool {name}: failed to allocate {capacity} objects")]
    Alloc { name: &'static str, capacity: usize },
    #[error("handle from pool {handle:?} released to pool {pool:?}")]
    ForeignHandle { handle: PoolId, pool: PoolId },
    #[error("stale handle for slot {0}")]
    StaleHandle(SlotId),
}

/// A release the pool refused. The handle is returned untouched.
pub struct Rejected<T> {
    pub handle: Handle<T>,
    pub reason: PoolError,
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("handle", &self.handle)
            .field("reason", &self.reason)
            .finish()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "release rejected: {}", self.reason)
    }
}

impl<T> std::error::Error for Rejected<T> {}

struct Slot<T> {
    value: T,
    gen: u32,
    in_use: bool,
}

/// Free-list allocator over a pre-allocated slot array.
pub struct Pool<T> {
    id: PoolId,
    name: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    exhausted: u64,
}

impl<T: Default> Pool<T> {
    /// Allocate every object up front. Fails instead of aborting when memory
    /// is short, so stack initialization can roll back.
    pub fn with_capacity(name: &'static str, capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity(name));
        }
        if capacity > u32::MAX as usize {
            return Err(PoolError::TooLarge { name, capacity });
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| PoolError::Alloc { name, capacity })?;
        let mut free = Vec::new();
        free.try_reserve_exact(capacity)
            .map_err(|_| PoolError::Alloc { name, capacity })?;
        for _ in 0..capacity {
            slots.push(Slot {
                value: T::default(),
                gen: 0,
                in_use: false,
            });
        }
        // Lowest slot is handed out first.
        free.extend((0..capacity as u32).rev());
        Ok(Self {
            id: PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            slots,
            free,
            exhausted: 0,
        })
    }

    /// Take a free object. `None` means the pool is exhausted; callers treat
    /// that as backpressure.
    pub fn acquire(&mut self) -> Option<Handle<T>> {
        let Some(slot) = self.free.pop() else {
            self.exhausted += 1;
            return None;
        };
        let entry = &mut self.slots[slot as usize];
        entry.in_use = true;
        Some(Handle {
            pool: self.id,
            slot,
            gen: entry.gen,
            _kind: PhantomData,
        })
    }

    /// Return an object. The object is reset to its default state.
    pub fn release(&mut self, handle: Handle<T>) -> Result<(), Rejected<T>> {
        if handle.pool != self.id {
            let reason = PoolError::ForeignHandle {
                handle: handle.pool,
                pool: self.id,
            };
            return Err(Rejected { handle, reason });
        }
        let entry = &mut self.slots[handle.slot as usize];
        if !entry.in_use || entry.gen != handle.gen {
            let reason = PoolError::StaleHandle(handle.id());
            return Err(Rejected { handle, reason });
        }
        entry.in_use = false;
        entry.gen = entry.gen.wrapping_add(1);
        entry.value = T::default();
        self.free.push(handle.slot);
        Ok(())
    }

    /// Return every outstanding object to the free list. Handles still held
    /// elsewhere become stale. Returns how many objects were reclaimed.
    pub fn reclaim_all(&mut self) -> usize {
        let mut reclaimed = 0;
        for (i, entry) in self.slots.iter_mut().enumerate() {
            if entry.in_use {
                entry.in_use = false;
                entry.gen = entry.gen.wrapping_add(1);
                entry.value = T::default();
                self.free.push(i as u32);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

impl<T> Pool<T> {
    pub fn get(&self, handle: &Handle<T>) -> Option<&T> {
        if handle.pool != self.id {
            return None;
        }
        let entry = self.slots.get(handle.slot as usize)?;
        (entry.in_use && entry.gen == handle.gen).then_some(&entry.value)
    }

    pub fn get_mut(&mut self, handle: &Handle<T>) -> Option<&mut T> {
        if handle.pool != self.id {
            return None;
        }
        let entry = self.slots.get_mut(handle.slot as usize)?;
        (entry.in_use && entry.gen == handle.gen).then_some(&mut entry.value)
    }

    /// Look up a live object by slot. The stack's collections own the
    /// handles; everything else refers to objects by `SlotId`.
    pub fn slot(&self, id: SlotId) -> Option<&T> {
        let entry = self.slots.get(id.index())?;
        entry.in_use.then_some(&entry.value)
    }

    pub fn slot_mut(&mut self, id: SlotId) -> Option<&mut T> {
        let entry = self.slots.get_mut(id.index())?;
        entry.in_use.then_some(&mut entry.value)
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Number of acquisitions refused because the pool was empty.
    pub fn exhausted(&self) -> u64 {
        self.exhausted
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

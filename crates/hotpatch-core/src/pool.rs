//! Fixed-growth pool allocators
//!
//! Registry records (compilands, dependencies, symbol contributions) are
//! allocated from typed pools rather than individually boxed. A pool grows in
//! fixed blocks, recycles freed slots through a free list, and hands out
//! generation-checked handles so a handle kept across a free is detected
//! instead of silently reading a recycled slot.

use std::marker::PhantomData;
use std::sync::Mutex;

/// Slots added per growth step.
const BLOCK: usize = 64;

/// Generation-checked reference to a pooled value.
///
/// Copyable and comparable; does not borrow the pool. A handle whose slot has
/// been freed (and possibly reused) fails validation rather than aliasing the
/// new occupant.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({}@{})", self.index, self.generation)
    }
}

/// Point-in-time allocator counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Total allocations over the pool's lifetime.
    pub allocations: u64,
    /// Currently live values.
    pub live: usize,
    /// Total slots, live or free.
    pub capacity: usize,
    /// Memory backing the slots, in bytes.
    pub bytes: usize,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    allocations: u64,
}

/// Thread-safe slab pool with fixed block growth.
pub struct Pool<T> {
    name: &'static str,
    inner: Mutex<Inner<T>>,
}

impl<T> Pool<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                allocations: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // Inner never panics while holding the lock, so poisoning cannot
        // leave a half-updated free list behind.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn alloc(&self, value: T) -> Handle<T> {
        let mut inner = self.lock();
        inner.allocations += 1;
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let start = inner.slots.len();
                inner.slots.reserve(BLOCK);
                for _ in 0..BLOCK {
                    inner.slots.push(Slot {
                        generation: 0,
                        value: None,
                    });
                }
                // Newest slots go to the back of the free list so index 0 of
                // the block is handed out first.
                for i in (start + 1..start + BLOCK).rev() {
                    inner.free.push(i as u32);
                }
                start as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.value = Some(value);
        Handle {
            index,
            generation: slot.generation,
            _marker: PhantomData,
        }
    }

    /// Free the value behind `handle`. Fails on a stale or double-freed
    /// handle.
    pub fn free(&self, handle: Handle<T>) -> crate::Result<T> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .get_mut(handle.index as usize)
            .ok_or(crate::Error::StaleHandle)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return Err(crate::Error::StaleHandle);
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        value.ok_or(crate::Error::StaleHandle)
    }

    /// Read access to the value behind `handle`.
    pub fn with<R>(&self, handle: Handle<T>, f: impl FnOnce(&T) -> R) -> crate::Result<R> {
        let inner = self.lock();
        let slot = inner
            .slots
            .get(handle.index as usize)
            .ok_or(crate::Error::StaleHandle)?;
        match &slot.value {
            Some(value) if slot.generation == handle.generation => Ok(f(value)),
            _ => Err(crate::Error::StaleHandle),
        }
    }

    /// Mutable access to the value behind `handle`.
    pub fn with_mut<R>(&self, handle: Handle<T>, f: impl FnOnce(&mut T) -> R) -> crate::Result<R> {
        let mut inner = self.lock();
        let slot = inner
            .slots
            .get_mut(handle.index as usize)
            .ok_or(crate::Error::StaleHandle)?;
        match &mut slot.value {
            Some(value) if slot.generation == handle.generation => Ok(f(value)),
            _ => Err(crate::Error::StaleHandle),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            allocations: inner.allocations,
            live: inner.slots.len() - inner.free.len(),
            capacity: inner.slots.len(),
            bytes: inner.slots.capacity() * std::mem::size_of::<Slot<T>>(),
        }
    }

    /// Drop every live value and invalidate all outstanding handles. Capacity
    /// and the lifetime allocation counter are kept.
    pub fn purge(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.free.clear();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            inner.free.push(index as u32);
        }
        // Hand out low indices first after a purge.
        inner.free.reverse();
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("live", &stats.live)
            .field("capacity", &stats.capacity)
            .finish()
    }
}

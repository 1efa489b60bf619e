//! Reference-counted handles.
//!
//! Every primitive is addressed by one pointer-sized word, the way a C
//! `pthread_mutex_t` is. The word holds one of three things:
//!
//! - `0`: null. Never initialized through `init`, or already destroyed.
//! - bit 63 set: a static initializer. The low bits carry a per-kind code
//!   (the mutex type, for instance). The first operation that needs real
//!   state allocates it and swaps it in with a compare-and-swap.
//! - anything else: a live handle, `(generation << 32) | (slot + 1)`, naming
//!   a slot in the kind's [`Registry`].
//!
//! Slots carry a generation that is bumped on every removal, so a stale
//! handle never aliases a reused slot. Each live slot counts in-flight
//! operations ("busy"); destroy refuses while any are pending, and the handle
//! word is nulled before the slot's state is released.
//!
//! The registry table sits behind a [`SpinLock`]; every critical section is a
//! few loads and stores. Nothing blocks while it is held.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Exhaustion, PthreadError, Result};
use crate::spinlock::SpinLock;
use crate::trace::{self, ObjectKind};

pub(crate) const NULL_HANDLE: u64 = 0;

const STATIC_TAG: u64 = 1 << 63;
const GENERATION_MASK: u32 = 0x7FFF_FFFF;
const MAX_SLOTS: usize = u32::MAX as usize - 1;

/// Handle word for a static initializer carrying `code`.
#[must_use]
pub(crate) const fn static_handle(code: u32) -> u64 {
    STATIC_TAG | code as u64
}

#[inline]
const fn is_static(word: u64) -> bool {
    word & STATIC_TAG != 0
}

#[inline]
const fn static_code(word: u64) -> u32 {
    word as u32
}

#[inline]
fn live_word(index: usize, generation: u32) -> u64 {
    (u64::from(generation & GENERATION_MASK) << 32) | (index as u64 + 1)
}

#[inline]
fn decode(word: u64) -> (usize, u32) {
    let low = (word & 0xFFFF_FFFF) as usize;
    (low.wrapping_sub(1), (word >> 32) as u32)
}

/// Lifecycle state of a handle word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Validity {
    /// Static initializer whose state has not been materialized yet.
    UninitializedStatic,
    Live,
    /// Null, destroyed, or stale.
    Dead,
}

struct Entry<T> {
    state: Arc<T>,
    busy: usize,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

struct Table<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

impl<T> Table<T> {
    fn entry_mut(&mut self, word: u64) -> Option<&mut Entry<T>> {
        let (index, generation) = decode(word);
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn insert(&mut self, state: Arc<T>) -> Result<u64> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(PthreadError::ResourceExhausted(Exhaustion::Memory));
                }
                self.slots
                    .try_reserve(1)
                    .map_err(|_| PthreadError::ResourceExhausted(Exhaustion::Memory))?;
                self.free
                    .try_reserve(self.slots.len() + 1)
                    .map_err(|_| PthreadError::ResourceExhausted(Exhaustion::Memory))?;
                self.slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.entry = Some(Entry { state, busy: 0 });
        self.live += 1;
        Ok(live_word(index, slot.generation))
    }

    /// Empty the slot named by `word`, bumping its generation.
    fn vacate(&mut self, word: u64) -> Option<Arc<T>> {
        let (index, generation) = decode(word);
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
        // Capacity was reserved when the slot was created.
        self.free.push(index);
        self.live -= 1;
        Some(entry.state)
    }
}

/// Arena of live objects of one primitive kind.
pub(crate) struct Registry<T> {
    table: SpinLock<Table<T>>,
    kind: ObjectKind,
}

impl<T> Registry<T> {
    pub(crate) const fn new(kind: ObjectKind) -> Self {
        Self {
            table: SpinLock::new(Table {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            kind,
        }
    }

    /// Register fresh state, returning its live handle word.
    pub(crate) fn create(&self, state: T) -> Result<u64> {
        let state = Arc::new(state);
        let word = self.table.lock().insert(state)?;
        trace::event(self.kind, word, "init");
        Ok(word)
    }

    fn discard(&self, word: u64) {
        let state = self.table.lock().vacate(word);
        drop(state);
    }

    /// Pin the object named by `word` for one operation (`ref`).
    ///
    /// A static initializer is materialized first: `materialize` builds the
    /// state from the static code, and the handle word is swapped from the
    /// sentinel to the new live word. A thread that loses that race discards
    /// its speculative slot and pins the winner's.
    pub(crate) fn acquire<F>(
        &self,
        word: &AtomicU64,
        materialize: F,
    ) -> Result<HandleRef<'_, T>>
    where
        F: Fn(u32) -> Result<T>,
    {
        loop {
            let w = word.load(Ordering::Acquire);
            if w == NULL_HANDLE {
                return Err(PthreadError::InvalidHandle);
            }
            if is_static(w) {
                let state = Arc::new(materialize(static_code(w))?);
                let fresh = self.table.lock().insert(state)?;
                match word.compare_exchange(w, fresh, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => trace::event(self.kind, fresh, "materialize"),
                    Err(current) => {
                        self.discard(fresh);
                        trace::anomaly(
                            self.kind,
                            w,
                            "materialize_race_lost",
                            serde_json::json!({ "winner": format!("{current:#018x}") }),
                        );
                    }
                }
                continue;
            }
            if let Some(pin) = self.pin(word, w)? {
                return Ok(pin);
            }
        }
    }

    /// Pin without materializing (`ref_unlock`). `Ok(None)` for a static
    /// initializer: such an object has never been locked or waited on.
    pub(crate) fn acquire_existing(
        &self,
        word: &AtomicU64,
    ) -> Result<Option<HandleRef<'_, T>>> {
        loop {
            let w = word.load(Ordering::Acquire);
            if w == NULL_HANDLE {
                return Err(PthreadError::InvalidHandle);
            }
            if is_static(w) {
                return Ok(None);
            }
            if let Some(pin) = self.pin(word, w)? {
                return Ok(Some(pin));
            }
        }
    }

    /// `Ok(None)` means the word moved under us; the caller retries.
    fn pin(&self, word: &AtomicU64, w: u64) -> Result<Option<HandleRef<'_, T>>> {
        let mut table = self.table.lock();
        if word.load(Ordering::Acquire) != w {
            return Ok(None);
        }
        let entry = table.entry_mut(w).ok_or(PthreadError::InvalidHandle)?;
        entry.busy += 1;
        let state = Arc::clone(&entry.state);
        Ok(Some(HandleRef {
            registry: self,
            word: w,
            state,
        }))
    }

    /// Take the object out of the registry for destruction.
    ///
    /// Refuses with `Busy` while operations are pinned on it or while `idle`
    /// reports outstanding lock state; `idle` runs under the registry lock and
    /// must not block. On success the handle word is nulled first and the
    /// state is handed back to the caller. A static initializer that never
    /// materialized is simply nulled (`Ok(None)`).
    pub(crate) fn ref_for_destroy(
        &self,
        word: &AtomicU64,
        idle: impl Fn(&T) -> bool,
    ) -> Result<Option<Arc<T>>> {
        loop {
            let w = word.load(Ordering::Acquire);
            if w == NULL_HANDLE {
                return Err(PthreadError::InvalidHandle);
            }
            if is_static(w) {
                if word
                    .compare_exchange(w, NULL_HANDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    trace::event(self.kind, w, "destroy");
                    return Ok(None);
                }
                continue;
            }
            let state = {
                let mut table = self.table.lock();
                if word.load(Ordering::Acquire) != w {
                    continue;
                }
                let entry = table.entry_mut(w).ok_or(PthreadError::InvalidHandle)?;
                if entry.busy > 0 || !idle(&entry.state) {
                    return Err(PthreadError::Busy);
                }
                word.store(NULL_HANDLE, Ordering::Release);
                table.vacate(w)
            };
            trace::event(self.kind, w, "destroy");
            return Ok(state);
        }
    }

    /// Initialize `word` in place (`ref_init`). A live word is `Busy`.
    pub(crate) fn ref_init(&self, word: &AtomicU64, state: T) -> Result<()> {
        let w = word.load(Ordering::Acquire);
        if self.validity(w) == Validity::Live {
            return Err(PthreadError::Busy);
        }
        let fresh = self.create(state)?;
        if word
            .compare_exchange(w, fresh, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.discard(fresh);
            return Err(PthreadError::Busy);
        }
        Ok(())
    }

    /// Drop the slot owned by a handle that is going out of scope.
    pub(crate) fn release(&self, word: &mut AtomicU64) {
        let w = std::mem::replace(word.get_mut(), NULL_HANDLE);
        if w != NULL_HANDLE && !is_static(w) {
            self.discard(w);
        }
    }

    pub(crate) fn validity(&self, word: u64) -> Validity {
        if word == NULL_HANDLE {
            return Validity::Dead;
        }
        if is_static(word) {
            return Validity::UninitializedStatic;
        }
        if self.table.lock().entry_mut(word).is_some() {
            Validity::Live
        } else {
            Validity::Dead
        }
    }

    /// In-flight operation count of a live handle.
    pub(crate) fn busy_count(&self, word: u64) -> Option<usize> {
        self.table.lock().entry_mut(word).map(|e| e.busy)
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.table.lock().live
    }
}

/// One pinned operation on a live object. Unpins (`unref`) on drop.
pub(crate) struct HandleRef<'r, T> {
    registry: &'r Registry<T>,
    word: u64,
    state: Arc<T>,
}

impl<T> HandleRef<'_, T> {
    /// Live handle word this pin refers to.
    pub(crate) fn word(&self) -> u64 {
        self.word
    }

    pub(crate) fn arc(&self) -> Arc<T> {
        Arc::clone(&self.state)
    }

    /// Unpin and pass `result` through, mirroring `unref(handle, result)`.
    pub(crate) fn unref<R>(self, result: R) -> R {
        drop(self);
        result
    }
}

impl<T> Deref for HandleRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

impl<T> Drop for HandleRef<'_, T> {
    fn drop(&mut self) {
        let mut table = self.registry.table.lock();
        if let Some(entry) = table.entry_mut(self.word) {
            entry.busy = entry.busy.saturating_sub(1);
        }
    }
}

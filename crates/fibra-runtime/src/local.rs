//! Fiber-local storage
//!
//! A [`FiberLocal`] owns a process-wide slot index, taken on first use and
//! returned when the key is dropped. Every entity carries a small inline
//! area for values without drop glue and a lazily grown table of boxed
//! values for everything else. Slots are tagged with the key's generation,
//! so an index recycled to a new key never exposes the old key's value.
//!
//! Off-fiber, each OS thread has its own storage.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::mem::{self, MaybeUninit};
use std::sync::atomic::{AtomicU64, Ordering};

use fibra_core::{SlotAllocator, SlotKey};

use crate::scheduler;

/// Inline slots per entity
const INLINE_SLOTS: usize = 16;

/// Upper bound on live boxed keys
const MAX_BOXED_KEYS: usize = 1 << 16;

const INLINE_BIT: u64 = 1 << 63;

static INLINE_KEYS: SlotAllocator = SlotAllocator::new(INLINE_SLOTS);
static BOXED_KEYS: SlotAllocator = SlotAllocator::new(MAX_BOXED_KEYS);

type InlineBytes = [u64; 2];

struct InlineSlot {
    generation: Cell<u32>,
    value: UnsafeCell<MaybeUninit<InlineBytes>>,
}

/// Per-entity (or per-thread) value table
pub(crate) struct FlsStorage {
    inline: [InlineSlot; INLINE_SLOTS],
    boxed: UnsafeCell<Vec<Option<(u32, Box<dyn Any>)>>>,
}

impl FlsStorage {
    pub(crate) fn new() -> Self {
        Self {
            inline: std::array::from_fn(|_| InlineSlot {
                generation: Cell::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            }),
            boxed: UnsafeCell::new(Vec::new()),
        }
    }

    /// Drop every value. Called when the owning fiber exits.
    pub(crate) fn clear(&self) {
        for slot in &self.inline {
            slot.generation.set(0);
        }
        // Take the table out first: a destructor may touch fiber-locals
        let table = unsafe { mem::take(&mut *self.boxed.get()) };
        drop(table);
    }

    fn inline_ptr<T>(&self, key: SlotKey, init: fn() -> T) -> *const T {
        let slot = &self.inline[key.index];
        let ptr = slot.value.get() as *mut T;
        if slot.generation.get() != key.generation {
            // Safety: the key only goes inline when T fits and has no drop
            // glue; the slot is owned by this fiber or thread
            unsafe { ptr.write(init()) };
            slot.generation.set(key.generation);
        }
        ptr
    }

    fn boxed_ptr<T: 'static>(&self, key: SlotKey, init: fn() -> T) -> *const T {
        {
            let table = unsafe { &*self.boxed.get() };
            if let Some(Some((generation, value))) = table.get(key.index) {
                if *generation == key.generation {
                    if let Some(v) = value.downcast_ref::<T>() {
                        return v;
                    }
                }
            }
        }
        // init may itself use fiber-locals, so no borrow of the table is
        // held across it
        let value: Box<dyn Any> = Box::new(init());
        let table = unsafe { &mut *self.boxed.get() };
        if table.len() <= key.index {
            table.resize_with(key.index + 1, || None);
        }
        let old = table[key.index].replace((key.generation, value));
        let ptr = match &table[key.index] {
            Some((_, v)) => v.downcast_ref::<T>().map(|v| v as *const T),
            None => None,
        };
        drop(old);
        match ptr {
            Some(p) => p,
            None => unreachable!("fiber-local slot holds a foreign type"),
        }
    }
}

thread_local! {
    static THREAD_STORAGE: FlsStorage = FlsStorage::new();
}

fn with_storage<R>(f: impl FnOnce(&FlsStorage) -> R) -> R {
    match scheduler::current_entity() {
        Some(entity) => f(&entity.fls),
        None => THREAD_STORAGE.with(f),
    }
}

/// Per-fiber value, initialized on first access in each fiber.
///
/// ```ignore
/// static REQUESTS: FiberLocal<Cell<u32>> = FiberLocal::new(|| Cell::new(0));
///
/// REQUESTS.set(REQUESTS.get() + 1);
/// ```
pub struct FiberLocal<T: 'static> {
    /// Packed slot key, 0 until the first access
    key: AtomicU64,
    init: fn() -> T,
}

impl<T: Send + 'static> FiberLocal<T> {
    const FITS_INLINE: bool = !mem::needs_drop::<T>()
        && mem::size_of::<T>() <= mem::size_of::<InlineBytes>()
        && mem::align_of::<T>() <= mem::align_of::<InlineBytes>();

    pub const fn new(init: fn() -> T) -> Self {
        Self {
            key: AtomicU64::new(0),
            init,
        }
    }

    fn key(&self) -> (bool, SlotKey) {
        let packed = self.key.load(Ordering::Acquire);
        if packed != 0 {
            return unpack(packed);
        }
        let (inline, key) = self.allocate();
        match self
            .key
            .compare_exchange(0, pack(inline, key), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => (inline, key),
            Err(winner) => {
                release(inline, key);
                unpack(winner)
            }
        }
    }

    fn allocate(&self) -> (bool, SlotKey) {
        if Self::FITS_INLINE {
            if let Some(key) = INLINE_KEYS.allocate() {
                return (true, key);
            }
        }
        match BOXED_KEYS.allocate() {
            Some(key) => (false, key),
            None => panic!("too many fiber-local keys"),
        }
    }

    /// Run `f` with this fiber's value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let (inline, key) = self.key();
        let init = self.init;
        with_storage(move |storage| {
            let ptr = if inline {
                storage.inline_ptr(key, init)
            } else {
                storage.boxed_ptr(key, init)
            };
            // Safety: the value stays put until the owning fiber exits or
            // the slot is reinitialized under a newer generation
            f(unsafe { &*ptr })
        })
    }
}

impl<T: Copy + Send + 'static> FiberLocal<Cell<T>> {
    pub fn get(&self) -> T {
        self.with(Cell::get)
    }

    pub fn set(&self, value: T) {
        self.with(|c| c.set(value))
    }
}

impl<T: 'static> Drop for FiberLocal<T> {
    fn drop(&mut self) {
        let packed = *self.key.get_mut();
        if packed != 0 {
            let (inline, key) = unpack(packed);
            release(inline, key);
        }
    }
}

fn pack(inline: bool, key: SlotKey) -> u64 {
    let flag = if inline { INLINE_BIT } else { 0 };
    flag | (u64::from(key.generation) << 32) | key.index as u64
}

fn unpack(packed: u64) -> (bool, SlotKey) {
    let inline = packed & INLINE_BIT != 0;
    let key = SlotKey {
        index: (packed & 0xFFFF_FFFF) as usize,
        generation: ((packed & !INLINE_BIT) >> 32) as u32,
    };
    (inline, key)
}

fn release(inline: bool, key: SlotKey) {
    if inline {
        INLINE_KEYS.release(key);
    } else {
        BOXED_KEYS.release(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::testing::run_as_fiber;
    use std::sync::Arc;

    #[test]
    fn test_pack_round_trip() {
        let key = SlotKey { index: 12, generation: 7 };
        assert_eq!(unpack(pack(true, key)), (true, key));
        assert_eq!(unpack(pack(false, key)), (false, key));
    }

    #[test]
    fn test_thread_local_fallback() {
        static COUNTER: FiberLocal<Cell<u32>> = FiberLocal::new(|| Cell::new(5));
        assert_eq!(COUNTER.get(), 5);
        COUNTER.set(6);
        assert_eq!(COUNTER.get(), 6);
        std::thread::spawn(|| assert_eq!(COUNTER.get(), 5)).join().unwrap();
    }

    #[test]
    fn test_recycled_key_starts_fresh() {
        let a = FiberLocal::new(|| String::from("a"));
        a.with(|s| assert_eq!(s, "a"));
        let (_, key_a) = a.key();
        drop(a);
        // LIFO reuse hands the same index to the next key, one generation on
        let b = FiberLocal::new(|| String::from("b"));
        let (_, key_b) = b.key();
        if key_b.index == key_a.index {
            assert_ne!(key_b.generation, key_a.generation);
        }
        b.with(|s| assert_eq!(s, "b"));
    }

    #[test]
    fn test_fibers_get_own_values() {
        static ID: FiberLocal<Cell<usize>> = FiberLocal::new(|| Cell::new(0));
        static NAME: FiberLocal<std::cell::RefCell<String>> =
            FiberLocal::new(|| std::cell::RefCell::new(String::new()));

        run_as_fiber(|| {
            let seen = Arc::new(crate::sync::Mutex::new(Vec::new()));
            let fibers: Vec<_> = (1..=8)
                .map(|i| {
                    let seen = Arc::clone(&seen);
                    Fiber::spawn(move || {
                        assert_eq!(ID.get(), 0);
                        ID.set(i);
                        NAME.with(|n| n.borrow_mut().push_str(&i.to_string()));
                        crate::yield_now();
                        crate::sleep_for(std::time::Duration::from_millis(1));
                        assert_eq!(ID.get(), i);
                        NAME.with(|n| assert_eq!(*n.borrow(), i.to_string()));
                        seen.lock().push(i);
                    })
                })
                .collect();
            for mut f in fibers {
                f.join();
            }
            assert_eq!(seen.lock().len(), 8);
        });
    }
}

//! Ranked mutexes enforcing the topology lock hierarchy.
//!
//! Every topology object lock carries a [`LockClass`]. A thread may only
//! acquire a lock whose rank is strictly greater than every ranked lock it
//! already holds. Debug builds check this on each acquisition and panic on
//! violation; release builds compile the check out. [`LockClass::Anon`]
//! locks are leaves and are never tracked.

use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

/// Position of a lock in the acquisition hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockClass {
    /// Unranked helper lock.
    Anon,
    /// Region configuration lock.
    Region,
    /// Port lock, ranked by the port's depth below the root.
    Port {
        /// Port depth, root is zero.
        depth: u32,
    },
    /// Decoder lock, ranked by the owning port's depth.
    Decoder {
        /// Depth of the port owning the decoder.
        port_depth: u32,
    },
}

impl LockClass {
    /// Numeric rank; acquisitions must strictly increase it.
    #[must_use]
    pub const fn rank(self) -> u32 {
        match self {
            Self::Anon => 0,
            Self::Region => 3,
            Self::Port { depth } => 4 + depth,
            Self::Decoder { port_depth } => 5 + port_depth,
        }
    }
}

/// Mutex tagged with a [`LockClass`].
pub struct OrderedMutex<T> {
    class: LockClass,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Wraps `value` in a mutex of the given class.
    pub const fn new(class: LockClass, value: T) -> Self {
        Self {
            class,
            inner: Mutex::new(value),
        }
    }

    /// Class this mutex was created with.
    #[must_use]
    pub const fn class(&self) -> LockClass {
        self.class
    }

    /// Acquires the lock, checking rank order in debug builds.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        #[cfg(debug_assertions)]
        order::acquire(self.class);
        OrderedGuard {
            guard: self.inner.lock(),
            class: self.class,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("class", &self.class)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Guard returned by [`OrderedMutex::lock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    class: LockClass,
}

impl<T> OrderedGuard<'_, T> {
    /// Class of the mutex this guard holds.
    #[must_use]
    pub const fn class(&self) -> LockClass {
        self.class
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        order::release(self.class);
    }
}

#[cfg(debug_assertions)]
mod order {
    use std::cell::RefCell;

    use super::LockClass;

    thread_local! {
        static HELD: RefCell<Vec<LockClass>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquire(class: LockClass) {
        if class == LockClass::Anon {
            return;
        }
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(highest) = held.iter().copied().max_by_key(|held| held.rank()) {
                assert!(
                    class.rank() > highest.rank(),
                    "lock order violation: acquiring {class:?} while holding {highest:?}"
                );
            }
            held.push(class);
        });
    }

    pub(super) fn release(class: LockClass) {
        if class == LockClass::Anon {
            return;
        }
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(index) = held.iter().rposition(|entry| *entry == class) {
                held.remove(index);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{LockClass, OrderedMutex};

    #[test]
    fn ranks_follow_region_port_decoder_hierarchy() {
        assert!(LockClass::Region.rank() < LockClass::Port { depth: 0 }.rank());
        assert!(LockClass::Port { depth: 0 }.rank() < LockClass::Decoder { port_depth: 0 }.rank());
        assert_eq!(
            LockClass::Decoder { port_depth: 0 }.rank(),
            LockClass::Port { depth: 1 }.rank()
        );
    }

    #[test]
    fn increasing_acquisitions_are_accepted() {
        let region = OrderedMutex::new(LockClass::Region, 1_u32);
        let decoder = OrderedMutex::new(LockClass::Decoder { port_depth: 2 }, 2_u32);
        let outer = region.lock();
        let inner = decoder.lock();
        assert_eq!(*outer + *inner, 3);
    }

    #[test]
    fn guard_release_allows_reacquiring_lower_ranks() {
        let port = OrderedMutex::new(LockClass::Port { depth: 1 }, ());
        let region = OrderedMutex::new(LockClass::Region, ());
        drop(port.lock());
        let _region = region.lock();
        let _port = port.lock();
    }

    #[test]
    fn anon_locks_nest_anywhere() {
        let decoder = OrderedMutex::new(LockClass::Decoder { port_depth: 3 }, ());
        let leaf = OrderedMutex::new(LockClass::Anon, ());
        let _decoder = decoder.lock();
        let guard = leaf.lock();
        assert_eq!(guard.class(), LockClass::Anon);
    }

    #[test]
    fn guards_mutate_through_deref() {
        let lock = OrderedMutex::new(LockClass::Anon, vec![1_u8]);
        lock.lock().push(2);
        assert_eq!(*lock.lock(), vec![1, 2]);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn decreasing_acquisition_panics_in_debug_builds() {
        let decoder = OrderedMutex::new(LockClass::Decoder { port_depth: 0 }, ());
        let port = OrderedMutex::new(LockClass::Port { depth: 0 }, ());
        let _decoder = decoder.lock();
        let _port = port.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn equal_rank_nesting_panics_in_debug_builds() {
        let first = OrderedMutex::new(LockClass::Decoder { port_depth: 1 }, ());
        let second = OrderedMutex::new(LockClass::Decoder { port_depth: 1 }, ());
        let _first = first.lock();
        let _second = second.lock();
    }
}

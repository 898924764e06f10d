//! Weak back-references that empty themselves when their owner goes away.
//!
//! An owner keeps a [`WeakRegistry`]; every [`WeakHandle`] it hands out is
//! recorded in the registry's link table. When the registry is dropped (or
//! [`WeakRegistry::break_handles`] is called) it walks the table once and
//! empties every outstanding handle before returning. A handle therefore
//! either yields the full target or nothing, never something in between.
//!
//! ```text
//! WeakRegistry ──links──► [slot0, slot1, ...]   (weak refs to handle slots)
//!      │                     ▲      ▲
//!      │                     │      │
//!      └─ drop: set all ─────┘   WeakHandle (owns its slot, remembers its key)
//!         slots to None
//! ```
//!
//! Registration is an O(1) arena insert, breaking is O(k) in the number of
//! outstanding handles. Cloning a handle registers the clone before it is
//! returned; moving a handle is a plain move and keeps its registration.
//! Everything here is single-threaded, like the scheduler that uses it.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use slotmap::{DefaultKey, SlotMap};

type Slot<T> = RefCell<Option<T>>;
type LinkTable<T> = RefCell<SlotMap<DefaultKey, Weak<Slot<T>>>>;

/// Per-owner list of outstanding weak handles
pub struct WeakRegistry<T: Clone> {
    target: T,
    links: Rc<LinkTable<T>>,
}

impl<T: Clone> WeakRegistry<T> {
    /// Create a registry whose handles resolve to `target`
    #[must_use]
    pub fn new(target: T) -> Self {
        Self {
            target,
            links: Rc::new(RefCell::new(SlotMap::new())),
        }
    }

    /// The value handles resolve to while the owner lives
    #[must_use]
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Register and return a new handle
    #[must_use]
    pub fn handle(&self) -> WeakHandle<T> {
        register(&self.links, self.target.clone())
    }

    /// Number of outstanding handles
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.borrow().len()
    }

    /// Whether no handle is outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.borrow().is_empty()
    }

    /// Empty every outstanding handle now.
    ///
    /// Owners call this at the start of their own teardown so handles stop
    /// resolving before any field is dropped. Handles created afterwards are
    /// live again.
    pub fn break_handles(&self) {
        let slots: Vec<Weak<Slot<T>>> = self
            .links
            .borrow_mut()
            .drain()
            .map(|(_, slot)| slot)
            .collect();

        for slot in slots {
            if let Some(slot) = slot.upgrade() {
                *slot.borrow_mut() = None;
            }
        }
    }
}

impl<T: Clone> Drop for WeakRegistry<T> {
    fn drop(&mut self) {
        self.break_handles();
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for WeakRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRegistry")
            .field("target", &self.target)
            .field("handles", &self.len())
            .finish()
    }
}

fn register<T: Clone>(links: &Rc<LinkTable<T>>, target: T) -> WeakHandle<T> {
    let slot = Rc::new(RefCell::new(Some(target)));
    let key = links.borrow_mut().insert(Rc::downgrade(&slot));
    WeakHandle {
        slot,
        link: Some(Link {
            links: Rc::downgrade(links),
            key,
        }),
    }
}

struct Link<T> {
    links: Weak<LinkTable<T>>,
    key: DefaultKey,
}

/// Non-owning reference that reads as empty after its owner is destroyed
pub struct WeakHandle<T: Clone> {
    slot: Rc<Slot<T>>,
    link: Option<Link<T>>,
}

impl<T: Clone> WeakHandle<T> {
    /// A handle that was never bound
    #[must_use]
    pub fn empty() -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
            link: None,
        }
    }

    /// The target, or `None` once the owner is gone
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Run `f` on a clone of the target.
    ///
    /// The slot is not borrowed while `f` runs, so `f` may drop the owner.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.get().as_ref().map(f)
    }

    /// Whether the handle reads as empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_none()
    }

    /// Drop the reference without waiting for the owner
    pub fn reset(&mut self) {
        self.unlink();
        *self.slot.borrow_mut() = None;
    }

    fn unlink(&mut self) {
        if let Some(link) = self.link.take() {
            if let Some(links) = link.links.upgrade() {
                // A stale key (after break_handles) is a no-op.
                links.borrow_mut().remove(link.key);
            }
        }
    }
}

impl<T: Clone> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        let links = self.link.as_ref().and_then(|link| link.links.upgrade());
        match (self.get(), links) {
            (Some(target), Some(links)) => register(&links, target),
            _ => Self::empty(),
        }
    }
}

impl<T: Clone> Default for WeakHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Clone> Drop for WeakHandle<T> {
    fn drop(&mut self) {
        self.unlink();
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(target) => f.debug_tuple("WeakHandle").field(&target).finish(),
            None => f.write_str("WeakHandle(<empty>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_handle_resolves_while_owner_lives() {
        let registry = WeakRegistry::new(42u32);
        let handle = registry.handle();

        assert_eq!(handle.get(), Some(42));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handle_empties_on_owner_drop() {
        let registry = WeakRegistry::new("panel".to_string());
        let a = registry.handle();
        let b = registry.handle();

        drop(registry);

        assert!(a.is_empty());
        assert!(b.is_empty());
        assert_eq!(a.get(), None);
        assert_eq!(b.with(|s| s.len()), None);
    }

    #[test]
    fn test_dropped_handle_unregisters() {
        let registry = WeakRegistry::new(1u8);
        let handle = registry.handle();
        assert_eq!(registry.len(), 1);

        drop(handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clone_registers_separately() {
        let registry = WeakRegistry::new(7i64);
        let a = registry.handle();
        let b = a.clone();
        assert_eq!(registry.len(), 2);

        drop(a);
        assert_eq!(registry.len(), 1);
        assert_eq!(b.get(), Some(7));

        drop(registry);
        assert!(b.is_empty());
    }

    #[test]
    fn test_moved_handle_stays_registered() {
        let registry = WeakRegistry::new(3u16);
        let handle = registry.handle();
        let holder = vec![handle];

        assert_eq!(registry.len(), 1);
        assert_eq!(holder[0].get(), Some(3));

        drop(registry);
        assert!(holder[0].is_empty());
    }

    #[test]
    fn test_clone_of_empty_handle_is_empty() {
        let registry = WeakRegistry::new(5u8);
        let handle = registry.handle();
        drop(registry);

        let clone = handle.clone();
        assert!(clone.is_empty());
        assert!(WeakHandle::<u8>::empty().clone().is_empty());
    }

    #[test]
    fn test_break_handles_early() {
        let registry = WeakRegistry::new(9u32);
        let old = registry.handle();

        registry.break_handles();
        assert!(old.is_empty());
        assert!(registry.is_empty());

        let fresh = registry.handle();
        assert_eq!(fresh.get(), Some(9));

        // The stale handle's key no longer maps to anything.
        drop(old);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reset_detaches_handle() {
        let registry = WeakRegistry::new(11u32);
        let mut handle = registry.handle();

        handle.reset();
        assert!(handle.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handle_outlives_registry_drop_safely() {
        let handle = {
            let registry = WeakRegistry::new(vec![1, 2, 3]);
            registry.handle()
        };
        // Dropping the handle after its registry must not touch freed state.
        assert!(handle.is_empty());
        drop(handle);
    }

    #[test]
    fn test_owner_dropped_inside_with() {
        let owner = RefCell::new(Some(WeakRegistry::new(5u32)));
        let handle = owner.borrow().as_ref().unwrap().handle();

        let seen = handle.with(|v| {
            owner.borrow_mut().take();
            *v
        });
        assert_eq!(seen, Some(5));
        assert!(handle.is_empty());
    }

    proptest! {
        #[test]
        fn prop_every_handle_empties_after_drop(count in 0usize..64, keep_every in 1usize..5) {
            let registry = WeakRegistry::new(count);
            let handles: Vec<_> = (0..count).map(|_| registry.handle()).collect();
            let kept: Vec<_> = handles
                .into_iter()
                .enumerate()
                .filter(|(i, _)| i % keep_every == 0)
                .map(|(_, h)| h)
                .collect();

            prop_assert_eq!(registry.len(), kept.len());
            prop_assert!(kept.iter().all(|h| h.get() == Some(count)));

            drop(registry);
            prop_assert!(kept.iter().all(WeakHandle::is_empty));
        }
    }
}

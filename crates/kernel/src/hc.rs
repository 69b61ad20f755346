use std::hash;
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::{Arc, Weak, Mutex};

use ahash::AHashMap;

/// Maximally shared handle. Two `Hc` values built from equal data through the
/// same factory are pointer-identical, so equality and hashing are O(1).
#[derive(Debug)]
pub struct Hc<T>(Arc<T>);

impl<T> Clone for Hc<T> {
    fn clone(&self) -> Self { Hc(self.0.clone()) }
}

impl<T> Hc<T> {
    fn inner(&self) -> &Arc<T> {
        let Hc(inner) = self;
        inner
    }

    pub fn as_ptr(&self) -> *const T {
        Arc::as_ptr(self.inner())
    }
}

impl<T: Clone> Hc<T> {
    pub fn cloned(&self) -> T {
        self.inner().as_ref().clone()
    }
}

impl<T> PartialEq for Hc<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(self.inner(), other.inner())
    }
}
impl<T> Eq for Hc<T> { }

impl<T> hash::Hash for Hc<T> {
    #[inline]
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        ptr::hash(Arc::as_ptr(self.inner()), state);
    }
}

impl<T> Deref for Hc<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner()
    }
}

impl<T : fmt::Display> fmt::Display for Hc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Hc(inner) = self;
        inner.fmt(f)
    }
}

impl<T> Hc<T> {
    fn to_weak(&self) -> WeakHc<T> {
        let weak = Arc::downgrade(self.inner());
        WeakHc(weak)
    }
}

#[derive(Debug, Clone)]
struct WeakHc<T>(Weak<T>);

impl<T> WeakHc<T> {
    fn upgrade(&self) -> Option<Hc<T>> {
        let WeakHc(inner) = self;
        inner.upgrade().map(Hc)
    }
}

#[derive(Debug)]
pub struct HcFactory<T: hash::Hash + Eq + Clone> {
    table: AHashMap<T, WeakHc<T>>,
}

impl<T: hash::Hash + Eq + Clone> HcFactory<T> {
    pub fn with_capacity(capacity: usize) -> HcFactory<T> {
        HcFactory {
            table: AHashMap::with_capacity(capacity)
        }
    }

    pub fn get(&self, element: &T) -> Option<Hc<T>> {
       self.table
            .get(element)
            .and_then(|w| w.upgrade())
    }

    pub fn make(&mut self, element: T) -> Hc<T> {
        if let Some(hc) = self.get(&element) {
            hc
        } else {
            let result = Hc(Arc::new(element.clone()));
            self.table.insert(element, result.to_weak());
            result
        }
    }

    /// Drop table entries whose node has been freed.
    pub fn sweep(&mut self) {
        self.table.retain(|_, w| w.upgrade().is_some());
    }
}

/// Process-global factory: insert-only under the lock, and once published a
/// handle never moves, so readers that already hold an `Hc` stay wait-free.
#[derive(Debug)]
pub struct SharedFactory<T: hash::Hash + Eq + Clone> {
    inner: Mutex<HcFactory<T>>,
}

impl<T: hash::Hash + Eq + Clone> SharedFactory<T> {
    pub fn with_capacity(capacity: usize) -> SharedFactory<T> {
        SharedFactory {
            inner: Mutex::new(HcFactory::with_capacity(capacity))
        }
    }

    pub fn make(&self, element: T) -> Hc<T> {
        let mut table = self.inner.lock().expect("hash-cons table poisoned");
        table.make(element)
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Boxed callback handed to collaborators when subscribing.
pub type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

type SharedCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerTable<T> {
    next_id: u64,
    callbacks: BTreeMap<u64, SharedCallback<T>>,
}

/// A set of typed callbacks. Each `subscribe` returns the disposer that
/// removes it again.
pub struct Listeners<T> {
    table: Arc<Mutex<ListenerTable<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(ListenerTable {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut table = lock(&self.table);
            let id = table.next_id;
            table.next_id += 1;
            table.callbacks.insert(id, Arc::new(callback));
            id
        };
        let weak: Weak<Mutex<ListenerTable<T>>> = Arc::downgrade(&self.table);
        Subscription::new(move || {
            if let Some(table) = weak.upgrade() {
                lock(&table).callbacks.remove(&id);
            }
        })
    }

    /// Calls every registered callback. The table lock is released first so
    /// callbacks may subscribe or dispose.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<SharedCallback<T>> = lock(&self.table).callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(value);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.table).callbacks.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Disposer for a registered callback. Disposing runs at most once; dropping
/// an undisposed subscription disposes it.
pub struct Subscription {
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(disposer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposer: Some(Box::new(disposer)),
        }
    }

    pub fn dispose(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }

    #[cfg(test)]
    fn is_disposed(&self) -> bool {
        self.disposer.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_live_subscribers_only() {
        let listeners: Listeners<u32> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let mut first = listeners.subscribe(move |v| {
            counter.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let counter = hits.clone();
        let _second = listeners.subscribe(move |v| {
            counter.fetch_add(*v as usize, Ordering::SeqCst);
        });

        listeners.emit(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        first.dispose();
        listeners.emit(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn dispose_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.dispose();
        sub.dispose();
        drop(sub);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let listeners: Listeners<()> = Listeners::new();
        {
            let _sub = listeners.subscribe(|_| {});
            assert_eq!(listeners.len(), 1);
        }
        assert!(listeners.is_empty());
    }

    #[test]
    fn disposing_after_listeners_dropped_is_harmless() {
        let listeners: Listeners<()> = Listeners::new();
        let mut sub = listeners.subscribe(|_| {});
        drop(listeners);
        sub.dispose();
        assert!(sub.is_disposed());
    }
}

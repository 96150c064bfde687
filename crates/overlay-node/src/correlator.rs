use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Matches outstanding overlay requests to incoming replies.
///
/// A caller [`register`](Correlator::register)s a waiter under a correlation
/// key before publishing its request, then awaits the waiter. The task that
/// receives the reply calls [`deliver`](Correlator::deliver), which completes
/// every waiter currently registered for that key and removes them. Replies
/// arriving after that are dropped because the key is gone.
///
/// Several concurrent waiters for the same key are legal; all of them observe
/// the same payload. A waiter that is dropped (timeout, HTTP cancellation)
/// removes itself from the map.
pub struct Correlator<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slots: Mutex<HashMap<String, Vec<Slot<T>>>>,
    next_id: AtomicU64,
}

struct Slot<T> {
    id: u64,
    tx: oneshot::Sender<T>,
}

/// A single-shot delivery slot returned by [`Correlator::register`].
pub struct Waiter<T> {
    inner: Arc<Inner<T>>,
    key: String,
    id: u64,
    rx: oneshot::Receiver<T>,
}

impl<T> Clone for Correlator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Correlator<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Atomically appends a new waiter to `key`'s list.
    pub fn register(&self, key: &str) -> Waiter<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.inner
            .slots
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(Slot { id, tx });

        Waiter {
            inner: self.inner.clone(),
            key: key.to_string(),
            id,
            rx,
        }
    }

    /// Number of waiters currently registered for `key`.
    pub fn pending(&self, key: &str) -> usize {
        self.inner.slots.lock().get(key).map_or(0, Vec::len)
    }
}

impl<T: Clone> Correlator<T> {
    /// Hands `value` to every waiter registered for `key` and discards the
    /// list. Returns how many waiters were completed.
    ///
    /// The list is snapshotted and cleared under the lock; the sends happen
    /// outside of it. A send can still fail if the waiter gave up in the
    /// meantime, which is fine.
    pub fn deliver(&self, key: &str, value: T) -> usize {
        let slots = match self.inner.slots.lock().remove(key) {
            Some(slots) => slots,
            None => return 0,
        };

        let mut delivered = 0;
        for slot in slots {
            if slot.tx.send(value.clone()).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }
}

impl<T> Waiter<T> {
    /// Waits for the reply, or gives up after `timeout`.
    ///
    /// Consumes the waiter either way; giving up removes the slot from the
    /// map so a late reply finds no consumer.
    pub async fn wait(mut self, timeout: Duration) -> Option<T> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) | Err(_) => None,
        }
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        let mut slots = self.inner.slots.lock();
        if let Some(list) = slots.get_mut(&self.key) {
            list.retain(|slot| slot.id != self.id);
            if list.is_empty() {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_a_registered_waiter() {
        let correlator = Correlator::new();

        let waiter = correlator.register("a");
        assert_eq!(correlator.deliver("a", vec![1u8, 2, 3]), 1);

        let payload = waiter.wait(Duration::from_secs(1)).await;
        assert_eq!(payload, Some(vec![1, 2, 3]));
        assert_eq!(correlator.pending("a"), 0);
    }

    #[tokio::test]
    async fn fans_out_to_all_waiters_for_the_same_key() {
        let correlator = Correlator::new();

        let first = correlator.register("img");
        let second = correlator.register("img");
        assert_eq!(correlator.pending("img"), 2);

        assert_eq!(correlator.deliver("img", "bytes".to_string()), 2);

        assert_eq!(
            first.wait(Duration::from_secs(1)).await.as_deref(),
            Some("bytes")
        );
        assert_eq!(
            second.wait(Duration::from_secs(1)).await.as_deref(),
            Some("bytes")
        );
    }

    #[tokio::test]
    async fn delivery_without_waiters_is_dropped() {
        let correlator = Correlator::<Vec<u8>>::new();

        assert_eq!(correlator.deliver("nobody", vec![0]), 0);
    }

    #[tokio::test]
    async fn second_delivery_finds_no_consumer() {
        let correlator = Correlator::new();

        let waiter = correlator.register("once");
        assert_eq!(correlator.deliver("once", 1u32), 1);
        assert_eq!(correlator.deliver("once", 2u32), 0);

        assert_eq!(waiter.wait(Duration::from_secs(1)).await, Some(1));
    }

    #[tokio::test]
    async fn timed_out_waiter_removes_its_slot() {
        let correlator = Correlator::<u32>::new();

        let waiter = correlator.register("slow");
        assert_eq!(waiter.wait(Duration::from_millis(10)).await, None);

        assert_eq!(correlator.pending("slow"), 0);
        assert_eq!(correlator.deliver("slow", 7), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_block_others() {
        let correlator = Correlator::new();

        let kept = correlator.register("k");
        let dropped = correlator.register("k");
        drop(dropped);

        assert_eq!(correlator.pending("k"), 1);
        assert_eq!(correlator.deliver("k", 9u32), 1);
        assert_eq!(kept.wait(Duration::from_secs(1)).await, Some(9));
    }
}

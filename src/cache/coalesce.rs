//! Coalescing of thumbnail requests
//!
//! Observers waiting on the same uncached thumbnail share one pending entry
//! and therefore one job. Each observer owns the receiving end of a channel;
//! resolution is a send per observer, so the owning thread never calls into
//! observer code. An observer that dropped its receiver is skipped.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::debug;

use crate::job::ResourceKey;
use crate::textures::TextureInfo;

pub type ObserverId = u64;

/// Delivered to an observer when its thumbnail is ready
#[derive(Debug, Clone)]
pub struct ThumbnailReady {
    pub key: ResourceKey,
    pub observer: ObserverId,
    pub payload: TextureInfo,
}

/// Sending half of an observer's notification channel
#[derive(Debug, Clone)]
pub struct ThumbnailObserver {
    id: ObserverId,
    tx: Sender<ThumbnailReady>,
}

impl ThumbnailObserver {
    pub fn new(id: ObserverId, tx: Sender<ThumbnailReady>) -> Self {
        Self { id, tx }
    }

    /// Create an observer together with its receiver
    pub fn channel(id: ObserverId) -> (Self, Receiver<ThumbnailReady>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Send a payload. Returns `false` if the receiver is gone.
    pub fn notify(&self, key: &ResourceKey, payload: &TextureInfo) -> bool {
        self.tx
            .send(ThumbnailReady {
                key: key.clone(),
                observer: self.id,
                payload: payload.clone(),
            })
            .is_ok()
    }
}

/// Counters for coalesced requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    /// Subscriptions seen
    pub total: u64,
    /// Subscriptions that joined an existing entry
    pub coalesced: u64,
    /// Entries created (one job each)
    pub started: u64,
}

/// Pending thumbnail requests keyed by resource
#[derive(Default)]
pub struct RequestCoalescer {
    pending: HashMap<ResourceKey, Vec<ThumbnailObserver>>,
    stats: CoalescerStats,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer to the pending entry for `key`.
    ///
    /// Returns `true` when a new entry was created and the caller must enqueue a job.
    pub fn subscribe(&mut self, key: ResourceKey, observer: ThumbnailObserver) -> bool {
        self.stats.total += 1;
        match self.pending.get_mut(&key) {
            Some(observers) => {
                self.stats.coalesced += 1;
                if !observers.iter().any(|o| o.id == observer.id) {
                    observers.push(observer);
                }
                false
            }
            None => {
                self.stats.started += 1;
                self.pending.insert(key, vec![observer]);
                true
            }
        }
    }

    /// Deliver `payload` to every observer of `key` and drop the entry.
    ///
    /// Returns the number of observers that received it.
    pub fn resolve(&mut self, key: &ResourceKey, payload: &TextureInfo) -> usize {
        let Some(observers) = self.pending.remove(key) else {
            return 0;
        };

        let total = observers.len();
        let delivered = observers.iter().filter(|o| o.notify(key, payload)).count();
        if delivered < total {
            debug!("Skipped {} vanished observers for {}", total - delivered, key);
        }
        delivered
    }

    /// Remove one observer. The entry stays pending so the queued job still fills the cache.
    pub fn unsubscribe(&mut self, key: &ResourceKey, observer: ObserverId) -> bool {
        match self.pending.get_mut(key) {
            Some(observers) => {
                let before = observers.len();
                observers.retain(|o| o.id != observer);
                observers.len() < before
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending entry without notifying anyone
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn stats(&self) -> CoalescerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn payload() -> TextureInfo {
        TextureInfo::from_faces(vec![Some(RgbaImage::new(4, 4))])
    }

    #[test]
    fn test_many_subscribers_one_entry() {
        let mut coalescer = RequestCoalescer::new();
        let key = ResourceKey::new("rock.tex");

        let mut receivers = Vec::new();
        let mut created = 0;
        for id in 0..5 {
            let (observer, rx) = ThumbnailObserver::channel(id);
            if coalescer.subscribe(key.clone(), observer) {
                created += 1;
            }
            receivers.push(rx);
        }
        assert_eq!(created, 1);
        assert!(coalescer.is_pending(&key));

        assert_eq!(coalescer.resolve(&key, &payload()), 5);
        assert!(!coalescer.is_pending(&key));
        for (id, rx) in receivers.iter().enumerate() {
            let ready = rx.try_recv().unwrap();
            assert_eq!(ready.observer, id as ObserverId);
            assert_eq!(ready.key, key);
            assert_eq!(ready.payload.dimensions, (4, 4));
            assert!(rx.try_recv().is_err());
        }

        let stats = coalescer.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.coalesced, 4);
        assert_eq!(stats.started, 1);
    }

    #[test]
    fn test_dropped_observer_is_skipped() {
        let mut coalescer = RequestCoalescer::new();
        let key = ResourceKey::new("rock.tex");

        let (alive, alive_rx) = ThumbnailObserver::channel(1);
        let (gone, gone_rx) = ThumbnailObserver::channel(2);
        coalescer.subscribe(key.clone(), alive);
        coalescer.subscribe(key.clone(), gone);
        drop(gone_rx);

        assert_eq!(coalescer.resolve(&key, &payload()), 1);
        assert!(alive_rx.try_recv().is_ok());
    }

    #[test]
    fn test_unsubscribe_keeps_entry_pending() {
        let mut coalescer = RequestCoalescer::new();
        let key = ResourceKey::new("rock.tex");
        let (observer, rx) = ThumbnailObserver::channel(9);
        coalescer.subscribe(key.clone(), observer);

        assert!(coalescer.unsubscribe(&key, 9));
        assert!(!coalescer.unsubscribe(&key, 9));
        assert!(coalescer.is_pending(&key));
        assert_eq!(coalescer.resolve(&key, &payload()), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resolve_unknown_and_clear() {
        let mut coalescer = RequestCoalescer::new();
        assert_eq!(coalescer.resolve(&ResourceKey::new("none.tex"), &payload()), 0);

        let (observer, rx) = ThumbnailObserver::channel(1);
        coalescer.subscribe(ResourceKey::new("a.tex"), observer);
        assert_eq!(coalescer.clear(), 1);
        assert_eq!(coalescer.pending_count(), 0);
        assert!(rx.try_recv().is_err());
    }
}

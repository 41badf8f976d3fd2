//! Stack-ordered job queue with duplicate collapsing
//!
//! Nodes live in a slab and are linked by index, newest at the head. An index
//! from (key, variant) to slot gives constant-time duplicate lookup, so a
//! re-request can be unlinked from the middle and re-pushed at the head.

use std::collections::HashMap;

use super::{Job, ResourceKey, Variant};

struct Node {
    job: Job,
    /// Towards the head (newer)
    prev: Option<usize>,
    /// Towards the tail (older)
    next: Option<usize>,
}

/// Pending jobs for one lane
#[derive(Default)]
pub struct JobQueue {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<(ResourceKey, Variant), usize>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a job as the most recent entry.
    ///
    /// If a job for the same (key, variant) is already queued it is removed
    /// and the new entry carries the stricter policy of the two. Returns
    /// `false` in that case (a merge), `true` for a net-new job.
    pub fn push(&mut self, job: Job) -> bool {
        let dedup = job.dedup_key();
        let mut job = job;
        let mut accepted = true;

        if let Some(slot) = self.index.remove(&dedup) {
            let queued = self.unlink(slot);
            job = job.merge_policy(&queued);
            accepted = false;
        }

        let slot = self.alloc(Node {
            job,
            prev: None,
            next: self.head,
        });
        match self.head {
            Some(old_head) => self.node_mut(old_head).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        self.index.insert(dedup, slot);

        accepted
    }

    /// Remove and return the most recently pushed job
    pub fn pop(&mut self) -> Option<Job> {
        let slot = self.head?;
        let job = self.unlink(slot);
        self.index.remove(&job.dedup_key());
        Some(job)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether a job for (key, variant) is waiting
    pub fn contains(&self, key: &ResourceKey, variant: Variant) -> bool {
        self.index.contains_key(&(key.clone(), variant))
    }

    /// Drop every pending job, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        count
    }

    /// Iterate pending jobs from newest to oldest
    pub fn iter(&self) -> impl Iterator<Item = &Job> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.slots[cursor?].as_ref()?;
            cursor = node.next;
            Some(&node.job)
        })
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.slots[slot]
            .as_mut()
            .expect("queue index points at a vacant slot")
    }

    /// Detach a node from the list and free its slot
    fn unlink(&mut self, slot: usize) -> Job {
        let node = self.slots[slot]
            .take()
            .expect("queue index points at a vacant slot");

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }

        self.free.push(slot);
        node.job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FreshnessPolicy, GpuFamily};

    fn job(path: &str, variant: Variant, policy: FreshnessPolicy) -> Job {
        Job::new(ResourceKey::new(path), variant, policy)
    }

    #[test]
    fn test_pop_is_stack_ordered() {
        let mut queue = JobQueue::new();
        assert!(queue.push(job("a.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing)));
        assert!(queue.push(job("b.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing)));
        assert!(queue.push(job("c.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing)));
        assert_eq!(queue.len(), 3);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|j| j.key.to_string())
            .collect();
        assert_eq!(order, vec!["c.tex", "b.tex", "a.tex"]);
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_merges_to_strictest() {
        let mut queue = JobQueue::new();
        let variant = Variant::Converted(GpuFamily::PowerVrIos);

        assert!(queue.push(job("rock.tex", variant, FreshnessPolicy::Force)));
        assert!(!queue.push(job("rock.tex", variant, FreshnessPolicy::OnlyIfMissing)));

        assert_eq!(queue.len(), 1);
        let merged = queue.pop().unwrap();
        assert_eq!(merged.policy, FreshnessPolicy::Force);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_merge_moves_entry_to_head() {
        let mut queue = JobQueue::new();
        queue.push(job("a.tex", Variant::Thumbnail, FreshnessPolicy::OnlyIfMissing));
        queue.push(job("b.tex", Variant::Thumbnail, FreshnessPolicy::OnlyIfMissing));
        queue.push(job("c.tex", Variant::Thumbnail, FreshnessPolicy::OnlyIfMissing));

        // Re-request the middle entry
        assert!(!queue.push(job("b.tex", Variant::Thumbnail, FreshnessPolicy::OnlyIfStale)));

        let keys: Vec<&str> = queue.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["b.tex", "c.tex", "a.tex"]);
        assert_eq!(queue.iter().next().unwrap().policy, FreshnessPolicy::OnlyIfStale);
    }

    #[test]
    fn test_variants_are_distinct() {
        let mut queue = JobQueue::new();
        assert!(queue.push(job("a.tex", Variant::Thumbnail, FreshnessPolicy::OnlyIfMissing)));
        assert!(queue.push(job("a.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing)));
        assert!(queue.push(job(
            "a.tex",
            Variant::Converted(GpuFamily::Mali),
            FreshnessPolicy::OnlyIfMissing
        )));
        assert!(queue.push(job(
            "a.tex",
            Variant::Converted(GpuFamily::Dx11),
            FreshnessPolicy::OnlyIfMissing
        )));
        assert_eq!(queue.len(), 4);
        assert!(queue.contains(&ResourceKey::new("a.tex"), Variant::Converted(GpuFamily::Mali)));
        assert!(!queue.contains(&ResourceKey::new("a.tex"), Variant::Converted(GpuFamily::Tegra)));
    }

    #[test]
    fn test_tail_removal_and_slot_reuse() {
        let mut queue = JobQueue::new();
        queue.push(job("a.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing));
        queue.push(job("b.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing));

        // a.tex sits at the tail; merging it exercises tail unlinking
        assert!(!queue.push(job("a.tex", Variant::Original, FreshnessPolicy::Force)));
        queue.push(job("c.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing));

        let keys: Vec<&str> = queue.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["c.tex", "a.tex", "b.tex"]);
        assert_eq!(queue.slots.len(), 3);

        assert_eq!(queue.pop().unwrap().key.as_str(), "c.tex");
        assert_eq!(queue.pop().unwrap().key.as_str(), "a.tex");
        assert_eq!(queue.pop().unwrap().key.as_str(), "b.tex");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_reports_count() {
        let mut queue = JobQueue::new();
        queue.push(job("a.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing));
        queue.push(job("b.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());

        // Usable after clearing
        assert!(queue.push(job("a.tex", Variant::Original, FreshnessPolicy::OnlyIfMissing)));
        assert_eq!(queue.len(), 1);
    }
}

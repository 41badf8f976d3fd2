//! In-memory texture cache
//!
//! Three independently bounded stores: thumbnails, decoded originals and one
//! converted store per GPU family. Each store evicts by weight: every insert
//! or explicit hit stamps the entry with the store's running counter, and an
//! insert that pushes the store over budget drops everything stamped before
//! `counter - budget`. This is an approximation of LRU; `peek` never changes
//! weights, so metadata queries do not keep entries alive.

mod coalesce;
mod thumbnail;

pub use coalesce::{CoalescerStats, ObserverId, RequestCoalescer, ThumbnailObserver, ThumbnailReady};
pub use thumbnail::make_thumbnail;

use std::collections::HashMap;
use std::hash::Hash;
use tracing::{debug, warn};

use crate::descriptor::TextureDescriptor;
use crate::job::{GpuFamily, ResourceKey};
use crate::paths;
use crate::textures::{estimate_texture_size, TextureCodec, TextureInfo};

struct Entry<V> {
    value: V,
    weight: u64,
}

/// Entry-count bounded map with threshold eviction
pub struct WeightedCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    counter: u64,
    budget: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> WeightedCache<K, V> {
    pub fn new(budget: usize) -> Self {
        Self {
            entries: HashMap::new(),
            counter: 0,
            budget,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Look up an entry and mark it as recently used
    pub fn get(&mut self, key: &K) -> Option<V> {
        let weight = self.counter;
        let entry = self.entries.get_mut(key)?;
        entry.weight = weight;
        self.counter += 1;
        Some(entry.value.clone())
    }

    /// Look up an entry without touching its weight
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry, then evict. Returns the number of evicted entries.
    pub fn put(&mut self, key: K, value: V) -> usize {
        let weight = self.counter;
        self.counter += 1;
        self.entries.insert(key, Entry { value, weight });

        if self.entries.len() <= self.budget {
            return 0;
        }

        let threshold = self.counter.saturating_sub(self.budget as u64);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.weight >= threshold);
        before - self.entries.len()
    }

    pub fn invalidate(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Store budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudgets {
    pub thumbnails: usize,
    pub originals: usize,
    pub converted: usize,
}

impl Default for CacheBudgets {
    fn default() -> Self {
        Self {
            thumbnails: 100,
            originals: 1,
            converted: 1,
        }
    }
}

/// Thumbnail, original and per-family converted stores
pub struct TextureCache {
    thumbnails: WeightedCache<ResourceKey, TextureInfo>,
    originals: WeightedCache<ResourceKey, TextureInfo>,
    converted: HashMap<GpuFamily, WeightedCache<ResourceKey, TextureInfo>>,
    budgets: CacheBudgets,
}

impl Default for TextureCache {
    fn default() -> Self {
        Self::new(CacheBudgets::default())
    }
}

impl TextureCache {
    pub fn new(budgets: CacheBudgets) -> Self {
        let converted = GpuFamily::ALL
            .iter()
            .map(|family| (*family, WeightedCache::new(budgets.converted)))
            .collect();

        Self {
            thumbnails: WeightedCache::new(budgets.thumbnails),
            originals: WeightedCache::new(budgets.originals),
            converted,
            budgets,
        }
    }

    pub fn budgets(&self) -> CacheBudgets {
        self.budgets
    }

    fn converted_store(&mut self, family: GpuFamily) -> &mut WeightedCache<ResourceKey, TextureInfo> {
        let budget = self.budgets.converted;
        self.converted
            .entry(family)
            .or_insert_with(|| WeightedCache::new(budget))
    }

    pub fn thumbnail(&mut self, key: &ResourceKey) -> Option<TextureInfo> {
        self.thumbnails.get(key)
    }

    pub fn original(&mut self, key: &ResourceKey) -> Option<TextureInfo> {
        self.originals.get(key)
    }

    pub fn converted(&mut self, key: &ResourceKey, family: GpuFamily) -> Option<TextureInfo> {
        self.converted_store(family).get(key)
    }

    pub fn set_thumbnail(&mut self, key: ResourceKey, info: TextureInfo) {
        let evicted = self.thumbnails.put(key, info);
        if evicted > 0 {
            debug!("Evicted {} thumbnails", evicted);
        }
    }

    pub fn set_original(&mut self, key: ResourceKey, info: TextureInfo) {
        let evicted = self.originals.put(key, info);
        if evicted > 0 {
            debug!("Evicted {} originals", evicted);
        }
    }

    pub fn set_converted(&mut self, key: ResourceKey, family: GpuFamily, info: TextureInfo) {
        let evicted = self.converted_store(family).put(key, info);
        if evicted > 0 {
            debug!("Evicted {} converted textures for {}", evicted, family);
        }
    }

    /// Drop a resource from every store
    pub fn invalidate(&mut self, key: &ResourceKey) {
        self.thumbnails.invalidate(key);
        self.originals.invalidate(key);
        for store in self.converted.values_mut() {
            store.invalidate(key);
        }
    }

    /// Empty the original and converted stores, keeping thumbnails
    pub fn clear_except_thumbnails(&mut self) {
        self.originals.clear();
        for store in self.converted.values_mut() {
            store.clear();
        }
    }

    /// Empty every store
    pub fn clear_all(&mut self) {
        self.clear_except_thumbnails();
        self.thumbnails.clear();
    }

    pub fn thumbnail_count(&self) -> usize {
        self.thumbnails.len()
    }

    pub fn original_count(&self) -> usize {
        self.originals.len()
    }

    pub fn converted_count(&self, family: GpuFamily) -> usize {
        self.converted.get(&family).map(WeightedCache::len).unwrap_or(0)
    }

    fn peek_converted(&self, key: &ResourceKey, family: GpuFamily) -> Option<&TextureInfo> {
        self.converted.get(&family).and_then(|store| store.peek(key))
    }

    pub fn original_size(&self, key: &ResourceKey) -> u64 {
        self.originals.peek(key).map(|info| info.data_size).unwrap_or(0)
    }

    pub fn original_file_size(&self, key: &ResourceKey) -> u64 {
        self.originals.peek(key).map(|info| info.file_size).unwrap_or(0)
    }

    pub fn original_dimensions(&self, key: &ResourceKey) -> Option<(u32, u32)> {
        self.originals.peek(key).map(|info| info.dimensions)
    }

    pub fn original_modified(&self, key: &ResourceKey) -> Option<std::time::SystemTime> {
        self.originals.peek(key).and_then(|info| info.source_modified)
    }

    pub fn converted_size(&self, key: &ResourceKey, family: GpuFamily) -> u64 {
        self.peek_converted(key, family).map(|info| info.data_size).unwrap_or(0)
    }

    pub fn converted_file_size(&self, key: &ResourceKey, family: GpuFamily) -> u64 {
        self.peek_converted(key, family).map(|info| info.file_size).unwrap_or(0)
    }

    pub fn converted_dimensions(&self, key: &ResourceKey, family: GpuFamily) -> Option<(u32, u32)> {
        self.peek_converted(key, family).map(|info| info.dimensions)
    }

    pub fn thumbnail_size(&self, key: &ResourceKey) -> Option<(u32, u32)> {
        self.thumbnails.peek(key).map(|info| info.dimensions)
    }

    /// Load an existing converted artifact from disk into the converted store.
    ///
    /// Returns `true` if the store holds the texture afterwards.
    pub fn try_preload(
        &mut self,
        descriptor: &TextureDescriptor,
        family: GpuFamily,
        codec: &dyn TextureCodec,
    ) -> bool {
        let key = descriptor.key();
        if self.converted_store(family).contains(&key) {
            return true;
        }

        let Some(format) = descriptor.format_for(family) else {
            return false;
        };
        let artifact = descriptor.converted_path(family);
        if !artifact.exists() {
            return false;
        }

        match codec.load_converted(descriptor, family) {
            Ok(faces) if !faces.is_empty() => {
                let face_count = faces.len();
                let mut info = TextureInfo::from_faces(faces.into_iter().map(Some).collect());
                let (width, height) = info.dimensions;
                info.data_size = estimate_texture_size(width, height, face_count, Some(format));
                info.file_size = paths::file_size(&artifact);
                info.source_modified = paths::modified_time(&artifact);
                debug!("Preloaded {} for {}", artifact.display(), family);
                self.set_converted(key, family, info);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Failed to preload {}: {:#}", artifact.display(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use image::RgbaImage;
    use std::path::{Path, PathBuf};

    fn info(width: u32) -> TextureInfo {
        let mut info = TextureInfo::from_faces(vec![Some(RgbaImage::new(width, width))]);
        info.data_size = (width * width * 4) as u64;
        info
    }

    #[test]
    fn test_budget_two_evicts_oldest() {
        let mut cache = WeightedCache::new(2);
        assert_eq!(cache.put("A", 0), 0);
        assert_eq!(cache.put("B", 1), 0);
        // counter is 3 after C, threshold 1 drops A (weight 0)
        assert_eq!(cache.put("C", 2), 1);

        assert!(!cache.contains(&"A"));
        assert!(cache.contains(&"B"));
        assert!(cache.contains(&"C"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_get_bumps_and_peek_does_not() {
        let mut cache = WeightedCache::new(2);
        cache.put("A", 0);
        cache.put("B", 1);
        assert_eq!(cache.get(&"A"), Some(0));
        cache.put("C", 2);
        // A was touched after B, so B goes
        assert!(cache.contains(&"A"));
        assert!(!cache.contains(&"B"));

        let mut cache = WeightedCache::new(2);
        cache.put("A", 0);
        cache.put("B", 1);
        assert_eq!(cache.peek(&"A"), Some(&0));
        cache.put("C", 2);
        assert!(!cache.contains(&"A"));
    }

    #[test]
    fn test_budget_never_exceeded() {
        for budget in 1..5 {
            let mut cache = WeightedCache::new(budget);
            for i in 0..50u32 {
                cache.put(i % 7, i);
                if i % 3 == 0 {
                    cache.get(&(i % 5));
                }
                assert!(cache.len() <= budget, "budget {} exceeded: {}", budget, cache.len());
            }
        }
    }

    #[test]
    fn test_replace_same_key_keeps_one_entry() {
        let mut cache = WeightedCache::new(1);
        cache.put("A", 1);
        assert_eq!(cache.put("A", 2), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&"A"), Some(&2));
        assert_eq!(cache.invalidate(&"A"), Some(2));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_converted_partitions_are_independent() {
        let mut cache = TextureCache::default();
        let a = ResourceKey::new("a.tex");
        let b = ResourceKey::new("b.tex");

        cache.set_converted(a.clone(), GpuFamily::PowerVrIos, info(4));
        cache.set_converted(b.clone(), GpuFamily::Dx11, info(8));
        assert!(cache.converted(&a, GpuFamily::PowerVrIos).is_some());
        assert!(cache.converted(&b, GpuFamily::Dx11).is_some());

        // Budget 1 per family: b replaces a only within ios
        cache.set_converted(b.clone(), GpuFamily::PowerVrIos, info(2));
        assert!(cache.converted(&a, GpuFamily::PowerVrIos).is_none());
        assert_eq!(cache.converted_count(GpuFamily::PowerVrIos), 1);
        assert_eq!(cache.converted_dimensions(&b, GpuFamily::Dx11), Some((8, 8)));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut cache = TextureCache::new(CacheBudgets {
            thumbnails: 10,
            originals: 10,
            converted: 10,
        });
        let key = ResourceKey::new("rock.tex");
        cache.set_thumbnail(key.clone(), info(2));
        cache.set_original(key.clone(), info(16));
        cache.set_converted(key.clone(), GpuFamily::Mali, info(16));
        assert_eq!(cache.original_size(&key), 16 * 16 * 4);
        assert_eq!(cache.thumbnail_size(&key), Some((2, 2)));

        cache.clear_except_thumbnails();
        assert_eq!(cache.original_count(), 0);
        assert_eq!(cache.converted_count(GpuFamily::Mali), 0);
        assert_eq!(cache.thumbnail_count(), 1);

        cache.set_original(key.clone(), info(16));
        cache.invalidate(&key);
        assert_eq!(cache.thumbnail_count(), 0);
        assert_eq!(cache.original_count(), 0);

        cache.set_thumbnail(key.clone(), info(2));
        cache.clear_all();
        assert_eq!(cache.thumbnail_count(), 0);
    }

    struct FixedCodec;

    impl TextureCodec for FixedCodec {
        fn decode(&self, _path: &Path) -> Result<RgbaImage> {
            Ok(RgbaImage::new(4, 4))
        }

        fn convert_for_family(
            &self,
            descriptor: &TextureDescriptor,
            family: GpuFamily,
            _quality: crate::textures::CompressionQuality,
        ) -> Result<PathBuf> {
            Ok(descriptor.converted_path(family))
        }

        fn load_converted(&self, _descriptor: &TextureDescriptor, _family: GpuFamily) -> Result<Vec<RgbaImage>> {
            Ok(vec![RgbaImage::new(32, 16)])
        }
    }

    #[test]
    fn test_try_preload() -> Result<()> {
        use crate::textures::CompressionFormat;

        let dir = tempfile::tempdir()?;
        let descriptor = TextureDescriptor::new(dir.path().join("rock.tex"), dir.path().join("rock.png"))
            .with_format(GpuFamily::Adreno, CompressionFormat::BC1);
        let key = descriptor.key();
        let mut cache = TextureCache::default();

        // No artifact on disk yet
        assert!(!cache.try_preload(&descriptor, GpuFamily::Adreno, &FixedCodec));
        // No format for this family
        assert!(!cache.try_preload(&descriptor, GpuFamily::Tegra, &FixedCodec));

        std::fs::write(descriptor.converted_path(GpuFamily::Adreno), b"dds")?;
        assert!(cache.try_preload(&descriptor, GpuFamily::Adreno, &FixedCodec));
        assert_eq!(cache.converted_dimensions(&key, GpuFamily::Adreno), Some((32, 16)));
        assert_eq!(cache.converted_file_size(&key, GpuFamily::Adreno), 3);
        Ok(())
    }
}

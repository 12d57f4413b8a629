use std::{
	hash::{Hash, Hasher},
	sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		Arc,
		Mutex,
	},
};

use dashmap::DashMap;

use crate::{GeographicExtent, RasterBlock};

pub const DEFAULT_CACHE_CAPACITY: usize = 512 * 1024 * 1024;

/// Identifies a block: the source it came from, the area it covers and the resolution it was read at.
#[derive(Clone, Debug)]
pub struct CacheKey {
	source: Arc<str>,
	extent: GeographicExtent,
	resolution: f64,
}

impl CacheKey {
	pub fn new(source: impl Into<Arc<str>>, extent: GeographicExtent, resolution: f64) -> Self {
		Self {
			source: source.into(),
			extent,
			resolution,
		}
	}

	pub fn source(&self) -> &str { &self.source }

	pub fn extent(&self) -> &GeographicExtent { &self.extent }

	pub fn resolution(&self) -> f64 { self.resolution }
}

impl PartialEq for CacheKey {
	fn eq(&self, other: &Self) -> bool {
		self.source == other.source
			&& self.extent.crs() == other.extent.crs()
			&& self.extent.key_bits() == other.extent.key_bits()
			&& self.resolution.to_bits() == other.resolution.to_bits()
	}
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.source.hash(state);
		self.extent.crs().hash(state);
		self.extent.key_bits().hash(state);
		self.resolution.to_bits().hash(state);
	}
}

struct CacheEntry {
	block: Arc<RasterBlock>,
	bytes: usize,
	last_access: AtomicU64,
}

/// A size-bounded LRU cache of decoded raster blocks, shared by every source of a generator.
///
/// Lookups go straight to a sharded map and only touch the entry's access tick. Inserts that need room evict the
/// least recently used entries under a separate lock, so a `get` never waits for an eviction scan.
pub struct TileCache {
	entries: DashMap<CacheKey, CacheEntry>,
	bytes: AtomicUsize,
	capacity: AtomicUsize,
	clock: AtomicU64,
	eviction: Mutex<()>,
}

impl TileCache {
	pub fn new(capacity_bytes: usize) -> Self {
		Self {
			entries: DashMap::new(),
			bytes: AtomicUsize::new(0),
			capacity: AtomicUsize::new(capacity_bytes),
			clock: AtomicU64::new(0),
			eviction: Mutex::new(()),
		}
	}

	pub fn get(&self, key: &CacheKey) -> Option<Arc<RasterBlock>> {
		let entry = self.entries.get(key)?;
		entry.last_access.store(self.tick(), Ordering::Relaxed);
		Some(entry.block.clone())
	}

	pub fn contains(&self, key: &CacheKey) -> bool { self.entries.contains_key(key) }

	pub fn put(&self, key: CacheKey, block: Arc<RasterBlock>) {
		tracy::zone!("Cache insert");

		let bytes = block.byte_size();
		let _guard = self.eviction.lock().unwrap();

		if let Some((_, old)) = self.entries.remove(&key) {
			self.bytes.fetch_sub(old.bytes, Ordering::AcqRel);
		}

		let capacity = self.capacity.load(Ordering::Acquire);
		if bytes > capacity {
			log::debug!("Not caching a {} byte block, capacity is {}", bytes, capacity);
			return;
		}
		self.evict_to(capacity - bytes);

		self.entries.insert(
			key,
			CacheEntry {
				block,
				bytes,
				last_access: AtomicU64::new(self.tick()),
			},
		);
		self.bytes.fetch_add(bytes, Ordering::AcqRel);
	}

	pub fn len(&self) -> usize { self.entries.len() }

	pub fn is_empty(&self) -> bool { self.entries.is_empty() }

	pub fn bytes(&self) -> usize { self.bytes.load(Ordering::Acquire) }

	pub fn capacity(&self) -> usize { self.capacity.load(Ordering::Acquire) }

	pub fn set_capacity(&self, capacity_bytes: usize) {
		let _guard = self.eviction.lock().unwrap();
		self.capacity.store(capacity_bytes, Ordering::Release);
		self.evict_to(capacity_bytes);
	}

	pub fn clear(&self) {
		let _guard = self.eviction.lock().unwrap();
		self.entries.clear();
		self.bytes.store(0, Ordering::Release);
	}

	fn tick(&self) -> u64 { self.clock.fetch_add(1, Ordering::Relaxed) }

	// Callers hold the eviction lock.
	fn evict_to(&self, budget: usize) {
		if self.bytes.load(Ordering::Acquire) <= budget {
			return;
		}

		let mut candidates: Vec<_> = self
			.entries
			.iter()
			.map(|x| (x.last_access.load(Ordering::Relaxed), x.key().clone()))
			.collect();
		candidates.sort_unstable_by_key(|x| x.0);

		let mut evicted = 0;
		for (_, key) in candidates {
			if self.bytes.load(Ordering::Acquire) <= budget {
				break;
			}
			if let Some((_, entry)) = self.entries.remove(&key) {
				self.bytes.fetch_sub(entry.bytes, Ordering::AcqRel);
				evicted += 1;
			}
		}
		log::debug!("Evicted {} cache entries", evicted);
	}
}

impl Default for TileCache {
	fn default() -> Self { Self::new(DEFAULT_CACHE_CAPACITY) }
}

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::types::{Region, ALIGNMENT};

/// Upper bound on the number of blocks in one slab.
pub const MAX_ITEMS_PER_SLAB: usize = 512;

/// A payload buffer. Its capacity is the size class it was drawn from, its length
/// the extent the owner asked for.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    region: Region,
}

impl Buffer {
    /// Wraps bytes that were not drawn from a pool, e.g. a receive buffer of the
    /// transport.
    pub(crate) fn adopt(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            data: bytes.into_boxed_slice(),
            len,
            region: Region::Delegated,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes actually held, i.e., the size class for pooled buffers.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }
}

/// Returns the size class serving requests of `bytes` bytes.
///
/// # Examples
/// ```
/// # use ambient::memory::slab::size_class;
/// assert_eq!(size_class(1), 64);
/// assert_eq!(size_class(64), 64);
/// assert_eq!(size_class(65), 128);
/// assert_eq!(size_class(5000), 8192);
/// ```
#[inline]
pub fn size_class(bytes: usize) -> usize {
    bytes.max(ALIGNMENT).next_power_of_two()
}

#[derive(Debug)]
struct FreeList {
    free: Vec<Box<[u8]>>,
    slabs: usize,
    items_per_slab: usize,
}

/// Size-classed slab allocator. Each class keeps a free list; an empty free list
/// is refilled by acquiring one slab worth of blocks from the system allocator.
#[derive(Debug)]
pub struct SlabPool {
    slab_bytes: usize,
    region: Region,
    /// Maximum number of slabs over all classes, `None` for unbounded.
    limit: Option<usize>,
    classes: Mutex<FxHashMap<usize, FreeList>>,
}

impl SlabPool {
    pub fn new(slab_bytes: usize, region: Region, limit: Option<usize>) -> Self {
        Self {
            slab_bytes,
            region,
            limit,
            classes: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of blocks per slab of the given size class.
    #[inline]
    pub fn items_per_slab(&self, class: usize) -> usize {
        (self.slab_bytes / class).clamp(1, MAX_ITEMS_PER_SLAB)
    }

    /// Draws a buffer of `len` bytes. Returns `Ok(None)` if the pool is bounded and
    /// would have to exceed its slab limit.
    pub fn allocate(&self, len: usize) -> Result<Option<Buffer>> {
        let class = size_class(len);
        let mut classes = self.classes.lock();
        let acquired: usize = classes.values().map(|list| list.slabs).sum();
        let items_per_slab = self.items_per_slab(class);
        let list = classes.entry(class).or_insert_with(|| FreeList {
            free: Vec::new(),
            slabs: 0,
            items_per_slab,
        });

        if list.free.is_empty() {
            if self.limit.is_some_and(|limit| acquired >= limit) {
                return Ok(None);
            }
            list.free = acquire_slab(class, list.items_per_slab)?;
            list.slabs += 1;
        }

        let data = list.free.pop().expect("freshly acquired slab is not empty");
        Ok(Some(Buffer {
            data,
            len,
            region: self.region,
        }))
    }

    /// Puts a buffer back on the free list of its size class.
    ///
    /// # Panics
    /// Panics if the buffer was not drawn from a pool of this region.
    pub fn free(&self, buffer: Buffer) {
        assert_eq!(
            buffer.region, self.region,
            "buffer returned to a pool of the wrong region"
        );
        let class = buffer.capacity();
        let items_per_slab = self.items_per_slab(class);
        self.classes
            .lock()
            .entry(class)
            .or_insert_with(|| FreeList {
                free: Vec::new(),
                slabs: 0,
                items_per_slab,
            })
            .free
            .push(buffer.data);
    }

    /// Total number of slabs acquired so far.
    pub fn slabs(&self) -> usize {
        self.classes.lock().values().map(|list| list.slabs).sum()
    }

    /// Number of free blocks of the size class serving `len` bytes.
    pub fn available(&self, len: usize) -> usize {
        self.classes
            .lock()
            .get(&size_class(len))
            .map_or(0, |list| list.free.len())
    }
}

/// Acquires a slab of `items` blocks of `class` bytes each.
fn acquire_slab(class: usize, items: usize) -> Result<Vec<Box<[u8]>>> {
    let exhausted = || Error::AllocationExhausted {
        class,
        bytes: class * items,
    };

    let mut blocks = Vec::new();
    blocks.try_reserve_exact(items).map_err(|_| exhausted())?;
    for _ in 0..items {
        let mut block = Vec::new();
        block.try_reserve_exact(class).map_err(|_| exhausted())?;
        block.resize(class, 0u8);
        blocks.push(block.into_boxed_slice());
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slabs_for_k_items() {
        let pool = SlabPool::new(4096, Region::Standard, None);
        // 256 byte class -> 16 items per slab
        assert_eq!(pool.items_per_slab(256), 16);

        for k in [1usize, 15, 16, 17, 40] {
            let pool = SlabPool::new(4096, Region::Standard, None);
            let buffers = (0..k)
                .map(|_| pool.allocate(200).unwrap().unwrap())
                .collect::<Vec<_>>();
            assert_eq!(pool.slabs(), k.div_ceil(16), "k = {k}");
            assert!(buffers.iter().all(|b| b.len() == 200 && b.capacity() == 256));
        }
    }

    #[test]
    fn test_freed_blocks_are_reused() {
        let pool = SlabPool::new(1024, Region::Standard, None);
        let k = 10;
        let buffers = (0..k)
            .map(|_| pool.allocate(128).unwrap().unwrap())
            .collect::<Vec<_>>();
        let slabs = pool.slabs();
        assert_eq!(slabs, 2);

        for buffer in buffers {
            pool.free(buffer);
        }
        assert_eq!(pool.available(128), 2 * 8);

        let _again = (0..k)
            .map(|_| pool.allocate(128).unwrap().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(pool.slabs(), slabs);
    }

    #[test]
    fn test_oversized_request_gets_one_item_slab() {
        let pool = SlabPool::new(1024, Region::Standard, None);
        let buffer = pool.allocate(3000).unwrap().unwrap();
        assert_eq!(buffer.capacity(), 4096);
        assert_eq!(pool.items_per_slab(4096), 1);
        assert_eq!(pool.slabs(), 1);
    }

    #[test]
    fn test_limit() {
        let pool = SlabPool::new(128, Region::Bulked, Some(1));
        let first = pool.allocate(64).unwrap();
        let second = pool.allocate(64).unwrap();
        assert!(first.is_some() && second.is_some());
        assert!(pool.allocate(64).unwrap().is_none());

        pool.free(first.unwrap());
        assert!(pool.allocate(64).unwrap().is_some());
    }

    #[test]
    #[should_panic(expected = "buffer returned to a pool of the wrong region")]
    fn test_free_wrong_region() {
        let standard = SlabPool::new(128, Region::Standard, None);
        let bulk = SlabPool::new(128, Region::Bulked, None);
        bulk.free(standard.allocate(64).unwrap().unwrap());
    }
}

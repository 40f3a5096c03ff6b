//! Bounded-time kernel heap.
//!
//! A segregated free-list allocator over a fixed pool of pages. Block
//! sizes are powers of two from `HEAP_MIN_ALLOC` up to one page; larger
//! requests take whole contiguous pages. Freed blocks go back on their
//! bucket and are never coalesced, so both paths are O(1) once a bucket
//! has been primed, and priming is a single bounded page scan.
//!
//! Task stacks, named objects, and FPU save areas all come from here so
//! real-time allocation never touches host-locked memory. Every payload
//! is aligned to `HEAP_MIN_ALIGN` (16), enough for an FXSAVE area
//! embedded in a heap object.

use core::ptr;

use quartz_abi::config::{HEAP_MIN_ALIGN, HEAP_MIN_ALLOC, HEAP_PAGE_SIZE, HEAP_PAGES};
use quartz_lib::IrqMutex;
use quartz_lib::klog_warn;

const POOL_SIZE: usize = HEAP_PAGES * HEAP_PAGE_SIZE;
const NUM_BUCKETS: usize = (HEAP_PAGE_SIZE / HEAP_MIN_ALLOC).trailing_zeros() as usize + 1;

/// Per-block header, placed `HEADER_SIZE` bytes before the payload.
/// Sized to a full alignment unit so payloads stay 16-aligned.
const HEADER_SIZE: usize = HEAP_MIN_ALIGN;
const BLOCK_MAGIC: u32 = 0x5154_4D4D; // "QTMM"

#[repr(C)]
struct BlockHeader {
    magic: u32,
    /// Bucket index, or `PAGE_RUN_BUCKET` for a whole-page run.
    bucket: u16,
    /// Page count for whole-page runs.
    pages: u16,
    _pad: u64,
}

const PAGE_RUN_BUCKET: u16 = u16::MAX;

const _: () = {
    assert!(core::mem::size_of::<BlockHeader>() == HEADER_SIZE);
    assert!(HEAP_MIN_ALLOC >= core::mem::size_of::<usize>() + HEADER_SIZE);
};

struct Heap {
    pool: [u8; POOL_SIZE],
    /// Free list head per bucket: offset into `pool` of the first free
    /// block, or `usize::MAX`. Free blocks store the next offset in
    /// their first payload word.
    free_heads: [usize; NUM_BUCKETS],
    /// One bit per page: set while the page is in use.
    page_map: [u64; HEAP_PAGES.div_ceil(64)],
    initialized: bool,
    failed_allocs: u64,
}

const NO_BLOCK: usize = usize::MAX;

impl Heap {
    const fn new() -> Self {
        Self {
            pool: [0; POOL_SIZE],
            free_heads: [NO_BLOCK; NUM_BUCKETS],
            page_map: [0; HEAP_PAGES.div_ceil(64)],
            initialized: false,
            failed_allocs: 0,
        }
    }

    fn init(&mut self) {
        self.free_heads = [NO_BLOCK; NUM_BUCKETS];
        self.page_map = [0; HEAP_PAGES.div_ceil(64)];
        self.failed_allocs = 0;
        self.initialized = true;
    }

    #[inline]
    fn bucket_for(size: usize) -> Option<usize> {
        let need = size + HEADER_SIZE;
        if need > HEAP_PAGE_SIZE {
            return None;
        }
        let block = need.next_power_of_two().max(HEAP_MIN_ALLOC);
        Some((block / HEAP_MIN_ALLOC).trailing_zeros() as usize)
    }

    #[inline]
    fn bucket_block_size(bucket: usize) -> usize {
        HEAP_MIN_ALLOC << bucket
    }

    fn page_in_use(&self, page: usize) -> bool {
        self.page_map[page / 64] & (1 << (page % 64)) != 0
    }

    fn set_page(&mut self, page: usize, used: bool) {
        if used {
            self.page_map[page / 64] |= 1 << (page % 64);
        } else {
            self.page_map[page / 64] &= !(1 << (page % 64));
        }
    }

    /// Claim `count` contiguous free pages; returns the first page index.
    fn claim_pages(&mut self, count: usize) -> Option<usize> {
        let mut run = 0usize;
        for page in 0..HEAP_PAGES {
            if self.page_in_use(page) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    let first = page + 1 - count;
                    for p in first..=page {
                        self.set_page(p, true);
                    }
                    return Some(first);
                }
            }
        }
        None
    }

    /// Read the free-list link stored in a free block's payload word.
    fn read_link(&self, offset: usize) -> usize {
        let mut raw = [0u8; core::mem::size_of::<usize>()];
        let len = raw.len();
        raw.copy_from_slice(&self.pool[offset..offset + len]);
        usize::from_ne_bytes(raw)
    }

    fn write_link(&mut self, offset: usize, next: usize) {
        self.pool[offset..offset + core::mem::size_of::<usize>()]
            .copy_from_slice(&next.to_ne_bytes());
    }

    fn write_header(&mut self, offset: usize, bucket: u16, pages: u16) {
        let header = BlockHeader {
            magic: BLOCK_MAGIC,
            bucket,
            pages,
            _pad: 0,
        };
        // SAFETY: offset + HEADER_SIZE is within the pool by construction.
        unsafe {
            ptr::write_unaligned(
                self.pool.as_mut_ptr().add(offset) as *mut BlockHeader,
                header,
            );
        }
    }

    fn read_header(&self, offset: usize) -> BlockHeader {
        // SAFETY: offset validated by the caller against the pool bounds.
        unsafe { ptr::read_unaligned(self.pool.as_ptr().add(offset) as *const BlockHeader) }
    }

    /// Carve one fresh page into `bucket`-sized blocks and thread them
    /// onto the free list.
    fn prime_bucket(&mut self, bucket: usize) -> bool {
        let Some(page) = self.claim_pages(1) else {
            return false;
        };
        let block = Self::bucket_block_size(bucket);
        let base = page * HEAP_PAGE_SIZE;
        let mut head = self.free_heads[bucket];
        let mut offset = base;
        while offset + block <= base + HEAP_PAGE_SIZE {
            self.write_link(offset, head);
            head = offset;
            offset += block;
        }
        self.free_heads[bucket] = head;
        true
    }

    fn alloc(&mut self, size: usize) -> usize {
        if !self.initialized || size == 0 {
            return NO_BLOCK;
        }
        match Self::bucket_for(size) {
            Some(bucket) => {
                if self.free_heads[bucket] == NO_BLOCK && !self.prime_bucket(bucket) {
                    self.failed_allocs += 1;
                    return NO_BLOCK;
                }
                let offset = self.free_heads[bucket];
                self.free_heads[bucket] = self.read_link(offset);
                self.write_header(offset, bucket as u16, 0);
                offset + HEADER_SIZE
            }
            None => {
                let pages = (size + HEADER_SIZE).div_ceil(HEAP_PAGE_SIZE);
                let Some(first) = self.claim_pages(pages) else {
                    self.failed_allocs += 1;
                    return NO_BLOCK;
                };
                let offset = first * HEAP_PAGE_SIZE;
                self.write_header(offset, PAGE_RUN_BUCKET, pages as u16);
                offset + HEADER_SIZE
            }
        }
    }

    fn free(&mut self, payload: usize) -> bool {
        if payload < HEADER_SIZE || payload >= POOL_SIZE {
            return false;
        }
        let offset = payload - HEADER_SIZE;
        let header = self.read_header(offset);
        if header.magic != BLOCK_MAGIC {
            return false;
        }
        if header.bucket == PAGE_RUN_BUCKET {
            let first = offset / HEAP_PAGE_SIZE;
            for page in first..first + header.pages as usize {
                self.set_page(page, false);
            }
        } else {
            let bucket = header.bucket as usize;
            if bucket >= NUM_BUCKETS {
                return false;
            }
            let head = self.free_heads[bucket];
            self.write_link(offset, head);
            self.free_heads[bucket] = offset;
        }
        true
    }
}

static HEAP: IrqMutex<Heap> = IrqMutex::new(Heap::new());

pub fn heap_init() {
    HEAP.lock().init();
}

/// Allocate `size` bytes from the real-time heap. Null on exhaustion.
pub fn rt_malloc(size: usize) -> *mut u8 {
    let mut heap = HEAP.lock();
    let offset = heap.alloc(size);
    if offset == NO_BLOCK {
        return ptr::null_mut();
    }
    // SAFETY: offset is a valid payload offset inside the static pool.
    unsafe { heap.pool.as_mut_ptr().add(offset) }
}

/// Return a block to the heap. Invalid pointers are logged and dropped
/// rather than corrupting the free lists.
pub fn rt_free(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let mut heap = HEAP.lock();
    let base = heap.pool.as_ptr() as usize;
    let addr = p as usize;
    if addr < base || addr >= base + POOL_SIZE || !heap.free(addr - base) {
        klog_warn!("MM: rt_free of foreign or corrupt block {:p}", p);
    }
}

/// Number of allocation failures since init. For diagnostics only.
pub fn failed_alloc_count() -> u64 {
    HEAP.lock().failed_allocs
}

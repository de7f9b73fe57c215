//! Shared fuzzing and testing infrastructure for `segheap`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use segheap::{
    Arena, FatalHandler, Heap, HeapError, Panic, RegionSource, ALIGNMENT, MIN_BLOCK_SIZE,
    PAGE_SIZE,
};
use std::{collections::BTreeMap, ptr::NonNull};

/// The payload length of a test allocation or resize.
//
// Note: a newtype rather than a bare `usize` so that it can have its own
// default mutator, which biases towards the sizes the heap treats specially.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self {
            max_size: 16 * PAGE_SIZE,
        }
    }
}

/// The largest payload that still lands in a quick-cache size class.
const MAX_QUICK_PAYLOAD: usize = MIN_BLOCK_SIZE + 11 * ALIGNMENT - 2 * 8;

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        // Any size up to the maximum.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        if !c.shrink() {
            // A small size, served from the quick cache once released.
            c.mutation(|ctx| {
                size.0 = 1 + ctx.rng().gen_index(MAX_QUICK_PAYLOAD).unwrap();
                Ok(())
            })?;

            // Just around a page boundary, where the region has to grow.
            c.mutation(|ctx| {
                let pages = 1 + ctx.rng().gen_index(4).unwrap();
                let jitter = ctx.rng().gen_index(2 * ALIGNMENT + 1).unwrap();
                size.0 = (pages * PAGE_SIZE + jitter).saturating_sub(ALIGNMENT + MIN_BLOCK_SIZE);
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = if context.rng().gen_bool() {
            m::range(1..=MAX_QUICK_PAYLOAD).generate(context)?
        } else {
            m::range(0..=self.max_size).generate(context)?
        };
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Free { id: u32 },
    Resize { id: u32, size: Size },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Resize {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Free { id } | Op::Resize { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Free an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, Op::Resize { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh heap over an arena of
    /// `arena_len` bytes.
    pub fn run(&self, arena_len: usize) -> Result<(), String> {
        let mut memory = vec![0u8; arena_len];
        let heap = Heap::new(Arena::new(&mut memory), Panic);
        self.run_with_heap(heap)
    }

    /// Run these test operations with the given heap.
    pub fn run_with_heap<S, F>(&self, mut heap: Heap<S, F>) -> Result<(), String>
    where
        S: RegionSource,
        F: FatalHandler,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::default();
        let mut peak = heap.max_payload();

        // Release an allocation, checking that its contents survived.
        let release = |heap: &mut Heap<S, F>, id: u32, alloc: LiveAlloc| -> Result<(), String> {
            log::debug!("releasing id{id} -> {alloc:?}");
            alloc.check_contents(alloc.len)?;
            alloc.fill(FREE_POISON_PATTERN);
            unsafe { heap.release(alloc.ptr) };
            Ok(())
        };

        // Check a pointer freshly returned by the heap for `size` bytes.
        let check_new = |heap: &Heap<S, F>,
                         live: &LiveMap,
                         ptr: NonNull<u8>,
                         size: usize|
         -> Result<(), String> {
            ensure!(
                ptr.as_ptr() as usize % ALIGNMENT == 0,
                "{ptr:p} is not {ALIGNMENT}-byte aligned",
            );
            ensure!(
                heap.payload_len(ptr) == Ok(size),
                "recorded payload length of {ptr:p} is {:?}, expected {size}",
                heap.payload_len(ptr),
            );
            let start = ptr.as_ptr() as usize;
            let end = start + size;
            for other in live.map.values() {
                let other_start = other.ptr.as_ptr() as usize;
                let other_end = other_start + other.len;
                ensure!(
                    end <= other_start || other_end <= start,
                    "two distinct live allocations should never overlap",
                );
            }
            Ok(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size } => {
                    if let Some(old) = live.remove(id) {
                        release(&mut heap, id, old)?;
                    }

                    match heap.allocate(size.0) {
                        Ok(Some(ptr)) => {
                            ensure!(size.0 != 0, "zero-size allocation returned {ptr:p}");
                            check_new(&heap, &live, ptr, size.0)?;
                            let alloc = LiveAlloc::new(ptr, size.0, id);
                            alloc.fill(alloc.byte);
                            live.insert(id, alloc);
                        }
                        Ok(None) => ensure!(size.0 == 0, "allocation of {} returned nothing", size.0),
                        Err(HeapError::OutOfMemory) => {}
                        Err(e) => return Err(format!("allocation of {} failed: {e}", size.0)),
                    }
                }

                Op::Free { id } => {
                    if let Some(alloc) = live.remove(id) {
                        release(&mut heap, id, alloc)?;
                    }
                }

                Op::Resize { id, size } => {
                    if let Some(old) = live.remove(id) {
                        old.check_contents(old.len)?;
                        match unsafe { heap.resize(old.ptr, size.0) } {
                            Ok(Some(ptr)) => {
                                check_new(&heap, &live, ptr, size.0)?;
                                let new = LiveAlloc::new(ptr, size.0, id);
                                new.check_contents(old.len.min(size.0))?;
                                new.fill(new.byte);
                                live.insert(id, new);
                            }
                            Ok(None) => ensure!(size.0 == 0, "resize to {} released", size.0),
                            Err(HeapError::OutOfMemory) => {
                                ensure!(
                                    heap.payload_len(old.ptr) == Ok(old.len),
                                    "failed resize disturbed the allocation",
                                );
                                live.insert(id, old);
                            }
                            Err(e) => return Err(format!("resize of live id{id} failed: {e}")),
                        }
                    }
                }
            }

            if let Err(e) = heap.check_integrity() {
                return Err(format!("heap corrupted after {op:?}: {e}"));
            }
            ensure!(
                heap.current_payload() == live.total_payload,
                "heap reports {} live payload bytes, expected {}",
                heap.current_payload(),
                live.total_payload,
            );
            peak = peak.max(live.total_payload);
            ensure!(
                heap.max_payload() == peak,
                "heap reports a high-water mark of {}, expected {peak}",
                heap.max_payload(),
            );
            let tiled: usize = heap.blocks().map(|b| b.size()).sum();
            ensure!(
                heap.region_len() == 0 || tiled + SENTINEL_BYTES == heap.region_len(),
                "blocks cover {tiled} of {} region bytes",
                heap.region_len(),
            );
        }

        // Finally, release any remaining live allocations.
        for (id, alloc) in std::mem::take(&mut live.map) {
            release(&mut heap, id, alloc)?;
        }
        ensure!(
            heap.current_payload() == 0,
            "{} payload bytes still live after releasing everything",
            heap.current_payload(),
        );
        heap.check_integrity().map_err(|e| e.to_string())?;

        Ok(())
    }
}

const FREE_POISON_PATTERN: u8 = 0xFF;

/// Region bytes that belong to no block.
const SENTINEL_BYTES: usize = 48;

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    len: usize,
    /// The byte the whole payload is filled with.
    byte: u8,
}

impl LiveAlloc {
    fn new(ptr: NonNull<u8>, len: usize, id: u32) -> Self {
        // Never the free poison pattern, and distinct for neighbouring ids.
        let byte = 0x10 | (id as u8 & 0x3F);
        LiveAlloc { ptr, len, byte }
    }

    fn fill(&self, byte: u8) {
        unsafe { self.ptr.as_ptr().write_bytes(byte, self.len) };
    }

    /// Check that the first `prefix` bytes still hold the fill pattern of
    /// this allocation's id.
    fn check_contents(&self, prefix: usize) -> Result<(), String> {
        let slice = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), prefix) };
        ensure!(
            slice.iter().all(|b| *b == self.byte),
            "contents of {:p} were not preserved",
            self.ptr,
        );
        Ok(())
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{:p}", self.ptr))
            .field("len", &self.len)
            .field("byte", &self.byte)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,

    /// The sum of the live allocations' payload lengths.
    total_payload: usize,
}

impl LiveMap {
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_payload += alloc.len;
        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and release old entries before adding new ones"
        );
    }

    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_payload -= alloc.len;
        Some(alloc)
    }
}

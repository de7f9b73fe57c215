use super::*;
use crate::block::PAGE_SIZE;
use crate::fatal::Panic;
use crate::region::Arena;
use std::vec;
use std::vec::Vec;

/// Bytes taken by the pad word, the prologue, and the epilogue.
const SENTINELS: usize = 48;

fn memory(pages: usize) -> Vec<u8> {
    vec![0u8; pages * PAGE_SIZE + ALIGNMENT]
}

fn new_heap(memory: &mut [u8]) -> Heap<Arena<'_>, Panic> {
    let _ = env_logger::try_init();
    Heap::new(Arena::new(memory), Panic)
}

fn alloc<S: RegionSource, F: FatalHandler>(heap: &mut Heap<S, F>, size: usize) -> NonNull<u8> {
    heap.allocate(size)
        .expect("allocation should succeed")
        .expect("non-zero allocation should return a pointer")
}

fn layout<S, F>(heap: &Heap<S, F>) -> Vec<(usize, BlockState)> {
    heap.blocks().map(|b| (b.size(), b.state())).collect()
}

#[test]
fn zero_size_allocation_is_not_an_error() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);
    assert_eq!(heap.allocate(0), Ok(None));
    assert_eq!(heap.region_len(), 0);
    assert_eq!(heap.blocks().count(), 0);
    heap.check_integrity().unwrap();
}

#[test]
fn payload_length_round_trips() {
    let mut mem = memory(16);
    let mut heap = new_heap(&mut mem);

    for n in [1, 15, 16, 17, 31, 100, 208, 1000, 4000, 10_000] {
        let p = alloc(&mut heap, n);
        assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(heap.payload_len(p), Ok(n));

        let size = heap.block_size(p).unwrap();
        assert_eq!(size % ALIGNMENT, 0);
        assert!(size >= MIN_BLOCK_SIZE);
        assert!(size >= n + 2 * WORD_SIZE);

        // The whole payload is writable without disturbing the tags.
        unsafe { p.as_ptr().write_bytes(0xA5, n) };
        heap.check_integrity().unwrap();
    }
}

#[test]
fn blocks_tile_the_region() {
    let mut mem = memory(16);
    let mut heap = new_heap(&mut mem);

    let ptrs: Vec<_> = (1..40).map(|i| alloc(&mut heap, i * 37)).collect();
    for p in ptrs.iter().step_by(3) {
        unsafe { heap.release(*p) };
    }

    let total: usize = heap.blocks().map(|b| b.size()).sum();
    assert_eq!(total + SENTINELS, heap.region_len());
    heap.check_integrity().unwrap();
}

#[test]
fn freed_space_is_reused_without_growing() {
    let mut mem = memory(16);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 100);
    let q = alloc(&mut heap, 16284);
    let grown = heap.region_len();
    assert!(grown > PAGE_SIZE);

    unsafe {
        heap.release(p);
        heap.release(q);
    }
    heap.check_integrity().unwrap();

    // `p` sits in the quick cache; `q` merged with the tail of the region.
    assert_eq!(
        layout(&heap),
        [
            (128, BlockState::QuickCached),
            (grown - SENTINELS - 128, BlockState::Free),
        ]
    );

    let r = alloc(&mut heap, 10);
    assert_eq!(r, q);
    assert_eq!(heap.region_len(), grown);
    heap.check_integrity().unwrap();
}

#[test]
fn quick_cache_hit_returns_same_address() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 40);
    let _guard = alloc(&mut heap, 40);
    unsafe { heap.release(p) };
    assert_eq!(heap.validate(p), Err(InvalidPointer::InQuickCache));

    // A different size class does not touch the cached block.
    let other = alloc(&mut heap, 60);
    assert_ne!(other, p);

    let again = alloc(&mut heap, 40);
    assert_eq!(again, p);
    assert_eq!(heap.payload_len(again), Ok(40));
    heap.check_integrity().unwrap();
}

#[test]
fn full_quick_stack_is_flushed_into_free_lists() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let ptrs: Vec<_> = (0..6).map(|_| alloc(&mut heap, 100)).collect();
    for &p in &ptrs[..5] {
        unsafe { heap.release(p) };
    }
    let cached = layout(&heap)
        .iter()
        .filter(|(_, s)| *s == BlockState::QuickCached)
        .count();
    assert_eq!(cached, 5);
    heap.check_integrity().unwrap();

    unsafe { heap.release(ptrs[5]) };
    heap.check_integrity().unwrap();
    assert_eq!(
        layout(&heap),
        [
            (5 * 128, BlockState::Free),
            (128, BlockState::QuickCached),
            (PAGE_SIZE - SENTINELS - 6 * 128, BlockState::Free),
        ]
    );

    // The survivor is the one served next.
    assert_eq!(alloc(&mut heap, 100), ptrs[5]);
}

#[test]
fn growing_resize_moves_and_copies() {
    let mut mem = memory(8);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 100);
    let _guard = alloc(&mut heap, 100);
    for i in 0..100 {
        unsafe { p.as_ptr().add(i).write(i as u8) };
    }

    let q = unsafe { heap.resize(p, 1000) }.unwrap().unwrap();
    assert_ne!(q, p);
    assert_eq!(heap.payload_len(q), Ok(1000));
    for i in 0..100 {
        assert_eq!(unsafe { q.as_ptr().add(i).read() }, i as u8);
    }
    assert_eq!(heap.validate(p), Err(InvalidPointer::InQuickCache));

    // The old and new payloads were never live at the same time.
    assert_eq!(heap.current_payload(), 1100);
    assert_eq!(heap.max_payload(), 1100);
    heap.check_integrity().unwrap();
}

#[test]
fn shrinking_resize_keeps_small_remainder() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 100);
    let before = layout(&heap);

    let q = unsafe { heap.resize(p, 90) }.unwrap();
    assert_eq!(q, Some(p));
    assert_eq!(heap.payload_len(p), Ok(90));
    assert_eq!(heap.block_size(p), Ok(128));
    assert_eq!(heap.current_payload(), 90);
    assert_eq!(heap.max_payload(), 100);
    assert_eq!(layout(&heap).len(), before.len());
    heap.check_integrity().unwrap();
}

#[test]
fn shrinking_resize_splits_and_coalesces() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 1000);
    assert_eq!(heap.block_size(p), Ok(1024));

    let q = unsafe { heap.resize(p, 100) }.unwrap();
    assert_eq!(q, Some(p));
    assert_eq!(
        layout(&heap),
        [
            (128, BlockState::Allocated { payload_len: 100 }),
            (PAGE_SIZE - SENTINELS - 128, BlockState::Free),
        ]
    );
    assert_eq!(heap.current_payload(), 100);
    assert_eq!(heap.max_payload(), 1000);
    heap.check_integrity().unwrap();
}

#[test]
fn resize_to_same_length_is_a_no_op() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 64);
    assert_eq!(unsafe { heap.resize(p, 64) }, Ok(Some(p)));
    assert_eq!(heap.current_payload(), 64);
}

#[test]
fn resize_to_zero_releases() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 300);
    assert_eq!(unsafe { heap.resize(p, 0) }, Ok(None));
    assert_eq!(heap.current_payload(), 0);
    assert_eq!(heap.validate(p), Err(InvalidPointer::AlreadyFree));
    heap.check_integrity().unwrap();
}

#[test]
fn resize_rejects_bad_pointers_without_side_effects() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let mut local = 0u128;
    let foreign = NonNull::from(&mut local).cast::<u8>();
    assert_eq!(
        unsafe { heap.resize(foreign, 8) },
        Err(HeapError::InvalidPointer(InvalidPointer::OutOfBounds))
    );

    let p = alloc(&mut heap, 100);
    unsafe { p.as_ptr().write_bytes(0, 100) };
    let before = layout(&heap);

    let misaligned = unsafe { p.add(8) };
    assert_eq!(
        unsafe { heap.resize(misaligned, 8) },
        Err(HeapError::InvalidPointer(InvalidPointer::Misaligned))
    );
    let interior = unsafe { p.add(16) };
    assert_eq!(
        unsafe { heap.resize(interior, 8) },
        Err(HeapError::InvalidPointer(InvalidPointer::AlreadyFree))
    );
    assert_eq!(layout(&heap), before);
    assert_eq!(heap.current_payload(), 100);

    unsafe { heap.release(p) };
    assert_eq!(
        unsafe { heap.resize(p, 50) },
        Err(HeapError::InvalidPointer(InvalidPointer::InQuickCache))
    );
    heap.check_integrity().unwrap();
}

#[test]
fn validation_detects_damaged_tags() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 16);
    let _guard = alloc(&mut heap, 16);
    let header = unsafe { p.as_ptr().sub(WORD_SIZE).cast::<u64>() };
    let original = unsafe { header.read() };
    assert_eq!(heap.validate(p), Ok(()));

    // Writing one byte past the payload lands in the footer.
    unsafe { p.as_ptr().add(16).write(0xFF) };
    assert_eq!(heap.validate(p), Err(InvalidPointer::TagMismatch));

    unsafe { header.write(8 | 1) };
    assert_eq!(heap.validate(p), Err(InvalidPointer::BadSize));

    unsafe { header.write(0x4000_0000 | 1) };
    assert_eq!(heap.validate(p), Err(InvalidPointer::PastEpilogue));

    unsafe { header.write(original | 0x4) };
    assert_eq!(heap.validate(p), Err(InvalidPointer::BadSize));
}

#[test]
#[should_panic(expected = "block has already been released")]
fn double_release_is_fatal() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 1000);
    unsafe {
        heap.release(p);
        heap.release(p);
    }
}

#[test]
#[should_panic(expected = "block is in the quick cache")]
fn double_release_of_cached_block_is_fatal() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 10);
    unsafe {
        heap.release(p);
        heap.release(p);
    }
}

#[test]
#[should_panic(expected = "pointer is outside the heap")]
fn release_of_foreign_pointer_is_fatal() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);
    let _p = alloc(&mut heap, 10);

    let mut local = [0u128; 2];
    unsafe { heap.release(NonNull::from(&mut local).cast()) };
}

#[test]
fn large_requests_grow_the_region() {
    let mut mem = memory(64);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 100_000);
    assert_eq!(heap.region_len(), PAGE_SIZE + 25 * PAGE_SIZE);
    unsafe { p.as_ptr().write_bytes(0x11, 100_000) };
    heap.check_integrity().unwrap();

    unsafe { heap.release(p) };
    assert_eq!(
        layout(&heap),
        [(heap.region_len() - SENTINELS, BlockState::Free)]
    );
}

#[test]
fn exhaustion_leaves_heap_usable() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);

    let p = alloc(&mut heap, 100);
    assert_eq!(heap.allocate(5 * PAGE_SIZE), Err(HeapError::OutOfMemory));
    assert_eq!(heap.allocate(usize::MAX), Err(HeapError::OutOfMemory));
    assert_eq!(heap.region_len(), PAGE_SIZE);
    heap.check_integrity().unwrap();

    assert_eq!(
        unsafe { heap.resize(p, 5 * PAGE_SIZE) },
        Err(HeapError::OutOfMemory)
    );
    assert_eq!(heap.payload_len(p), Ok(100));
    assert_eq!(heap.max_payload(), 100);

    let q = alloc(&mut heap, 3000);
    assert_ne!(q, p);
    heap.check_integrity().unwrap();
}

#[test]
fn accounting_over_a_random_workload() {
    let mut mem = memory(1024);
    let mut heap = new_heap(&mut mem);

    // xorshift64*
    let mut state = 0x2545_F491_4F6C_DD1D_u64;
    let mut next = move || {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        state.wrapping_mul(0x2545_F491_4F6C_DD1D)
    };

    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
    let mut last_max = 0;

    for step in 0..3000u32 {
        let roll = next();
        let size = if roll % 16 == 0 {
            (next() % 20_000) as usize + 1
        } else {
            (next() % 300) as usize + 1
        };
        let fill = step as u8 | 1;

        match roll % 4 {
            0 | 1 if live.len() < 128 => {
                if let Ok(Some(p)) = heap.allocate(size) {
                    assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
                    unsafe { p.as_ptr().write_bytes(fill, size) };
                    live.push((p, size, fill));
                }
            }
            2 if !live.is_empty() => {
                let (p, len, byte) = live.swap_remove((next() as usize) % live.len());
                for i in 0..len {
                    assert_eq!(unsafe { p.as_ptr().add(i).read() }, byte);
                }
                unsafe { heap.release(p) };
            }
            3 if !live.is_empty() => {
                let index = (next() as usize) % live.len();
                let (p, len, byte) = live[index];
                if let Ok(Some(q)) = unsafe { heap.resize(p, size) } {
                    for i in 0..len.min(size) {
                        assert_eq!(unsafe { q.as_ptr().add(i).read() }, byte);
                    }
                    unsafe { q.as_ptr().write_bytes(fill, size) };
                    live[index] = (q, size, fill);
                }
            }
            _ => {}
        }

        heap.check_integrity().unwrap();
        let expected: usize = live.iter().map(|(_, len, _)| len).sum();
        assert_eq!(heap.current_payload(), expected);
        assert!(heap.max_payload() >= last_max);
        last_max = heap.max_payload();
    }
}

#[test]
fn debug_output_mentions_counters() {
    let mut mem = memory(4);
    let mut heap = new_heap(&mut mem);
    let _p = alloc(&mut heap, 10);
    let s = std::format!("{heap:?}");
    assert!(s.contains("current_payload: 10"), "{s}");
}

use std::cell::Cell;
use std::io;
use std::ptr::NonNull;

use proptest::prelude::*;
use vmarena_core::{
    ArenaError, ArenaSlice, ArenaStats, BumpArena, OsVirtualMemory, VirtualMemory, COMMIT_GRANULARITY,
};

const MIB: usize = 1024 * 1024;

/// OS backend that refuses commits once its budget is spent.
struct BudgetedMemory {
    os: OsVirtualMemory,
    commits_left: Cell<usize>,
}

impl BudgetedMemory {
    fn new(commits: usize) -> Self {
        Self {
            os: OsVirtualMemory,
            commits_left: Cell::new(commits),
        }
    }
}

impl VirtualMemory for BudgetedMemory {
    fn reserve(&self, size: usize) -> io::Result<NonNull<u8>> {
        self.os.reserve(size)
    }

    unsafe fn commit(&self, addr: NonNull<u8>, size: usize) -> io::Result<()> {
        let left = self.commits_left.get();
        if left == 0 {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "commit budget spent"));
        }
        self.commits_left.set(left - 1);
        self.os.commit(addr, size)
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) {
        self.os.release(base, size)
    }

    unsafe fn discard(&self, addr: NonNull<u8>, size: usize) -> io::Result<()> {
        self.os.discard(addr, size)
    }
}

/// Backend whose reservations always fail.
struct NoAddressSpace;

impl VirtualMemory for NoAddressSpace {
    fn reserve(&self, _size: usize) -> io::Result<NonNull<u8>> {
        Err(io::Error::new(io::ErrorKind::OutOfMemory, "address space exhausted"))
    }

    unsafe fn commit(&self, _addr: NonNull<u8>, _size: usize) -> io::Result<()> {
        unreachable!("nothing was reserved")
    }

    unsafe fn release(&self, _base: NonNull<u8>, _size: usize) {
        unreachable!("nothing was reserved")
    }

    unsafe fn discard(&self, _addr: NonNull<u8>, _size: usize) -> io::Result<()> {
        unreachable!("nothing was reserved")
    }
}

#[test]
fn reservation_failure_is_reported() {
    let err = BumpArena::with_backend(NoAddressSpace, MIB).unwrap_err();
    assert!(matches!(err, ArenaError::ReservationFailed { size, .. } if size == MIB));
}

#[test]
fn huge_reservation_fails_without_panicking() {
    assert!(matches!(
        BumpArena::new(usize::MAX),
        Err(ArenaError::ReservationFailed { .. })
    ));
}

#[test]
fn failed_commit_leaves_arena_untouched() {
    let mut arena = BumpArena::with_backend(BudgetedMemory::new(1), MIB).unwrap();
    let first = arena.push(100).unwrap();
    arena.bytes_mut(first).fill(0x5A);
    assert_eq!(arena.committed_bytes(), COMMIT_GRANULARITY);

    let err = arena.push_aligned(COMMIT_GRANULARITY, 64).unwrap_err();
    assert!(matches!(
        err,
        ArenaError::CommitFailed { offset, size, .. }
            if offset == COMMIT_GRANULARITY && size == COMMIT_GRANULARITY
    ));
    assert_eq!(arena.cursor(), 100);
    assert_eq!(arena.committed_bytes(), COMMIT_GRANULARITY);
    assert!(arena.bytes(first).iter().all(|&b| b == 0x5A));

    // Pushes that fit the committed range still succeed.
    let small = arena.push(1000).unwrap();
    assert_eq!(small.offset(), 100);
}

#[test]
fn alignment_is_address_exact() {
    let mut arena = BumpArena::new(MIB).unwrap();
    for &align in &[1usize, 2, 4, 8, 16, 64, 4096] {
        // Knock the cursor off alignment first.
        arena.push(3).unwrap();
        let slice = arena.push_aligned(24, align).unwrap();
        let addr = arena.address_of(slice).unwrap();
        assert_eq!(addr % align, 0, "alignment {align}");
        assert_eq!(slice.offset(), addr - arena.base_addr().unwrap());
    }
}

#[test]
fn lifo_pop_reuses_address() {
    let mut arena = BumpArena::new(MIB).unwrap();
    let a = arena.push(40).unwrap();
    let _b = arena.push(72).unwrap();

    arena.pop(a);
    assert_eq!(arena.cursor(), a.offset());

    let c = arena.push(8).unwrap();
    assert_eq!(c.offset(), a.offset());
    assert_eq!(arena.address_of(c), arena.address_of(a));
}

#[test]
fn destroyed_arena_rejects_pushes() {
    let mut arena = BumpArena::new(MIB).unwrap();
    arena.push(10).unwrap();
    arena.destroy();
    assert!(arena.base_addr().is_none());
    assert!(matches!(arena.push(1), Err(ArenaError::Destroyed)));
    assert!(matches!(
        arena.push_aligned(1, 16),
        Err(ArenaError::Destroyed)
    ));
}

#[test]
fn stats_serialize_to_json() {
    let mut arena = BumpArena::new(MIB).unwrap();
    arena.push(COMMIT_GRANULARITY + 1).unwrap();

    let value = serde_json::to_value(arena.stats()).unwrap();
    assert_eq!(value["reserved_bytes"], MIB);
    assert_eq!(value["committed_bytes"], 2 * COMMIT_GRANULARITY);
    assert_eq!(value["used_bytes"], COMMIT_GRANULARITY + 1);
    assert_eq!(value["valid"], true);

    let back: ArenaStats = serde_json::from_value(value).unwrap();
    assert_eq!(back, arena.stats());
}

#[test]
fn arena_can_move_across_threads() {
    let mut arena = BumpArena::new(MIB).unwrap();
    let s = arena.push_string("from main").unwrap();
    let arena = std::thread::spawn(move || {
        assert_eq!(arena.bytes(s), b"from main\0");
        arena
    })
    .join()
    .unwrap();
    assert_eq!(arena.cursor(), 10);
}

#[derive(Debug, Clone)]
enum Op {
    Push { size: usize, align_shift: u32 },
    PopLast,
    Reset,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0usize..3 * COMMIT_GRANULARITY, 0u32..13)
            .prop_map(|(size, align_shift)| Op::Push { size, align_shift }),
        2 => Just(Op::PopLast),
        1 => Just(Op::Reset),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn bookkeeping_invariants_hold(ops in prop::collection::vec(op(), 1..40)) {
        let mut arena = BumpArena::new(64 * MIB).unwrap();
        let mut live: Vec<ArenaSlice> = Vec::new();
        let mut high_water = 0;

        for op in ops {
            match op {
                Op::Push { size, align_shift } => {
                    let align = 1usize << align_shift;
                    let before = arena.cursor();
                    match arena.push_aligned(size, align) {
                        Ok(slice) => {
                            prop_assert!(slice.offset() >= before);
                            prop_assert_eq!(arena.address_of(slice).unwrap() % align, 0);
                            prop_assert!(arena.bytes(slice).iter().all(|&b| b == 0));
                            arena.bytes_mut(slice).fill(0xC3);
                            live.push(slice);
                        }
                        Err(ArenaError::OutOfMemory { .. }) => prop_assert_eq!(arena.cursor(), before),
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                }
                Op::PopLast => {
                    if let Some(slice) = live.pop() {
                        arena.pop(slice);
                        prop_assert_eq!(arena.cursor(), slice.offset());
                    }
                }
                Op::Reset => {
                    arena.reset();
                    live.clear();
                    prop_assert_eq!(arena.cursor(), 0);
                }
            }

            let committed = arena.committed_bytes();
            prop_assert_eq!(committed % COMMIT_GRANULARITY, 0);
            prop_assert!(committed >= arena.cursor());
            prop_assert!(committed <= arena.reserved_size());
            prop_assert!(committed >= high_water);
            high_water = committed;
            prop_assert!(arena.spare_committed().iter().all(|&b| b == 0));
        }
    }
}

use emu_memory::page::PAGE_SIZE;
use emu_memory::{Access, Placement, ReservationPolicy, SegmentError, SegmentId, SegmentTable};

fn table() -> SegmentTable {
    SegmentTable::new(
        ReservationPolicy {
            default: 4 * PAGE_SIZE,
            writable: 32 * PAGE_SIZE,
        },
        Placement::Anywhere,
    )
}

#[test]
fn policy_reserves_more_for_writable_segments() {
    let mut t = table();
    let code = t.allocate(Access::ExecRead, 10).unwrap();
    let data = t.allocate(Access::ReadWrite, 10).unwrap();
    assert_eq!(code.reserved(), 4 * PAGE_SIZE);
    assert_eq!(data.reserved(), 32 * PAGE_SIZE);
}

#[test]
fn default_policy_matches_documented_sizes() {
    let p = ReservationPolicy::default();
    assert_eq!(p.for_access(Access::ReadOnly), 16 * 1024 * 1024);
    assert_eq!(p.for_access(Access::ReadWrite), 256 * 1024 * 1024);
}

#[test]
fn ids_are_dense_and_reused() {
    let mut t = table();
    let a = t.allocate(Access::ReadWrite, 1).unwrap();
    let b = t.allocate(Access::ReadWrite, 1).unwrap();
    assert_eq!(a.id(), SegmentId(0));
    assert_eq!(b.id(), SegmentId(1));
    assert_eq!(t.len(), 2);

    drop(a);
    assert!(t.get(SegmentId(0)).is_none());
    assert_eq!(t.len(), 1);

    let c = t.allocate(Access::ReadWrite, 1).unwrap();
    assert_eq!(c.id(), SegmentId(0));
}

#[test]
fn segment_outlives_table_lookup_while_referenced() {
    let mut t = table();
    let a = t.allocate(Access::ReadWrite, 64).unwrap();
    let again = t.get(a.id()).unwrap();
    drop(a);
    assert_eq!(again.size(), 64);
    assert!(t.get(again.id()).is_some());
}

#[test]
fn committed_never_exceeds_reserved() {
    let mut t = table();
    let s = t.allocate(Access::ReadWrite, 0).unwrap();
    let mut last = s.size();
    for size in [1, PAGE_SIZE, 5 * PAGE_SIZE + 3, 32 * PAGE_SIZE, 32 * PAGE_SIZE + 1] {
        let result = s.grow(Access::ReadWrite, size);
        assert!(s.size() <= s.reserved());
        assert!(s.size() >= last);
        last = s.size();
        if size > s.reserved() {
            assert!(matches!(result, Err(SegmentError::ReservationExceeded { .. })));
        } else {
            result.unwrap();
        }
    }
}

#[test]
fn initial_size_larger_than_reservation_widens_it() {
    let mut t = table();
    let s = t.allocate(Access::ReadOnly, 6 * PAGE_SIZE).unwrap();
    assert_eq!(s.reserved(), 6 * PAGE_SIZE);
}

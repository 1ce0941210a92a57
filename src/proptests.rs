use super::*;

use crate::tests::CountingAlloc;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

type Shape = decomposition![4, 8, 4];
type Map<'a> = ShadowMap<u16, [u8; 16], Shape, &'a CountingAlloc>;

/// Checks the tree against the set of leaf bases the model says were written.
fn validate_map(map: &Map<'_>, bases: &BTreeSet<u16>) {
    let mut seen = Vec::new();
    map.for_each_leaf(|base, _| seen.push(base));
    assert_eq!(
        seen,
        bases.iter().copied().collect::<Vec<_>>(),
        "live leaves must be exactly the written ones, ascending"
    );

    let tops: BTreeSet<u16> = bases.iter().map(|b| b >> 12).collect();
    let stats = map.stats();
    assert_eq!(stats.leaves, bases.len());
    assert_eq!(stats.levels, tops.len(), "one interior node per top index");
    assert_eq!(map.allocator().acquired.get(), stats.nodes());
    assert_eq!(map.allocator().released.get(), 0);
}

#[derive(Clone, Debug)]
enum Op {
    Write(u16, u8),
    Read(u16),
    Fill(u16, u16, u8),
}

fn addr_strategy() -> impl Strategy<Value = u16> + Clone {
    // Narrow the middle byte so reads regularly land in written leaves.
    (0u16..4, 0u16..8, 0u16..16).prop_map(|(top, mid, low)| (top << 12) | (mid << 4) | low)
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let addr = addr_strategy();
    let op = prop_oneof![
        40 => (addr.clone(), 1u8..).prop_map(|(a, v)| Op::Write(a, v)),
        50 => addr.clone().prop_map(Op::Read),
        10 => (addr.clone(), 0u16..64, 1u8..).prop_map(|(a, n, v)| Op::Fill(a, n, v)),
    ];
    prop::collection::vec(op, 0..=500)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 10_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_equivalence_with_model(ops in ops_strategy()) {
        let alloc = CountingAlloc::default();
        let mut map: Map<'_> = ShadowMap::with_allocator(&alloc);
        let mut values: BTreeMap<u16, u8> = BTreeMap::new();
        let mut bases: BTreeSet<u16> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Write(addr, v) => {
                    map.leaf_for_write(addr)[Map::offset(addr)] = v;
                    values.insert(addr, v);
                    bases.insert(Map::leaf_base(addr));
                }
                Op::Read(addr) => {
                    let got = map.leaf(addr).map(|r| r[Map::offset(addr)]);
                    let expected = bases
                        .contains(&Map::leaf_base(addr))
                        .then(|| values.get(&addr).copied().unwrap_or(0));
                    prop_assert_eq!(got, expected);
                }
                Op::Fill(start, len, v) => {
                    let len = u64::from(len).min(0x1_0000 - u64::from(start));
                    map.for_each_run_mut(start, len, |_, rec, range| rec[range].fill(v)).unwrap();
                    for addr in (0..len).map(|i| start + i as u16) {
                        values.insert(addr, v);
                        bases.insert(Map::leaf_base(addr));
                    }
                }
            }
        }

        validate_map(&map, &bases);
        drop(map);
        prop_assert_eq!(alloc.released.get(), alloc.acquired.get());
        prop_assert_eq!(alloc.live_bytes.get(), 0);
    }

    #[test]
    fn prop_offset_and_contiguous_elements(addr in any::<u64>()) {
        type Wide = ShadowMap<u64, [u8; 4096], decomposition![20, 20, 12, 12]>;
        let offset = Wide::offset(addr);
        prop_assert_eq!(offset as u64, addr % 4096);
        prop_assert_eq!(Wide::contiguous_elements(addr), 4096 - offset);
        prop_assert_eq!(Wide::leaf_base(addr) + offset as u64, addr);

        let g = Wide::geometry();
        let rebuilt = (g.index(0, addr) as u64) << 44
            | (g.index(1, addr) as u64) << 24
            | (g.index(2, addr) as u64) << 12
            | g.index(3, addr) as u64;
        prop_assert_eq!(rebuilt, addr);
    }

    #[test]
    fn prop_runs_tile_the_range(start in 0u16.., len in 0u64..2048) {
        let len = len.min(0x1_0000 - u64::from(start));
        let map: ShadowMap<u16, [u8; 16], Shape> = ShadowMap::new();
        let mut next = u64::from(start);
        let mut covered = 0u64;
        map.for_each_run(start, len, |at, rec, range| {
            assert!(rec.is_none());
            assert_eq!(u64::from(at), next);
            assert_eq!(range.start, Map::offset(at));
            assert!(range.end <= 16);
            next += range.len() as u64;
            covered += range.len() as u64;
        }).unwrap();
        prop_assert_eq!(covered, len);
    }
}

#[test]
fn exhaustive_byte_space_locality() {
    // Every pair of addresses in an 8-bit space under 4+4.
    type Byte = ShadowMap<u8, [u8; 16], decomposition![4, 4]>;
    for a in 0..=u8::MAX {
        let mut map = Byte::new();
        let rec: *const [u8; 16] = map.leaf_for_write(a);
        for b in 0..=u8::MAX {
            let same_leaf = a >> 4 == b >> 4;
            match map.leaf(b) {
                Some(other) => {
                    assert!(same_leaf, "{a:#x} must not map {b:#x}");
                    assert!(std::ptr::eq(other, rec));
                }
                None => assert!(!same_leaf, "{b:#x} shares {a:#x}'s leaf"),
            }
        }
        assert_eq!(map.stats().nodes(), 1);
    }
}

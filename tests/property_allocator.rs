//! Property-based tests for allocator correctness
//!
//! Uses proptest to check the candidate scan against a brute-force answer
//! and the live device for double allocation across random workloads

use nandftl::core::allocator::find_youngest;
use nandftl::{BlockStatus, Ftl, FtlConfig, Geometry, LogicalBlock, MappingTable, PhysicalBlock, SimNand};
use proptest::prelude::*;
use std::collections::HashSet;

const BLOCKS: u32 = 24;

fn status() -> impl Strategy<Value = BlockStatus> {
    prop_oneof![
        4 => Just(BlockStatus::Free),
        4 => Just(BlockStatus::Used),
        1 => Just(BlockStatus::Bad),
        1 => Just(BlockStatus::RecentlyFreed),
    ]
}

fn table(states: &[(BlockStatus, u32)]) -> MappingTable {
    let mut table = MappingTable::new(states.len() as u32);
    for (i, &(status, erases)) in states.iter().enumerate() {
        let block = PhysicalBlock(i as u32);
        for _ in 0..erases {
            table.record_erase(block);
        }
        table.set_status(block, status);
    }
    table
}

proptest! {
    #[test]
    fn prop_youngest_free_is_minimal(
        states in prop::collection::vec((status(), 0u32..50), BLOCKS as usize),
        plane_num in prop_oneof![Just(1u32), Just(2), Just(4)],
        reference in prop::option::of(0..BLOCKS),
    ) {
        let table = table(&states);
        let reference = reference.map(PhysicalBlock);
        let found = find_youngest(&table, plane_num, reference, &[], u32::MAX);

        let eligible: Vec<(PhysicalBlock, u32)> = (0..BLOCKS)
            .map(PhysicalBlock)
            .filter(|&b| Some(b) != reference)
            .filter(|&b| match reference {
                Some(r) if plane_num > 1 => b.plane(plane_num) == r.plane(plane_num),
                _ => true,
            })
            .filter(|&b| table.status(b) == BlockStatus::Free)
            .map(|b| (b, table.state(b).erase_count))
            .collect();

        // lowest erase count, lowest index on ties
        let expected = eligible.iter().min_by_key(|&&(b, count)| (count, b.0)).map(|&(b, _)| b);
        prop_assert_eq!(found.youngest_free, expected);
        prop_assert_eq!(found.youngest_used, None);
    }

    #[test]
    fn prop_victim_respects_balance_and_pins(
        states in prop::collection::vec((status(), 0u32..50), BLOCKS as usize),
        balance in 0u32..40,
        pinned in prop::collection::vec(0..BLOCKS, 0..4),
    ) {
        let table = table(&states);
        let pinned: Vec<PhysicalBlock> = pinned.into_iter().map(PhysicalBlock).collect();
        let found = find_youngest(&table, 1, None, &pinned, balance);

        if let Some(victim) = found.youngest_used {
            prop_assert_eq!(table.status(victim), BlockStatus::Used);
            prop_assert!(!pinned.contains(&victim));
            let count = table.state(victim).erase_count;
            prop_assert!(table.max_erase_count() - count > balance);
        }
    }

    #[test]
    fn prop_no_double_allocation(
        writes in prop::collection::vec((0u32..10, 0u32..8, 1u8..=255), 1..120),
        bad in prop::collection::hash_set(0..BLOCKS, 0..4),
    ) {
        let geometry = Geometry {
            page_size: 64,
            oob_size: 16,
            pages_per_block: 8,
            block_total: BLOCKS,
            plane_num: 2,
        };
        let config = FtlConfig {
            recent_capacity: 4,
            erase_balance: 6,
            ..Default::default()
        };
        let mut ftl = Ftl::open(SimNand::new(geometry), config).unwrap();
        for &b in &bad {
            ftl.nand_mut().fail_erase(PhysicalBlock(b));
        }

        for (logical, page, fill) in writes {
            ftl.write_page(LogicalBlock(logical), page, &[fill; 64]).unwrap();

            let mut seen = HashSet::new();
            for (_, physical) in ftl.table().mapped() {
                prop_assert!(seen.insert(physical), "{} mapped twice", physical);
                prop_assert_eq!(ftl.table().status(physical), BlockStatus::Used);
            }
            if let Some(block) = ftl.mapping_block() {
                prop_assert!(!seen.contains(&block));
            }
            for b in ftl.recent_blocks() {
                prop_assert!(!seen.contains(b), "{} queued while mapped", b);
            }
        }
        prop_assert!(ftl.check_mapping().is_empty());
    }
}

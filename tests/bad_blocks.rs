//! Bad block handling and ECC tests

use nandftl::{Action, BlockStatus, Ftl, FtlConfig, FtlError, Geometry, LogicalBlock, PhysicalBlock, SimNand};
use std::collections::HashSet;

const PAGE: usize = 128;
const PPB: u32 = 8;

fn geometry(plane_num: u32) -> Geometry {
    Geometry {
        page_size: PAGE,
        oob_size: 16,
        pages_per_block: PPB,
        block_total: 16,
        plane_num,
    }
}

fn config() -> FtlConfig {
    FtlConfig {
        recent_capacity: 4,
        ..Default::default()
    }
}

fn ftl() -> Ftl<SimNand> {
    Ftl::open(SimNand::new(geometry(1)), config()).unwrap()
}

fn page(byte: u8) -> Vec<u8> {
    vec![byte; PAGE]
}

fn read(ftl: &mut Ftl<SimNand>, logical: u32, p: u32) -> Vec<u8> {
    let mut buf = page(0xEE);
    ftl.read_page(LogicalBlock(logical), p, &mut buf).unwrap();
    buf
}

fn has_entry(ftl: &Ftl<SimNand>, action: Action) -> bool {
    ftl.journal_entries().iter().any(|e| e.action() == action)
}

#[test]
fn test_erase_failure_marks_bad() {
    let mut ftl = ftl();
    // fresh device: the first allocation takes block 0
    ftl.nand_mut().fail_erase(PhysicalBlock(0));

    ftl.write_page(LogicalBlock(2), 0, &page(2)).unwrap();
    assert_eq!(ftl.table().status(PhysicalBlock(0)), BlockStatus::Bad);
    assert_eq!(ftl.table().lookup(LogicalBlock(2)), Some(PhysicalBlock(1)));
    assert_eq!(read(&mut ftl, 2, 0), page(2));
    assert!(has_entry(&ftl, Action::BadBlock));
}

#[test]
fn test_write_failure_on_new_block() {
    let mut ftl = ftl();
    ftl.nand_mut().fail_writes(PhysicalBlock(0));

    ftl.write_page(LogicalBlock(3), 1, &page(3)).unwrap();
    let physical = ftl.table().lookup(LogicalBlock(3)).unwrap();
    assert_ne!(physical, PhysicalBlock(0));
    assert_eq!(ftl.table().status(PhysicalBlock(0)), BlockStatus::Bad);
    assert_eq!(read(&mut ftl, 3, 1), page(3));
    assert!(has_entry(&ftl, Action::WriteFailed));
}

#[test]
fn test_write_failure_on_mapped_block_relocates() {
    let mut ftl = ftl();
    ftl.write_page(LogicalBlock(1), 0, &page(0x10)).unwrap();
    ftl.write_page(LogicalBlock(1), 1, &page(0x11)).unwrap();
    let old = ftl.table().lookup(LogicalBlock(1)).unwrap();

    ftl.nand_mut().fail_write_once(old.page(2));
    ftl.write_page(LogicalBlock(1), 2, &page(0x12)).unwrap();

    let new = ftl.table().lookup(LogicalBlock(1)).unwrap();
    assert_ne!(new, old);
    assert_eq!(ftl.table().status(old), BlockStatus::Bad);
    for p in 0..3u32 {
        assert_eq!(read(&mut ftl, 1, p), page(0x10 + p as u8));
    }
}

#[test]
fn test_corrected_read_rejuvenates() {
    let mut ftl = ftl();
    ftl.write_page(LogicalBlock(4), 0, &page(0x40)).unwrap();
    ftl.write_page(LogicalBlock(4), 3, &page(0x43)).unwrap();
    let old = ftl.table().lookup(LogicalBlock(4)).unwrap();

    ftl.nand_mut().inject_corrected(old.page(1));
    assert_eq!(read(&mut ftl, 4, 3), page(0x43));

    let new = ftl.table().lookup(LogicalBlock(4)).unwrap();
    assert_ne!(new, old);
    assert_eq!(ftl.table().status(old), BlockStatus::RecentlyFreed);
    assert!(has_entry(&ftl, Action::BitFlip));
    assert_eq!(read(&mut ftl, 4, 0), page(0x40));
    assert_eq!(read(&mut ftl, 4, 3), page(0x43));
}

#[test]
fn test_uncorrectable_read_fails() {
    let mut ftl = ftl();
    ftl.write_page(LogicalBlock(5), 0, &page(0x50)).unwrap();
    ftl.write_page(LogicalBlock(5), 1, &page(0x51)).unwrap();
    let physical = ftl.table().lookup(LogicalBlock(5)).unwrap();

    ftl.nand_mut().inject_uncorrectable(physical.page(1));
    let mut buf = page(0);
    let err = ftl.read_page(LogicalBlock(5), 1, &mut buf).unwrap_err();
    assert!(matches!(err, FtlError::ReadFailed { block, page: 1 } if block == physical.0));
    assert!(has_entry(&ftl, Action::ReadFailed));

    // the rest of the block is unaffected
    assert_eq!(read(&mut ftl, 5, 0), page(0x50));
}

#[test]
fn test_compaction_copies_uncorrectable_page_raw() {
    let mut ftl = ftl();
    for p in 0..PPB {
        ftl.write_page(LogicalBlock(6), p, &page(0x60 + p as u8)).unwrap();
    }
    let old = ftl.table().lookup(LogicalBlock(6)).unwrap();
    ftl.nand_mut().inject_uncorrectable(old.page(2));

    // block is full: the overwrite compacts it
    ftl.write_page(LogicalBlock(6), 0, &page(0x6F)).unwrap();
    let new = ftl.table().lookup(LogicalBlock(6)).unwrap();
    assert_ne!(new, old);
    assert!(has_entry(&ftl, Action::SourceError));

    assert_eq!(read(&mut ftl, 6, 0), page(0x6F));
    assert_eq!(read(&mut ftl, 6, 1), page(0x61));
    // raw copy keeps what the device returned
    let mut expected = page(0x62);
    expected[0] ^= 0x01;
    assert_eq!(read(&mut ftl, 6, 2), expected);
    for p in 3..PPB {
        assert_eq!(read(&mut ftl, 6, p), page(0x60 + p as u8));
    }
}

#[test]
fn test_compaction_skips_unreadable_page() {
    let mut ftl = ftl();
    for p in 0..PPB {
        ftl.write_page(LogicalBlock(7), p, &page(0x70 + p as u8)).unwrap();
    }
    let old = ftl.table().lookup(LogicalBlock(7)).unwrap();
    ftl.nand_mut().inject_read_failure(old.page(5));

    ftl.write_page(LogicalBlock(7), 0, &page(0x7F)).unwrap();
    assert!(has_entry(&ftl, Action::CopyPageFailed));
    assert_eq!(read(&mut ftl, 7, 5), page(0));
    assert_eq!(read(&mut ftl, 7, 6), page(0x76));
}

#[test]
fn test_bad_blocks_never_allocated_again() {
    let mut ftl = ftl();
    let bad: HashSet<PhysicalBlock> = [2, 5, 11].into_iter().map(PhysicalBlock).collect();
    for &block in &bad {
        ftl.nand_mut().fail_erase(block);
    }

    for round in 0..30u32 {
        for logical in 0..4u32 {
            ftl.write_page(LogicalBlock(logical), round % PPB, &page(round as u8 | 0x80))
                .unwrap();
            for (_, physical) in ftl.table().mapped() {
                assert!(!bad.contains(&physical), "round {}: {} reused", round, physical);
            }
            if let Some(block) = ftl.mapping_block() {
                assert!(!bad.contains(&block));
            }
        }
    }

    let marked: HashSet<PhysicalBlock> = ftl
        .table()
        .blocks()
        .filter(|(_, s)| s.status == BlockStatus::Bad)
        .map(|(b, _)| b)
        .collect();
    assert_eq!(marked, bad);
}

#[test]
fn test_out_of_space() {
    let mut ftl = ftl();
    for index in 0..16 {
        ftl.nand_mut().fail_erase(PhysicalBlock(index));
    }
    let err = ftl.write_page(LogicalBlock(0), 0, &page(1)).unwrap_err();
    assert!(matches!(err, FtlError::OutOfSpace));
    assert_eq!(ftl.stats().bad_blocks, 16);
    assert_eq!(ftl.table().lookup(LogicalBlock(0)), None);
}

#[test]
fn test_hardware_move_with_bad_source() {
    let nand = SimNand::new(geometry(2)).with_hardware_move(true);
    let mut ftl = Ftl::open(nand, config()).unwrap();
    for p in 0..PPB {
        ftl.write_page(LogicalBlock(1), p, &page(0x20 + p as u8)).unwrap();
    }
    let old = ftl.table().lookup(LogicalBlock(1)).unwrap();
    ftl.nand_mut().inject_uncorrectable(old.page(4));

    ftl.write_page(LogicalBlock(1), 7, &page(0x2F)).unwrap();
    let new = ftl.table().lookup(LogicalBlock(1)).unwrap();
    assert_ne!(new, old);
    assert!(ftl.nand().stats().moves > 0);
    assert!(has_entry(&ftl, Action::SoftwareCopy));
    assert_eq!(read(&mut ftl, 1, 3), page(0x23));
    assert_eq!(read(&mut ftl, 1, 7), page(0x2F));
}

#[test]
fn test_hardware_move_same_plane() {
    let nand = SimNand::new(geometry(2)).with_hardware_move(true);
    let mut ftl = Ftl::open(nand, config()).unwrap();
    for p in 0..PPB {
        ftl.write_page(LogicalBlock(0), p, &page(0x30 + p as u8)).unwrap();
    }
    let old = ftl.table().lookup(LogicalBlock(0)).unwrap();

    ftl.block_copy(LogicalBlock(0)).unwrap();
    let new = ftl.table().lookup(LogicalBlock(0)).unwrap();
    assert_ne!(new, old);
    assert_eq!(new.plane(2), old.plane(2));
    assert_eq!(ftl.nand().stats().moves, PPB as u64);
    for p in 0..PPB {
        assert_eq!(read(&mut ftl, 0, p), page(0x30 + p as u8));
    }
}

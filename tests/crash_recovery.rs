//! Crash recovery tests
//!
//! Power loss is simulated by dropping the FTL without syncing (the NAND
//! contents are kept) or by exhausting the simulator's program budget
//! part-way through an operation. Every remount must come back with exactly
//! the committed state.

use nandftl::{
    Action, BackupRegion, BlockStatus, Ftl, FtlConfig, Geometry, LogicalBlock, MemoryBackup, SimNand,
};
use std::sync::{Arc, Mutex};

const PAGE: usize = 128;
const PPB: u32 = 8;

fn geometry() -> Geometry {
    Geometry {
        page_size: PAGE,
        oob_size: 16,
        pages_per_block: PPB,
        block_total: 16,
        plane_num: 1,
    }
}

fn config() -> FtlConfig {
    FtlConfig {
        recent_capacity: 4,
        ..Default::default()
    }
}

fn page(byte: u8) -> Vec<u8> {
    vec![byte; PAGE]
}

fn read(ftl: &mut Ftl<SimNand>, logical: u32, p: u32) -> Vec<u8> {
    let mut buf = page(0xEE);
    ftl.read_page(LogicalBlock(logical), p, &mut buf).unwrap();
    buf
}

/// Logical blocks 0..4 with pages 0..4 holding `block * 16 + page + 1`
fn committed_device() -> Ftl<SimNand> {
    let mut ftl = Ftl::open(SimNand::new(geometry()), config()).unwrap();
    for logical in 0..4u32 {
        for p in 0..4u32 {
            ftl.write_page(LogicalBlock(logical), p, &page((logical * 16 + p + 1) as u8))
                .unwrap();
        }
    }
    ftl.sync().unwrap();
    ftl
}

fn assert_committed(ftl: &mut Ftl<SimNand>) {
    for logical in 0..4u32 {
        for p in 0..4u32 {
            assert_eq!(
                read(ftl, logical, p),
                page((logical * 16 + p + 1) as u8),
                "logical {} page {}",
                logical,
                p
            );
        }
    }
}

#[test]
fn test_unsynced_writes_are_discarded() {
    let mut ftl = committed_device();
    let sn = ftl.sn();

    // append into a committed block, and map a new one
    ftl.write_page(LogicalBlock(1), 0, &page(0x99)).unwrap();
    ftl.write_page(LogicalBlock(1), 5, &page(0x98)).unwrap();
    ftl.write_page(LogicalBlock(6), 0, &page(0x97)).unwrap();
    assert!(ftl.is_dirty());

    let mut ftl = Ftl::open(ftl.into_inner(), config()).unwrap();
    assert!(ftl.sn() >= sn);
    assert_committed(&mut ftl);
    assert_eq!(read(&mut ftl, 1, 5), page(0));
    assert_eq!(ftl.table().lookup(LogicalBlock(6)), None);
    assert_eq!(read(&mut ftl, 6, 0), page(0));

    // the repaired block holds only committed pages
    let physical = ftl.table().lookup(LogicalBlock(1)).unwrap();
    assert_eq!(ftl.page_mapping(physical).unwrap().live_count(), 4);
}

#[test]
fn test_synced_writes_survive() {
    let mut ftl = committed_device();
    ftl.write_page(LogicalBlock(2), 0, &page(0x42)).unwrap();
    ftl.write_page(LogicalBlock(9), 3, &page(0x43)).unwrap();
    ftl.sync().unwrap();

    let mut ftl = Ftl::open(ftl.into_inner(), config()).unwrap();
    assert_eq!(read(&mut ftl, 2, 0), page(0x42));
    assert_eq!(read(&mut ftl, 2, 1), page(2 * 16 + 2));
    assert_eq!(read(&mut ftl, 9, 3), page(0x43));
}

#[test]
fn test_relocation_after_sync_is_rolled_back() {
    let mut ftl = committed_device();
    let committed = ftl.table().lookup(LogicalBlock(0)).unwrap();

    // fill block 0 so the next write compacts it elsewhere
    for p in 4..PPB {
        ftl.write_page(LogicalBlock(0), p, &page(0x70 + p as u8)).unwrap();
    }
    ftl.write_page(LogicalBlock(0), 0, &page(0x7F)).unwrap();
    assert_ne!(ftl.table().lookup(LogicalBlock(0)), Some(committed));

    let mut ftl = Ftl::open(ftl.into_inner(), config()).unwrap();
    assert_committed(&mut ftl);
    for p in 4..PPB {
        assert_eq!(read(&mut ftl, 0, p), page(0));
    }
}

#[test]
fn test_close_commits() {
    let mut ftl = committed_device();
    ftl.write_page(LogicalBlock(3), 7, &page(0x55)).unwrap();
    let nand = ftl.close().unwrap();

    let mut ftl = Ftl::open(nand, config()).unwrap();
    assert_eq!(read(&mut ftl, 3, 7), page(0x55));
    assert!(ftl
        .journal_entries()
        .iter()
        .any(|e| e.action() == Action::SessionDone));
}

#[test]
fn test_power_cut_during_writes() {
    for budget in [0u64, 1, 2, 3, 5, 8, 13, 21, 34] {
        let mut ftl = committed_device();
        ftl.nand_mut().set_program_budget(Some(budget));

        let mut failed = false;
        'work: for round in 0..6u32 {
            for logical in [0u32, 2, 5] {
                let data = page(0xC0 | round as u8);
                if ftl.write_page(LogicalBlock(logical), round % PPB, &data).is_err() {
                    failed = true;
                    break 'work;
                }
            }
        }

        let mut nand = ftl.into_inner();
        nand.set_program_budget(None);
        let mut ftl = Ftl::open(nand, config()).unwrap();
        assert_committed(&mut ftl);
        assert_eq!(ftl.table().lookup(LogicalBlock(5)), None, "budget {}", budget);
        assert_eq!(read(&mut ftl, 0, 5), page(0), "budget {} failed {}", budget, failed);
        assert_eq!(ftl.nand().stats().overwrite_violations, 0);

        // still fully usable
        ftl.write_page(LogicalBlock(5), 0, &page(0x11)).unwrap();
        ftl.sync().unwrap();
        let mut ftl = Ftl::open(ftl.into_inner(), config()).unwrap();
        assert_eq!(read(&mut ftl, 5, 0), page(0x11));
        assert_committed(&mut ftl);
    }
}

#[test]
fn test_power_cut_during_flush() {
    for budget in 0u64..12 {
        let mut ftl = committed_device();
        ftl.write_page(LogicalBlock(7), 1, &page(0x77)).unwrap();

        ftl.nand_mut().set_program_budget(Some(budget));
        let flushed = ftl.sync().is_ok();

        let mut nand = ftl.into_inner();
        nand.set_program_budget(None);
        let mut ftl = Ftl::open(nand, config()).unwrap();
        assert_committed(&mut ftl);

        let new_page = read(&mut ftl, 7, 1);
        if flushed {
            assert_eq!(new_page, page(0x77), "budget {}", budget);
        } else {
            assert!(new_page == page(0) || new_page == page(0x77), "budget {}", budget);
        }
    }
}

#[test]
fn test_corrupt_latest_snapshot_falls_back() {
    let mut ftl = committed_device();
    let first = ftl.mapping_block().unwrap();
    ftl.write_page(LogicalBlock(8), 0, &page(0x88)).unwrap();
    ftl.sync().unwrap();
    let latest = ftl.mapping_block().unwrap();
    assert_ne!(first, latest);

    let mut nand = ftl.into_inner();
    nand.corrupt_data(latest.page(1), &[0x12; 16]);

    let mut ftl = Ftl::open(nand, config()).unwrap();
    assert_eq!(ftl.mapping_block(), Some(first));
    assert_committed(&mut ftl);
    assert_eq!(read(&mut ftl, 8, 0), page(0));
}

#[test]
fn test_no_snapshot_mounts_empty() {
    // data page with a valid tag but no snapshot anywhere
    let mut ftl = Ftl::open(SimNand::new(geometry()), config()).unwrap();
    ftl.write_page(LogicalBlock(1), 0, &page(1)).unwrap();

    let mut ftl = Ftl::open(ftl.into_inner(), config()).unwrap();
    assert_eq!(ftl.mapping_block(), None);
    assert!(ftl.is_dirty());
    assert_eq!(read(&mut ftl, 1, 0), page(0));
}

#[test]
fn test_recovery_keeps_bad_blocks() {
    let mut ftl = committed_device();
    let (free, _) = ftl
        .table()
        .blocks()
        .find(|(_, s)| s.status == BlockStatus::Free)
        .unwrap();
    ftl.nand_mut().fail_erase(free);
    ftl.write_page(LogicalBlock(10), 0, &page(0x10)).unwrap();
    ftl.sync().unwrap();
    let bad: Vec<_> = ftl
        .table()
        .blocks()
        .filter(|(_, s)| s.status == BlockStatus::Bad)
        .map(|(b, _)| b)
        .collect();
    assert_eq!(bad, vec![free]);

    let ftl = Ftl::open(ftl.into_inner(), config()).unwrap();
    assert_eq!(ftl.table().status(bad[0]), BlockStatus::Bad);
}

/// Register bank that outlives the FTL instance using it
#[derive(Clone, Default)]
struct SharedRegion(Arc<Mutex<MemoryBackup>>);

impl BackupRegion for SharedRegion {
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn read(&self, index: usize) -> u32 {
        self.0.lock().unwrap().read(index)
    }

    fn write(&mut self, index: usize, value: u32) {
        self.0.lock().unwrap().write(index, value)
    }
}

#[test]
fn test_backup_region_locates_snapshot() {
    let region = SharedRegion::default();
    let config = FtlConfig {
        legacy_scan: false,
        ..config()
    };

    let mut ftl = Ftl::open_with_backup(SimNand::new(geometry()), config.clone(), Box::new(region.clone())).unwrap();
    ftl.write_page(LogicalBlock(4), 2, &page(0x44)).unwrap();
    ftl.sync().unwrap();
    let block = ftl.mapping_block().unwrap();
    assert_eq!(region.0.lock().unwrap().registers()[0], block.0);

    // hide the snapshot from the tag scan
    let mut nand = ftl.into_inner();
    nand.corrupt_oob(block.page(0), &[0u8; 16]);

    let mut ftl = Ftl::open(nand.clone(), config.clone()).unwrap();
    assert_eq!(ftl.mapping_block(), None);
    assert_eq!(read(&mut ftl, 4, 2), page(0));

    let mut ftl = Ftl::open_with_backup(nand, config, Box::new(region)).unwrap();
    assert_eq!(ftl.mapping_block(), Some(block));
    assert_eq!(read(&mut ftl, 4, 2), page(0x44));
}

//! Property-based tests against an in-memory model
//!
//! Random sequences of writes, erases, syncs, clean remounts and power cuts
//! run against both the FTL and a plain map of page contents. Reads must
//! always agree with the model; after a power cut the model rolls back to
//! what the last persisted snapshot covered.

use nandftl::{Ftl, FtlConfig, Geometry, LogicalBlock, SimNand};
use proptest::prelude::*;
use std::collections::HashMap;

const PAGE: usize = 64;
const PPB: u32 = 8;
const LOGICAL: u32 = 6;

type Model = HashMap<(u32, u32), Vec<u8>>;

#[derive(Debug, Clone)]
enum Op {
    Write { logical: u32, first: u32, fills: Vec<u8> },
    Erase { begin: u64, len: u64 },
    Sync,
    Remount,
    PowerCut,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..LOGICAL, 0..PPB, prop::collection::vec(prop_oneof![Just(0u8), 1u8..=255], 1..4))
            .prop_map(|(logical, first, mut fills)| {
                fills.truncate((PPB - first) as usize);
                Op::Write { logical, first, fills }
            }),
        1 => (0..(LOGICAL * PPB) as u64, 0u64..12).prop_map(|(begin, len)| Op::Erase { begin, len }),
        1 => Just(Op::Sync),
        1 => Just(Op::Remount),
        1 => Just(Op::PowerCut),
    ]
}

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
        // keep leveling out of the picture: a move can trigger a flush
        // before the write that caused it lands
        erase_balance: u32::MAX,
        ..Default::default()
    }
}

/// Any flush, explicit or not, commits everything done so far
fn commit_if_flushed(ftl: &Ftl<SimNand>, model: &Model, committed: &mut Model, sn: &mut u32) {
    if ftl.sn() != *sn || !ftl.is_dirty() {
        *committed = model.clone();
        *sn = ftl.sn();
    }
}

fn check(ftl: &mut Ftl<SimNand>, model: &Model) -> Result<(), TestCaseError> {
    let mut buf = vec![0u8; PAGE];
    for logical in 0..LOGICAL {
        for p in 0..PPB {
            ftl.read_page(LogicalBlock(logical), p, &mut buf)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let expected = model.get(&(logical, p)).cloned().unwrap_or_else(|| vec![0; PAGE]);
            prop_assert_eq!(&buf, &expected, "logical {} page {}", logical, p);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_reads_match_model(ops in prop::collection::vec(op(), 1..60)) {
        let mut ftl = Ftl::open(SimNand::new(geometry()), config()).unwrap();
        let mut model = Model::new();
        let mut committed = Model::new();
        let mut sn = ftl.sn();

        for op in ops {
            match op {
                Op::Write { logical, first, fills } => {
                    let data: Vec<u8> = fills.iter().flat_map(|&b| vec![b; PAGE]).collect();
                    ftl.write_pages(LogicalBlock(logical), first, &data).unwrap();
                    for (i, &b) in fills.iter().enumerate() {
                        let key = (logical, first + i as u32);
                        if b == 0 {
                            model.remove(&key);
                        } else {
                            model.insert(key, vec![b; PAGE]);
                        }
                    }
                }
                Op::Erase { begin, len } => {
                    // one call per logical block: a flush may land between blocks
                    let end = (begin + len).min((LOGICAL * PPB) as u64);
                    let mut cursor = begin;
                    while cursor < end {
                        let stop = ((cursor / PPB as u64 + 1) * PPB as u64).min(end);
                        ftl.erase_range(cursor, stop).unwrap();
                        for page in cursor..stop {
                            model.remove(&((page / PPB as u64) as u32, (page % PPB as u64) as u32));
                        }
                        commit_if_flushed(&ftl, &model, &mut committed, &mut sn);
                        cursor = stop;
                    }
                }
                Op::Sync => ftl.sync().unwrap(),
                Op::Remount => {
                    ftl.sync().unwrap();
                    ftl = Ftl::open(ftl.into_inner(), config()).unwrap();
                }
                Op::PowerCut => {
                    ftl = Ftl::open(ftl.into_inner(), config()).unwrap();
                    model = committed.clone();
                }
            }

            commit_if_flushed(&ftl, &model, &mut committed, &mut sn);
            check(&mut ftl, &model)?;
        }

        prop_assert_eq!(ftl.nand().stats().overwrite_violations, 0);
    }

    #[test]
    fn prop_zero_writes_allocate_nothing(
        logical in 0..LOGICAL,
        first in 0..PPB,
        count in 1..4u32,
    ) {
        let mut ftl = Ftl::open(SimNand::new(geometry()), config()).unwrap();
        let count = count.min(PPB - first);
        let writes = ftl.nand().stats().writes;

        ftl.write_pages(LogicalBlock(logical), first, &vec![0u8; PAGE * count as usize]).unwrap();
        prop_assert_eq!(ftl.nand().stats().writes, writes);
        prop_assert_eq!(ftl.table().lookup(LogicalBlock(logical)), None);
    }
}

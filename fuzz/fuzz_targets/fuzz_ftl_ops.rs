#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use nandftl::{Ftl, FtlConfig, Geometry, LogicalBlock, PhysicalBlock, SimNand};
use std::collections::HashMap;

const PAGE: usize = 32;
const PPB: u32 = 4;
const LOGICAL: u32 = 6;

#[derive(Debug, Arbitrary)]
enum Op {
    Write { logical: u8, page: u8, fill: u8 },
    Erase { begin: u8, len: u8 },
    Sync,
    Remount,
    FailErase { block: u8 },
    Corrected { block: u8, page: u8 },
}

// Reads must keep matching a plain model while blocks go bad underneath.
// Failures may surface as errors (out of space); they must never panic or
// return stale data.
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let geometry = Geometry {
        page_size: PAGE,
        oob_size: 16,
        pages_per_block: PPB,
        block_total: 16,
        plane_num: 1,
    };
    let config = || FtlConfig { recent_capacity: 4, ..Default::default() };
    let mut ftl = match Ftl::open(SimNand::new(geometry), config()) {
        Ok(ftl) => ftl,
        Err(_) => return,
    };
    let mut model: HashMap<(u32, u32), u8> = HashMap::new();

    for op in ops.into_iter().take(64) {
        match op {
            Op::Write { logical, page, fill } => {
                let key = (logical as u32 % LOGICAL, page as u32 % PPB);
                if ftl.write_page(LogicalBlock(key.0), key.1, &[fill; PAGE]).is_err() {
                    return;
                }
                if fill == 0 {
                    model.remove(&key);
                } else {
                    model.insert(key, fill);
                }
            }
            Op::Erase { begin, len } => {
                let begin = begin as u64 % (LOGICAL * PPB) as u64;
                let end = (begin + len as u64 % 8).min((LOGICAL * PPB) as u64);
                if ftl.erase_range(begin, end).is_err() {
                    return;
                }
                for page in begin..end {
                    model.remove(&((page / PPB as u64) as u32, (page % PPB as u64) as u32));
                }
            }
            Op::Sync => {
                if ftl.sync().is_err() {
                    return;
                }
            }
            Op::Remount => {
                if ftl.sync().is_err() {
                    return;
                }
                ftl = match Ftl::open(ftl.into_inner(), config()) {
                    Ok(ftl) => ftl,
                    Err(_) => return,
                };
            }
            Op::FailErase { block } => {
                ftl.nand_mut().fail_erase(PhysicalBlock(block as u32 % 16));
            }
            Op::Corrected { block, page } => {
                let block = PhysicalBlock(block as u32 % 16);
                ftl.nand_mut().inject_corrected(block.page(page as u32 % PPB));
            }
        }

        let mut buf = [0u8; PAGE];
        for logical in 0..LOGICAL {
            for p in 0..PPB {
                if ftl.read_page(LogicalBlock(logical), p, &mut buf).is_err() {
                    return;
                }
                let expected = model.get(&(logical, p)).copied().unwrap_or(0);
                assert!(buf.iter().all(|&b| b == expected), "logical {} page {}", logical, p);
            }
        }
    }

    assert_eq!(ftl.nand().stats().overwrite_violations, 0);
});

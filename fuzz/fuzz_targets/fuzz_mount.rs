#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use nandftl::{Ftl, FtlConfig, Geometry, LogicalBlock, SimNand};

const PAGE: usize = 64;
const PPB: u32 = 4;

#[derive(Debug, Arbitrary)]
struct Damage {
    block: u8,
    page: u8,
    oob: bool,
    bytes: Vec<u8>,
}

// Mounting arbitrary garbage must never panic
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let damage: Vec<Damage> = match u.arbitrary() {
        Ok(damage) => damage,
        Err(_) => return,
    };

    let geometry = Geometry {
        page_size: PAGE,
        oob_size: 16,
        pages_per_block: PPB,
        block_total: 12,
        plane_num: 1,
    };
    let config = || FtlConfig { recent_capacity: 4, ..Default::default() };

    let mut ftl = match Ftl::open(SimNand::new(geometry), config()) {
        Ok(ftl) => ftl,
        Err(_) => return,
    };
    for logical in 0..4u32 {
        let _ = ftl.write_page(LogicalBlock(logical), logical % PPB, &[logical as u8 + 1; PAGE]);
    }
    let _ = ftl.sync();

    let mut nand = ftl.into_inner();
    for d in damage.iter().take(16) {
        let addr = nandftl::PhysicalBlock(d.block as u32 % 12).page(d.page as u32 % PPB);
        if d.oob {
            nand.corrupt_oob(addr, &d.bytes);
        } else {
            nand.corrupt_data(addr, &d.bytes);
        }
    }

    if let Ok(mut ftl) = Ftl::open(nand, config()) {
        let mut buf = [0u8; PAGE];
        for logical in 0..ftl.logical_blocks() {
            for p in 0..PPB {
                let _ = ftl.read_page(LogicalBlock(logical), p, &mut buf);
            }
        }
        let _ = ftl.sync();
        let _ = ftl.check_mapping();
    }
});

//! nftl-tool
//!
//! Inspect and manipulate NAND image files through the FTL

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use nandftl::{BlockStatus, FileNand, Ftl, FtlConfig, Geometry, LogicalBlock, PhysicalBlock};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nftl-tool")]
#[command(about = "Flash translation layer tool for NAND image files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct Target {
    /// Path to the NAND image
    #[arg(short, long)]
    image: PathBuf,

    /// FTL configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an erased image
    Create {
        #[command(flatten)]
        target: Target,

        #[arg(long, default_value = "2048")]
        page_size: usize,

        #[arg(long, default_value = "64")]
        oob_size: usize,

        #[arg(long, default_value = "64")]
        pages_per_block: u32,

        #[arg(long, default_value = "256")]
        blocks: u32,

        #[arg(long, default_value = "1")]
        planes: u32,
    },

    /// Drop every mapping and write an empty snapshot
    Format {
        #[command(flatten)]
        target: Target,
    },

    /// Print device statistics
    Info {
        #[command(flatten)]
        target: Target,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the block table
    Dump {
        #[command(flatten)]
        target: Target,
    },

    /// Print the page mapping of one physical block
    DumpBlock {
        #[command(flatten)]
        target: Target,

        /// Physical block number
        block: u32,
    },

    /// Look for leaked blocks and unreadable pages
    Check {
        #[command(flatten)]
        target: Target,
    },

    /// Print the diagnostic journal
    Log {
        #[command(flatten)]
        target: Target,

        /// Clear the journal after printing it
        #[arg(long)]
        clear: bool,
    },

    /// Write a file at a logical page offset
    Write {
        #[command(flatten)]
        target: Target,

        /// First logical page
        #[arg(long)]
        page: u64,

        #[arg(long)]
        input: PathBuf,
    },

    /// Read logical pages into a file
    Read {
        #[command(flatten)]
        target: Target,

        /// First logical page
        #[arg(long)]
        page: u64,

        #[arg(long, default_value = "1")]
        count: u64,

        #[arg(long)]
        output: PathBuf,
    },

    /// Discard logical pages begin..end
    Erase {
        #[command(flatten)]
        target: Target,

        #[arg(long)]
        begin: u64,

        #[arg(long)]
        end: u64,
    },
}

fn open(target: &Target) -> Result<Ftl<FileNand>> {
    let config = match &target.config {
        Some(path) => FtlConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => FtlConfig::default(),
    };
    let nand = FileNand::open(&target.image).with_context(|| format!("opening {}", target.image.display()))?;
    Ok(Ftl::open(nand, config)?)
}

fn close(mut ftl: Ftl<FileNand>) -> Result<()> {
    ftl.sync()?;
    ftl.into_inner().sync()?;
    Ok(())
}

/// Split an absolute logical page into block and page
fn locate(ftl: &Ftl<FileNand>, page: u64) -> (LogicalBlock, u32) {
    let ppb = ftl.geometry().pages_per_block as u64;
    (LogicalBlock((page / ppb) as u32), (page % ppb) as u32)
}

fn create(path: &Path, geometry: Geometry, config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => FtlConfig::load(path)?,
        None => FtlConfig::default(),
    };
    let nand = FileNand::create(path, geometry)?;
    let mut ftl = Ftl::open(nand, config)?;
    ftl.flush()?;
    let bytes = geometry.total_pages() * geometry.page_size as u64;
    info!("Created {} ({} KiB of NAND)", path.display(), bytes / 1024);
    close(ftl)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Create {
            target,
            page_size,
            oob_size,
            pages_per_block,
            blocks,
            planes,
        } => {
            let geometry = Geometry {
                page_size,
                oob_size,
                pages_per_block,
                block_total: blocks,
                plane_num: planes,
            };
            create(&target.image, geometry, target.config.as_deref())?;
        }

        Command::Format { target } => {
            let mut ftl = open(&target)?;
            ftl.format()?;
            close(ftl)?;
        }

        Command::Info { target, json } => {
            let ftl = open(&target)?;
            let stats = ftl.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let g = ftl.geometry();
                println!(
                    "Geometry:       {} blocks x {} pages x {} bytes (+{} oob), {} planes",
                    g.block_total, g.pages_per_block, g.page_size, g.oob_size, g.plane_num
                );
                println!(
                    "Blocks:         {} free, {} used, {} bad, {} recently freed",
                    stats.free_blocks, stats.used_blocks, stats.bad_blocks, stats.recent_blocks
                );
                println!("Mapped:         {} logical blocks", stats.mapped_logical);
                println!(
                    "Erase counts:   min {} / mean {:.1} / max {}",
                    stats.min_erase_count, stats.mean_erase_count, stats.max_erase_count
                );
                println!("Sequence:       {}", stats.sn);
                match stats.mapping_block {
                    Some(block) => println!("Mapping block:  {}", block),
                    None => println!("Mapping block:  none"),
                }
            }
        }

        Command::Dump { target } => {
            let ftl = open(&target)?;
            println!("{:>8} {:>8} {:>14} {:>8}", "physical", "logical", "status", "erases");
            for row in ftl.block_report() {
                let logical = row.logical.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
                let status = if row.mapping {
                    "Used (mapping)".to_string()
                } else {
                    format!("{:?}", row.status)
                };
                println!("{:>8} {:>8} {:>14} {:>8}", row.physical.to_string(), logical, status, row.erase_count);
            }
        }

        Command::DumpBlock { target, block } => {
            let mut ftl = open(&target)?;
            let physical = PhysicalBlock(block);
            let status = if block < ftl.geometry().block_total {
                ftl.table().status(physical)
            } else {
                bail!("block {} out of range", block);
            };
            if status == BlockStatus::Bad {
                println!("{} is bad", physical);
                return Ok(());
            }
            let map = ftl.page_mapping(physical)?;
            println!("{}: next free page {}", physical, map.next_free());
            for (logical_page, physical_page) in map.live() {
                println!("  logical page {:>4} -> page {:>4}", logical_page, physical_page);
            }
        }

        Command::Check { target } => {
            let mut ftl = open(&target)?;
            let leaked = ftl.check_mapping();
            let faults = ftl.check_blocks()?;
            for block in &leaked {
                println!("leaked: {}", block);
            }
            for fault in &faults {
                println!(
                    "unreadable: {} page {} at {}:{}{}",
                    fault.logical,
                    fault.logical_page,
                    fault.physical,
                    fault.physical_page,
                    if fault.uncorrectable { " (uncorrectable)" } else { "" }
                );
            }
            if leaked.is_empty() && faults.is_empty() {
                println!("OK");
            } else {
                bail!("{} leaked blocks, {} unreadable pages", leaked.len(), faults.len());
            }
        }

        Command::Log { target, clear } => {
            let mut ftl = open(&target)?;
            for entry in ftl.journal_entries() {
                let marker = if entry.action().is_failure() { "!" } else { " " };
                println!("{} {}", marker, entry);
            }
            if clear {
                ftl.clear_journal()?;
                close(ftl)?;
            }
        }

        Command::Write { target, page, input } => {
            let mut ftl = open(&target)?;
            let page_size = ftl.geometry().page_size;
            let mut data = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            data.resize(data.len().div_ceil(page_size).max(1) * page_size, 0);

            let ppb = ftl.geometry().pages_per_block as u64;
            let mut at = 0;
            let mut cursor = page;
            while at < data.len() {
                let (logical, first) = locate(&ftl, cursor);
                let pages = ((ppb - first as u64) as usize).min((data.len() - at) / page_size);
                ftl.write_pages(logical, first, &data[at..at + pages * page_size])?;
                at += pages * page_size;
                cursor += pages as u64;
            }
            info!("Wrote {} pages at logical page {}", data.len() / page_size, page);
            close(ftl)?;
        }

        Command::Read {
            target,
            page,
            count,
            output,
        } => {
            let mut ftl = open(&target)?;
            let page_size = ftl.geometry().page_size;
            let ppb = ftl.geometry().pages_per_block as u64;
            let mut data = vec![0u8; count as usize * page_size];

            let mut at = 0;
            let mut cursor = page;
            while cursor < page + count {
                let (logical, first) = locate(&ftl, cursor);
                let pages = (ppb - first as u64).min(page + count - cursor) as usize;
                ftl.read_pages(logical, first, &mut data[at..at + pages * page_size])?;
                at += pages * page_size;
                cursor += pages as u64;
            }
            std::fs::write(&output, &data).with_context(|| format!("writing {}", output.display()))?;
            info!("Read {} pages from logical page {}", count, page);
        }

        Command::Erase { target, begin, end } => {
            let mut ftl = open(&target)?;
            ftl.erase_range(begin, end)?;
            close(ftl)?;
        }
    }

    Ok(())
}

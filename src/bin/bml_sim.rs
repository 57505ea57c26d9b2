//! A tool for exercising bad-block management against a simulated or real NAND.
//!
//! The simulated NAND lives in an image file, so faults can be injected in one run and handled
//! in the next.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;

use flex_bml::config::BmlConfig;
use flex_bml::error::OpKind;
#[cfg(target_os = "linux")]
use flex_bml::nand::mtd::MtdNand;
use flex_bml::nand::{CellLayout, Nand, NandLayout, SimNand};
use flex_bml::partition::{Partition, PartitionAttr, PartitionTable};
use flex_bml::refresh::{Disturbance, RefreshScope};
use flex_bml::volume::Volume;

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of each die of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    #[clap(long, default_value_t = 1)]
    sim_dies: u32,

    #[clap(long, default_value_t = 1)]
    sim_planes: u32,

    /// Cell technology of the simulated dies
    #[clap(long, value_enum, default_value_t = Cells::Slc)]
    sim_cells: Cells,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum Cells {
    Slc,
    Mlc,
    Hybrid,
}

impl From<Cells> for CellLayout {
    fn from(value: Cells) -> Self {
        match value {
            Cells::Slc => CellLayout::SlcOnly,
            Cells::Mlc => CellLayout::MlcOnly,
            Cells::Hybrid => CellLayout::Hybrid,
        }
    }
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let layout = layout
                .dies(self.sim_dies)
                .planes(self.sim_planes)
                .cells(self.sim_cells.into());
            let mut sim = SimNand::new(layout);
            if let Some(path) = self.sim_path.as_ref().filter(|x| x.exists()) {
                sim.load(&mut File::open(path)?)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(mut sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

/// A partition given as `ID:FIRST:BLOCKS`, optionally followed by `:locked` or `:lock-tight`
#[derive(Debug, Clone, Copy)]
struct PartitionArg(Partition);

impl FromStr for PartitionArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        let (id, first, blocks, attr) = match fields[..] {
            [id, first, blocks] => (id, first, blocks, None),
            [id, first, blocks, attr] => (id, first, blocks, Some(attr)),
            _ => return Err(anyhow!("expected ID:FIRST:BLOCKS[:ATTR]")),
        };

        let attr = match attr {
            None | Some("rw") => PartitionAttr::ReadWrite,
            Some("locked") => PartitionAttr::Locked,
            Some("lock-tight") => PartitionAttr::LockTight,
            Some(other) => return Err(anyhow!("unknown partition attribute {other:?}")),
        };

        let part = Partition::new(id.parse()?, first.parse()?, blocks.parse()?).attr(attr);
        Ok(Self(part))
    }
}

#[derive(Args, Debug)]
struct ReservoirOptions {
    /// Size of each die's reservoir, in blocks
    #[clap(long, default_value_t = 24)]
    reservoir_blocks: u32,

    /// Part of the reservoir on the SLC side of a hybrid die
    #[clap(long, default_value_t = 8)]
    slc_reservoir_blocks: u32,

    /// Leave hardware locks alone
    #[clap(long)]
    preprogrammed: bool,
}

impl From<&ReservoirOptions> for BmlConfig {
    fn from(value: &ReservoirOptions) -> Self {
        BmlConfig::default()
            .reservoir_blocks(value.reservoir_blocks)
            .slc_reservoir_blocks(value.slc_reservoir_blocks)
            .preprogrammed(value.preprogrammed)
    }
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum Failure {
    Write,
    Erase,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lay out the reservoirs and write the first metadata; erases every reservoir block
    Format {
        /// Partitions, as ID:FIRST:BLOCKS[:locked|:lock-tight]
        #[clap(long = "partition")]
        partitions: Vec<PartitionArg>,
    },

    /// Print the reservoir state and bad-block map of each die; this is a read-only operation
    /// (apart from finishing an interrupted refresh)
    Info,

    /// Replace a block as if an operation on it had just failed
    Fail {
        sbn: u32,

        #[clap(long, value_enum, default_value_t = Failure::Write)]
        kind: Failure,

        /// The page a write failed on; all pages before it are kept
        #[clap(long, default_value_t = 0)]
        page: u32,

        /// Number of failing blocks, in the same plane group
        #[clap(long, default_value_t = 1)]
        group: u32,
    },

    /// Queue blocks for refresh, as if their reads reported disturbance
    Disturb { sbns: Vec<u32> },

    /// Refresh queued blocks
    Refresh {
        /// How many blocks to refresh; all of them if not given
        #[clap(long)]
        count: Option<usize>,

        /// Only refresh the configured partial quota
        #[clap(long, conflicts_with = "count")]
        partial: bool,
    },
}

impl Command {
    fn execute<N: Nand>(self, nand: N, config: BmlConfig) -> Result<N> {
        let volume = match self {
            Command::Format { partitions } => {
                let partitions = partitions.into_iter().map(|x| x.0).collect();
                let partitions = PartitionTable::new(partitions)?;
                Volume::format(nand, config, partitions)?
            }

            Command::Info => {
                let volume = Volume::open(nand, config)?;
                for die in 0..volume.layout().dies {
                    println!("die {die}: {:?}", volume.reservoir_stats(die)?);
                    for bmf in volume.bad_block_map(die)? {
                        println!("{:6} => {}", bmf.original, bmf.replacement);
                    }
                }
                volume
            }

            Command::Fail {
                sbn,
                kind,
                page,
                group,
            } => {
                let mut volume = Volume::open(nand, config)?;
                let cause = match kind {
                    Failure::Write => OpKind::Write,
                    Failure::Erase => OpKind::Erase,
                };
                volume.handle_bad_block(sbn, page, group, cause)?;
                println!("{sbn} => {}", volume.resolve(sbn)?);
                volume
            }

            Command::Disturb { sbns } => {
                let mut volume = Volume::open(nand, config)?;
                for &sbn in &sbns {
                    volume.note_disturbance(sbn, Disturbance::Update)?;
                }
                if let Some(&sbn) = sbns.first() {
                    volume.note_disturbance(sbn, Disturbance::ProgramLog)?;
                }
                volume
            }

            Command::Refresh { count, partial } => {
                let mut volume = Volume::open(nand, config)?;
                let scope = match (count, partial) {
                    (Some(n), _) => RefreshScope::User(n),
                    (None, true) => RefreshScope::Partial,
                    (None, false) => RefreshScope::All,
                };
                let report = volume.refresh_batch(scope, true)?;
                println!("Refreshed: {}, dropped: {}", report.refreshed, report.dropped);
                volume
            }
        };

        Ok(volume.into_nand())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    reservoir: ReservoirOptions,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config = BmlConfig::from(&args.reservoir);
    let nand = match args.nand.open()? {
        NandImpl::Sim(nand) => NandImpl::Sim(args.cmd.execute(nand, config)?),

        #[cfg(target_os = "linux")]
        NandImpl::Mtd(nand) => NandImpl::Mtd(args.cmd.execute(nand, config)?),
    };
    args.nand.cleanup(nand)?;
    Ok(())
}

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use color_eyre::{Result, eyre::eyre};
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cciss::ciss::command_list::XferDirection;
use cciss::config::{ControllerConfig, RegisterGeneration};
use cciss::engine::Controller;
use cciss::engine::block::{BlockCompletion, BlockRequest};
use cciss::hw::dma::{DEFAULT_BASE, DEFAULT_SIZE, DmaMemory};
use cciss::hw::sim::{SimVolume, SimulatedBoard};
use cciss::registry::ControllerRegistry;
use cciss::scsi::SECTOR_SIZE;

#[derive(Debug, Parser)]
#[command(name = "cciss")]
#[command(about = "Exercise the command engine against a simulated Smart Array", long_about = None)]
struct Args {
    /// Command slots in the pool.
    #[arg(long, default_value_t = 64)]
    nr_cmds: usize,
    /// Scatter-gather entries per command.
    #[arg(long, default_value_t = 32)]
    max_sg: usize,
    /// Logical volumes the simulated firmware exports.
    #[arg(long, default_value_t = 2)]
    volumes: u8,
    /// Size of each volume in 512 byte blocks.
    #[arg(long, default_value_t = 1 << 16)]
    blocks: u64,
    /// Register layout of the simulated board.
    #[arg(long, value_enum, default_value_t = Generation::Sa5)]
    generation: Generation,
    /// Sectors written and read back on every volume.
    #[arg(long, default_value_t = 64)]
    sectors: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Generation {
    Sa5,
    Sa5b,
}

impl From<Generation> for RegisterGeneration {
    fn from(value: Generation) -> Self {
        match value {
            Generation::Sa5 => RegisterGeneration::Sa5,
            Generation::Sa5b => RegisterGeneration::Sa5b,
        }
    }
}

async fn transfer(
    controller: &Controller,
    drive: usize,
    direction: XferDirection,
    sector: u64,
    segments: Vec<Vec<u8>>,
) -> Result<BlockCompletion> {
    let (tx, rx) = oneshot::channel();
    controller.submit_block(BlockRequest {
        drive,
        direction,
        sector,
        segments,
        done: Box::new(move |completion| {
            let _ = tx.send(completion);
        }),
    });
    let completion = rx.await?;
    completion.result?;
    Ok(completion)
}

/// Writes a pattern over the first sectors of `drive` one block per
/// segment, then reads it back and compares.
async fn exercise(controller: &Controller, drive: usize, sectors: u64) -> Result<()> {
    let segments: Vec<Vec<u8>> = (0..sectors)
        .map(|s| vec![(s as u8) ^ (drive as u8); SECTOR_SIZE as usize])
        .collect();
    for (chunk, data) in segments.chunks(controller.config().max_sg).enumerate() {
        let sector = (chunk * controller.config().max_sg) as u64;
        transfer(controller, drive, XferDirection::Write, sector, data.to_vec()).await?;
        let read = transfer(
            controller,
            drive,
            XferDirection::Read,
            sector,
            vec![vec![0; SECTOR_SIZE as usize]; data.len()],
        )
        .await?;
        if read.segments != data {
            return Err(eyre!(
                "drive {drive}: data read back from sector {sector} differs"
            ));
        }
    }
    info!(drive, sectors, "write and read back verified");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ControllerConfig {
        nr_cmds: args.nr_cmds,
        max_sg: args.max_sg,
        generation: args.generation.into(),
        ..Default::default()
    };

    let dma = DmaMemory::new(DEFAULT_BASE, DEFAULT_SIZE);
    let board = SimulatedBoard::new(config.generation, Arc::clone(&dma));
    for i in 0..args.volumes {
        board.add_volume(SimVolume::new(i, args.blocks));
    }

    let registry = ControllerRegistry::new();
    let controller = registry
        .attach(board.clone(), board.irq_line(), dma, config)
        .await?;

    let status = controller.status()?;
    for (index, _) in &status.drives {
        exercise(&controller, *index, args.sectors.min(args.blocks)).await?;
    }

    let status = controller.status()?;
    println!(
        "{}: firmware {}, queue depth {}, max outstanding {}, max sg {}",
        status.name,
        status.firmware_version,
        status.queue_depth,
        status.max_outstanding,
        status.max_sg_seen
    );
    for (index, drive) in &status.drives {
        println!(
            "  drive {index}: {} {} blocks of {} bytes, {}/{}/{} chs, raid {:?}",
            drive.model,
            drive.nr_blocks,
            drive.block_size,
            drive.cylinders,
            drive.heads,
            drive.sectors,
            drive.raid_level
        );
    }

    registry.shutdown().await;
    Ok(())
}

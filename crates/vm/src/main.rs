//! RayOS VM - command line runner
//!
//! Boots a program image and reports how it ended.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rayos_vm::decoder::decode_at;
use rayos_vm::hal::allocator::HostPageAllocator;
use rayos_vm::hal::HostServices;
use rayos_vm::memory::MemoryRegion;
use rayos_vm::{ProgramImage, RayVm, VmConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "rayos-vm")]
#[command(about = "RayOS VM - multi-core register machine", long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an image until it halts
    Run {
        /// Program image (.rvmi)
        image: PathBuf,

        /// Maximum simultaneously running cores
        #[arg(long)]
        max_cores: Option<usize>,
    },

    /// List the instructions of an image
    Disasm {
        image: PathBuf,
    },

    /// Print the default configuration as TOML
    DefaultConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => {
            log::info!("Loading config from: {}", path.display());
            VmConfig::load(path)?
        }
        None => VmConfig::default(),
    };

    match cli.command {
        Commands::Run { image, max_cores } => {
            if let Some(cores) = max_cores {
                config.max_cores = cores;
            }
            let image = ProgramImage::load(&image)?;
            let host = HostServices::host(config.memory_budget);
            let mut vm = RayVm::initialize(config, host, &image)?;

            let exit = vm.run();
            let metrics = vm.metrics();
            log::info!(
                "{} instructions retired on {} core(s), {} requests serviced",
                metrics.instructions_retired,
                metrics.cores_total,
                metrics.requests_serviced
            );

            match exit.fatal {
                Some(record) => {
                    match record.core {
                        Some(core) => eprintln!("fatal fault on core {core}: {}", record.fault),
                        None => eprintln!("fatal fault: {}", record.fault),
                    }
                    Ok(ExitCode::from(record.fault.code().min(255) as u8))
                }
                None => {
                    println!("{}", exit.return_value);
                    Ok(ExitCode::from(exit.return_value as u8))
                }
            }
        }

        Commands::Disasm { image } => {
            let image = ProgramImage::load(&image)?;
            let memory = MemoryRegion::with_words(&HostPageAllocator::new(), &image.instructions)?;

            let mut pc = 0;
            while pc < image.instructions.len() as u64 {
                let marker = if pc == image.entry { ">" } else { " " };
                match decode_at(&memory, pc) {
                    Ok(inst) => {
                        let operand = if inst.opcode.has_operand() {
                            format!(" {:#x}", inst.operand)
                        } else {
                            String::new()
                        };
                        println!("{marker}{pc:6}  {:016x}  {}{operand}", inst.word, inst.opcode);
                        pc = inst.next;
                    }
                    Err(fault) => {
                        println!("{marker}{pc:6}  {:016x}  ?? ({fault})", image.instructions[pc as usize]);
                        pc += 1;
                    }
                }
            }
            println!("data: {} bytes", image.data.len());
            Ok(ExitCode::SUCCESS)
        }

        Commands::DefaultConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

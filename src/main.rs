use anyhow::Context;
use clap::{Parser, Subcommand};
use critmem::images::checkpoint::describe_vma;
use critmem::mem::{hexdump, ProcessMemory, Vma};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

// Global start time for dmesg-style logging
static START_TIME: OnceLock<Instant> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "critmem")]
#[command(about = "Inspect process memory in CRIU checkpoint images", long_about = None)]
struct Args {
    /// Path to the checkpoint image directory
    #[arg(short = 'D', long, value_name = "DIR")]
    image_dir: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the memory areas of a process
    Maps {
        #[arg(short, long)]
        pid: u32,
    },

    /// Write the full memory image of a process to a file
    Dump {
        #[arg(short, long)]
        pid: u32,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Read an address range; hexdump to stdout unless an output file is given
    Read {
        #[arg(short, long)]
        pid: u32,

        /// First address (0x-prefixed hex or decimal)
        #[arg(long, value_parser = parse_addr)]
        start: u64,

        /// End address, exclusive
        #[arg(long, value_parser = parse_addr)]
        end: u64,

        /// Write raw bytes here instead of a hexdump
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Show the command line of a process
    Args {
        #[arg(short, long)]
        pid: u32,
    },

    /// Show the environment of a process
    Env {
        #[arg(short, long)]
        pid: u32,
    },
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    START_TIME.get_or_init(Instant::now);

    // Initialize logging with dmesg-style timestamps
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format(|buf, record| {
            let elapsed = START_TIME.get().map(|t| t.elapsed()).unwrap_or_default();

            // Format like dmesg: [  123.456789] LEVEL message
            writeln!(
                buf,
                "[{:5}.{:06}] {} {}",
                elapsed.as_secs(),
                elapsed.subsec_micros(),
                record.level(),
                record.args()
            )
        })
        .init();

    log::debug!("Image directory: {}", args.image_dir.display());

    match args.command {
        Command::Maps { pid } => show_maps(&args.image_dir, pid),
        Command::Dump { pid, output } => {
            let mut pm = ProcessMemory::load(&args.image_dir, pid)?;
            let file = File::create(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            let mut w = BufWriter::new(file);
            let written = pm.dump_to(&mut w)?;
            w.flush()?;
            log::info!("Wrote {} bytes to {}", written, output.display());
            Ok(())
        }
        Command::Read {
            pid,
            start,
            end,
            output,
        } => {
            let mut pm = ProcessMemory::load(&args.image_dir, pid)?;
            let data = pm.read_range(start, end)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &data)
                        .with_context(|| format!("writing {}", path.display()))?;
                    log::info!("Wrote {} bytes to {}", data.len(), path.display());
                }
                None => print!("{}", hexdump(start, &data)),
            }
            Ok(())
        }
        Command::Args { pid } => {
            let mut pm = ProcessMemory::load(&args.image_dir, pid)?;
            println!("{}", pm.arguments()?.join(" "));
            Ok(())
        }
        Command::Env { pid } => {
            let mut pm = ProcessMemory::load(&args.image_dir, pid)?;
            for var in pm.environment()? {
                println!("{}={}", var.name, var.value);
            }
            Ok(())
        }
    }
}

fn show_maps(dir: &Path, pid: u32) -> anyhow::Result<()> {
    let pm = ProcessMemory::load(dir, pid)?;
    let index = pm.index();

    println!(
        "PID {}: {} VMAs, {} pages in pages-{}.img",
        pid,
        pm.vmas().len(),
        index.resident_pages(),
        pm.images().pages_id
    );
    for entry in &pm.images().mm.vmas {
        let vma = Vma::from(entry);
        let resident = if vma.is_special() {
            "special".to_string()
        } else {
            format!("{} pages", index.resident_in(vma.start, vma.end))
        };
        println!("{} {}", describe_vma(entry), resident);
    }
    Ok(())
}

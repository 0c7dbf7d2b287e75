#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stm32_serial_boot::linux::LinuxProgrammer;
use stm32_serial_boot::{EraseTarget, Info, Options, Programmer, Verify};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    /// Memory address for read and write operations
    #[structopt(long, default_value = "0x08000000", parse(try_from_str = parse_u32))]
    address: u32,

    /// Erase before writing (global, bank1, bank2, sectors:a,b,..)
    #[structopt(long)]
    erase: Option<EraseTarget>,

    /// Binary image to write
    #[structopt(long)]
    write: Option<PathBuf>,

    /// Read back and compare the written image
    #[structopt(long, requires = "write")]
    verify: bool,

    /// File to read memory into
    #[structopt(long, requires = "length")]
    read: Option<PathBuf>,

    /// Number of bytes to read
    #[structopt(long, parse(try_from_str = parse_u32))]
    length: Option<u32>,

    /// Jump to this address once done
    #[structopt(long, parse(try_from_str = parse_u32))]
    go: Option<u32>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::default_bar().template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})"),
    );
    bar
}

fn show_info(info: &Info) {
    info!(
        "Bootloader version: {}.{}",
        info.bootloader_version >> 4,
        info.bootloader_version & 0x0F
    );
    info!("Supported commands: {}", hex::encode(&info.commands));
    info!("Extended erase: {}", info.extended_erase);

    if let Some(o) = &info.option_bytes {
        info!("Option bytes: {}", hex::encode(o));
    }
    if let Some(id) = &info.chip_id {
        info!("Chip ID: 0x{}", hex::encode(id));
    }
}

fn execute(p: &mut LinuxProgrammer, o: &Args) -> anyhow::Result<()> {
    info!("Connecting to bootloader");

    p.init()
        .context("Error connecting to bootloader, ensure BOOT0 is enabled and reset the device")?;

    info!("Bootloader connected!");

    let info = p.get_info().context("Error reading device info")?;
    show_info(&info);

    let image = match &o.write {
        Some(f) => Some(std::fs::read(f).with_context(|| format!("Error reading {}", f.display()))?),
        None => None,
    };

    if let Some(target) = &o.erase {
        info!("Erasing {:?}", target);
        p.erase(target).context("Error erasing memory")?;
    }

    if let Some(data) = &image {
        info!("Writing {} at 0x{:08x}", bytefmt::format(data.len() as u64), o.address);

        let bar = progress_bar(data.len());
        p.write_with(o.address, data, |n| bar.set_position(n as u64))
            .context("Error writing memory")?;
        bar.finish();

        if o.verify {
            info!("Verifying {}", bytefmt::format(data.len() as u64));

            let bar = progress_bar(data.len());
            let res = p
                .verify_with(o.address, data, |n| bar.set_position(n as u64))
                .context("Error reading memory")?;
            bar.finish();

            match res {
                Verify::Match => info!("Verification OK"),
                Verify::Mismatch { offset, expected, actual } => bail!(
                    "Verification failed at offset 0x{:x}: expected 0x{:02x}, read 0x{:02x}",
                    offset,
                    expected,
                    actual
                ),
            }
        }
    }

    if let (Some(f), Some(len)) = (&o.read, o.length) {
        info!("Reading {} from 0x{:08x}", bytefmt::format(len as u64), o.address);

        let bar = progress_bar(len as usize);
        let data = p
            .read_with(o.address, len as usize, |n| bar.set_position(n as u64))
            .context("Error reading memory")?;
        bar.finish();

        std::fs::write(f, &data).with_context(|| format!("Error writing {}", f.display()))?;
    }

    if let Some(addr) = o.go {
        info!("Starting application at 0x{:08x}", addr);
        p.go(addr).context("Error starting application")?;
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.port))?;

    let res = execute(&mut p, &o);

    // Always hand the device back to its application
    info!("Releasing device");
    p.release();

    res
}

//! # Remote Bitbang Server for AXI GPIO
//!
//! Serves the OpenOCD remote bitbang protocol and drives the JTAG lines through
//! the GPIO pins of a memory-mapped AXI GPIO block.
//!
//! ## Overview
//!
//! The binary wraps [`rbb_server`](https://docs.rs/rbb-server/) with a command line and two
//! concrete buses: the UIO mapped AXI GPIO block and a loopback bus for trying out a setup
//! without hardware. OpenOCD connects with
//!
//! ```text
//! adapter driver remote_bitbang
//! remote_bitbang host 127.0.0.1
//! remote_bitbang port 2222
//! ```
pub mod backends;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;
use env_logger::Env;
use rbb_server::{Capabilities, SignalBus, endpoint::Endpoint, server::Builder, sim::LoopbackBus};
use tokio_util::sync::CancellationToken;

use crate::backends::axi_gpio::{AxiGpioBackend, PinMap};

/// Name of the UIO device that is picked up automatically
const UIO_NAME: &str = "jtag_gpio";

fn pin(s: &str) -> Result<u8, String> {
    clap_num::number_range(s, 0, 31)
}

#[derive(clap::Args, Eq, PartialEq, Clone, Debug)]
struct PinArgs {
    #[arg(long, default_value = "0", value_parser = pin)]
    tck: u8,
    #[arg(long, default_value = "1", value_parser = pin)]
    tms: u8,
    #[arg(long, default_value = "2", value_parser = pin)]
    tdi: u8,
    #[arg(long, default_value = "3", value_parser = pin)]
    tdo: u8,
    #[arg(long, help = "Pin of the active-low nTRST line", value_parser = pin)]
    trst: Option<u8>,
    #[arg(long, help = "Pin of the active-low nSRST line", value_parser = pin)]
    srst: Option<u8>,
    #[arg(long, help = "Pin of the activity LED", value_parser = pin)]
    led: Option<u8>,
}

impl Default for PinArgs {
    fn default() -> Self {
        let pins = PinMap::default();
        PinArgs {
            tck: pins.tck,
            tms: pins.tms,
            tdi: pins.tdi,
            tdo: pins.tdo,
            trst: pins.trst,
            srst: pins.srst,
            led: pins.led,
        }
    }
}

impl From<PinArgs> for PinMap {
    fn from(pins: PinArgs) -> Self {
        PinMap {
            tck: pins.tck,
            tms: pins.tms,
            tdi: pins.tdi,
            tdo: pins.tdo,
            trst: pins.trst,
            srst: pins.srst,
            led: pins.led,
        }
    }
}

#[derive(Parser, Eq, PartialEq, Clone, Debug)]
enum DeviceImpl {
    /// AXI GPIO block exposed through UIO
    AxiGpio {
        path: Option<PathBuf>,
        #[command(flatten)]
        pins: PinArgs,
    },
    /// Loopback bus without hardware. TDO returns TDI delayed by one bit.
    Loopback {
        #[arg(long)]
        trst: bool,
        #[arg(long)]
        srst: bool,
        #[arg(long)]
        indicator: bool,
    },
}

#[derive(Parser)]
#[command(about = "OpenOCD remote bitbang server for JTAG over AXI GPIO", long_about=None)]
struct Args {
    #[arg(
        default_value = "tcp:127.0.0.1:2222",
        help = "Endpoint to listen on, tcp:HOST:PORT or unix:PATH"
    )]
    endpoint: Endpoint,

    #[arg(short, long, help = "The TCK frequency in kHz", default_value = "100")]
    frequency: u32,

    #[arg(long, help = "The rate of the engine clock in Hz", default_value = "48000000")]
    tick_rate: u64,

    #[arg(long, help = "Depth of the command and sample FIFOs", default_value = "512")]
    fifo_depth: usize,

    #[clap(subcommand)]
    device: Option<DeviceImpl>,
}

/// Attempts to automatically find the AXI GPIO block via the UIO driver
fn uio_driver_path() -> Option<PathBuf> {
    let uio_class_path = Path::new("/sys/class/uio");
    for entry in uio_class_path.read_dir().ok()? {
        use std::fs;

        let mut path = entry.ok()?.path();
        log::debug!("Looking at UIO path {}", path.display());
        path.push("name");
        let name = match fs::read_to_string(&path) {
            Ok(name) => name,
            Err(_) => continue,
        };
        let uio_name = name.trim();
        log::debug!("UIO has name {}", uio_name);
        if uio_name == UIO_NAME {
            // 'uio2' becomes '/dev/uio2'
            let uio_indexed_name = path.parent()?.file_name()?;
            let mut dev_path = PathBuf::from("/dev");
            dev_path.push(uio_indexed_name);
            return Some(dev_path);
        }
    }
    None
}

async fn serve<B: SignalBus>(
    bus: B,
    args: &Args,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let mut server = Builder::new()
        .frequency_khz(args.frequency)
        .tick_rate_hz(args.tick_rate)
        .fifo_depth(args.fifo_depth)
        .build(bus)?;
    log::info!(
        "TCK at {} kHz ({} ticks per half period)",
        args.frequency,
        server.timing().period_cyc()
    );
    server.listen(&args.endpoint, shutdown).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting remote bitbang server");

    let args = Args::parse();
    log::debug!(
        "Parsed arguments: endpoint={}, frequency={} kHz, tick_rate={} Hz, fifo_depth={}",
        args.endpoint,
        args.frequency,
        args.tick_rate,
        args.fifo_depth
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Received Ctrl-C, shutting down");
                on_signal.cancel();
            }
            Err(e) => log::error!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    let device_impl = args.device.clone().or_else(|| {
        let path = uio_driver_path()?;
        log::info!("Auto-detected UIO device at {}", path.display());
        Some(DeviceImpl::AxiGpio {
            path: Some(path),
            pins: PinArgs::default(),
        })
    });

    match device_impl {
        Some(DeviceImpl::AxiGpio { path, pins }) => {
            let uio_path = match path.or_else(uio_driver_path) {
                None => {
                    println!(
                        "No AXI GPIO block named '{}' could be detected. Explicitly specify a path using rbb-bridge axi-gpio <path>.",
                        UIO_NAME
                    );
                    return Ok(());
                }
                Some(path) => path,
            };

            log::info!("Initializing AXI GPIO bus from {}", uio_path.display());
            let bus = AxiGpioBackend::new(uio_path, pins.into())?;
            serve(bus, &args, shutdown).await?;
        }
        Some(DeviceImpl::Loopback {
            trst,
            srst,
            indicator,
        }) => {
            log::info!("Initializing loopback bus");
            let bus = LoopbackBus::new(Capabilities {
                has_trst: trst,
                has_srst: srst,
                has_indicator: indicator,
            });
            serve(bus, &args, shutdown).await?;
        }
        None => {
            println!(
                "No AXI GPIO block could be auto detected. Use rbb-bridge axi-gpio <path> to manually specify a device, or rbb-bridge loopback to run without hardware."
            )
        }
    }
    Ok(())
}

//! `mcbus`: command-line access to units on the shared serial bus.
//! Parameter reads and writes, slot-based discovery with address
//! auto-assignment, and firmware programming through the units'
//! bootloader.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use mcbus_core::discovery::{found_units, Discovery};
use mcbus_core::firmware::{self, FlashOptions, MemoryImage};
use mcbus_core::protocol::{
    escape, list_ports, open_port, BusClient, SerialChannel,
};

#[derive(Parser)]
#[command(name = "mcbus", version, about = "Talk to units on the shared serial bus")]
struct Cli {
    /// Serial port to use; defaults to the `defaults` file in the working
    /// directory, then /dev/ttyUSB0
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available serial ports
    Ports,
    /// Read or write a parameter at one or more unit addresses
    Param(ParamArgs),
    /// Read or set a unit's clock
    Clock(ClockArgs),
    /// Read a unit's temperature sensor
    Temp {
        #[arg(value_parser = maybe_hex::<u8>)]
        address: u8,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Read a unit's fuse, lock, signature and calibration bytes
    ChipInfo {
        #[arg(value_parser = maybe_hex::<u8>)]
        address: u8,
        #[arg(long)]
        json: bool,
    },
    /// Enumerate units on the bus
    Discover(DiscoverArgs),
    /// Program or verify a unit's firmware, or show its bootloader info
    Flash(FlashArgs),
}

#[derive(Args)]
struct ParamArgs {
    /// Unit address(es), comma separated
    addresses: String,

    /// Parameter to access
    #[arg(value_parser = maybe_hex::<u8>)]
    parameter: u8,

    /// Payload as hex bytes; when supplied, a write is performed unless
    /// --read is given
    payload: Vec<String>,

    /// Force a write even without a payload
    #[arg(short, long)]
    write: bool,

    /// Force a read even with a payload
    #[arg(short, long, conflicts_with = "write")]
    read: bool,

    /// Treat the payload as a text string joined by spaces
    #[arg(short, long)]
    string: bool,

    /// Repeat the operation until interrupted
    #[arg(short = 'o', long)]
    poll: bool,

    /// Sleep between polls [ms]
    #[arg(short = 'l', long, default_value_t = 0)]
    sleep: u64,
}

#[derive(Args)]
struct ClockArgs {
    #[arg(value_parser = maybe_hex::<u8>)]
    address: u8,

    /// Set the clock to an RFC 3339 time, or to the host's current time
    /// when given without a value
    #[arg(long, num_args = 0..=1, default_missing_value = "now")]
    set: Option<String>,
}

#[derive(Args)]
struct DiscoverArgs {
    /// Number of slots to divide the search into
    #[arg(short, long, default_value_t = 30)]
    slots: u8,

    /// Number of search rounds
    #[arg(short, long, default_value_t = 5)]
    rounds: u32,

    /// Reassign units whose address is 0 or already taken
    #[arg(short, long)]
    assign: bool,

    /// Addresses of units to silence before searching
    #[arg(long, value_parser = maybe_hex::<u8>)]
    silence: Vec<u8>,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct FlashArgs {
    /// Address of the unit
    #[arg(value_parser = maybe_hex::<u8>)]
    address: u8,

    /// Intel HEX file to program or verify against; without it the
    /// signature and bootloader version are read
    hexfile: Option<PathBuf>,

    /// Verify flash contents against the file instead of programming
    #[arg(long)]
    validate: bool,

    /// Probe for the bootloader for up to 30 seconds instead of checking
    /// contact first; press reset on the unit while this runs
    #[arg(short, long)]
    force: bool,
}

fn default_port() -> String {
    std::fs::read_to_string("defaults")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "/dev/ttyUSB0".to_string())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

fn open_client(cli: &Cli) -> Result<BusClient<SerialChannel>> {
    let name = cli.port.clone().unwrap_or_else(default_port);
    let port = open_port(&name, cli.baud).with_context(|| format!("opening {name}"))?;
    Ok(BusClient::new(SerialChannel::new(port)))
}

fn parse_addresses(text: &str) -> Result<Vec<u8>> {
    text.split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| maybe_hex::<u8>(s).map_err(|e| anyhow::anyhow!("address {s:?}: {e}")))
        .collect()
}

fn parse_hex_payload(parts: &[String]) -> Result<Vec<u8>> {
    let joined: String = parts.concat();
    if joined.len() % 2 != 0 || !joined.is_ascii() {
        bail!("payload must be an even number of hex digits");
    }
    (0..joined.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&joined[i..i + 2], 16)
                .with_context(|| format!("bad hex byte {:?}", &joined[i..i + 2]))
        })
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Command::Ports => cmd_ports(),
        Command::Param(args) => cmd_param(&cli, args),
        Command::Clock(args) => cmd_clock(&cli, args),
        Command::Temp { address, json } => cmd_temp(&cli, *address, *json),
        Command::ChipInfo { address, json } => cmd_chip_info(&cli, *address, *json),
        Command::Discover(args) => cmd_discover(&cli, args),
        Command::Flash(args) => cmd_flash(&cli, args),
    }
}

fn cmd_ports() -> Result<()> {
    for port in list_ports() {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  {vid:04x}:{pid:04x}  {}",
                port.name,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.name),
        }
    }
    Ok(())
}

fn cmd_param(cli: &Cli, args: &ParamArgs) -> Result<()> {
    let addresses = parse_addresses(&args.addresses)?;
    let payload = if args.string {
        args.payload.join(" ").into_bytes()
    } else {
        parse_hex_payload(&args.payload)?
    };
    let writing = (!payload.is_empty() && !args.read) || args.write;

    let mut client = open_client(cli)?;
    loop {
        for &address in &addresses {
            let response = if writing {
                client.write(address, args.parameter, &payload)?
            } else {
                client.read_with(
                    address,
                    args.parameter,
                    &payload,
                    client.response_timeout(),
                )?
            };
            if response.ok {
                println!("{address:#04x}: {}", escape(&response.payload));
            } else if response.is_unit_error() {
                println!("{address:#04x}: error response: {}", escape(&response.payload));
            } else if response.raw.is_empty() {
                println!("{address:#04x}: no response");
            } else {
                println!("{address:#04x}: bad response: {}", escape(&response.raw));
            }
        }
        if !args.poll {
            break;
        }
        if args.sleep > 0 {
            std::thread::sleep(Duration::from_millis(args.sleep));
        }
    }
    Ok(())
}

fn cmd_clock(cli: &Cli, args: &ClockArgs) -> Result<()> {
    let mut client = open_client(cli)?;
    match &args.set {
        Some(spec) => {
            let time = if spec == "now" {
                None
            } else {
                let parsed = DateTime::parse_from_rfc3339(spec)
                    .with_context(|| format!("bad time {spec:?}"))?;
                Some(parsed.with_timezone(&Utc))
            };
            client.write_clock(args.address, time)?;
        }
        None => {
            let time = client.read_clock(args.address)?;
            println!(
                "{} ({})",
                time.timestamp(),
                time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

fn cmd_temp(cli: &Cli, address: u8, json: bool) -> Result<()> {
    let mut client = open_client(cli)?;
    let reading = client.read_temperature(address)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reading)?);
    } else {
        println!("{:.2} °C (sensor {})", reading.celsius, reading.sensor_id);
    }
    Ok(())
}

fn cmd_chip_info(cli: &Cli, address: u8, json: bool) -> Result<()> {
    let mut client = open_client(cli)?;
    let info = client.read_chip_info(address)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("fuses:       {:02X} {:02X} {:02X}", info.fuse_low, info.fuse_high, info.fuse_extended);
        println!("lock:        {:02X}", info.lock);
        println!(
            "signature:   {:02X} {:02X} {:02X}",
            info.signature[0], info.signature[1], info.signature[2]
        );
        println!("calibration: {:02X}", info.calibration);
    }
    Ok(())
}

fn cmd_discover(cli: &Cli, args: &DiscoverArgs) -> Result<()> {
    let mut client = open_client(cli)?;
    for &address in &args.silence {
        client.silence(address)?;
    }

    let mut discovery = Discovery::new(&mut client, args.slots)?;
    let rounds = discovery.search(args.rounds)?;

    if args.assign {
        // Each announce re-randomizes slot selection, so only the final
        // round's next_slot tokens are still valid
        let latest = rounds.last().map(|r| r.units.clone()).unwrap_or_default();
        let mut reserved = args.silence.clone();
        reserved.push(0);
        for assignment in discovery.assign_addresses(&latest, &reserved)? {
            println!(
                "readdressed {:#04x} -> {:#04x}",
                assignment.old_address, assignment.new_address
            );
        }
    }

    let units = found_units(&rounds);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&units)?);
        return Ok(());
    }
    let collisions: usize = rounds.iter().map(|r| r.collisions.len()).sum();
    for unit in &units {
        println!("unit {:#04x} (next slot {})", unit.address, unit.next_slot);
    }
    println!("{} unit(s) found, {collisions} collision(s) over {} round(s)", units.len(), rounds.len());
    Ok(())
}

fn cmd_flash(cli: &Cli, args: &FlashArgs) -> Result<()> {
    let mut client = open_client(cli)?;
    let options = FlashOptions { force_sync: args.force, ..FlashOptions::default() };

    let Some(hexfile) = &args.hexfile else {
        let info = firmware::bootloader_info(&mut client, args.address, &options)?;
        println!(
            "signature {:02X} {:02X} {:02X}, bootloader {}.{}",
            info.signature[0], info.signature[1], info.signature[2],
            info.sw_major, info.sw_minor
        );
        return Ok(());
    };

    let image = MemoryImage::from_file(hexfile)
        .with_context(|| format!("parsing {}", hexfile.display()))?;
    if args.validate {
        let report = firmware::verify(&mut client, args.address, &image, &options)?;
        match report.first_mismatch {
            None => println!("validation successful ({} bytes)", report.bytes_checked),
            Some(at) => bail!("flash differs from {} at byte {at:#x}", hexfile.display()),
        }
    } else {
        firmware::program(&mut client, args.address, &image, &options)?;
        println!("programmed {} bytes", image.len());
    }
    Ok(())
}

/// IBB loopback tool
///
/// Opens an in-band bytestream between two in-process endpoints, pushes a
/// file or stdin through it and reports what crossed the wire.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::PathBuf;
use tracing::{info, Level};

use ibb_common::{Carrier, IbbConfig};
use ibb_daemon::{run_loopback, LoopbackOptions, LoopbackReport};

enum Input {
    Stdin,
    File(PathBuf),
}

struct Args {
    input: Input,
    block_size: Option<u16>,
    message: bool,
    config: Option<PathBuf>,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if let Some(first) = args.get(1) {
        match first.as_str() {
            "help" | "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "version" | "--version" | "-v" => {
                println!("ibb-loopback v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            _ => {}
        }
    }

    let args = match parse_args(&args[1..]) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    };

    let config = match &args.config {
        Some(path) => IbbConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => IbbConfig::default(),
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if config.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    info!("Starting ibb-loopback v{}", env!("CARGO_PKG_VERSION"));

    let input = match &args.input {
        Input::Stdin => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
        Input::File(path) => {
            std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?
        }
    };

    let mut options = LoopbackOptions::from_config(&config);
    if let Some(block_size) = args.block_size {
        options.block_size = block_size;
    }
    if args.message {
        options.carrier = Carrier::Message;
    }

    let report = run_loopback(&config, options, input).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut parsed = Args {
        input: Input::Stdin,
        block_size: None,
        message: false,
        config: None,
        json: false,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "send" => {
                let path = iter.next().context("'send' needs a file path")?;
                parsed.input = Input::File(PathBuf::from(path));
            }
            "stdin" => parsed.input = Input::Stdin,
            "--block-size" => {
                let value = iter.next().context("--block-size needs a value")?;
                parsed.block_size = Some(
                    value
                        .parse::<u16>()
                        .with_context(|| format!("Invalid block size: {}", value))?,
                );
            }
            "--message" => parsed.message = true,
            "--config" => {
                let path = iter.next().context("--config needs a file path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--json" => parsed.json = true,
            other => bail!("Unknown argument: {}", other),
        }
    }

    Ok(parsed)
}

/// Print transfer statistics
fn print_report(report: &LoopbackReport) {
    println!("\n========================================");
    println!("         IBB Loopback Transfer");
    println!("========================================");
    println!("Session:          {}", report.sid);
    println!("Carrier:          {}", report.carrier);
    println!("Block size:       {} bytes", report.block_size);
    println!("Transferred:      {} bytes", report.bytes);
    println!("Frames:           {}", report.frames);
    println!("Elapsed:          {} ms", report.elapsed_ms);
    println!("Sender streams:   {}", report.sender.streams);
    println!("Sender bytes out: {}", report.sender.bytes_sent);
    println!("Receiver bytes:   {}", report.receiver.bytes_received);
    println!("Verified:         yes");
    println!("========================================\n");
}

/// Print help message
fn print_help() {
    println!("ibb-loopback - In-band bytestream loopback");
    println!();
    println!("USAGE:");
    println!("    ibb-loopback [send <file> | stdin] [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    send <file>         Stream the contents of <file>");
    println!("    stdin               Stream standard input (default)");
    println!("    help                Show this help message");
    println!("    version             Show version information");
    println!();
    println!("OPTIONS:");
    println!("    --block-size <N>    Block size in bytes (0 = configured default)");
    println!("    --message           Carry data in message stanzas instead of iq");
    println!("    --config <path>     Load settings from a TOML file");
    println!("    --json              Print the report as JSON");
    println!();
    println!("EXAMPLES:");
    println!("    ibb-loopback send Cargo.toml --block-size 512");
    println!("    echo hello | ibb-loopback stdin --message --json");
}

//! rackd - streams USB-audio control voltages to the voice cards in the rack
//!
//! ## Command line flags
//!
//! - `--config <path>`: configuration file (default `~/.config/rackd/rackd.yaml`)
//! - `--dry-run`: run against a simulated backplane, no hardware needed
//! - `--list-devices`: print capture devices and MIDI ports, then exit

use std::path::PathBuf;
use std::process::ExitCode;

use rackd::Options;

const USAGE: &str = "usage: rackd [--config <path>] [--dry-run] [--list-devices]";

fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut options = Options::default();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                options.config_path = PathBuf::from(path);
            }
            "--dry-run" => options.dry_run = true,
            "--list-devices" => options.list_devices = true,
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument {}", other)),
        }
    }
    Ok(Some(options))
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => {
            println!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            return ExitCode::from(2);
        }
    };

    log::info!("rackd {} starting up", env!("CARGO_PKG_VERSION"));
    match rackd::run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

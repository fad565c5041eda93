// SPDX-License-Identifier: MIT
//
// Resinwerk — resin printer control utility.
//
// Entry point. Parses arguments, initialises logging, and dispatches to
// the command implementations.  Logs go to stderr so stdout stays clean
// for command output.

mod commands;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "resinwerk", version, about = "SDCP resin printer control utility")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover printers and display their status.
    Status {
        /// Address of a single printer to query; discovers when omitted.
        addr: Option<IpAddr>,
        /// Explicit broadcast address for discovery.
        #[arg(long, default_value = "255.255.255.255")]
        broadcast: IpAddr,
        /// Dump the full descriptor JSON instead of the summary.
        #[arg(long)]
        full: bool,
    },
    /// Continuously report print progress for one printer.
    Watch {
        /// Address of the printer to watch; discovers when omitted.
        #[arg(long)]
        printer: Option<IpAddr>,
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 5)]
        interval: u64,
        /// Explicit broadcast address for discovery.
        #[arg(long, default_value = "255.255.255.255")]
        broadcast: IpAddr,
    },
    /// Upload a file to the printer and optionally start printing it.
    Upload {
        /// The .ctb/.goo file to upload.
        file: PathBuf,
        /// Address of the target printer; discovers when omitted.
        addr: Option<IpAddr>,
        /// Upload only; do not start printing afterwards.
        #[arg(long)]
        no_start: bool,
        /// Explicit broadcast address for discovery.
        #[arg(long, default_value = "255.255.255.255")]
        broadcast: IpAddr,
    },
    /// Start printing a file already present on the printer.
    Print {
        /// Filename as known to the printer.
        file: String,
        /// Address of the target printer; discovers when omitted.
        addr: Option<IpAddr>,
        /// Explicit broadcast address for discovery.
        #[arg(long, default_value = "255.255.255.255")]
        broadcast: IpAddr,
    },
    /// Tell a printer to connect to an MQTT broker on this host.
    ConnectMqtt {
        /// Broker port, or "host:port" (the host part is informational:
        /// the printer connects back to the address the datagram came from).
        address: String,
        /// Address of the target printer; discovers when omitted.
        #[arg(long)]
        printer: Option<IpAddr>,
        /// Explicit broadcast address for discovery.
        #[arg(long, default_value = "255.255.255.255")]
        broadcast: IpAddr,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Status {
            addr,
            broadcast,
            full,
        } => commands::status(addr, broadcast, full).await,
        Command::Watch {
            printer,
            interval,
            broadcast,
        } => commands::watch(printer, broadcast, interval).await,
        Command::Upload {
            file,
            addr,
            no_start,
            broadcast,
        } => commands::upload(&file, addr, broadcast, no_start).await,
        Command::Print {
            file,
            addr,
            broadcast,
        } => commands::print(&file, addr, broadcast).await,
        Command::ConnectMqtt {
            address,
            printer,
            broadcast,
        } => commands::connect_mqtt(&address, printer, broadcast).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn upload_accepts_no_start_flag() {
        let cli = Cli::parse_from(["resinwerk", "upload", "part.goo", "10.0.0.5", "--no-start"]);
        match cli.command {
            Command::Upload {
                file,
                addr,
                no_start,
                ..
            } => {
                assert_eq!(file, PathBuf::from("part.goo"));
                assert_eq!(addr, Some("10.0.0.5".parse().unwrap()));
                assert!(no_start);
            }
            other => panic!("expected Upload, got {other:?}"),
        }
    }

    #[test]
    fn verbosity_counts_across_subcommands() {
        let cli = Cli::parse_from(["resinwerk", "-vv", "status"]);
        assert_eq!(cli.verbose, 2);
    }
}

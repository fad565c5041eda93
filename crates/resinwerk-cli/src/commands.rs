// SPDX-License-Identifier: MIT
//
// Command implementations.  Each subcommand is a thin orchestration of the
// library: discovery to find the target, then a session (embedded broker +
// file server) for anything that talks SDCP.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use resinwerk_core::{DiscoveryConfig, Error, Result, SessionConfig};
use resinwerk_sdcp::discovery::{self, DiscoveredPrinter};
use resinwerk_sdcp::{EmbeddedBroker, FileServer, Printer, PrinterSession};

/// Resolve the target printer: unicast probe when an address is given,
/// otherwise broadcast discovery taking the single answer.
async fn find_printer(addr: Option<IpAddr>, broadcast: IpAddr) -> Result<DiscoveredPrinter> {
    let config = DiscoveryConfig::default();
    match addr {
        Some(addr) => discovery::probe(addr, &config)
            .await?
            .ok_or_else(|| Error::Discovery(format!("no printer answered at {addr}"))),
        None => {
            let mut printers = discovery::discover(broadcast, &config).await?;
            if printers.is_empty() {
                return Err(Error::Discovery("no printers found on the network".into()));
            }
            if printers.len() > 1 {
                warn!(
                    count = printers.len(),
                    "multiple printers found; using the first — pass an address to disambiguate"
                );
            }
            Ok(printers.remove(0))
        }
    }
}

/// Start broker and file server, build the session, and connect.
async fn establish(printer: DiscoveredPrinter) -> Result<PrinterSession> {
    let mut broker = EmbeddedBroker::new();
    broker.start().await?;
    let mut files = FileServer::new();
    files.start().await?;

    let mut session = PrinterSession::new(
        printer,
        broker,
        files,
        SessionConfig::default(),
        DiscoveryConfig::default(),
    );
    session.connect().await?;
    Ok(session)
}

fn refuse_if_busy(printer: &DiscoveredPrinter) -> Result<()> {
    if printer.descriptor.is_busy() {
        return Err(Error::Connection(format!(
            "printer is busy ({:?})",
            printer.descriptor.data.status.current_status
        )));
    }
    Ok(())
}

/// One printer's status as a plain-text block.
fn status_summary(printer: &DiscoveredPrinter) -> String {
    let status = &printer.descriptor.data.status;
    let print_info = &status.print_info;
    let transfer = &status.file_transfer_info;
    format!(
        "IP address:       {}\n\
         Printer:          {}\n\
         Machine status:   {:?}\n\
         Print status:     {:?}\n\
         Layers:           {}/{}\n\
         File:             {}\n\
         Transfer status:  {:?}\n",
        printer.addr,
        printer.descriptor.describe(),
        status.current_status,
        print_info.status,
        print_info.current_layer,
        print_info.total_layer,
        print_info.filename,
        transfer.status,
    )
}

pub async fn status(addr: Option<IpAddr>, broadcast: IpAddr, full: bool) -> Result<()> {
    let config = DiscoveryConfig::default();
    let printers = match addr {
        Some(addr) => discovery::probe(addr, &config)
            .await?
            .into_iter()
            .collect(),
        None => discovery::discover(broadcast, &config).await?,
    };
    if printers.is_empty() {
        return Err(Error::Discovery("no printers found".into()));
    }
    for printer in &printers {
        if full {
            println!("{}", serde_json::to_string_pretty(&printer.descriptor)?);
        } else {
            println!("{}", status_summary(printer));
        }
    }
    Ok(())
}

pub async fn watch(printer: Option<IpAddr>, broadcast: IpAddr, interval: u64) -> Result<()> {
    let target = find_printer(printer, broadcast).await?;
    let addr = target.addr;
    let config = DiscoveryConfig::default();

    info!(printer = %target.descriptor.describe(), %addr, "watching");
    loop {
        let Some(fresh) = discovery::probe(addr, &config).await? else {
            warn!(%addr, "printer did not answer; retrying");
            tokio::time::sleep(Duration::from_secs(interval)).await;
            continue;
        };
        let print_info = &fresh.descriptor.data.status.print_info;
        if print_info.total_layer == 0 {
            println!("{}: not printing", fresh.descriptor.describe());
            return Ok(());
        }
        let pct = 100.0 * f64::from(print_info.current_layer) / f64::from(print_info.total_layer);
        println!(
            "{}: layer {}/{} ({pct:.0}%)",
            print_info.filename, print_info.current_layer, print_info.total_layer
        );
        if print_info.current_layer >= print_info.total_layer {
            println!("print complete");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

pub async fn upload(
    file: &Path,
    addr: Option<IpAddr>,
    broadcast: IpAddr,
    no_start: bool,
) -> Result<()> {
    if !file.exists() {
        return Err(Error::Transfer(format!("{} does not exist", file.display())));
    }
    let basename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Transfer(format!("bad filename: {}", file.display())))?
        .to_owned();

    let target = find_printer(addr, broadcast).await?;
    info!(printer = %target.descriptor.describe(), addr = %target.addr, "printer selected");
    refuse_if_busy(&target)?;

    let mut session = establish(target).await?;
    let mut progress = session.progress_channel();
    let reporter = async move {
        while let Some(p) = progress.recv().await {
            if p.is_failure() {
                eprintln!("\rupload failed");
            } else {
                eprint!("\r{}: {}/{} bytes", p.filename, p.bytes, p.total);
                if p.is_terminal() {
                    eprintln!();
                }
            }
        }
    };
    let (uploaded, ()) = tokio::join!(session.upload_file(file), reporter);
    let bytes = uploaded?;
    info!(bytes, "upload complete");

    if !no_start {
        session.print_file(&basename).await?;
        println!("print started: {basename}");
    }
    session.disconnect().await?;
    session.shutdown().await
}

pub async fn print(file: &str, addr: Option<IpAddr>, broadcast: IpAddr) -> Result<()> {
    let target = find_printer(addr, broadcast).await?;
    info!(printer = %target.descriptor.describe(), addr = %target.addr, "printer selected");
    refuse_if_busy(&target)?;

    let mut session = establish(target).await?;
    session.print_file(file).await?;
    println!("print started: {file}");
    session.disconnect().await?;
    session.shutdown().await
}

pub async fn connect_mqtt(
    address: &str,
    printer: Option<IpAddr>,
    broadcast: IpAddr,
) -> Result<()> {
    let port = broker_port(address)?;
    let config = DiscoveryConfig::default();
    let targets = match printer {
        Some(addr) => match discovery::probe(addr, &config).await? {
            Some(found) => vec![found],
            None => return Err(Error::Discovery(format!("no printer answered at {addr}"))),
        },
        None => discovery::discover(broadcast, &config).await?,
    };
    if targets.is_empty() {
        return Err(Error::Discovery("no printers found".into()));
    }
    for target in &targets {
        discovery::send_broker_redirect(target.addr, port).await?;
        println!(
            "{} ({}) redirected to broker port {port}",
            target.descriptor.describe(),
            target.addr
        );
    }
    Ok(())
}

/// Accepts either a bare port or "host:port".  The redirect datagram only
/// carries a port; the printer connects back to the datagram's source
/// address, so a host component is informational at best.
fn broker_port(address: &str) -> Result<u16> {
    let port_part = match address.rsplit_once(':') {
        Some((host, port)) => {
            if !host.is_empty() {
                info!(host, "host component ignored; the printer connects back to this machine");
            }
            port
        }
        None => address,
    };
    port_part
        .parse()
        .map_err(|_| Error::Connection(format!("invalid broker port in {address:?}")))
}

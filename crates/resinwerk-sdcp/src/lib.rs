// SPDX-License-Identifier: MIT
//
// Resinwerk SDCP — the network side of the printer protocol.
//
// The printer initiates the MQTT connection, so the controlling host runs
// a disposable single-client broker ([`broker::EmbeddedBroker`]) and a
// disposable single-route HTTP origin ([`fileserver::FileServer`]) for each
// session.  [`session::PrinterSession`] drives the command/response/status
// correlation over those two servers; [`discovery`] is the UDP side channel
// that finds printers and tells one to connect to the broker.

pub mod broker;
pub mod discovery;
pub mod fileserver;
pub mod packet;
pub mod session;

pub use broker::EmbeddedBroker;
pub use discovery::DiscoveredPrinter;
pub use fileserver::FileServer;
pub use session::{Printer, PrinterSession};

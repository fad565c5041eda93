// SPDX-License-Identifier: MIT
//
// The SDCP printer session state machine.
//
// Once the broker and file server exist, this layer multiplexes the
// command/response/status protocol over three topics keyed by the
// printer's board identifier.  The device emits unsolicited status at any
// time, so every operation here is a consumer of one ordered inbound
// stream, demultiplexed first by topic and then by request id within the
// response topic.  All consumption is serialized through the one driving
// task, and every wait is bounded.

use std::net::IpAddr;
use std::path::Path;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use resinwerk_core::{
    CommandEnvelope, CommandId, DiscoveryConfig, Error, MachineStatus, PrintStep,
    PrinterDescriptor, ResponseMessage, Result, SessionConfig, StatusBlock, StatusMessage,
    TransferProgress, TransferStatus, fresh_request_id,
};

use crate::broker::{EmbeddedBroker, InboundMessage};
use crate::discovery::{self, DiscoveredPrinter};
use crate::fileserver::{FileRoute, FileServer};

/// Narrow capability interface for a controllable printer.
///
/// [`PrinterSession`] is the real implementation; tests and front ends can
/// substitute their own.
#[allow(async_fn_in_trait)]
pub trait Printer {
    /// "Name (MachineName)" from the last known descriptor.
    fn describe(&self) -> String;
    /// Redirect the device to the embedded broker and run the handshake.
    async fn connect(&mut self) -> Result<()>;
    /// Best-effort session teardown.
    async fn disconnect(&mut self) -> Result<()>;
    /// Push a local file to the printer; returns the transferred byte count.
    async fn upload_file(&mut self, path: &Path) -> Result<u64>;
    /// Start printing a file already present on the printer.
    async fn print_file(&mut self, filename: &str) -> Result<()>;
    /// Refresh over the discovery channel and return the new snapshot.
    async fn status(&mut self) -> Result<PrinterDescriptor>;
}

/// An inbound message after topic demultiplexing.
enum SessionEvent {
    Response(ResponseMessage),
    Status(StatusBlock),
}

/// The logical session driving one printer through one broker and one
/// file server.
pub struct PrinterSession {
    addr: IpAddr,
    descriptor: PrinterDescriptor,
    broker: EmbeddedBroker,
    files: FileServer,
    config: SessionConfig,
    discovery: DiscoveryConfig,
    /// Most recent status block seen on the status topic.
    cached_status: Option<StatusBlock>,
    /// Live end of the bounded transfer-progress channel, if a consumer
    /// asked for one.  Non-null only while a transfer may still produce
    /// values; dropped after the terminal value so nothing can follow it.
    progress_tx: Option<mpsc::Sender<TransferProgress>>,
}

impl PrinterSession {
    /// Build a session from a discovered printer and started servers.
    pub fn new(
        printer: DiscoveredPrinter,
        broker: EmbeddedBroker,
        files: FileServer,
        config: SessionConfig,
        discovery: DiscoveryConfig,
    ) -> Self {
        Self {
            addr: printer.addr,
            descriptor: printer.descriptor,
            broker,
            files,
            config,
            discovery,
            cached_status: None,
            progress_tx: None,
        }
    }

    /// The printer's last known descriptor snapshot.
    pub fn descriptor(&self) -> &PrinterDescriptor {
        &self.descriptor
    }

    /// Most recent status block observed on the status topic, if any.
    pub fn cached_status(&self) -> Option<&StatusBlock> {
        self.cached_status.as_ref()
    }

    /// Create the bounded progress channel for the next upload.  Call
    /// before [`Printer::upload_file`]; the channel closes after the
    /// terminal value.
    pub fn progress_channel(&mut self) -> mpsc::Receiver<TransferProgress> {
        let (tx, rx) = mpsc::channel(self.config.progress_queue_depth);
        self.progress_tx = Some(tx);
        rx
    }

    /// Stop both embedded servers.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.broker.stop().await?;
        self.files.stop().await
    }

    /// Publish a command and consume inbound messages until the response
    /// with the matching request id arrives.  Non-zero ack codes are a
    /// typed failure.
    pub async fn send_command_and_wait(
        &mut self,
        cmd: CommandId,
        data: Option<Value>,
    ) -> Result<Value> {
        self.send_command(cmd, data, true).await
    }

    /// As [`send_command_and_wait`](Self::send_command_and_wait), but a
    /// non-zero ack is logged and the payload returned anyway.
    pub async fn send_command_tolerant(
        &mut self,
        cmd: CommandId,
        data: Option<Value>,
    ) -> Result<Value> {
        self.send_command(cmd, data, false).await
    }

    async fn send_command(
        &mut self,
        cmd: CommandId,
        data: Option<Value>,
        strict_ack: bool,
    ) -> Result<Value> {
        let envelope = CommandEnvelope::new(
            cmd,
            data,
            self.descriptor.board_id(),
            &self.descriptor.id,
        );
        let request_id = envelope.request_id().to_owned();
        self.broker
            .publish(&self.topic("request"), serde_json::to_vec(&envelope)?);
        debug!(cmd = cmd.code(), request_id = %request_id, "command published");

        let deadline = Instant::now() + self.config.command_timeout;
        loop {
            let msg = self.next_before(deadline, "command response").await?;
            let Some(event) = self.classify(msg) else {
                continue;
            };
            match event {
                SessionEvent::Response(resp) => {
                    if resp.data.request_id != request_id {
                        debug!(
                            foreign = %resp.data.request_id,
                            "ignoring response for a foreign request id"
                        );
                        continue;
                    }
                    let ack = resp.data.ack_code();
                    if ack != 0 {
                        if strict_ack {
                            return Err(Error::CommandRejected {
                                cmd: cmd.code(),
                                code: ack,
                            });
                        }
                        warn!(ack, cmd = cmd.code(), "tolerating non-zero ack code");
                    }
                    debug!(request_id = %request_id, "response matched");
                    return Ok(resp.data.payload);
                }
                SessionEvent::Status(_) => {}
            }
        }
    }

    /// Refresh the descriptor over the discovery channel.
    pub async fn refresh(&mut self) -> Result<()> {
        match discovery::probe(self.addr, &self.discovery).await? {
            Some(found) => {
                self.descriptor = found.descriptor;
                Ok(())
            }
            None => Err(Error::Discovery(format!("no reply from {}", self.addr))),
        }
    }

    // -- internals ----------------------------------------------------------

    fn topic(&self, kind: &str) -> String {
        format!("/sdcp/{kind}/{}", self.descriptor.board_id())
    }

    /// One bounded wait against an overall deadline.
    async fn next_before(
        &mut self,
        deadline: Instant,
        operation: &'static str,
    ) -> Result<InboundMessage> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout { operation });
        }
        match self.broker.next_published_message(remaining).await {
            Err(Error::Timeout { .. }) => Err(Error::Timeout { operation }),
            other => other,
        }
    }

    /// Demultiplex one inbound message by topic.  Status messages update
    /// the cache as a side effect; attributes are observed and ignored;
    /// unknown topics and unparsable payloads are logged and dropped.
    fn classify(&mut self, msg: InboundMessage) -> Option<SessionEvent> {
        if msg.topic == self.topic("response") {
            match serde_json::from_slice::<ResponseMessage>(&msg.payload) {
                Ok(resp) => Some(SessionEvent::Response(resp)),
                Err(e) => {
                    warn!(error = %e, "discarding unparsable response message");
                    None
                }
            }
        } else if msg.topic == self.topic("status") {
            match serde_json::from_slice::<StatusMessage>(&msg.payload) {
                Ok(status) => {
                    self.note_status(&status.data.status);
                    Some(SessionEvent::Status(status.data.status))
                }
                Err(e) => {
                    warn!(error = %e, "discarding unparsable status message");
                    None
                }
            }
        } else if msg.topic == self.topic("attributes") {
            None
        } else {
            warn!(topic = %msg.topic, "message on unknown topic");
            None
        }
    }

    fn note_status(&mut self, status: &StatusBlock) {
        if let MachineStatus::Unknown(code) = status.current_status {
            warn!(code, "unknown machine status code");
        }
        if let PrintStep::Unknown(code) = status.print_info.status {
            warn!(code, "unknown print step code");
        }
        if let TransferStatus::Unknown(code) = status.file_transfer_info.status {
            warn!(code, "unknown file transfer status code");
        }
        debug!(status = ?status, "status update");
        self.cached_status = Some(status.clone());
    }

    async fn push_progress(&mut self, progress: TransferProgress) {
        if let Some(tx) = &self.progress_tx {
            if tx.send(progress).await.is_err() {
                debug!("progress consumer dropped; further snapshots skipped");
                self.progress_tx = None;
            }
        }
    }

    /// The status-consuming phase of an upload, after the route exists.
    async fn drive_upload(&mut self, basename: &str, route: &FileRoute, url: String) -> Result<u64> {
        let cmd_data = json!({
            "Check": 0,
            "CleanCache": 1,
            "Compress": 0,
            "FileSize": route.size,
            "Filename": basename,
            "MD5": route.md5,
            "URL": url,
        });
        self.send_command_and_wait(CommandId::UploadFile, Some(cmd_data))
            .await?;

        loop {
            let msg = match self
                .broker
                .next_published_message(self.config.status_timeout)
                .await
            {
                Err(Error::Timeout { .. }) => {
                    return Err(Error::Transfer("no status update before timeout".into()));
                }
                other => other?,
            };
            let Some(event) = self.classify(msg) else {
                continue;
            };
            match event {
                SessionEvent::Response(resp) => warn!(
                    request_id = %resp.data.request_id,
                    "unexpected response with no outstanding request"
                ),
                SessionEvent::Status(status) => {
                    let transfer = &status.file_transfer_info;
                    // The printer goes Busy for the duration of the pull and
                    // returns to Ready with a terminal transfer status.
                    if status.current_status == MachineStatus::Ready {
                        return match transfer.status {
                            TransferStatus::Done => {
                                let total = transfer.file_total_size;
                                self.push_progress(TransferProgress {
                                    bytes: total as i64,
                                    total,
                                    filename: transfer.filename.clone(),
                                })
                                .await;
                                info!(bytes = total, "transfer complete");
                                Ok(total)
                            }
                            TransferStatus::Error => {
                                Err(Error::Transfer("printer reported a transfer error".into()))
                            }
                            other => Err(Error::Transfer(format!(
                                "unexpected terminal transfer status {other:?}"
                            ))),
                        };
                    }
                    self.push_progress(TransferProgress {
                        bytes: transfer.download_offset as i64,
                        total: transfer.file_total_size,
                        filename: transfer.filename.clone(),
                    })
                    .await;
                }
            }
        }
    }
}

impl Printer for PrinterSession {
    fn describe(&self) -> String {
        self.descriptor.describe()
    }

    /// Send the UDP redirect, wait (bounded) for the connect and subscribe
    /// signals, then run the fixed three-command handshake.
    async fn connect(&mut self) -> Result<()> {
        discovery::send_broker_redirect_to(self.addr, self.discovery.port, self.broker.port())
            .await?;

        let client_id = self
            .broker
            .wait_connected(self.config.connect_timeout)
            .await
            .map_err(|e| {
                Error::Connection(format!("printer never connected to the broker: {e}"))
            })?;
        if client_id != self.descriptor.board_id() {
            return Err(Error::Connection(format!(
                "client id mismatch: {client_id} != {}",
                self.descriptor.board_id()
            )));
        }

        let topic = self
            .broker
            .wait_subscribed(self.config.connect_timeout)
            .await
            .map_err(|e| Error::Connection(format!("printer never subscribed: {e}")))?;
        debug!(topic = %topic, "printer subscribed");

        self.send_command_and_wait(CommandId::Handshake0, None).await?;
        self.send_command_and_wait(CommandId::Handshake1, None).await?;
        self.send_command_and_wait(
            CommandId::SetStatusInterval,
            Some(json!({ "TimePeriod": self.config.status_interval_ms })),
        )
        .await?;

        info!(printer = %self.descriptor.describe(), "session established");
        Ok(())
    }

    /// Best-effort: a printer that is already gone is not an error.
    async fn disconnect(&mut self) -> Result<()> {
        match self.send_command_and_wait(CommandId::Disconnect, None).await {
            Ok(_) => Ok(()),
            Err(Error::Timeout { .. }) | Err(Error::Broker(_)) => {
                debug!("printer did not acknowledge disconnect");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Register the file under a randomized path, command the upload, and
    /// track status until a terminal transfer state.  Every exit path
    /// either delivers the final byte count or exactly one -1 sentinel on
    /// the progress channel; a waiting consumer is never left hanging.
    async fn upload_file(&mut self, path: &Path) -> Result<u64> {
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Transfer(format!("bad filename: {}", path.display())))?
            .to_owned();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != "ctb" && ext != "goo" {
            warn!(ext = %ext, "unrecognized file extension");
        }

        // Registration completes before the URL is ever disclosed.
        let http_path = format!("/{}.{ext}", fresh_request_id());
        let route = self.files.register_file_route(&http_path, path).await?;
        // The firmware substitutes its view of the host for `${ipaddr}`.
        let url = format!("http://${{ipaddr}}:{}{}", self.files.port(), http_path);

        let result = self.drive_upload(&basename, &route, url).await;
        self.files.unregister_file_route(&http_path);

        if let Err(e) = &result {
            error!(error = %e, "upload failed");
            self.push_progress(TransferProgress {
                bytes: -1,
                total: route.size,
                filename: basename,
            })
            .await;
        }
        // Terminal value delivered; nothing may follow it.
        self.progress_tx = None;
        result
    }

    /// Command the print start and observe a bounded number of status
    /// messages for confirmation.  Exceeding the bound is reported even
    /// though printing may actually have started.
    async fn print_file(&mut self, filename: &str) -> Result<()> {
        self.send_command_and_wait(
            CommandId::StartPrinting,
            Some(json!({ "Filename": filename, "StartLayer": 0 })),
        )
        .await?;

        let mut observed = 0;
        while observed < self.config.print_start_status_limit {
            let msg = self
                .broker
                .next_published_message(self.config.status_timeout)
                .await?;
            let Some(event) = self.classify(msg) else {
                continue;
            };
            match event {
                SessionEvent::Response(resp) => warn!(
                    request_id = %resp.data.request_id,
                    "unexpected response with no outstanding request"
                ),
                SessionEvent::Status(status) => {
                    observed += 1;
                    if status.current_status == MachineStatus::Busy
                        && status.print_info.status.is_active()
                    {
                        info!(filename, "print started");
                        return Ok(());
                    }
                    debug!(print_info = ?status.print_info, "print start not yet confirmed");
                }
            }
        }
        Err(Error::PrintStartUnconfirmed { observed })
    }

    async fn status(&mut self) -> Result<PrinterDescriptor> {
        self.refresh().await?;
        Ok(self.descriptor.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{self, Packet};
    use std::io::Write as _;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpStream, UdpSocket};

    const BOARD: &str = "ABC123";

    fn descriptor(board: &str) -> PrinterDescriptor {
        serde_json::from_value(json!({
            "Id": "dev-1",
            "Data": {
                "Attributes": {
                    "MainboardID": board,
                    "Name": "Saturn3Ultra",
                    "MachineName": "ELEGOO Saturn 3 Ultra"
                },
                "Status": {
                    "CurrentStatus": 0,
                    "PrintInfo": {
                        "Status": 0, "CurrentLayer": 0, "TotalLayer": 0, "Filename": ""
                    },
                    "FileTransferInfo": {
                        "Status": 0, "DownloadOffset": 0, "FileTotalSize": 0, "Filename": ""
                    }
                }
            }
        }))
        .expect("descriptor")
    }

    fn status_json(current: i64, print_step: i64, transfer: (i64, u64, u64, &str)) -> Value {
        let (t_status, offset, total, filename) = transfer;
        json!({
            "CurrentStatus": current,
            "PrintInfo": {
                "Status": print_step,
                "CurrentLayer": 0,
                "TotalLayer": 100,
                "Filename": filename
            },
            "FileTransferInfo": {
                "Status": t_status,
                "DownloadOffset": offset,
                "FileTotalSize": total,
                "Filename": filename
            }
        })
    }

    /// Minimal MQTT client playing the printer's role against the broker.
    struct FakePrinter {
        board: String,
        stream: TcpStream,
    }

    impl FakePrinter {
        /// TCP connect, MQTT CONNECT, and subscribe to the request topic —
        /// the firmware's connection dance.
        async fn connect(port: u16, board: &str) -> Self {
            let stream = TcpStream::connect(("127.0.0.1", port))
                .await
                .expect("fake printer connect");
            let mut fake = Self {
                board: board.to_owned(),
                stream,
            };
            fake.send(&Packet::Connect {
                client_id: board.to_owned(),
            })
            .await;
            assert_eq!(fake.recv().await, Packet::ConnAck);
            fake.send(&Packet::Subscribe {
                packet_id: 1,
                filters: vec![(format!("/sdcp/request/{board}"), 0)],
            })
            .await;
            assert!(matches!(fake.recv().await, Packet::SubAck { .. }));
            fake
        }

        async fn send(&mut self, pkt: &Packet) {
            self.stream
                .write_all(&packet::encode(pkt))
                .await
                .expect("fake printer write");
        }

        async fn recv(&mut self) -> Packet {
            packet::read_packet(&mut self.stream)
                .await
                .expect("fake printer read")
        }

        /// Wait for the next host command; returns (cmd, request id, envelope).
        async fn recv_command(&mut self) -> (u32, String, Value) {
            loop {
                if let Packet::Publish { payload, .. } = self.recv().await {
                    let v: Value = serde_json::from_slice(&payload).expect("command json");
                    let cmd = v["Data"]["Cmd"].as_u64().expect("Cmd") as u32;
                    let rid = v["Data"]["RequestID"].as_str().expect("RequestID").to_owned();
                    return (cmd, rid, v);
                }
            }
        }

        async fn publish_json(&mut self, topic: String, body: &Value) {
            self.send(&Packet::Publish {
                topic,
                payload: body.to_string().into_bytes(),
                qos: 0,
                packet_id: None,
            })
            .await;
        }

        async fn respond(&mut self, request_id: &str, cmd: u32, ack: i64) {
            let body = json!({
                "Data": {
                    "Cmd": cmd,
                    "RequestID": request_id,
                    "Data": { "Ack": ack },
                    "MainboardID": self.board
                },
                "Id": "dev-1"
            });
            self.publish_json(format!("/sdcp/response/{}", self.board), &body)
                .await;
        }

        async fn publish_status(&mut self, status: Value) {
            let body = json!({
                "Data": { "Status": status, "MainboardID": self.board },
                "Id": "dev-1"
            });
            self.publish_json(format!("/sdcp/status/{}", self.board), &body)
                .await;
        }

        /// Answer the three handshake commands; returns the codes seen.
        async fn serve_handshake(&mut self) -> Vec<u32> {
            let mut codes = Vec::new();
            for _ in 0..3 {
                let (cmd, rid, _) = self.recv_command().await;
                codes.push(cmd);
                self.respond(&rid, cmd, 0).await;
            }
            codes
        }
    }

    /// Broker + file server + session wired to a fake printer, with the
    /// redirect datagram swallowed by a loopback sink.
    async fn session_and_fake(board: &str) -> (PrinterSession, FakePrinter) {
        let mut broker = EmbeddedBroker::new();
        broker.start().await.expect("broker start");
        let mut files = FileServer::new();
        files.start().await.expect("file server start");

        let fake = FakePrinter::connect(broker.port(), board).await;

        // Sink for the redirect datagram so no real UDP port is involved.
        let sink = UdpSocket::bind(("127.0.0.1", 0)).await.expect("udp sink");
        let sink_port = sink.local_addr().expect("local_addr").port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = sink.recv_from(&mut buf).await;
        });

        let config = SessionConfig {
            connect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
            status_timeout: Duration::from_secs(1),
            ..SessionConfig::default()
        };
        let discovery = DiscoveryConfig {
            port: sink_port,
            broadcast_timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(200),
        };
        let session = PrinterSession::new(
            DiscoveredPrinter {
                addr: "127.0.0.1".parse().unwrap(),
                descriptor: descriptor(BOARD),
            },
            broker,
            files,
            config,
            discovery,
        );
        (session, fake)
    }

    /// A session past the connect handshake.
    async fn established() -> (PrinterSession, FakePrinter) {
        let (mut session, mut fake) = session_and_fake(BOARD).await;
        let (connected, codes) = tokio::join!(session.connect(), fake.serve_handshake());
        connected.expect("connect");
        assert_eq!(codes, vec![0, 1, 512]);
        (session, fake)
    }

    #[tokio::test]
    async fn connect_runs_three_command_handshake() {
        let _ = established().await;
    }

    #[tokio::test]
    async fn connect_rejects_client_id_mismatch() {
        let (mut session, _fake) = session_and_fake("WRONG_BOARD").await;
        let err = session.connect().await.unwrap_err();
        match err {
            Error::Connection(msg) => assert!(msg.contains("mismatch"), "{msg}"),
            other => panic!("expected Connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_matching_ignores_foreign_ids_and_caches_status() {
        let (mut session, mut fake) = established().await;

        let driver = async {
            let (cmd, rid, _) = fake.recv_command().await;
            assert_eq!(cmd, CommandId::Handshake0.code());
            // Noise first: a foreign response and an unsolicited status.
            fake.respond(&fresh_request_id(), cmd, 0).await;
            fake.publish_status(status_json(1, 2, (0, 0, 0, "busy.goo"))).await;
            fake.respond(&rid, cmd, 0).await;
        };
        let (result, ()) = tokio::join!(
            session.send_command_and_wait(CommandId::Handshake0, None),
            driver
        );
        result.expect("command should match its own request id");

        let cached = session.cached_status().expect("status cached as side effect");
        assert_eq!(cached.current_status, MachineStatus::Busy);
        assert_eq!(cached.print_info.status, PrintStep::Exposure);
    }

    #[tokio::test]
    async fn unanswered_command_times_out() {
        let (mut session, mut fake) = established().await;

        let driver = async {
            // Receive but never answer.
            let _ = fake.recv_command().await;
        };
        let (result, ()) = tokio::join!(
            session.send_command_and_wait(CommandId::Handshake0, None),
            driver
        );
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn bad_ack_is_typed_failure_by_default_and_tolerable_on_request() {
        let (mut session, mut fake) = established().await;

        let driver = async {
            let (cmd, rid, _) = fake.recv_command().await;
            fake.respond(&rid, cmd, 1).await;
        };
        let (result, ()) = tokio::join!(
            session.send_command_and_wait(CommandId::StartPrinting, None),
            driver
        );
        match result {
            Err(Error::CommandRejected { cmd, code }) => {
                assert_eq!(cmd, CommandId::StartPrinting.code());
                assert_eq!(code, 1);
            }
            other => panic!("expected CommandRejected, got {other:?}"),
        }

        let driver = async {
            let (cmd, rid, _) = fake.recv_command().await;
            fake.respond(&rid, cmd, 1).await;
        };
        let (result, ()) = tokio::join!(
            session.send_command_tolerant(CommandId::StartPrinting, None),
            driver
        );
        let payload = result.expect("tolerant mode returns the payload");
        assert_eq!(payload["Ack"], 1);
    }

    fn goo_file(dir: &tempfile::TempDir, bytes: usize) -> std::path::PathBuf {
        let path = dir.path().join("model.goo");
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(&vec![0x5A; bytes]).expect("write");
        path
    }

    #[tokio::test]
    async fn upload_reports_monotonic_progress_and_final_total() {
        let (mut session, mut fake) = established().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = goo_file(&dir, 10_000);
        let mut progress = session.progress_channel();

        let driver = async {
            let (cmd, rid, envelope) = fake.recv_command().await;
            assert_eq!(cmd, CommandId::UploadFile.code());
            let data = &envelope["Data"]["Data"];
            assert_eq!(data["FileSize"], 10_000);
            assert_eq!(data["Filename"], "model.goo");
            assert_eq!(data["MD5"].as_str().unwrap().len(), 32);
            let url = data["URL"].as_str().unwrap();
            assert!(url.starts_with("http://${ipaddr}:"), "{url}");
            assert!(url.ends_with(".goo"), "{url}");
            fake.respond(&rid, cmd, 0).await;

            // Busy while pulling, then Ready + Done.
            fake.publish_status(status_json(1, 0, (0, 2_000, 10_000, "model.goo"))).await;
            fake.publish_status(status_json(1, 0, (0, 7_500, 10_000, "model.goo"))).await;
            fake.publish_status(status_json(0, 0, (2, 10_000, 10_000, "model.goo"))).await;
        };

        let (result, ()) = tokio::join!(session.upload_file(&path), driver);
        assert_eq!(result.expect("upload"), 10_000);

        let mut seen = Vec::new();
        while let Some(p) = progress.recv().await {
            seen.push(p.bytes);
        }
        assert_eq!(seen, vec![2_000, 7_500, 10_000]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn upload_error_yields_exactly_one_sentinel_then_closes() {
        let (mut session, mut fake) = established().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = goo_file(&dir, 4_096);
        let mut progress = session.progress_channel();

        let driver = async {
            let (cmd, rid, _) = fake.recv_command().await;
            fake.respond(&rid, cmd, 0).await;
            fake.publish_status(status_json(1, 0, (0, 1_024, 4_096, "model.goo"))).await;
            fake.publish_status(status_json(0, 0, (3, 1_024, 4_096, "model.goo"))).await;
        };

        let (result, ()) = tokio::join!(session.upload_file(&path), driver);
        assert!(matches!(result, Err(Error::Transfer(_))), "{result:?}");

        let mut seen = Vec::new();
        while let Some(p) = progress.recv().await {
            seen.push(p.bytes);
        }
        assert_eq!(seen, vec![1_024, -1]);
        // Channel closed after the terminal value: recv returned None above
        // and nothing can follow.
        assert_eq!(seen.iter().filter(|&&b| b < 0).count(), 1);
    }

    #[tokio::test]
    async fn print_start_confirmed_by_busy_with_active_step() {
        let (mut session, mut fake) = established().await;

        let driver = async {
            let (cmd, rid, envelope) = fake.recv_command().await;
            assert_eq!(cmd, CommandId::StartPrinting.code());
            assert_eq!(envelope["Data"]["Data"]["Filename"], "model.goo");
            assert_eq!(envelope["Data"]["Data"]["StartLayer"], 0);
            fake.respond(&rid, cmd, 0).await;
            // One idle status, then the confirmation.
            fake.publish_status(status_json(0, 0, (0, 0, 0, ""))).await;
            fake.publish_status(status_json(1, 1, (0, 0, 0, "model.goo"))).await;
        };

        let (result, ()) = tokio::join!(session.print_file("model.goo"), driver);
        result.expect("print start");
    }

    #[tokio::test]
    async fn print_start_gives_up_after_configured_status_bound() {
        let (mut session, mut fake) = established().await;

        let limit = session.config.print_start_status_limit;
        let driver = async {
            let (cmd, rid, _) = fake.recv_command().await;
            fake.respond(&rid, cmd, 0).await;
            for _ in 0..limit {
                fake.publish_status(status_json(0, 0, (0, 0, 0, ""))).await;
            }
        };

        let (result, ()) = tokio::join!(session.print_file("model.goo"), driver);
        match result {
            Err(Error::PrintStartUnconfirmed { observed }) => assert_eq!(observed, limit),
            other => panic!("expected PrintStartUnconfirmed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_refreshes_descriptor_over_discovery() {
        let (mut session, _fake) = session_and_fake(BOARD).await;

        // Stand in for the printer's discovery responder.
        let responder = UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind");
        session.discovery.port = responder.local_addr().expect("local_addr").port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = responder.recv_from(&mut buf).await.expect("recv");
            let mut refreshed = serde_json::to_value(descriptor(BOARD)).expect("json");
            refreshed["Data"]["Status"]["CurrentStatus"] = json!(1);
            responder
                .send_to(refreshed.to_string().as_bytes(), from)
                .await
                .expect("send");
        });

        let fresh = session.status().await.expect("status");
        assert!(fresh.is_busy());
        assert!(session.descriptor().is_busy());
    }
}

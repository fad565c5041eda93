// SPDX-License-Identifier: MIT
//
// Core domain types for the SDCP (JSON-over-MQTT) printer control protocol.
//
// The printer's JSON uses PascalCase field names throughout; every wire
// struct here carries explicit `rename` attributes so the Rust side can
// stay snake_case.  Status code enumerations are closed on the wire but
// open here: codes this crate does not know fold into an `Unknown`
// variant instead of failing deserialization, because a firmware update
// must never be able to crash a session.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// UDP port the printer listens on for discovery and redirect datagrams.
pub const SDCP_UDP_PORT: u16 = 3000;

/// Discovery request payload (broadcast and unicast).
pub const DISCOVERY_MAGIC: &[u8] = b"M99999";

/// Prefix of the "connect to this broker port" redirect datagram.
pub const REDIRECT_MAGIC: &str = "M66666";

// ---------------------------------------------------------------------------
// Status enumerations
// ---------------------------------------------------------------------------

/// `CurrentStatus` field inside the status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum MachineStatus {
    /// Idle, will accept uploads and print commands.
    Ready,
    /// Printing, transferring, or sitting at the "Completed" screen.
    Busy,
    /// A code this crate does not know.  Logged by consumers, never fatal.
    Unknown(i64),
}

impl From<i64> for MachineStatus {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::Ready,
            1 => Self::Busy,
            other => Self::Unknown(other),
        }
    }
}

impl From<MachineStatus> for i64 {
    fn from(status: MachineStatus) -> i64 {
        match status {
            MachineStatus::Ready => 0,
            MachineStatus::Busy => 1,
            MachineStatus::Unknown(code) => code,
        }
    }
}

/// `Status` field inside the print-info block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum PrintStep {
    NotPrinting,
    StartingPrint,
    Exposure,
    Retracting,
    Lowering,
    /// Reported at the end of a print; differs from `Complete` in ways the
    /// firmware does not document.
    Finished,
    Complete,
    Unknown(i64),
}

impl PrintStep {
    /// Whether the printer reports any active print step.
    pub fn is_active(self) -> bool {
        i64::from(self) > 0
    }
}

impl From<i64> for PrintStep {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::NotPrinting,
            1 => Self::StartingPrint,
            2 => Self::Exposure,
            3 => Self::Retracting,
            4 => Self::Lowering,
            12 => Self::Finished,
            16 => Self::Complete,
            other => Self::Unknown(other),
        }
    }
}

impl From<PrintStep> for i64 {
    fn from(step: PrintStep) -> i64 {
        match step {
            PrintStep::NotPrinting => 0,
            PrintStep::StartingPrint => 1,
            PrintStep::Exposure => 2,
            PrintStep::Retracting => 3,
            PrintStep::Lowering => 4,
            PrintStep::Finished => 12,
            PrintStep::Complete => 16,
            PrintStep::Unknown(code) => code,
        }
    }
}

/// `Status` field inside the file-transfer-info block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum TransferStatus {
    None,
    Done,
    Error,
    Unknown(i64),
}

impl From<i64> for TransferStatus {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::None,
            2 => Self::Done,
            3 => Self::Error,
            other => Self::Unknown(other),
        }
    }
}

impl From<TransferStatus> for i64 {
    fn from(status: TransferStatus) -> i64 {
        match status {
            TransferStatus::None => 0,
            TransferStatus::Done => 2,
            TransferStatus::Error => 3,
            TransferStatus::Unknown(code) => code,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// SDCP command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    /// First handshake command, null data.
    Handshake0,
    /// Second handshake command, null data.
    Handshake1,
    /// Ends the MQTT session from the printer side.
    Disconnect,
    /// `{ "Filename": ..., "StartLayer": 0 }`
    StartPrinting,
    /// `{ "Check", "CleanCache", "Compress", "FileSize", "Filename", "MD5", "URL" }`
    UploadFile,
    /// `{ "TimePeriod": <millis> }` — unsolicited status cadence.
    SetStatusInterval,
}

impl CommandId {
    /// Wire code for the `Cmd` envelope field.
    pub fn code(self) -> u32 {
        match self {
            Self::Handshake0 => 0,
            Self::Handshake1 => 1,
            Self::Disconnect => 64,
            Self::StartPrinting => 128,
            Self::UploadFile => 256,
            Self::SetStatusInterval => 512,
        }
    }
}

/// Generate a fresh 32-hex-character request correlation token.
pub fn fresh_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The host→device command envelope published on the request topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "Data")]
    pub data: CommandData,
    /// The session/device `Id` echoed from the discovery descriptor.
    #[serde(rename = "Id")]
    pub id: String,
}

/// Inner payload of a [`CommandEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandData {
    #[serde(rename = "Cmd")]
    pub cmd: u32,
    #[serde(rename = "Data")]
    pub data: Option<Value>,
    #[serde(rename = "From")]
    pub from: u32,
    #[serde(rename = "MainboardID")]
    pub mainboard_id: String,
    /// Random correlation token matched against the later response.
    #[serde(rename = "RequestID")]
    pub request_id: String,
    /// Epoch milliseconds at build time.
    #[serde(rename = "TimeStamp")]
    pub timestamp: i64,
}

impl CommandEnvelope {
    /// Build a command with a fresh request id and current timestamp.
    pub fn new(cmd: CommandId, data: Option<Value>, mainboard_id: &str, device_id: &str) -> Self {
        Self {
            data: CommandData {
                cmd: cmd.code(),
                data,
                from: 0,
                mainboard_id: mainboard_id.to_owned(),
                request_id: fresh_request_id(),
                timestamp: Utc::now().timestamp_millis(),
            },
            id: device_id.to_owned(),
        }
    }

    /// The correlation token of this command.
    pub fn request_id(&self) -> &str {
        &self.data.request_id
    }
}

// ---------------------------------------------------------------------------
// Descriptor and status blocks
// ---------------------------------------------------------------------------

/// Immutable snapshot of a printer, as returned by UDP discovery.
///
/// Replaced wholesale on each refresh, never partially mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterDescriptor {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Data")]
    pub data: DescriptorData,
}

impl PrinterDescriptor {
    /// Stable hardware id; the MQTT topic namespace key.
    pub fn board_id(&self) -> &str {
        &self.data.attributes.mainboard_id
    }

    /// Human-readable "Name (MachineName)" line.
    pub fn describe(&self) -> String {
        format!(
            "{} ({})",
            self.data.attributes.name, self.data.attributes.machine_name
        )
    }

    /// Whether the printer reports anything other than `Ready`.
    pub fn is_busy(&self) -> bool {
        self.data.status.current_status != MachineStatus::Ready
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorData {
    #[serde(rename = "Attributes")]
    pub attributes: PrinterAttributes,
    #[serde(rename = "Status")]
    pub status: StatusBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterAttributes {
    #[serde(rename = "MainboardID")]
    pub mainboard_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MachineName")]
    pub machine_name: String,
}

/// The status block carried by discovery replies and status-topic messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBlock {
    #[serde(rename = "CurrentStatus")]
    pub current_status: MachineStatus,
    #[serde(rename = "PrintInfo")]
    pub print_info: PrintInfo,
    #[serde(rename = "FileTransferInfo")]
    pub file_transfer_info: FileTransferInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintInfo {
    #[serde(rename = "Status")]
    pub status: PrintStep,
    #[serde(rename = "CurrentLayer")]
    pub current_layer: u32,
    #[serde(rename = "TotalLayer")]
    pub total_layer: u32,
    #[serde(rename = "Filename")]
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferInfo {
    #[serde(rename = "Status")]
    pub status: TransferStatus,
    #[serde(rename = "DownloadOffset")]
    pub download_offset: u64,
    #[serde(rename = "FileTotalSize")]
    pub file_total_size: u64,
    #[serde(rename = "Filename")]
    pub filename: String,
}

// ---------------------------------------------------------------------------
// Inbound message envelopes
// ---------------------------------------------------------------------------

/// A device→host message on the status topic.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "Data")]
    pub data: StatusMessageData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusMessageData {
    #[serde(rename = "Status")]
    pub status: StatusBlock,
}

/// A device→host acknowledgement on the response topic.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    #[serde(rename = "Data")]
    pub data: ResponseData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseData {
    #[serde(rename = "Cmd", default)]
    pub cmd: u32,
    /// Echo of the command's correlation token.
    #[serde(rename = "RequestID")]
    pub request_id: String,
    /// The response payload; carries the `Ack` code plus command-specific
    /// fields.
    #[serde(rename = "Data", default)]
    pub payload: Value,
}

impl ResponseData {
    /// The acknowledgement code; 0 means accepted.  A missing field is
    /// treated as accepted, matching observed firmware behavior on the
    /// handshake commands.
    pub fn ack_code(&self) -> i64 {
        self.payload.get("Ack").and_then(Value::as_i64).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Transfer progress
// ---------------------------------------------------------------------------

/// One snapshot of upload progress, delivered over a bounded channel.
///
/// `bytes == -1` is the error sentinel; it is always the last value the
/// channel carries.  A successful transfer ends with `bytes == total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes the printer has pulled so far, or -1 on failure.
    pub bytes: i64,
    /// Total size of the file being transferred.
    pub total: u64,
    /// Filename as reported by the printer.
    pub filename: String,
}

impl TransferProgress {
    /// Whether this snapshot is the error sentinel.
    pub fn is_failure(&self) -> bool {
        self.bytes < 0
    }

    /// Whether this snapshot is terminal (error, or all bytes transferred).
    pub fn is_terminal(&self) -> bool {
        self.is_failure() || (self.total > 0 && self.bytes as u64 >= self.total)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_descriptor_json() -> Value {
        json!({
            "Id": "f25273b12b094c5a8b9513a30ca60049",
            "Data": {
                "Attributes": {
                    "MainboardID": "ABC123",
                    "Name": "Saturn3Ultra",
                    "MachineName": "ELEGOO Saturn 3 Ultra"
                },
                "Status": {
                    "CurrentStatus": 0,
                    "PrintInfo": {
                        "Status": 0,
                        "CurrentLayer": 0,
                        "TotalLayer": 0,
                        "Filename": ""
                    },
                    "FileTransferInfo": {
                        "Status": 0,
                        "DownloadOffset": 0,
                        "FileTotalSize": 0,
                        "Filename": ""
                    }
                }
            }
        })
    }

    #[test]
    fn descriptor_roundtrips_pascal_case_fields() {
        let desc: PrinterDescriptor =
            serde_json::from_value(sample_descriptor_json()).expect("deserialize");
        assert_eq!(desc.board_id(), "ABC123");
        assert_eq!(desc.describe(), "Saturn3Ultra (ELEGOO Saturn 3 Ultra)");
        assert!(!desc.is_busy());

        let back = serde_json::to_value(&desc).expect("serialize");
        assert_eq!(back["Data"]["Attributes"]["MainboardID"], "ABC123");
        assert_eq!(back["Data"]["Status"]["CurrentStatus"], 0);
    }

    #[test]
    fn unknown_status_codes_do_not_fail_deserialization() {
        let mut json = sample_descriptor_json();
        json["Data"]["Status"]["CurrentStatus"] = json!(7);
        json["Data"]["Status"]["PrintInfo"]["Status"] = json!(99);
        json["Data"]["Status"]["FileTransferInfo"]["Status"] = json!(5);

        let desc: PrinterDescriptor = serde_json::from_value(json).expect("deserialize");
        assert_eq!(desc.data.status.current_status, MachineStatus::Unknown(7));
        assert_eq!(desc.data.status.print_info.status, PrintStep::Unknown(99));
        assert_eq!(
            desc.data.status.file_transfer_info.status,
            TransferStatus::Unknown(5)
        );
        assert!(desc.is_busy());
    }

    #[test]
    fn print_step_activity() {
        assert!(!PrintStep::NotPrinting.is_active());
        assert!(PrintStep::StartingPrint.is_active());
        assert!(PrintStep::Exposure.is_active());
        assert!(PrintStep::Complete.is_active());
    }

    #[test]
    fn command_envelope_shape() {
        let cmd = CommandEnvelope::new(
            CommandId::StartPrinting,
            Some(json!({"Filename": "part.goo", "StartLayer": 0})),
            "ABC123",
            "dev-1",
        );
        let value = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(value["Data"]["Cmd"], 128);
        assert_eq!(value["Data"]["From"], 0);
        assert_eq!(value["Data"]["MainboardID"], "ABC123");
        assert_eq!(value["Id"], "dev-1");
        assert_eq!(value["Data"]["Data"]["Filename"], "part.goo");
        assert_eq!(value["Data"]["RequestID"].as_str().unwrap().len(), 32);
        assert!(value["Data"]["TimeStamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn request_ids_are_unique_hex() {
        let a = fresh_request_id();
        let b = fresh_request_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn response_ack_code_defaults_to_accepted() {
        let resp: ResponseMessage = serde_json::from_value(json!({
            "Data": { "Cmd": 0, "RequestID": "aa".repeat(16) }
        }))
        .expect("deserialize");
        assert_eq!(resp.data.ack_code(), 0);

        let resp: ResponseMessage = serde_json::from_value(json!({
            "Data": { "Cmd": 256, "RequestID": "bb".repeat(16), "Data": { "Ack": 1 } }
        }))
        .expect("deserialize");
        assert_eq!(resp.data.ack_code(), 1);
    }

    #[test]
    fn transfer_progress_terminal_states() {
        let failed = TransferProgress {
            bytes: -1,
            total: 100,
            filename: "a.goo".into(),
        };
        assert!(failed.is_failure());
        assert!(failed.is_terminal());

        let partial = TransferProgress {
            bytes: 50,
            total: 100,
            filename: "a.goo".into(),
        };
        assert!(!partial.is_terminal());

        let done = TransferProgress {
            bytes: 100,
            total: 100,
            filename: "a.goo".into(),
        };
        assert!(done.is_terminal());
        assert!(!done.is_failure());
    }
}

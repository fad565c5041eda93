// SPDX-License-Identifier: MIT
//
// MQTT 3.1.1 wire codec — the subset a single resin printer actually speaks.
//
// # Framing
//
// Every MQTT control packet is:
//
// ```text
// fixed header:     1 byte  (packet type high nibble, flags low nibble)
// remaining length: 1-4 bytes (7 bits per byte, bit 7 = continuation)
// variable header + payload: remaining-length bytes
// ```
//
// The codec is symmetric — it encodes and decodes every packet kind it
// knows — so the broker, the tests, and the fake-printer test client all
// share one wire implementation.  No retained messages, no QoS 2, no
// persistence: the printer only ever uses CONNECT/SUBSCRIBE/PUBLISH
// (QoS 0 or 1) and PING.

use tokio::io::{AsyncRead, AsyncReadExt};

use resinwerk_core::{Error, Result};

// ---------------------------------------------------------------------------
// Packet type constants (MQTT 3.1.1 §2.2.1)
// ---------------------------------------------------------------------------

const TYPE_CONNECT: u8 = 1;
const TYPE_CONNACK: u8 = 2;
const TYPE_PUBLISH: u8 = 3;
const TYPE_PUBACK: u8 = 4;
const TYPE_SUBSCRIBE: u8 = 8;
const TYPE_SUBACK: u8 = 9;
const TYPE_PINGREQ: u8 = 12;
const TYPE_PINGRESP: u8 = 13;
const TYPE_DISCONNECT: u8 = 14;

/// Largest legal remaining-length value (4 continuation bytes).
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Cap on a single packet body, enforced before the body buffer is
/// allocated.  SDCP payloads are small JSON documents; the MQTT maximum
/// (~268 MB) would let a misbehaving client force huge allocations.
const MAX_PACKET_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Packet model
// ---------------------------------------------------------------------------

/// One decoded MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Client → broker session open.  Only the client identifier matters
    /// to us; will/credential fields are parsed past and dropped.
    Connect { client_id: String },
    /// Broker → client accept acknowledgement.
    ConnAck,
    /// Either direction; `packet_id` present iff `qos > 0`.
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        packet_id: Option<u16>,
    },
    /// QoS-1 delivery acknowledgement.
    PubAck { packet_id: u16 },
    /// Client → broker topic-filter registration.
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, u8)>,
    },
    /// Broker → client per-topic grants.
    SubAck { packet_id: u16, granted: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
    /// A packet type this subset does not handle; body already consumed.
    Unsupported { packet_type: u8 },
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read one complete packet from the stream.
///
/// A clean EOF surfaces as `Error::Io(UnexpectedEof)`; the broker treats
/// that as the client hanging up.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet> {
    let mut first = [0u8; 1];
    reader.read_exact(&mut first).await?;

    let remaining = read_remaining_length(reader).await?;
    if remaining > MAX_PACKET_SIZE {
        return Err(Error::Broker(format!(
            "packet body of {remaining} bytes exceeds the {MAX_PACKET_SIZE}-byte cap"
        )));
    }
    let mut body = vec![0u8; remaining];
    reader.read_exact(&mut body).await?;

    decode_body(first[0], &body)
}

/// Decode the variable-length remaining-length field.
async fn read_remaining_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let mut value: usize = 0;
    let mut multiplier: usize = 1;
    for i in 0.. {
        if i >= 4 {
            return Err(Error::Broker("remaining length exceeds 4 bytes".into()));
        }
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        value += (byte[0] & 0x7F) as usize * multiplier;
        if byte[0] & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }
    Ok(value)
}

/// Decode a packet body given its fixed-header byte.
pub fn decode_body(first_byte: u8, body: &[u8]) -> Result<Packet> {
    let packet_type = first_byte >> 4;
    let flags = first_byte & 0x0F;
    let mut r = Reader::new(body);

    match packet_type {
        TYPE_CONNECT => decode_connect(&mut r),
        TYPE_CONNACK => Ok(Packet::ConnAck),
        TYPE_PUBLISH => decode_publish(flags, &mut r),
        TYPE_PUBACK => Ok(Packet::PubAck {
            packet_id: r.u16("PUBACK packet id")?,
        }),
        TYPE_SUBSCRIBE => decode_subscribe(&mut r),
        TYPE_SUBACK => {
            let packet_id = r.u16("SUBACK packet id")?;
            Ok(Packet::SubAck {
                packet_id,
                granted: r.rest().to_vec(),
            })
        }
        TYPE_PINGREQ => Ok(Packet::PingReq),
        TYPE_PINGRESP => Ok(Packet::PingResp),
        TYPE_DISCONNECT => Ok(Packet::Disconnect),
        other => Ok(Packet::Unsupported { packet_type: other }),
    }
}

fn decode_connect(r: &mut Reader<'_>) -> Result<Packet> {
    // Protocol name ("MQTT" or the 3.1 "MQIsdp"), level, flags, keepalive.
    let _protocol = r.string("CONNECT protocol name")?;
    let _level = r.u8("CONNECT protocol level")?;
    let connect_flags = r.u8("CONNECT flags")?;
    let _keepalive = r.u16("CONNECT keepalive")?;

    let client_id = r.string("CONNECT client id")?;

    // Skip will topic/message and credentials if present.
    if connect_flags & 0x04 != 0 {
        let _ = r.string("CONNECT will topic")?;
        let _ = r.bytes("CONNECT will message")?;
    }
    if connect_flags & 0x80 != 0 {
        let _ = r.string("CONNECT username")?;
    }
    if connect_flags & 0x40 != 0 {
        let _ = r.bytes("CONNECT password")?;
    }

    Ok(Packet::Connect { client_id })
}

fn decode_publish(flags: u8, r: &mut Reader<'_>) -> Result<Packet> {
    let qos = (flags >> 1) & 0x03;
    if qos > 2 {
        return Err(Error::Broker(format!("PUBLISH with invalid QoS {qos}")));
    }
    let topic = r.string("PUBLISH topic")?;
    let packet_id = if qos > 0 {
        Some(r.u16("PUBLISH packet id")?)
    } else {
        None
    };
    Ok(Packet::Publish {
        topic,
        payload: r.rest().to_vec(),
        qos,
        packet_id,
    })
}

fn decode_subscribe(r: &mut Reader<'_>) -> Result<Packet> {
    let packet_id = r.u16("SUBSCRIBE packet id")?;
    let mut filters = Vec::new();
    while !r.is_empty() {
        let topic = r.string("SUBSCRIBE topic filter")?;
        let qos = r.u8("SUBSCRIBE requested QoS")?;
        filters.push((topic, qos));
    }
    if filters.is_empty() {
        return Err(Error::Broker("SUBSCRIBE with no topic filters".into()));
    }
    Ok(Packet::Subscribe { packet_id, filters })
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Encode a packet to wire bytes.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let (first_byte, body) = match packet {
        Packet::Connect { client_id } => {
            let mut b = Vec::with_capacity(16 + client_id.len());
            write_string(&mut b, "MQTT");
            b.push(0x04); // protocol level 3.1.1
            b.push(0x02); // clean session
            b.extend_from_slice(&60u16.to_be_bytes()); // keepalive
            write_string(&mut b, client_id);
            (TYPE_CONNECT << 4, b)
        }
        Packet::ConnAck => (TYPE_CONNACK << 4, vec![0x00, 0x00]),
        Packet::Publish {
            topic,
            payload,
            qos,
            packet_id,
        } => {
            let mut b = Vec::with_capacity(4 + topic.len() + payload.len());
            write_string(&mut b, topic);
            if *qos > 0 {
                b.extend_from_slice(&packet_id.unwrap_or(0).to_be_bytes());
            }
            b.extend_from_slice(payload);
            ((TYPE_PUBLISH << 4) | (qos << 1), b)
        }
        Packet::PubAck { packet_id } => (TYPE_PUBACK << 4, packet_id.to_be_bytes().to_vec()),
        Packet::Subscribe { packet_id, filters } => {
            let mut b = Vec::new();
            b.extend_from_slice(&packet_id.to_be_bytes());
            for (topic, qos) in filters {
                write_string(&mut b, topic);
                b.push(*qos);
            }
            // Reserved flags 0b0010 are mandatory on SUBSCRIBE.
            ((TYPE_SUBSCRIBE << 4) | 0x02, b)
        }
        Packet::SubAck { packet_id, granted } => {
            let mut b = Vec::with_capacity(2 + granted.len());
            b.extend_from_slice(&packet_id.to_be_bytes());
            b.extend_from_slice(granted);
            (TYPE_SUBACK << 4, b)
        }
        Packet::PingReq => (TYPE_PINGREQ << 4, Vec::new()),
        Packet::PingResp => (TYPE_PINGRESP << 4, Vec::new()),
        Packet::Disconnect => (TYPE_DISCONNECT << 4, Vec::new()),
        Packet::Unsupported { packet_type } => (packet_type << 4, Vec::new()),
    };

    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(first_byte);
    write_remaining_length(&mut out, body.len());
    out.extend_from_slice(&body);
    out
}

/// Encode the variable-length remaining-length field.
fn write_remaining_length(out: &mut Vec<u8>, mut len: usize) {
    debug_assert!(len <= MAX_REMAINING_LENGTH);
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Write a u16-length-prefixed UTF-8 string.
fn write_string(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize, "string too long for a u16 length prefix");
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

// ---------------------------------------------------------------------------
// Body reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| truncated(what))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let hi = self.u8(what)?;
        let lo = self.u8(what)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn bytes(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.u16(what)? as usize;
        if self.pos + len > self.buf.len() {
            return Err(truncated(what));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let raw = self.bytes(what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Broker(format!("{what}: invalid UTF-8")))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

fn truncated(what: &str) -> Error {
    Error::Broker(format!("truncated packet: {what}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

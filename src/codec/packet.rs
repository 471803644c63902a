//! MQTT 5.0 control packet model and codec.
//!
//! All fifteen control packets with encode to and decode from their wire
//! form. Each packet is a fixed header `(type << 4) | flags`, a Variable
//! Byte Integer Remaining Length, the variable header and an optional
//! payload. The mapping is bijective apart from the short forms of the
//! PUBACK family (Remaining Length 2 and 3), which are both accepted and
//! emitted but normalise to the same decoded value.

use crate::codec::properties::Properties;
use crate::codec::{self, reason, Reader};
use crate::error::MqttError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Protocol name carried in every CONNECT.
const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 5.0.
const PROTOCOL_LEVEL: u8 = 5;

// ---------------------------------------------------------------------------
// Quality of service
// ---------------------------------------------------------------------------

/// Delivery guarantee for a publish. The wire value equals the integer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_u8(value: u8) -> Result<Self, MqttError> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(MqttError::malformed(format!("invalid QoS {other}"))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Per-subscription options byte: `{qos: 2 bits, no_local: 1,
/// retain_as_published: 1, retain_handling: 2}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: Qos,
    pub no_local: bool,
    pub retain_as_published: bool,
    /// 0 = send retained, 1 = send retained if new, 2 = do not send.
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    pub fn new(qos: Qos) -> Self {
        Self {
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: 0,
        }
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn with_retain_as_published(mut self, rap: bool) -> Self {
        self.retain_as_published = rap;
        self
    }

    pub fn with_retain_handling(mut self, handling: u8) -> Self {
        self.retain_handling = handling;
        self
    }

    pub fn encode(self) -> u8 {
        self.qos.as_u8()
            | u8::from(self.no_local) << 2
            | u8::from(self.retain_as_published) << 3
            | (self.retain_handling & 0x03) << 4
    }

    pub fn decode(byte: u8) -> Result<Self, MqttError> {
        if byte & 0b1100_0000 != 0 {
            return Err(MqttError::malformed("reserved subscription option bits set"));
        }
        let retain_handling = (byte >> 4) & 0x03;
        if retain_handling > 2 {
            return Err(MqttError::malformed(format!(
                "invalid retain handling {retain_handling}"
            )));
        }
        Ok(Self {
            qos: Qos::from_u8(byte & 0x03)?,
            no_local: byte & 0b0000_0100 != 0,
            retain_as_published: byte & 0b0000_1000 != 0,
            retain_handling,
        })
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::new(Qos::AtMostOnce)
    }
}

/// One topic filter plus its options within a SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic_filter: String,
    pub options: SubscriptionOptions,
}

impl Subscription {
    pub fn new(topic_filter: impl Into<String>, qos: Qos) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            options: SubscriptionOptions::new(qos),
        }
    }
}

// ---------------------------------------------------------------------------
// Packet bodies
// ---------------------------------------------------------------------------

/// Will message stored by the broker at CONNECT time.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub client_id: String,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub properties: Properties,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_start: true,
            keep_alive: 0,
            properties: Properties::default(),
            will: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: u8,
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: Qos,
    pub retain: bool,
    pub topic: String,
    /// Present if and only if `qos > 0`.
    pub packet_id: Option<u16>,
    pub properties: Properties,
    pub payload: Bytes,
}

/// Shared shape of PUBACK, PUBREC, PUBREL and PUBCOMP.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub packet_id: u16,
    pub reason_code: u8,
    pub properties: Properties,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: reason::SUCCESS,
            properties: Properties::default(),
        }
    }

    pub fn with_reason(packet_id: u16, reason_code: u8) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Properties::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub properties: Properties,
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub packet_id: u16,
    pub properties: Properties,
    /// One granted-QoS-or-error code per requested filter, in order.
    pub reason_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub properties: Properties,
    pub topic_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub properties: Properties,
    pub reason_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason_code: u8,
    pub properties: Properties,
}

impl Default for Disconnect {
    fn default() -> Self {
        Self {
            reason_code: reason::NORMAL_DISCONNECTION,
            properties: Properties::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub reason_code: u8,
    pub properties: Properties,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            reason_code: reason::SUCCESS,
            properties: Properties::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// The packet union
// ---------------------------------------------------------------------------

/// Tagged union of the fifteen MQTT 5.0 control packets.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    /// Wire name of the packet type, for logs and error messages.
    pub fn packet_type(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
            Packet::Auth(_) => "AUTH",
        }
    }

    /// Serialize the packet into a complete wire frame.
    pub fn encode(&self) -> Result<Bytes, MqttError> {
        let (first_byte, body) = match self {
            Packet::Connect(p) => (0x10, encode_connect(p)?),
            Packet::ConnAck(p) => (0x20, encode_connack(p)?),
            Packet::Publish(p) => {
                let flags = u8::from(p.dup) << 3 | p.qos.as_u8() << 1 | u8::from(p.retain);
                (0x30 | flags, encode_publish(p)?)
            }
            Packet::PubAck(p) => (0x40, encode_ack(p)?),
            Packet::PubRec(p) => (0x50, encode_ack(p)?),
            Packet::PubRel(p) => (0x62, encode_ack(p)?),
            Packet::PubComp(p) => (0x70, encode_ack(p)?),
            Packet::Subscribe(p) => (0x82, encode_subscribe(p)?),
            Packet::SubAck(p) => (0x90, encode_suback(p)?),
            Packet::Unsubscribe(p) => (0xA2, encode_unsubscribe(p)?),
            Packet::UnsubAck(p) => (0xB0, encode_unsuback(p)?),
            Packet::PingReq => (0xC0, BytesMut::new()),
            Packet::PingResp => (0xD0, BytesMut::new()),
            Packet::Disconnect(p) => (0xE0, encode_disconnect(p)?),
            Packet::Auth(p) => (0xF0, encode_auth(p)?),
        };
        let mut frame = BytesMut::with_capacity(body.len() + 5);
        frame.put_u8(first_byte);
        codec::write_vbi(&mut frame, body.len() as u32)?;
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode one packet from its first byte and framed body.
    pub fn decode(first_byte: u8, body: Bytes) -> Result<Packet, MqttError> {
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;
        let mut r = Reader::new(body);
        let packet = match packet_type {
            1 => {
                expect_flags(flags, 0, "CONNECT")?;
                Packet::Connect(decode_connect(&mut r)?)
            }
            2 => {
                expect_flags(flags, 0, "CONNACK")?;
                Packet::ConnAck(decode_connack(&mut r)?)
            }
            3 => Packet::Publish(decode_publish(flags, &mut r)?),
            4 => {
                expect_flags(flags, 0, "PUBACK")?;
                Packet::PubAck(decode_ack(&mut r)?)
            }
            5 => {
                expect_flags(flags, 0, "PUBREC")?;
                Packet::PubRec(decode_ack(&mut r)?)
            }
            6 => {
                expect_flags(flags, 0x02, "PUBREL")?;
                Packet::PubRel(decode_ack(&mut r)?)
            }
            7 => {
                expect_flags(flags, 0, "PUBCOMP")?;
                Packet::PubComp(decode_ack(&mut r)?)
            }
            8 => {
                expect_flags(flags, 0x02, "SUBSCRIBE")?;
                Packet::Subscribe(decode_subscribe(&mut r)?)
            }
            9 => {
                expect_flags(flags, 0, "SUBACK")?;
                Packet::SubAck(decode_suback(&mut r)?)
            }
            10 => {
                expect_flags(flags, 0x02, "UNSUBSCRIBE")?;
                Packet::Unsubscribe(decode_unsubscribe(&mut r)?)
            }
            11 => {
                expect_flags(flags, 0, "UNSUBACK")?;
                Packet::UnsubAck(decode_unsuback(&mut r)?)
            }
            12 => {
                expect_flags(flags, 0, "PINGREQ")?;
                Packet::PingReq
            }
            13 => {
                expect_flags(flags, 0, "PINGRESP")?;
                Packet::PingResp
            }
            14 => {
                expect_flags(flags, 0, "DISCONNECT")?;
                Packet::Disconnect(decode_disconnect(&mut r)?)
            }
            15 => {
                expect_flags(flags, 0, "AUTH")?;
                Packet::Auth(decode_auth(&mut r)?)
            }
            other => {
                return Err(MqttError::malformed(format!(
                    "unknown packet type {other}"
                )));
            }
        };
        if !r.is_empty() {
            return Err(MqttError::malformed(format!(
                "{} bytes left over after {}",
                r.remaining(),
                packet.packet_type()
            )));
        }
        Ok(packet)
    }
}

fn expect_flags(flags: u8, expected: u8, kind: &str) -> Result<(), MqttError> {
    if flags != expected {
        return Err(MqttError::malformed(format!(
            "invalid fixed header flags 0x{flags:x} for {kind}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CONNECT / CONNACK
// ---------------------------------------------------------------------------

fn encode_connect(p: &Connect) -> Result<BytesMut, MqttError> {
    let mut out = BytesMut::new();
    codec::write_string(&mut out, PROTOCOL_NAME)?;
    out.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if p.clean_start {
        flags |= 0x02;
    }
    if let Some(will) = &p.will {
        flags |= 0x04;
        flags |= will.qos.as_u8() << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if p.password.is_some() {
        flags |= 0x40;
    }
    if p.username.is_some() {
        flags |= 0x80;
    }
    out.put_u8(flags);
    out.put_u16(p.keep_alive);
    p.properties.encode(&mut out)?;

    codec::write_string(&mut out, &p.client_id)?;
    if let Some(will) = &p.will {
        will.properties.encode(&mut out)?;
        codec::write_string(&mut out, &will.topic)?;
        codec::write_binary(&mut out, &will.payload)?;
    }
    if let Some(username) = &p.username {
        codec::write_string(&mut out, username)?;
    }
    if let Some(password) = &p.password {
        codec::write_binary(&mut out, password)?;
    }
    Ok(out)
}

fn decode_connect(r: &mut Reader) -> Result<Connect, MqttError> {
    let protocol_name = r.read_string()?;
    if protocol_name != PROTOCOL_NAME {
        return Err(MqttError::malformed(format!(
            "invalid protocol name {protocol_name:?}"
        )));
    }
    let level = r.read_u8()?;
    if level != PROTOCOL_LEVEL {
        return Err(MqttError::protocol(format!(
            "unsupported protocol version {level}"
        )));
    }
    let flags = r.read_u8()?;
    if flags & 0x01 != 0 {
        return Err(MqttError::malformed("reserved CONNECT flag set"));
    }
    let keep_alive = r.read_u16()?;
    let properties = Properties::decode(r)?;
    let client_id = r.read_string()?;

    let will = if flags & 0x04 != 0 {
        let will_properties = Properties::decode(r)?;
        let topic = r.read_string()?;
        let payload = r.read_binary()?;
        Some(Will {
            topic,
            payload,
            qos: Qos::from_u8((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
            properties: will_properties,
        })
    } else {
        if flags & 0x38 != 0 {
            return Err(MqttError::malformed("will flags set without will"));
        }
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(r.read_string()?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(r.read_binary()?)
    } else {
        None
    };

    Ok(Connect {
        client_id,
        clean_start: flags & 0x02 != 0,
        keep_alive,
        properties,
        will,
        username,
        password,
    })
}

fn encode_connack(p: &ConnAck) -> Result<BytesMut, MqttError> {
    let mut out = BytesMut::new();
    out.put_u8(u8::from(p.session_present));
    out.put_u8(p.reason_code);
    p.properties.encode(&mut out)?;
    Ok(out)
}

fn decode_connack(r: &mut Reader) -> Result<ConnAck, MqttError> {
    let ack_flags = r.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(MqttError::malformed("reserved CONNACK flags set"));
    }
    Ok(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        reason_code: r.read_u8()?,
        properties: Properties::decode(r)?,
    })
}

// ---------------------------------------------------------------------------
// PUBLISH
// ---------------------------------------------------------------------------

fn encode_publish(p: &Publish) -> Result<BytesMut, MqttError> {
    let mut out = BytesMut::new();
    codec::write_string(&mut out, &p.topic)?;
    match (p.qos, p.packet_id) {
        (Qos::AtMostOnce, None) => {}
        (Qos::AtMostOnce, Some(_)) => {
            return Err(MqttError::protocol("packet id on QoS 0 publish"));
        }
        (_, Some(id)) => out.put_u16(id),
        (_, None) => {
            return Err(MqttError::protocol("missing packet id on QoS>0 publish"));
        }
    }
    p.properties.encode(&mut out)?;
    out.put_slice(&p.payload);
    Ok(out)
}

fn decode_publish(flags: u8, r: &mut Reader) -> Result<Publish, MqttError> {
    let dup = flags & 0b1000 != 0;
    let qos = Qos::from_u8((flags >> 1) & 0x03)?;
    let retain = flags & 0b0001 != 0;
    if qos == Qos::AtMostOnce && dup {
        return Err(MqttError::malformed("DUP flag set on QoS 0 publish"));
    }
    let topic = r.read_string()?;
    let packet_id = match qos {
        Qos::AtMostOnce => None,
        _ => Some(r.read_u16()?),
    };
    let properties = Properties::decode(r)?;
    let payload = r.take_rest();
    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        properties,
        payload,
    })
}

// ---------------------------------------------------------------------------
// PUBACK family
// ---------------------------------------------------------------------------

// Remaining Length 2 implies reason SUCCESS with no properties and
// Remaining Length 3 implies reason code only; both short forms are
// emitted and accepted.
fn encode_ack(p: &Ack) -> Result<BytesMut, MqttError> {
    let mut out = BytesMut::new();
    out.put_u16(p.packet_id);
    if p.reason_code == reason::SUCCESS && p.properties.is_empty() {
        return Ok(out);
    }
    out.put_u8(p.reason_code);
    if !p.properties.is_empty() {
        p.properties.encode(&mut out)?;
    }
    Ok(out)
}

fn decode_ack(r: &mut Reader) -> Result<Ack, MqttError> {
    let packet_id = r.read_u16()?;
    if r.is_empty() {
        return Ok(Ack::new(packet_id));
    }
    let reason_code = r.read_u8()?;
    let properties = if r.is_empty() {
        Properties::default()
    } else {
        Properties::decode(r)?
    };
    Ok(Ack {
        packet_id,
        reason_code,
        properties,
    })
}

// ---------------------------------------------------------------------------
// SUBSCRIBE / SUBACK / UNSUBSCRIBE / UNSUBACK
// ---------------------------------------------------------------------------

fn encode_subscribe(p: &Subscribe) -> Result<BytesMut, MqttError> {
    if p.subscriptions.is_empty() {
        return Err(MqttError::protocol("SUBSCRIBE requires at least one filter"));
    }
    let mut out = BytesMut::new();
    out.put_u16(p.packet_id);
    p.properties.encode(&mut out)?;
    for sub in &p.subscriptions {
        codec::write_string(&mut out, &sub.topic_filter)?;
        out.put_u8(sub.options.encode());
    }
    Ok(out)
}

fn decode_subscribe(r: &mut Reader) -> Result<Subscribe, MqttError> {
    let packet_id = r.read_u16()?;
    let properties = Properties::decode(r)?;
    let mut subscriptions = Vec::new();
    while !r.is_empty() {
        let topic_filter = r.read_string()?;
        let options = SubscriptionOptions::decode(r.read_u8()?)?;
        subscriptions.push(Subscription {
            topic_filter,
            options,
        });
    }
    if subscriptions.is_empty() {
        return Err(MqttError::malformed("SUBSCRIBE carries no topic filters"));
    }
    Ok(Subscribe {
        packet_id,
        properties,
        subscriptions,
    })
}

fn encode_suback(p: &SubAck) -> Result<BytesMut, MqttError> {
    let mut out = BytesMut::new();
    out.put_u16(p.packet_id);
    p.properties.encode(&mut out)?;
    for &code in &p.reason_codes {
        out.put_u8(code);
    }
    Ok(out)
}

fn decode_suback(r: &mut Reader) -> Result<SubAck, MqttError> {
    let packet_id = r.read_u16()?;
    let properties = Properties::decode(r)?;
    let mut reason_codes = Vec::with_capacity(r.remaining());
    while !r.is_empty() {
        reason_codes.push(r.read_u8()?);
    }
    if reason_codes.is_empty() {
        return Err(MqttError::malformed("SUBACK carries no reason codes"));
    }
    Ok(SubAck {
        packet_id,
        properties,
        reason_codes,
    })
}

fn encode_unsubscribe(p: &Unsubscribe) -> Result<BytesMut, MqttError> {
    if p.topic_filters.is_empty() {
        return Err(MqttError::protocol(
            "UNSUBSCRIBE requires at least one filter",
        ));
    }
    let mut out = BytesMut::new();
    out.put_u16(p.packet_id);
    p.properties.encode(&mut out)?;
    for filter in &p.topic_filters {
        codec::write_string(&mut out, filter)?;
    }
    Ok(out)
}

fn decode_unsubscribe(r: &mut Reader) -> Result<Unsubscribe, MqttError> {
    let packet_id = r.read_u16()?;
    let properties = Properties::decode(r)?;
    let mut topic_filters = Vec::new();
    while !r.is_empty() {
        topic_filters.push(r.read_string()?);
    }
    if topic_filters.is_empty() {
        return Err(MqttError::malformed("UNSUBSCRIBE carries no topic filters"));
    }
    Ok(Unsubscribe {
        packet_id,
        properties,
        topic_filters,
    })
}

fn decode_unsuback(r: &mut Reader) -> Result<UnsubAck, MqttError> {
    let packet_id = r.read_u16()?;
    let properties = Properties::decode(r)?;
    let mut reason_codes = Vec::with_capacity(r.remaining());
    while !r.is_empty() {
        reason_codes.push(r.read_u8()?);
    }
    if reason_codes.is_empty() {
        return Err(MqttError::malformed("UNSUBACK carries no reason codes"));
    }
    Ok(UnsubAck {
        packet_id,
        properties,
        reason_codes,
    })
}

fn encode_unsuback(p: &UnsubAck) -> Result<BytesMut, MqttError> {
    let mut out = BytesMut::new();
    out.put_u16(p.packet_id);
    p.properties.encode(&mut out)?;
    for &code in &p.reason_codes {
        out.put_u8(code);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// DISCONNECT / AUTH
// ---------------------------------------------------------------------------

// Remaining Length 0 implies the default reason code with no properties;
// the same optimisation as the PUBACK family, one byte earlier.
fn encode_disconnect(p: &Disconnect) -> Result<BytesMut, MqttError> {
    let mut out = BytesMut::new();
    if p.reason_code == reason::NORMAL_DISCONNECTION && p.properties.is_empty() {
        return Ok(out);
    }
    out.put_u8(p.reason_code);
    if !p.properties.is_empty() {
        p.properties.encode(&mut out)?;
    }
    Ok(out)
}

fn decode_disconnect(r: &mut Reader) -> Result<Disconnect, MqttError> {
    if r.is_empty() {
        return Ok(Disconnect::default());
    }
    let reason_code = r.read_u8()?;
    let properties = if r.is_empty() {
        Properties::default()
    } else {
        Properties::decode(r)?
    };
    Ok(Disconnect {
        reason_code,
        properties,
    })
}

fn encode_auth(p: &Auth) -> Result<BytesMut, MqttError> {
    let mut out = BytesMut::new();
    if p.reason_code == reason::SUCCESS && p.properties.is_empty() {
        return Ok(out);
    }
    out.put_u8(p.reason_code);
    if !p.properties.is_empty() {
        p.properties.encode(&mut out)?;
    }
    Ok(out)
}

fn decode_auth(r: &mut Reader) -> Result<Auth, MqttError> {
    if r.is_empty() {
        return Ok(Auth::default());
    }
    let reason_code = r.read_u8()?;
    let properties = if r.is_empty() {
        Properties::default()
    } else {
        Properties::decode(r)?
    };
    Ok(Auth {
        reason_code,
        properties,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) -> Packet {
        let frame = packet.encode().unwrap();
        let (first, body) = split_frame(frame);
        let decoded = Packet::decode(first, body).unwrap();
        assert_eq!(decoded, packet);
        decoded
    }

    /// Strip the fixed header and Remaining Length from a full frame.
    fn split_frame(frame: Bytes) -> (u8, Bytes) {
        let first = frame[0];
        let mut idx = 1;
        let mut remaining: usize = 0;
        let mut shift = 0;
        loop {
            let byte = frame[idx];
            remaining |= ((byte & 0x7F) as usize) << shift;
            idx += 1;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let body = frame.slice(idx..);
        assert_eq!(body.len(), remaining, "remaining length mismatch");
        (first, body)
    }

    #[test]
    fn test_connect_round_trip() {
        round_trip(Packet::Connect(Connect {
            client_id: "sensor-7".into(),
            clean_start: false,
            keep_alive: 60,
            properties: Properties {
                session_expiry_interval: Some(300),
                receive_maximum: Some(10),
                user_properties: vec![("env".into(), "prod".into())],
                ..Default::default()
            },
            will: Some(Will {
                topic: "sensors/sensor-7/status".into(),
                payload: Bytes::from_static(b"offline"),
                qos: Qos::AtLeastOnce,
                retain: true,
                properties: Properties {
                    will_delay_interval: Some(10),
                    content_type: Some("text/plain".into()),
                    ..Default::default()
                },
            }),
            username: Some("device".into()),
            password: Some(Bytes::from_static(b"hunter2")),
        }));
    }

    #[test]
    fn test_connect_minimal_round_trip() {
        round_trip(Packet::Connect(Connect {
            client_id: String::new(),
            keep_alive: 0,
            ..Default::default()
        }));
    }

    #[test]
    fn test_connect_rejects_wrong_protocol_name() {
        let packet = Packet::Connect(Connect::default());
        let frame = packet.encode().unwrap();
        let (first, body) = split_frame(frame);
        let mut bytes = body.to_vec();
        bytes[2] = b'X'; // corrupt "MQTT"
        assert!(matches!(
            Packet::decode(first, Bytes::from(bytes)),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_connect_rejects_wrong_protocol_level() {
        let packet = Packet::Connect(Connect::default());
        let frame = packet.encode().unwrap();
        let (first, body) = split_frame(frame);
        let mut bytes = body.to_vec();
        bytes[6] = 4; // MQTT 3.1.1
        assert!(matches!(
            Packet::decode(first, Bytes::from(bytes)),
            Err(MqttError::Protocol(_))
        ));
    }

    #[test]
    fn test_connack_round_trip() {
        round_trip(Packet::ConnAck(ConnAck {
            session_present: true,
            reason_code: reason::SUCCESS,
            properties: Properties {
                receive_maximum: Some(100),
                topic_alias_maximum: Some(5),
                assigned_client_identifier: Some("srv-abc".into()),
                server_keep_alive: Some(30),
                maximum_qos: Some(1),
                ..Default::default()
            },
        }));
    }

    #[test]
    fn test_publish_qos0_round_trip() {
        round_trip(Packet::Publish(Publish {
            topic: "t".into(),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        }));
    }

    #[test]
    fn test_publish_qos2_with_properties_round_trip() {
        round_trip(Packet::Publish(Publish {
            dup: true,
            qos: Qos::ExactlyOnce,
            retain: true,
            topic: "a/b/c".into(),
            packet_id: Some(1234),
            properties: Properties {
                topic_alias: Some(2),
                message_expiry_interval: Some(60),
                user_properties: vec![("k1".into(), "v1".into()), ("k1".into(), "v2".into())],
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x00, 0xFF, 0x10]),
        }));
    }

    #[test]
    fn test_publish_missing_packet_id_rejected() {
        let packet = Packet::Publish(Publish {
            qos: Qos::AtLeastOnce,
            topic: "t".into(),
            packet_id: None,
            ..Default::default()
        });
        assert!(packet.encode().is_err());
    }

    #[test]
    fn test_publish_dup_on_qos0_rejected() {
        // header with DUP set and QoS 0
        let body = {
            let mut out = BytesMut::new();
            codec::write_string(&mut out, "t").unwrap();
            out.put_u8(0); // empty properties
            out.freeze()
        };
        assert!(Packet::decode(0x38, body).is_err());
    }

    #[test]
    fn test_puback_short_form_emitted_and_accepted() {
        let frame = Packet::PubAck(Ack::new(7)).encode().unwrap();
        // type, RL=2, packet id only
        assert_eq!(frame.as_ref(), &[0x40, 0x02, 0x00, 0x07]);

        let decoded = Packet::decode(0x40, Bytes::from_static(&[0x00, 0x07])).unwrap();
        assert_eq!(decoded, Packet::PubAck(Ack::new(7)));
    }

    #[test]
    fn test_puback_reason_only_form() {
        let decoded = Packet::decode(0x40, Bytes::from_static(&[0x00, 0x07, 0x87])).unwrap();
        assert_eq!(
            decoded,
            Packet::PubAck(Ack::with_reason(7, reason::NOT_AUTHORIZED))
        );
        // encodes back to the three-byte form
        let frame = decoded.encode().unwrap();
        assert_eq!(frame.as_ref(), &[0x40, 0x03, 0x00, 0x07, 0x87]);
    }

    #[test]
    fn test_puback_with_properties_round_trip() {
        round_trip(Packet::PubAck(Ack {
            packet_id: 9,
            reason_code: reason::QUOTA_EXCEEDED,
            properties: Properties {
                reason_string: Some("slow down".into()),
                ..Default::default()
            },
        }));
    }

    #[test]
    fn test_pubrel_carries_reserved_flags() {
        let frame = Packet::PubRel(Ack::new(3)).encode().unwrap();
        assert_eq!(frame[0], 0x62);
        // wrong flags rejected
        assert!(Packet::decode(0x60, Bytes::from_static(&[0x00, 0x03])).is_err());
        round_trip(Packet::PubRel(Ack::new(3)));
    }

    #[test]
    fn test_pubrec_pubcomp_round_trip() {
        round_trip(Packet::PubRec(Ack::new(11)));
        round_trip(Packet::PubComp(Ack::new(11)));
    }

    #[test]
    fn test_subscribe_round_trip() {
        round_trip(Packet::Subscribe(Subscribe {
            packet_id: 21,
            properties: Properties {
                subscription_identifiers: vec![8],
                ..Default::default()
            },
            subscriptions: vec![
                Subscription::new("a/+/c", Qos::AtLeastOnce),
                Subscription {
                    topic_filter: "d/#".into(),
                    options: SubscriptionOptions::new(Qos::ExactlyOnce)
                        .with_no_local(true)
                        .with_retain_as_published(true)
                        .with_retain_handling(2),
                },
            ],
        }));
    }

    #[test]
    fn test_subscribe_requires_filters() {
        let packet = Packet::Subscribe(Subscribe {
            packet_id: 1,
            properties: Properties::default(),
            subscriptions: vec![],
        });
        assert!(packet.encode().is_err());
    }

    #[test]
    fn test_subscribe_reserved_flags_rejected() {
        assert!(SubscriptionOptions::decode(0b0100_0000).is_err());
        assert!(SubscriptionOptions::decode(0b0011_0000).is_err()); // retain handling 3
    }

    #[test]
    fn test_subscription_options_byte_packing() {
        let options = SubscriptionOptions::new(Qos::AtLeastOnce)
            .with_no_local(true)
            .with_retain_handling(1);
        assert_eq!(options.encode(), 0b0001_0101);
        assert_eq!(SubscriptionOptions::decode(0b0001_0101).unwrap(), options);
    }

    #[test]
    fn test_suback_round_trip() {
        round_trip(Packet::SubAck(SubAck {
            packet_id: 21,
            properties: Properties::default(),
            reason_codes: vec![
                reason::GRANTED_QOS_1,
                reason::UNSPECIFIED_ERROR,
                reason::GRANTED_QOS_2,
            ],
        }));
    }

    #[test]
    fn test_unsubscribe_round_trip() {
        round_trip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 33,
            properties: Properties::default(),
            topic_filters: vec!["a/b".into(), "c/#".into()],
        }));
    }

    #[test]
    fn test_unsuback_round_trip() {
        round_trip(Packet::UnsubAck(UnsubAck {
            packet_id: 33,
            properties: Properties::default(),
            reason_codes: vec![reason::SUCCESS, reason::NO_SUBSCRIPTION_EXISTED],
        }));
    }

    #[test]
    fn test_ping_packets_are_two_bytes() {
        assert_eq!(Packet::PingReq.encode().unwrap().as_ref(), &[0xC0, 0x00]);
        assert_eq!(Packet::PingResp.encode().unwrap().as_ref(), &[0xD0, 0x00]);
        round_trip(Packet::PingReq);
        round_trip(Packet::PingResp);
    }

    #[test]
    fn test_disconnect_default_is_empty_body() {
        let frame = Packet::Disconnect(Disconnect::default()).encode().unwrap();
        assert_eq!(frame.as_ref(), &[0xE0, 0x00]);
        let decoded = Packet::decode(0xE0, Bytes::new()).unwrap();
        assert_eq!(decoded, Packet::Disconnect(Disconnect::default()));
    }

    #[test]
    fn test_disconnect_with_reason_round_trip() {
        round_trip(Packet::Disconnect(Disconnect {
            reason_code: reason::SESSION_TAKEN_OVER,
            properties: Properties {
                reason_string: Some("superseded".into()),
                session_expiry_interval: Some(0),
                ..Default::default()
            },
        }));
    }

    #[test]
    fn test_auth_round_trip() {
        round_trip(Packet::Auth(Auth {
            reason_code: reason::CONTINUE_AUTHENTICATION,
            properties: Properties {
                authentication_method: Some("SCRAM-SHA-256".into()),
                authentication_data: Some(Bytes::from_static(b"challenge")),
                ..Default::default()
            },
        }));
        let decoded = Packet::decode(0xF0, Bytes::new()).unwrap();
        assert_eq!(decoded, Packet::Auth(Auth::default()));
    }

    #[test]
    fn test_unknown_packet_type_rejected() {
        assert!(matches!(
            Packet::decode(0x00, Bytes::new()),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert!(Packet::decode(0xC0, Bytes::from_static(&[0x00])).is_err());
    }
}

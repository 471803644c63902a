//! MQTT 5.0 property codec.
//!
//! Properties are carried as a flat record rather than a map keyed by
//! wire identifier: every known identifier has one typed slot, except
//! subscription identifiers and user properties which are ordered
//! sequences. The wire order of user properties is observable and
//! meaningful to applications, so insertion order and duplicates are
//! preserved exactly.

use crate::codec::{self, Reader};
use crate::error::MqttError;
use bytes::{BufMut, Bytes, BytesMut};

// Property identifiers from OASIS MQTT 5.0 Table 2-4.
pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
pub const CONTENT_TYPE: u8 = 0x03;
pub const RESPONSE_TOPIC: u8 = 0x08;
pub const CORRELATION_DATA: u8 = 0x09;
pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
pub const SERVER_KEEP_ALIVE: u8 = 0x13;
pub const AUTHENTICATION_METHOD: u8 = 0x15;
pub const AUTHENTICATION_DATA: u8 = 0x16;
pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
pub const WILL_DELAY_INTERVAL: u8 = 0x18;
pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
pub const RESPONSE_INFORMATION: u8 = 0x1A;
pub const SERVER_REFERENCE: u8 = 0x1C;
pub const REASON_STRING: u8 = 0x1F;
pub const RECEIVE_MAXIMUM: u8 = 0x21;
pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
pub const TOPIC_ALIAS: u8 = 0x23;
pub const MAXIMUM_QOS: u8 = 0x24;
pub const RETAIN_AVAILABLE: u8 = 0x25;
pub const USER_PROPERTY: u8 = 0x26;
pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;

/// Flat property container for all packet types.
///
/// Each scalar slot is absent by default and encoded only when set.
/// Which slots a given packet may legally carry is not enforced here;
/// the container mirrors the wire content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// Ordered sequence; a packet may carry several.
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    /// Ordered key/value pairs; order and duplicates are preserved.
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

impl Properties {
    /// True when every scalar slot is absent and both sequences are
    /// empty.
    pub fn is_empty(&self) -> bool {
        self.payload_format_indicator.is_none()
            && self.message_expiry_interval.is_none()
            && self.content_type.is_none()
            && self.response_topic.is_none()
            && self.correlation_data.is_none()
            && self.subscription_identifiers.is_empty()
            && self.session_expiry_interval.is_none()
            && self.assigned_client_identifier.is_none()
            && self.server_keep_alive.is_none()
            && self.authentication_method.is_none()
            && self.authentication_data.is_none()
            && self.request_problem_information.is_none()
            && self.will_delay_interval.is_none()
            && self.request_response_information.is_none()
            && self.response_information.is_none()
            && self.server_reference.is_none()
            && self.reason_string.is_none()
            && self.receive_maximum.is_none()
            && self.topic_alias_maximum.is_none()
            && self.topic_alias.is_none()
            && self.maximum_qos.is_none()
            && self.retain_available.is_none()
            && self.user_properties.is_empty()
            && self.maximum_packet_size.is_none()
            && self.wildcard_subscription_available.is_none()
            && self.subscription_identifier_available.is_none()
            && self.shared_subscription_available.is_none()
    }

    /// Encode the property block, including its Variable Byte Integer
    /// length prefix, into `out`.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), MqttError> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;
        codec::write_vbi(out, body.len() as u32)?;
        out.extend_from_slice(&body);
        Ok(())
    }

    fn encode_body(&self, out: &mut BytesMut) -> Result<(), MqttError> {
        if let Some(v) = self.payload_format_indicator {
            out.put_u8(PAYLOAD_FORMAT_INDICATOR);
            out.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            out.put_u8(MESSAGE_EXPIRY_INTERVAL);
            out.put_u32(v);
        }
        if let Some(ref v) = self.content_type {
            out.put_u8(CONTENT_TYPE);
            codec::write_string(out, v)?;
        }
        if let Some(ref v) = self.response_topic {
            out.put_u8(RESPONSE_TOPIC);
            codec::write_string(out, v)?;
        }
        if let Some(ref v) = self.correlation_data {
            out.put_u8(CORRELATION_DATA);
            codec::write_binary(out, v)?;
        }
        for &id in &self.subscription_identifiers {
            out.put_u8(SUBSCRIPTION_IDENTIFIER);
            codec::write_vbi(out, id)?;
        }
        if let Some(v) = self.session_expiry_interval {
            out.put_u8(SESSION_EXPIRY_INTERVAL);
            out.put_u32(v);
        }
        if let Some(ref v) = self.assigned_client_identifier {
            out.put_u8(ASSIGNED_CLIENT_IDENTIFIER);
            codec::write_string(out, v)?;
        }
        if let Some(v) = self.server_keep_alive {
            out.put_u8(SERVER_KEEP_ALIVE);
            out.put_u16(v);
        }
        if let Some(ref v) = self.authentication_method {
            out.put_u8(AUTHENTICATION_METHOD);
            codec::write_string(out, v)?;
        }
        if let Some(ref v) = self.authentication_data {
            out.put_u8(AUTHENTICATION_DATA);
            codec::write_binary(out, v)?;
        }
        if let Some(v) = self.request_problem_information {
            out.put_u8(REQUEST_PROBLEM_INFORMATION);
            out.put_u8(v);
        }
        if let Some(v) = self.will_delay_interval {
            out.put_u8(WILL_DELAY_INTERVAL);
            out.put_u32(v);
        }
        if let Some(v) = self.request_response_information {
            out.put_u8(REQUEST_RESPONSE_INFORMATION);
            out.put_u8(v);
        }
        if let Some(ref v) = self.response_information {
            out.put_u8(RESPONSE_INFORMATION);
            codec::write_string(out, v)?;
        }
        if let Some(ref v) = self.server_reference {
            out.put_u8(SERVER_REFERENCE);
            codec::write_string(out, v)?;
        }
        if let Some(ref v) = self.reason_string {
            out.put_u8(REASON_STRING);
            codec::write_string(out, v)?;
        }
        if let Some(v) = self.receive_maximum {
            out.put_u8(RECEIVE_MAXIMUM);
            out.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            out.put_u8(TOPIC_ALIAS_MAXIMUM);
            out.put_u16(v);
        }
        if let Some(v) = self.topic_alias {
            out.put_u8(TOPIC_ALIAS);
            out.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            out.put_u8(MAXIMUM_QOS);
            out.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            out.put_u8(RETAIN_AVAILABLE);
            out.put_u8(v);
        }
        for (key, value) in &self.user_properties {
            out.put_u8(USER_PROPERTY);
            codec::write_string_pair(out, key, value)?;
        }
        if let Some(v) = self.maximum_packet_size {
            out.put_u8(MAXIMUM_PACKET_SIZE);
            out.put_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            out.put_u8(WILDCARD_SUBSCRIPTION_AVAILABLE);
            out.put_u8(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            out.put_u8(SUBSCRIPTION_IDENTIFIER_AVAILABLE);
            out.put_u8(v);
        }
        if let Some(v) = self.shared_subscription_available {
            out.put_u8(SHARED_SUBSCRIPTION_AVAILABLE);
            out.put_u8(v);
        }
        Ok(())
    }

    /// Decode a property block, including its length prefix, from the
    /// reader. Unknown identifiers fail the packet.
    pub fn decode(reader: &mut Reader) -> Result<Self, MqttError> {
        let len = reader.read_vbi()? as usize;
        let block = reader.read_bytes(len)?;
        let mut r = Reader::new(block);
        let mut props = Properties::default();
        while !r.is_empty() {
            let id = r.read_u8()?;
            match id {
                PAYLOAD_FORMAT_INDICATOR => {
                    props.payload_format_indicator = Some(r.read_u8()?);
                }
                MESSAGE_EXPIRY_INTERVAL => {
                    props.message_expiry_interval = Some(r.read_u32()?);
                }
                CONTENT_TYPE => props.content_type = Some(r.read_string()?),
                RESPONSE_TOPIC => props.response_topic = Some(r.read_string()?),
                CORRELATION_DATA => props.correlation_data = Some(r.read_binary()?),
                SUBSCRIPTION_IDENTIFIER => {
                    props.subscription_identifiers.push(r.read_vbi()?);
                }
                SESSION_EXPIRY_INTERVAL => {
                    props.session_expiry_interval = Some(r.read_u32()?);
                }
                ASSIGNED_CLIENT_IDENTIFIER => {
                    props.assigned_client_identifier = Some(r.read_string()?);
                }
                SERVER_KEEP_ALIVE => props.server_keep_alive = Some(r.read_u16()?),
                AUTHENTICATION_METHOD => {
                    props.authentication_method = Some(r.read_string()?);
                }
                AUTHENTICATION_DATA => {
                    props.authentication_data = Some(r.read_binary()?);
                }
                REQUEST_PROBLEM_INFORMATION => {
                    props.request_problem_information = Some(r.read_u8()?);
                }
                WILL_DELAY_INTERVAL => props.will_delay_interval = Some(r.read_u32()?),
                REQUEST_RESPONSE_INFORMATION => {
                    props.request_response_information = Some(r.read_u8()?);
                }
                RESPONSE_INFORMATION => {
                    props.response_information = Some(r.read_string()?);
                }
                SERVER_REFERENCE => props.server_reference = Some(r.read_string()?),
                REASON_STRING => props.reason_string = Some(r.read_string()?),
                RECEIVE_MAXIMUM => props.receive_maximum = Some(r.read_u16()?),
                TOPIC_ALIAS_MAXIMUM => props.topic_alias_maximum = Some(r.read_u16()?),
                TOPIC_ALIAS => props.topic_alias = Some(r.read_u16()?),
                MAXIMUM_QOS => props.maximum_qos = Some(r.read_u8()?),
                RETAIN_AVAILABLE => props.retain_available = Some(r.read_u8()?),
                USER_PROPERTY => {
                    let pair = r.read_string_pair()?;
                    props.user_properties.push(pair);
                }
                MAXIMUM_PACKET_SIZE => props.maximum_packet_size = Some(r.read_u32()?),
                WILDCARD_SUBSCRIPTION_AVAILABLE => {
                    props.wildcard_subscription_available = Some(r.read_u8()?);
                }
                SUBSCRIPTION_IDENTIFIER_AVAILABLE => {
                    props.subscription_identifier_available = Some(r.read_u8()?);
                }
                SHARED_SUBSCRIPTION_AVAILABLE => {
                    props.shared_subscription_available = Some(r.read_u8()?);
                }
                other => {
                    return Err(MqttError::malformed(format!(
                        "unknown property identifier 0x{other:02x}"
                    )));
                }
            }
        }
        Ok(props)
    }
}

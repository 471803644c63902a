#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Struct field patterns
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::struct_field_names)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::if_not_else)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_wildcard_for_single_variants)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Closure style
#![allow(clippy::redundant_closure_for_method_calls)]
// Iteration style
#![allow(clippy::explicit_iter_loop)]
#![allow(clippy::explicit_into_iter_loop)]
// Unit patterns
#![allow(clippy::ignored_unit_patterns)]
// Type defaults
#![allow(clippy::default_trait_access)]
// Large types
#![allow(clippy::large_futures)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
// Self usage
#![allow(clippy::unused_self)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! Photon - Asynchronous MQTT 5.0 client library.
//!
//! A long-lived session object that connects to a broker over TCP or
//! TLS, exchanges the fifteen MQTT 5.0 control packets and exposes
//! publish/subscribe/unsubscribe with the delivery guarantees of
//! QoS 0/1/2.
//!
//! # Module Organization
//!
//! ## Codec
//! - `codec` - Byte-level primitives (Variable Byte Integers, strings,
//!   binary data)
//! - `codec::properties` - The flat MQTT 5.0 property container
//! - `codec::packet` - Control packet model and wire codec
//! - `codec::reason` - Reason code table
//!
//! ## Networking
//! - `net` - Frame-preserving packet transport over TCP or TLS
//! - `net::tls` - TLS configuration (trust anchors, SNI, mutual TLS)
//!
//! ## Session
//! - `client` - The session engine: handshake, read loop, keep-alive,
//!   QoS flows, reconnect, offline queue
//! - `client::state` - Pending-ack tables and negotiated server limits
//! - `client::packet_id` - Packet identifier allocation
//! - `client::alias` - Topic alias tables
//! - `client::offline` - Deferred publish queue
//! - `client::reconnect` - Backoff strategies
//!
//! ## Configuration
//! - `config` - Client options
//! - `error` - Error taxonomy

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod net;

// Re-exports for convenience
pub use client::reconnect::{
    ConstantDelay, ExponentialBackoff, LinearBackoff, NoReconnect, ReconnectStrategy,
};
pub use client::state::ServerCapabilities;
pub use client::{ConnectionState, Message, MqttClient};
pub use codec::packet::{
    Ack, Auth, ConnAck, Connect, Disconnect, Packet, Publish, Qos, SubAck, Subscribe,
    Subscription, SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};
pub use codec::properties::Properties;
pub use codec::reason;
pub use config::{ClientConfig, WillConfig};
pub use error::MqttError;
pub use net::tls::{ClientIdentity, TlsConfig, TrustAnchors};
pub use net::Transport;

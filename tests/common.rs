//! Common test harness: a scripted byte-level mock broker.
//!
//! Each test drives one side of the conversation explicitly: the broker
//! half reads whole frames off the socket, decodes them with the
//! library's own codec, asserts on what arrived and writes back exactly
//! the packets the script calls for.

// Not all test files use all helpers; silence dead_code warnings for
// unused exports.
#![allow(dead_code)]

use bytes::Bytes;
use photon::{reason, ClientConfig, ConnAck, Connect, Packet, Properties};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Bind a fresh loopback listener on an ephemeral port.
pub async fn broker_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

/// A client configuration pointed at the mock broker.
///
/// Keep-alive is disabled so scripted exchanges never see interleaved
/// PINGREQ frames.
pub fn test_config(port: u16) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        client_id: "test-client".to_string(),
        keep_alive_secs: 0,
        connect_timeout_secs: 5,
        ..Default::default()
    }
}

/// One accepted broker-side connection.
pub struct BrokerConn {
    stream: TcpStream,
}

impl BrokerConn {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.expect("accept client");
        Self { stream }
    }

    /// Read exactly one framed packet and decode it.
    pub async fn read_packet(&mut self) -> Packet {
        let mut first = [0u8; 1];
        self.stream
            .read_exact(&mut first)
            .await
            .expect("read packet header");
        let mut remaining: u32 = 0;
        let mut shift = 0;
        loop {
            let mut byte = [0u8; 1];
            self.stream
                .read_exact(&mut byte)
                .await
                .expect("read remaining length");
            remaining |= u32::from(byte[0] & 0x7F) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
            assert!(shift <= 21, "remaining length too long");
        }
        let mut body = vec![0u8; remaining as usize];
        self.stream
            .read_exact(&mut body)
            .await
            .expect("read packet body");
        Packet::decode(first[0], Bytes::from(body)).expect("decode packet")
    }

    /// Encode and write one packet.
    pub async fn send(&mut self, packet: &Packet) {
        let frame = packet.encode().expect("encode packet");
        self.stream.write_all(&frame).await.expect("write packet");
        self.stream.flush().await.expect("flush packet");
    }

    /// Read a packet and require it to be the CONNECT.
    pub async fn expect_connect(&mut self) -> Connect {
        match self.read_packet().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {}", other.packet_type()),
        }
    }

    /// Reply with a successful CONNACK.
    pub async fn connack(&mut self, session_present: bool) {
        self.connack_with_properties(session_present, Properties::default())
            .await;
    }

    pub async fn connack_with_properties(&mut self, session_present: bool, properties: Properties) {
        self.send(&Packet::ConnAck(ConnAck {
            session_present,
            reason_code: reason::SUCCESS,
            properties,
        }))
        .await;
    }

    /// Run the CONNECT/CONNACK exchange with default properties.
    pub async fn handshake(listener: &TcpListener) -> Self {
        let mut conn = Self::accept(listener).await;
        conn.expect_connect().await;
        conn.connack(false).await;
        conn
    }

    /// Drop the socket abruptly, as a crashed broker would.
    pub fn kill(self) {
        drop(self.stream);
    }
}

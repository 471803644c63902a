//! Transport adapter: a framed MQTT packet stream over TCP or TLS.

pub mod tls;

use crate::codec::packet::Packet;
use crate::codec::VBI_MAX;
use crate::error::MqttError;
use bytes::Bytes;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Plain TCP or TLS-wrapped byte stream.
enum TransportStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One open connection to a broker, framed at packet granularity.
///
/// Reads and writes go through independent mutexes: the read half is
/// only ever touched by the handshake and then the read loop, while the
/// write mutex serialises concurrent senders so the bytes of one packet
/// are never interleaved with another's.
pub struct Transport {
    reader: Mutex<ReadHalf<TransportStream>>,
    writer: Mutex<WriteHalf<TransportStream>>,
    /// Server-announced maximum packet size; 0 means unlimited.
    max_outbound: AtomicU32,
    closed: AtomicBool,
}

impl Transport {
    /// Open a byte stream to `host:port`, upgrading to TLS when a
    /// configuration is supplied.
    pub async fn connect(
        host: &str,
        port: u16,
        tls_config: Option<&tls::TlsConfig>,
    ) -> Result<Self, MqttError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| MqttError::Connection(format!("connect {host}:{port}: {e}")))?;
        let _ = tcp.set_nodelay(true);

        let stream = match tls_config {
            Some(cfg) => {
                let connector = TlsConnector::from(tls::build_client_config(cfg)?);
                let sni = cfg.server_name.as_deref().unwrap_or(host);
                let server_name = rustls::ServerName::try_from(sni)
                    .map_err(|_| MqttError::Connection(format!("invalid server name {sni:?}")))?;
                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| MqttError::Connection(format!("TLS handshake: {e}")))?;
                TransportStream::Tls(Box::new(tls_stream))
            }
            None => TransportStream::Plain(tcp),
        };

        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_outbound: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Install the server's announced maximum packet size after CONNACK.
    pub fn set_max_outbound(&self, limit: u32) {
        self.max_outbound.store(limit, Ordering::Relaxed);
    }

    /// Serialize and write one packet atomically, flushing before
    /// returning.
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), MqttError> {
        let frame = packet.encode()?;
        self.send_frame(packet.packet_type(), frame).await
    }

    /// Write one pre-encoded frame atomically.
    pub async fn send_frame(&self, kind: &'static str, frame: Bytes) -> Result<(), MqttError> {
        let limit = self.max_outbound.load(Ordering::Relaxed);
        if limit != 0 && frame.len() as u64 > u64::from(limit) {
            return Err(MqttError::protocol(format!(
                "{kind} of {} bytes exceeds server maximum packet size {limit}",
                frame.len()
            )));
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| MqttError::Connection(format!("write {kind}: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| MqttError::Connection(format!("flush {kind}: {e}")))?;
        debug!(kind, bytes = frame.len(), "sent packet");
        Ok(())
    }

    /// Read exactly one packet from the stream.
    ///
    /// Returns `None` at clean end-of-stream. Partial reads are retried
    /// until the framed packet is complete; timeouts are the engine's
    /// concern, not the transport's.
    pub async fn read_packet(&self) -> Result<Option<Packet>, MqttError> {
        let mut reader = self.reader.lock().await;

        let mut first = [0u8; 1];
        match reader.read_exact(&mut first).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(MqttError::Connection(format!("read packet header: {e}"))),
        }

        // Remaining Length: 1-4 VBI bytes directly off the stream.
        let mut remaining: u32 = 0;
        let mut shift: u32 = 0;
        loop {
            let mut byte = [0u8; 1];
            reader
                .read_exact(&mut byte)
                .await
                .map_err(|e| MqttError::Connection(format!("read packet length: {e}")))?;
            remaining |= u32::from(byte[0] & 0x7F) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 21 {
                return Err(MqttError::malformed("remaining length exceeds 4 bytes"));
            }
        }
        if remaining > VBI_MAX {
            return Err(MqttError::malformed("remaining length out of range"));
        }

        let mut body = vec![0u8; remaining as usize];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| MqttError::Connection(format!("read packet body: {e}")))?;

        let packet = Packet::decode(first[0], Bytes::from(body))?;
        debug!(kind = packet.packet_type(), "received packet");
        Ok(Some(packet))
    }

    /// Tear down the stream. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet::{Ack, Publish, Qos};
    use tokio::net::TcpListener;

    async fn pair() -> (Transport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let transport = Transport::connect(&addr.ip().to_string(), addr.port(), None)
            .await
            .unwrap();
        (transport, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_read_packet_reassembles_partial_writes() {
        let (transport, mut peer) = pair().await;
        let frame = Packet::Publish(Publish {
            topic: "t/partial".into(),
            payload: Bytes::from(vec![0xAB; 300]),
            ..Default::default()
        })
        .encode()
        .unwrap();

        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(7) {
                peer.write_all(chunk).await.unwrap();
                peer.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            peer
        });

        let packet = transport.read_packet().await.unwrap().unwrap();
        match packet {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "t/partial");
                assert_eq!(p.payload.len(), 300);
            }
            other => panic!("unexpected {}", other.packet_type()),
        }
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_packet_returns_none_at_eof() {
        let (transport, peer) = pair().await;
        drop(peer);
        assert!(transport.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_packet_writes_one_frame() {
        let (transport, mut peer) = pair().await;
        transport
            .send_packet(&Packet::PubAck(Ack::new(9)))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x40, 0x02, 0x00, 0x09]);
    }

    #[tokio::test]
    async fn test_oversized_outbound_packet_rejected() {
        let (transport, _peer) = pair().await;
        transport.set_max_outbound(16);
        let result = transport
            .send_packet(&Packet::Publish(Publish {
                topic: "big".into(),
                qos: Qos::AtMostOnce,
                payload: Bytes::from(vec![0u8; 64]),
                ..Default::default()
            }))
            .await;
        assert!(matches!(result, Err(MqttError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _peer) = pair().await;
        transport.close().await;
        transport.close().await;
    }
}

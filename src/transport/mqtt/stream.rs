//! Socket I/O: TCP or TLS streams framed as MQTT packets
//!
//! [`MqttConnector`] opens the socket, performs the TLS and CONNECT/CONNACK
//! handshakes inside the connect timeout and hands back an [`MqttLink`].

use super::connection::{ConnectionParams, TransportError};
use super::tls::build_tls_config;
use crate::config::BrokerSection;
use crate::protocol::{ConnectReturnCode, Packet, ProtocolError};
use crate::transport::{Connected, Connector, Link};
use async_trait::async_trait;
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Plain TCP or TLS stream
enum AsyncStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connector for real brokers
pub struct MqttConnector {
    tls: Option<TlsConnector>,
    server_name: Option<String>,
}

impl MqttConnector {
    /// Prepare a connector; TLS material is loaded once here
    pub fn new(config: &BrokerSection) -> Result<Self, TransportError> {
        let address = super::connection::BrokerAddress::parse(&config.url)?;

        let tls = if address.tls {
            let tls_config = build_tls_config(config.tls.as_ref())?;
            Some(TlsConnector::from(Arc::new(tls_config)))
        } else {
            None
        };

        Ok(Self {
            tls,
            server_name: config.tls.as_ref().and_then(|t| t.server_name.clone()),
        })
    }

    async fn open_stream(&self, params: &ConnectionParams) -> Result<AsyncStream, TransportError> {
        let broker = &params.broker;
        let tcp_stream = TcpStream::connect((broker.host.as_str(), broker.port)).await?;
        tcp_stream.set_nodelay(true)?;

        if !broker.tls {
            return Ok(AsyncStream::Plain(tcp_stream));
        }

        let connector = self.tls.as_ref().ok_or_else(|| {
            TransportError::TlsConfig(format!("no TLS settings prepared for {broker}"))
        })?;
        let hostname = self.server_name.as_deref().unwrap_or(&broker.host);
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| TransportError::TlsConfig(format!("Invalid server name: {hostname}")))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TransportError::TlsHandshakeFailed(e.to_string()))?;

        Ok(AsyncStream::Tls(Box::new(tls_stream)))
    }

    async fn handshake(&self, params: &ConnectionParams) -> Result<Connected, TransportError> {
        let stream = self.open_stream(params).await?;
        let mut link = MqttLink::new(stream, params.max_packet_size);

        link.send(&Packet::Connect(params.connect_packet())).await?;

        match link.receive().await? {
            Packet::ConnAck(connack) if connack.code == ConnectReturnCode::Accepted => {
                debug!(
                    broker = %params.broker,
                    session_present = connack.session_present,
                    "CONNACK accepted"
                );
                Ok(Connected {
                    link: Box::new(link),
                    session_present: connack.session_present,
                })
            }
            Packet::ConnAck(connack) => Err(TransportError::Refused(connack.code)),
            other => Err(TransportError::Protocol(ProtocolError::MalformedPacket(
                format!("expected CONNACK, received {}", other.name()),
            ))),
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Connected, TransportError> {
        tokio::time::timeout(params.connect_timeout, self.handshake(params))
            .await
            .map_err(|_| TransportError::TimedOut(params.connect_timeout))?
    }
}

/// One open, handshaken connection to the broker
pub struct MqttLink {
    stream: AsyncStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_packet_size: usize,
}

impl MqttLink {
    fn new(stream: AsyncStream, max_packet_size: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            max_packet_size,
        }
    }
}

#[async_trait]
impl Link for MqttLink {
    async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.write_buf.clear();
        packet.encode(&mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.read_buf, self.max_packet_size)? {
                return Ok(packet);
            }
            // read_buf is cancel safe, so a dropped receive loses no bytes
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

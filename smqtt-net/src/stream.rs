use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use smqtt_codec::v3::{Connect, ConnectAck, Packet};
use smqtt_codec::Codec;

use crate::error::MqttError;
use crate::Result;

/// Framed MQTT v3.1.1 packet stream on top of a connected socket.
///
/// Writes are complete packets, a packet is never interleaved with another one.
pub struct MqttStream<Io> {
    io: Framed<Io, Codec>,
    send_timeout: Duration,
}

impl<Io> MqttStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// `max_packet_size` bounds inbound packets (`0` is unlimited), a zero `send_timeout`
    /// waits for writes forever.
    pub fn new(io: Io, max_packet_size: u32, send_timeout: Duration) -> Self {
        MqttStream { io: Framed::new(io, Codec::new(max_packet_size)), send_timeout }
    }

    #[inline]
    pub fn get_ref(&self) -> &Io {
        self.io.get_ref()
    }

    #[inline]
    pub async fn send_connect(&mut self, connect: Connect) -> Result<()> {
        self.send(Packet::Connect(Box::new(connect))).await
    }

    /// Encodes and flushes one packet.
    #[inline]
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        log::debug!("send packet: {:?}", packet);
        if self.send_timeout.is_zero() {
            self.io.send(packet).await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.send_timeout, self.io.send(packet)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e)),
                Err(_) => Err(MqttError::WriteTimeout),
            }
        }
    }

    #[inline]
    pub async fn flush(&mut self) -> Result<()> {
        if self.send_timeout.is_zero() {
            self.io.flush().await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.send_timeout, self.io.flush()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e)),
                Err(_) => Err(MqttError::FlushTimeout),
            }
        }
    }

    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        if self.send_timeout.is_zero() {
            self.io.close().await?;
            Ok(())
        } else {
            match tokio::time::timeout(self.send_timeout, self.io.close()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(MqttError::Encode(e)),
                Err(_) => Err(MqttError::CloseTimeout),
            }
        }
    }

    /// Waits up to `tm` for the next packet, `Ok(None)` means the peer closed the socket.
    #[inline]
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>> {
        match tokio::time::timeout(tm, self.next()).await {
            Ok(Some(Ok(msg))) => Ok(Some(msg)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(MqttError::ReadTimeout),
        }
    }

    /// The first packet from the broker must be a CONNACK.
    #[inline]
    pub async fn recv_connect_ack(&mut self, tm: Duration) -> Result<ConnectAck> {
        match self.recv(tm).await? {
            Some(Packet::ConnectAck(ack)) => Ok(ack),
            Some(packet) => Err(MqttError::UnexpectedPacket(format!("expected CONNACK, got {:?}", packet))),
            None => Err(MqttError::Disconnected),
        }
    }
}

impl<Io> futures::Stream for MqttStream<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Packet>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.io).poll_next(cx);
        Poll::Ready(match futures::ready!(next) {
            Some(Ok(packet)) => {
                log::debug!("recv packet: {:?}", packet);
                Some(Ok(packet))
            }
            Some(Err(e)) => Some(Err(MqttError::Decode(e))),
            None => None,
        })
    }
}

use super::{Connector, Operation, SocketIo, Stats};
use crate::limits::ConnLimits;
use bytes::{Buf, BytesMut};
use socket2::SockRef;
use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

/// [`SocketIo`] over a Tokio TCP stream.
///
/// Socket-level options go through [`socket2::SockRef`]. Read and write
/// timeouts are enforced around each operation since Tokio streams do not
/// honor `SO_RCVTIMEO`/`SO_SNDTIMEO`.
#[derive(Debug)]
pub struct TcpSocket {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    read_ahead: BytesMut,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    stats: Stats,
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            peer: stream.peer_addr().ok(),
            stream: Some(stream),
            read_ahead: BytesMut::new(),
            read_timeout: None,
            write_timeout: None,
            stats: Stats::default(),
        }
    }

    /// Connects to `addr` (anything Tokio can resolve).
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut socket = Self::new(stream);
        socket.stats.begin(Operation::Connect);
        Ok(socket)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref()?.local_addr().ok()
    }

    #[inline]
    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }

    #[inline]
    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }

    fn take_read_ahead(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.read_ahead.len());
        buf[..n].copy_from_slice(&self.read_ahead[..n]);
        self.read_ahead.advance(n);
        n
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "socket timeout"))),
        None => fut.await,
    }
}

impl SocketIo for TcpSocket {
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stats.begin(Operation::Send);
        if buf.is_empty() {
            return self.stats.record(Ok(0), |n| *n);
        }

        let limit = self.write_timeout;
        let result = match self.stream.as_mut() {
            Some(stream) => with_timeout(limit, stream.write(buf)).await,
            None => Err(io::ErrorKind::NotConnected.into()),
        };
        self.stats.record(result, |n| *n)
    }

    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stats.begin(Operation::Receive);
        if !self.read_ahead.is_empty() {
            let n = self.take_read_ahead(buf);
            return self.stats.record(Ok(n), |n| *n);
        }

        let limit = self.read_timeout;
        let result = match self.stream.as_mut() {
            Some(stream) => with_timeout(limit, stream.read(buf)).await,
            None => Err(io::ErrorKind::NotConnected.into()),
        };
        self.stats.record(result, |n| *n)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stats.begin(Operation::Send);
        let result = self.stream().and_then(|stream| stream.try_write(buf));
        self.stats.record(result, |n| *n)
    }

    fn try_receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stats.begin(Operation::Receive);
        if !self.read_ahead.is_empty() {
            let n = self.take_read_ahead(buf);
            return self.stats.record(Ok(n), |n| *n);
        }

        let result = self.stream().and_then(|stream| stream.try_read(buf));
        self.stats.record(result, |n| *n)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stats.begin(Operation::Disconnect);
        let result = match self.stream_mut() {
            Ok(stream) => stream.shutdown().await,
            Err(err) => Err(err),
        };
        self.stats.record(result, |_| 0)
    }

    fn close(&mut self) {
        self.stats.begin(Operation::Close);
        self.read_ahead.clear();
        self.stream = None;
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    fn recv_buffer_size(&self) -> io::Result<usize> {
        SockRef::from(self.stream()?).recv_buffer_size()
    }

    fn set_recv_buffer_size(&mut self, size: usize) -> io::Result<()> {
        SockRef::from(self.stream()?).set_recv_buffer_size(size)
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        SockRef::from(self.stream()?).send_buffer_size()
    }

    fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()> {
        SockRef::from(self.stream()?).set_send_buffer_size(size)
    }

    fn keepalive(&self) -> io::Result<bool> {
        SockRef::from(self.stream()?).keepalive()
    }

    fn set_keepalive(&mut self, enabled: bool) -> io::Result<()> {
        SockRef::from(self.stream()?).set_keepalive(enabled)
    }

    fn linger(&self) -> io::Result<Option<Duration>> {
        SockRef::from(self.stream()?).linger()
    }

    fn set_linger(&mut self, linger: Option<Duration>) -> io::Result<()> {
        SockRef::from(self.stream()?).set_linger(linger)
    }

    fn nodelay(&self) -> io::Result<bool> {
        self.stream()?.nodelay()
    }

    fn set_nodelay(&mut self, enabled: bool) -> io::Result<()> {
        self.stream()?.set_nodelay(enabled)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        loop {
            let n = match self.stream()?.try_read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            };
            self.read_ahead.extend_from_slice(&chunk[..n]);
        }
        Ok(self.read_ahead.len())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn last_operation(&self) -> Operation {
        self.stats.last_operation
    }

    fn last_error(&self) -> Option<io::ErrorKind> {
        self.stats.last_error
    }

    fn bytes_transferred(&self) -> usize {
        self.stats.transferred
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Opens plain TCP connections with the given per-connection options.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    limits: ConnLimits,
}

impl TcpConnector {
    pub fn new(limits: ConnLimits) -> Self {
        Self { limits }
    }
}

impl Connector for TcpConnector {
    type Socket = TcpSocket;

    async fn connect(&self, target: &str) -> io::Result<TcpSocket> {
        let mut socket = TcpSocket::connect(target).await?;
        socket.configure(&self.limits)?;
        Ok(socket)
    }
}

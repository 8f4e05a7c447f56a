use super::adapter::StreamAdapter;
use crate::{
    errors::{Error, Result},
    queue::ByteQueue,
    socket::SocketIo,
};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};
use tracing::trace;

const RECORD_HEADER: usize = 5;

enum TlsConnection {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsConnection::Server(conn) => conn.read_tls(rd),
            TlsConnection::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsConnection::Server(conn) => conn.write_tls(wr),
            TlsConnection::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsConnection::Server(conn) => conn.process_new_packets(),
            TlsConnection::Client(conn) => conn.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsConnection::Server(conn) => conn.reader(),
            TlsConnection::Client(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsConnection::Server(conn) => conn.writer(),
            TlsConnection::Client(conn) => conn.writer(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.is_handshaking(),
            TlsConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Server(conn) => conn.wants_write(),
            TlsConnection::Client(conn) => conn.wants_write(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Server(conn) => conn.send_close_notify(),
            TlsConnection::Client(conn) => conn.send_close_notify(),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            TlsConnection::Server(conn) => conn.alpn_protocol(),
            TlsConnection::Client(conn) => conn.alpn_protocol(),
        }
    }
}

/// A TLS session running over a [`SocketIo`] through a [`StreamAdapter`].
///
/// Ciphertext is read one record at a time (5-byte header, then the body
/// length it announces), so the adapter never consumes bytes past the
/// current record. Bytes staged before the session started but not yet
/// consumed are handed back to the plain protocol by
/// [`teardown`](Self::teardown).
pub struct TlsSession {
    conn: TlsConnection,
    adapter: StreamAdapter,
    pending_header: Option<Bytes>,
    peer_closed: bool,
}

impl TlsSession {
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self> {
        let conn = rustls::ServerConnection::new(config)?;
        Ok(Self::new(TlsConnection::Server(conn)))
    }

    pub fn client(config: Arc<rustls::ClientConfig>, server_name: ServerName<'static>) -> Result<Self> {
        let conn = rustls::ClientConnection::new(config, server_name)?;
        Ok(Self::new(TlsConnection::Client(conn)))
    }

    fn new(conn: TlsConnection) -> Self {
        Self {
            conn,
            adapter: StreamAdapter::new(),
            pending_header: None,
            peer_closed: false,
        }
    }

    #[inline(always)]
    pub fn adapter(&self) -> &StreamAdapter {
        &self.adapter
    }

    #[inline]
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    #[inline]
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    /// Drives the handshake to completion.
    pub async fn handshake<S: SocketIo>(&mut self, socket: &mut S) -> Result<()> {
        while self.conn.is_handshaking() {
            self.flush_tls(socket).await?;
            if !self.conn.is_handshaking() {
                break;
            }
            self.read_record(socket).await?;
        }

        // Final flight (client Finished, server session tickets).
        self.flush_tls(socket).await?;
        trace!("tls handshake complete");
        Ok(())
    }

    /// Reads one record and feeds it to the TLS engine.
    ///
    /// If cancelled between header and body, the header is kept and the
    /// next call resumes with the body.
    async fn read_record<S: SocketIo>(&mut self, socket: &mut S) -> Result<()> {
        let header = match self.pending_header.take() {
            Some(header) => header,
            None => self.adapter.begin_read(RECORD_HEADER).end(socket).await?,
        };
        self.pending_header = Some(header.clone());

        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        let body = self.adapter.begin_read(len).end(socket).await?;
        self.pending_header = None;

        let mut record = Vec::with_capacity(RECORD_HEADER + len);
        record.extend_from_slice(&header);
        record.extend_from_slice(&body);

        let mut rd = &record[..];
        while !rd.is_empty() {
            if self.conn.read_tls(&mut rd)? == 0 {
                break;
            }
        }

        if let Err(err) = self.conn.process_new_packets() {
            // Deliver the alert before giving up.
            let _ = self.flush_tls(socket).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn flush_tls<S: SocketIo>(&mut self, socket: &mut S) -> Result<()> {
        while self.conn.wants_write() {
            let mut out = Vec::new();
            self.conn.write_tls(&mut out)?;
            self.adapter.begin_write(&out).end(socket).await?;
        }
        Ok(())
    }

    /// Moves decrypted plaintext into `rx`. `None` once the peer sent
    /// `close_notify` and nothing is left.
    fn drain_plaintext(&mut self, rx: &mut ByteQueue) -> io::Result<Option<usize>> {
        let mut buf = [0u8; 4096];
        let mut total = 0;

        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok((total != 0).then_some(total));
                }
                Ok(n) => {
                    rx.add(&buf[..n]);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Some(total)),
                Err(err) => return Err(err),
            }
        }
    }

    /// Appends decrypted bytes to `rx`, reading records until some arrive.
    ///
    /// Returns `0` when the peer closed the session or the socket.
    pub async fn receive_into<S: SocketIo>(&mut self, socket: &mut S, rx: &mut ByteQueue) -> Result<usize> {
        loop {
            if self.peer_closed {
                return Ok(0);
            }
            match self.drain_plaintext(rx)? {
                Some(0) => {}
                Some(n) => return Ok(n),
                None => return Ok(0),
            }

            match self.read_record(socket).await {
                Ok(()) => self.flush_tls(socket).await?,
                Err(Error::Io(err))
                    if err.kind() == io::ErrorKind::ConnectionReset && self.adapter.staged() == 0 =>
                {
                    self.peer_closed = true;
                    return Ok(0);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Encrypts and sends all of `tx`.
    pub async fn send_from<S: SocketIo>(&mut self, socket: &mut S, tx: &mut ByteQueue) -> Result<()> {
        while !tx.is_empty() {
            let n = self.conn.writer().write(tx.as_slice())?;
            tx.remove(n);

            let stalled = n == 0 && !self.conn.wants_write();
            self.flush_tls(socket).await?;
            if stalled {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
        }
        Ok(())
    }

    /// Sends `close_notify`.
    pub async fn close<S: SocketIo>(&mut self, socket: &mut S) -> Result<()> {
        self.conn.send_close_notify();
        self.flush_tls(socket).await
    }

    /// Ends the session without a close exchange and moves the bytes it
    /// holds into `rx`: undelivered plaintext first, then whatever was
    /// received past the last record.
    pub fn teardown(mut self, rx: &mut ByteQueue) -> usize {
        let before = rx.len();
        let _ = self.drain_plaintext(rx);

        if let Some(header) = self.pending_header.take() {
            rx.add(&header);
        }
        self.adapter.drain_into(rx);
        rx.len() - before
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.conn {
            TlsConnection::Server(_) => "server",
            TlsConnection::Client(_) => "client",
        };

        f.debug_struct("TlsSession")
            .field("side", &side)
            .field("handshaking", &self.conn.is_handshaking())
            .field("adapter", &self.adapter)
            .finish()
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::{
        socket::SimSocket,
        tools::{tls_client_config, tls_server_config},
    };

    fn localhost() -> ServerName<'static> {
        ServerName::try_from("localhost").unwrap()
    }

    async fn connected() -> (TlsSession, SimSocket, TlsSession, SimSocket) {
        let (mut client_io, mut server_io) = SimSocket::pair(64 * 1024);
        let mut client = TlsSession::client(tls_client_config(), localhost()).unwrap();
        let mut server = TlsSession::server(tls_server_config()).unwrap();

        let (c, s) = tokio::join!(client.handshake(&mut client_io), server.handshake(&mut server_io));
        c.unwrap();
        s.unwrap();
        assert!(!client.is_handshaking() && !server.is_handshaking());

        (client, client_io, server, server_io)
    }

    #[tokio::test]
    async fn handshake_and_exchange() {
        let (mut client, mut client_io, mut server, mut server_io) = connected().await;

        let mut tx = ByteQueue::from(&b"secret ping"[..]);
        client.send_from(&mut client_io, &mut tx).await.unwrap();
        assert!(tx.is_empty());

        let mut rx = ByteQueue::new();
        while rx.len() < 11 {
            server.receive_into(&mut server_io, &mut rx).await.unwrap();
        }
        assert_eq!(rx.as_slice(), b"secret ping");

        let mut tx = ByteQueue::from(&b"pong"[..]);
        server.send_from(&mut server_io, &mut tx).await.unwrap();
        let mut rx = ByteQueue::new();
        while rx.len() < 4 {
            client.receive_into(&mut client_io, &mut rx).await.unwrap();
        }
        assert_eq!(rx.as_slice(), b"pong");
    }

    #[tokio::test]
    async fn close_notify_reads_as_end() {
        let (mut client, mut client_io, mut server, mut server_io) = connected().await;
        client.close(&mut client_io).await.unwrap();

        let mut rx = ByteQueue::new();
        assert_eq!(server.receive_into(&mut server_io, &mut rx).await.unwrap(), 0);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn socket_close_reads_as_end() {
        let (client, client_io, mut server, mut server_io) = connected().await;
        drop((client, client_io));

        let mut rx = ByteQueue::new();
        assert_eq!(server.receive_into(&mut server_io, &mut rx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn teardown_keeps_plain_tail() {
        let (mut client, mut client_io, mut server, mut server_io) = connected().await;

        let mut tx = ByteQueue::from(&b"last tls"[..]);
        client.send_from(&mut client_io, &mut tx).await.unwrap();
        client_io.send_all(b"PLAIN").await.unwrap();

        let mut rx = ByteQueue::new();
        server.receive_into(&mut server_io, &mut rx).await.unwrap();
        assert_eq!(rx.as_slice(), b"last tls");

        // Records are read exactly, so the plain tail is still in the socket.
        let mut rx = ByteQueue::new();
        assert_eq!(server.teardown(&mut rx), 0);
        let mut buf = [0u8; 16];
        while rx.len() < 5 {
            let n = server_io.receive(&mut buf).await.unwrap();
            rx.add(&buf[..n]);
        }
        assert_eq!(rx.as_slice(), b"PLAIN");
    }

    #[tokio::test]
    async fn garbage_fails_handshake() {
        let (mut client_io, mut server_io) = SimSocket::pair(1024);
        let mut server = TlsSession::server(tls_server_config()).unwrap();

        client_io.send_all(b"\x16\x03\x01\x00\x05hello").await.unwrap();
        assert!(server.handshake(&mut server_io).await.is_err());
    }
}

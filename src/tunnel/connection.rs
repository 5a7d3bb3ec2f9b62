//! Tunnel connection
//!
//! Layers the cipher session and frame codec over a raw duplex stream.
//! Client and server connections share one implementation and differ only
//! in the [`Role`] marker, which decides the frame type written (masked or
//! not) and the frame type expected from the peer.
//!
//! A connection splits into a [`TunnelReader`] and a [`TunnelWriter`] so the
//! two forwarding directions can run concurrently, each exclusively owning
//! one path and its cipher. The halves are put back together with
//! [`TunnelConnection::reunite`] before the connection is reset for reuse.

use super::frame::{read_frame, ContentType, Frame, FrameType};
use super::state::{CloseSignal, ConnectionState, StateError};
use super::{TunnelError, FIN_MARKER};
use crate::crypto::{Iv, Key, StreamCipher, IV_LEN};
use bytes::Bytes;
use std::future::Future;
use std::marker::PhantomData;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Read buffer size for the frame decoder
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Which end of the tunnel a connection sits on
pub trait Role: Send + Sync + 'static {
    /// Frame type this side writes
    const OUTBOUND: FrameType;
    /// Frame type this side expects from the peer
    const INBOUND: FrameType;
    /// Name used in logs
    const NAME: &'static str;
}

/// Client end: writes masked frames, reads server frames
#[derive(Debug)]
pub enum Client {}

/// Server end: writes unmasked frames, reads client frames
#[derive(Debug)]
pub enum Server {}

impl Role for Client {
    const OUTBOUND: FrameType = FrameType::Client;
    const INBOUND: FrameType = FrameType::Server;
    const NAME: &'static str = "client";
}

impl Role for Server {
    const OUTBOUND: FrameType = FrameType::Server;
    const INBOUND: FrameType = FrameType::Client;
    const NAME: &'static str = "server";
}

/// Client-side tunnel connection
pub type ClientConnection<S = TcpStream> = TunnelConnection<S, Client>;

/// Server-side tunnel connection
pub type ServerConnection<S = TcpStream> = TunnelConnection<S, Server>;

/// Read path of a tunnel connection
pub struct TunnelReader<S, R> {
    inner: BufReader<ReadHalf<S>>,
    cipher: StreamCipher,
    input_open: bool,
    fin_received: bool,
    close: CloseSignal,
    _role: PhantomData<fn() -> R>,
}

/// Write path of a tunnel connection
pub struct TunnelWriter<S, R> {
    inner: WriteHalf<S>,
    cipher: StreamCipher,
    output_open: bool,
    close: CloseSignal,
    _role: PhantomData<fn() -> R>,
}

/// An encrypted, framed duplex channel carrying one logical session at a time
pub struct TunnelConnection<S, R> {
    reader: TunnelReader<S, R>,
    writer: TunnelWriter<S, R>,
    key: Key,
}

impl<S, R> TunnelReader<S, R>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Role,
{
    /// Read the next data payload
    ///
    /// Returns `Ok(None)` once the peer's "fin" has been observed, and keeps
    /// returning it afterwards.
    pub async fn read(&mut self) -> Result<Option<Bytes>, TunnelError> {
        if self.close.is_closed() {
            return Err(StateError::Closed.into());
        }
        if !self.input_open {
            return Err(StateError::InputShut.into());
        }
        if self.fin_received {
            return Ok(None);
        }

        let frame = self.next_frame().await?;

        match frame.content_type {
            ContentType::Binary => Ok(Some(self.decrypt(frame.payload))),
            ContentType::Text => {
                if self.decrypt(frame.payload) == FIN_MARKER {
                    trace!(role = R::NAME, "peer fin received");
                    self.fin_received = true;
                    Ok(None)
                } else {
                    Err(TunnelError::InvalidFrame(
                        "Unexpected control message".to_string(),
                    ))
                }
            }
            other => Err(TunnelError::InvalidFrame(format!(
                "Unexpected {:?} frame in data phase",
                other
            ))),
        }
    }

    /// Stop reading; wire-silent
    pub fn shutdown_input(&mut self) {
        self.input_open = false;
    }

    /// Force-close the whole connection
    pub fn close(&mut self) {
        self.input_open = false;
        self.close.fire();
    }

    /// Whether the peer has shut its output
    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// IV of the peer's current keystream
    pub fn iv(&self) -> &Iv {
        self.cipher.iv()
    }

    fn decrypt(&mut self, payload: Bytes) -> Bytes {
        let mut data = payload.to_vec();
        self.cipher.apply(&mut data);
        Bytes::from(data)
    }

    async fn next_frame(&mut self) -> Result<Frame, TunnelError> {
        tokio::select! {
            biased;
            _ = self.close.closed() => Err(StateError::Closed.into()),
            frame = read_frame(&mut self.inner, R::INBOUND) => frame,
        }
    }

    /// Consume frames until the peer's "fin", discarding anything else
    async fn drain_fin(&mut self) -> Result<(), TunnelError> {
        let mut discarded = 0usize;

        while !self.fin_received {
            let frame = self.next_frame().await?;
            match frame.content_type {
                ContentType::Text => {
                    if self.decrypt(frame.payload) == FIN_MARKER {
                        self.fin_received = true;
                    } else {
                        discarded += 1;
                    }
                }
                // Still decrypted so the keystream stays aligned with the fin.
                ContentType::Binary => {
                    self.decrypt(frame.payload);
                    discarded += 1;
                }
                _ => discarded += 1,
            }
        }

        if discarded > 0 {
            debug!(role = R::NAME, discarded, "discarded frames while draining for reset");
        }
        Ok(())
    }

    /// Receive the peer's IV and restart the read path with it
    async fn accept_iv(&mut self, key: &Key) -> Result<(), TunnelError> {
        let frame = self.next_frame().await?;
        self.cipher = decrypt_cipher(frame, key)?;
        self.input_open = true;
        self.fin_received = false;
        Ok(())
    }
}

impl<S, R> TunnelWriter<S, R>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Role,
{
    /// Encrypt and send `data` as one binary frame
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        if self.close.is_closed() {
            return Err(StateError::Closed.into());
        }
        if !self.output_open {
            return Err(StateError::OutputShut.into());
        }

        let payload = self.cipher.process(data);
        self.send(Frame::binary(R::OUTBOUND, Bytes::from(payload))).await
    }

    /// Send the "fin" control frame and stop writing
    ///
    /// Idempotent once the output is shut or the connection is closed.
    pub async fn shutdown_output(&mut self) -> Result<(), TunnelError> {
        if self.close.is_closed() || !self.output_open {
            return Ok(());
        }

        self.output_open = false;
        let payload = self.cipher.process(FIN_MARKER);
        self.send(Frame::text(R::OUTBOUND, Bytes::from(payload))).await
    }

    /// Force-close the whole connection
    pub async fn close(&mut self) {
        self.output_open = false;
        self.close.fire();
        let _ = self.inner.shutdown().await;
    }

    /// Resolve once either half has force-closed the connection
    ///
    /// The returned future owns its handle on the close signal, so it can be
    /// polled alongside I/O on this writer.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let close = self.close.clone();
        async move { close.closed().await }
    }

    /// IV of the local keystream
    pub fn iv(&self) -> &Iv {
        self.cipher.iv()
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TunnelError> {
        let encoded = frame.encode();
        tokio::select! {
            biased;
            _ = self.close.closed() => Err(StateError::Closed.into()),
            result = self.inner.write_all(&encoded) => Ok(result?),
        }
    }

    /// Generate a fresh IV, send it in clear and restart the write path
    async fn offer_iv(&mut self, key: &Key) -> Result<(), TunnelError> {
        let cipher = StreamCipher::generate(key)?;
        let frame = Frame::binary(R::OUTBOUND, Bytes::copy_from_slice(cipher.iv()));
        self.send(frame).await?;
        self.cipher = cipher;
        self.output_open = true;
        Ok(())
    }
}

impl<S, R> TunnelConnection<S, R>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Role,
{
    /// Bring up a connection over a freshly connected or accepted stream
    ///
    /// Each side sends its own encrypt IV, then reads the peer's as its
    /// decrypt IV. On failure the stream is dropped.
    pub async fn establish(stream: S, key: Key) -> Result<Self, TunnelError> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut read_half = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);

        let encrypt = StreamCipher::generate(&key)?;
        let iv_frame = Frame::binary(R::OUTBOUND, Bytes::copy_from_slice(encrypt.iv()));
        write_half.write_all(&iv_frame.encode()).await?;

        let frame = read_frame(&mut read_half, R::INBOUND)
            .await
            .map_err(|e| TunnelError::Handshake(format!("reading peer IV: {}", e)))?;
        let decrypt = decrypt_cipher(frame, &key)?;

        let close = CloseSignal::new();
        debug!(role = R::NAME, "tunnel connection established");

        Ok(Self {
            reader: TunnelReader {
                inner: read_half,
                cipher: decrypt,
                input_open: true,
                fin_received: false,
                close: close.clone(),
                _role: PhantomData,
            },
            writer: TunnelWriter {
                inner: write_half,
                cipher: encrypt,
                output_open: true,
                close,
                _role: PhantomData,
            },
            key,
        })
    }

    /// Encrypt and send `data`
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        self.writer.write(data).await
    }

    /// Read the next payload, `Ok(None)` at the peer's "fin"
    pub async fn read(&mut self) -> Result<Option<Bytes>, TunnelError> {
        self.reader.read().await
    }

    /// Send "fin" and stop writing
    pub async fn shutdown_output(&mut self) -> Result<(), TunnelError> {
        self.writer.shutdown_output().await
    }

    /// Stop reading; wire-silent
    pub fn shutdown_input(&mut self) {
        self.reader.shutdown_input();
    }

    /// Close the connection; every further operation fails
    pub async fn close(&mut self) {
        self.reader.close();
        self.writer.close().await;
    }

    /// Prepare the connection for the next logical session
    ///
    /// Requires the local output to be shut already. Drains frames until
    /// the peer's "fin", then reruns the IV exchange so the next session
    /// never reuses a keystream. Any failure closes the connection.
    pub async fn reset(&mut self) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(StateError::Closed.into());
        }
        if self.writer.output_open {
            return Err(StateError::OutputStillOpen.into());
        }

        if let Err(e) = self.renegotiate().await {
            debug!(role = R::NAME, error = %e, "reset failed, closing connection");
            self.close().await;
            return Err(e);
        }

        trace!(role = R::NAME, "tunnel connection reset");
        Ok(())
    }

    async fn renegotiate(&mut self) -> Result<(), TunnelError> {
        self.reader.drain_fin().await?;
        self.writer.offer_iv(&self.key).await?;
        self.reader.accept_iv(&self.key).await
    }

    /// Current half-close state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_flags(
            self.reader.input_open,
            self.writer.output_open,
            self.is_closed(),
        )
    }

    pub fn is_closed(&self) -> bool {
        self.writer.close.is_closed()
    }

    /// Whether the peer's "fin" has been observed this session
    pub fn fin_received(&self) -> bool {
        self.reader.fin_received
    }

    /// IV this side encrypts with in the current session
    pub fn encrypt_iv(&self) -> &Iv {
        self.writer.iv()
    }

    /// IV this side decrypts with in the current session
    pub fn decrypt_iv(&self) -> &Iv {
        self.reader.iv()
    }

    /// Split into independently owned read and write paths
    pub fn split(self) -> (TunnelReader<S, R>, TunnelWriter<S, R>, Key) {
        (self.reader, self.writer, self.key)
    }

    /// Put the halves of one connection back together
    pub fn reunite(
        reader: TunnelReader<S, R>,
        writer: TunnelWriter<S, R>,
        key: Key,
    ) -> Result<Self, TunnelError> {
        if !reader.close.same_as(&writer.close) || !reader.inner.get_ref().is_pair_of(&writer.inner) {
            return Err(StateError::Mismatched.into());
        }

        Ok(Self { reader, writer, key })
    }
}

impl<S, R: Role> std::fmt::Debug for TunnelConnection<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("role", &R::NAME)
            .field("input_open", &self.reader.input_open)
            .field("output_open", &self.writer.output_open)
            .field("fin_received", &self.reader.fin_received)
            .field("closed", &self.writer.close.is_closed())
            .finish()
    }
}

/// Build the decrypt cipher from the peer's IV frame
fn decrypt_cipher(frame: Frame, key: &Key) -> Result<StreamCipher, TunnelError> {
    if frame.content_type != ContentType::Binary {
        return Err(TunnelError::Handshake(format!(
            "expected binary IV frame, got {:?}",
            frame.content_type
        )));
    }
    if frame.payload.len() != IV_LEN {
        return Err(TunnelError::Handshake(format!(
            "IV must be {} bytes, got {}",
            IV_LEN,
            frame.payload.len()
        )));
    }

    Ok(StreamCipher::new(key, &frame.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    const KEY: Key = [7u8; 32];

    async fn pair() -> (ClientConnection<DuplexStream>, ServerConnection<DuplexStream>) {
        let (a, b) = duplex(256 * 1024);
        let (client, server) = tokio::join!(
            ClientConnection::establish(a, KEY),
            ServerConnection::establish(b, KEY)
        );
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_bring_up_exchanges_ivs() {
        let (client, server) = pair().await;

        assert_eq!(client.encrypt_iv(), server.decrypt_iv());
        assert_eq!(server.encrypt_iv(), client.decrypt_iv());
        assert_ne!(client.encrypt_iv(), server.encrypt_iv());
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_write_read_both_directions() {
        let (mut client, mut server) = pair().await;

        client.write(b"GET / ").await.unwrap();
        assert_eq!(server.read().await.unwrap().unwrap(), &b"GET / "[..]);

        server.write(b"HTTP/1.1 200 OK").await.unwrap();
        assert_eq!(client.read().await.unwrap().unwrap(), &b"HTTP/1.1 200 OK"[..]);
    }

    #[tokio::test]
    async fn test_half_close_is_independent() {
        let (mut client, mut server) = pair().await;

        client.shutdown_output().await.unwrap();
        assert_eq!(client.state(), ConnectionState::OutputShut);
        assert!(matches!(
            client.write(b"late").await,
            Err(TunnelError::State(StateError::OutputShut))
        ));
        // Idempotent
        client.shutdown_output().await.unwrap();

        // Output shut, reading still allowed
        server.write(b"still flowing").await.unwrap();
        assert_eq!(client.read().await.unwrap().unwrap(), &b"still flowing"[..]);

        assert!(server.read().await.unwrap().is_none());
        assert!(server.fin_received());
        assert!(server.read().await.unwrap().is_none());

        // Input shut, writing still allowed
        server.shutdown_input();
        assert_eq!(server.state(), ConnectionState::InputShut);
        assert!(matches!(
            server.read().await,
            Err(TunnelError::State(StateError::InputShut))
        ));
        server.write(b"after input shut").await.unwrap();
        assert_eq!(client.read().await.unwrap().unwrap(), &b"after input shut"[..]);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (mut client, _server) = pair().await;

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.write(b"x").await,
            Err(TunnelError::State(StateError::Closed))
        ));
        assert!(matches!(
            client.read().await,
            Err(TunnelError::State(StateError::Closed))
        ));
        assert!(client.reset().await.is_err());
    }

    #[tokio::test]
    async fn test_reset_requires_output_shut() {
        let (mut client, _server) = pair().await;

        assert!(matches!(
            client.reset().await,
            Err(TunnelError::State(StateError::OutputStillOpen))
        ));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_reset_renegotiates_ivs() {
        let (mut client, mut server) = pair().await;
        let first_client_iv = *client.encrypt_iv();
        let first_server_iv = *server.encrypt_iv();

        client.write(b"session one").await.unwrap();
        client.shutdown_output().await.unwrap();
        server.shutdown_output().await.unwrap();

        // Server resets without having read: drain discards the data frame.
        let (client_reset, server_reset) = tokio::join!(client.reset(), server.reset());
        client_reset.unwrap();
        server_reset.unwrap();

        assert_ne!(client.encrypt_iv(), &first_client_iv);
        assert_ne!(server.encrypt_iv(), &first_server_iv);
        assert_eq!(client.encrypt_iv(), server.decrypt_iv());
        assert_eq!(client.state(), ConnectionState::Open);
        assert!(!server.fin_received());

        client.write(b"session two").await.unwrap();
        assert_eq!(server.read().await.unwrap().unwrap(), &b"session two"[..]);
    }

    #[tokio::test]
    async fn test_split_and_reunite() {
        let (client, mut server) = pair().await;
        let (mut reader, mut writer, key) = client.split();

        writer.write(b"ping").await.unwrap();
        assert_eq!(server.read().await.unwrap().unwrap(), &b"ping"[..]);
        server.write(b"pong").await.unwrap();
        assert_eq!(reader.read().await.unwrap().unwrap(), &b"pong"[..]);

        let client = ClientConnection::reunite(reader, writer, key).unwrap();
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_reunite_rejects_foreign_halves() {
        let (first, _s1) = pair().await;
        let (second, _s2) = pair().await;

        let (reader, _, key) = first.split();
        let (_, writer, _) = second.split();

        assert!(matches!(
            ClientConnection::reunite(reader, writer, key),
            Err(TunnelError::State(StateError::Mismatched))
        ));
    }

    #[tokio::test]
    async fn test_close_from_writer_aborts_pending_read() {
        let (client, _server) = pair().await;
        let (mut reader, mut writer, _) = client.split();

        let pending = tokio::spawn(async move { reader.read().await });
        tokio::task::yield_now().await;
        writer.close().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TunnelError::State(StateError::Closed))));
    }

    #[tokio::test]
    async fn test_closed_future_is_spawnable() {
        let (client, _server) = pair().await;
        let (mut reader, writer, _) = client.split();

        let waiter = tokio::spawn(writer.closed());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        reader.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        drop(writer);
    }

    #[tokio::test]
    async fn test_bring_up_rejects_bad_iv() {
        let (a, mut b) = duplex(1024);

        let peer = tokio::spawn(async move {
            let frame = Frame::binary(FrameType::Server, Bytes::from_static(b"short"));
            b.write_all(&frame.encode()).await.unwrap();
            b
        });

        let result = ClientConnection::establish(a, KEY).await;
        assert!(matches!(result, Err(TunnelError::Handshake(_))));
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_unexpected_text_is_protocol_error() {
        let (mut client, server) = pair().await;
        let (_reader, mut writer, _) = server.split();

        let payload = writer.cipher.process(b"not fin");
        writer
            .send(Frame::text(FrameType::Server, Bytes::from(payload)))
            .await
            .unwrap();

        let err = client.read().await.unwrap_err();
        assert!(err.is_protocol());
    }
}

//! An encrypted wrapper for bidirectional byte streams.
//!
//! Both endpoints write `block_size` cryptographically random bytes and
//! read the peer's, in either order; the XOR of the two halves — random as
//! long as either side is honest, and identical at both ends — seeds a pair
//! of CFB keystreams, one per direction. Every byte written is XORed
//! against the outbound keystream before it reaches the underlying stream,
//! and every byte read is XORed against the inbound one.
//!
//! The block key is long-lived and shared by every session; only the IV is
//! per-session, and nothing authenticates the bytes on the wire. This
//! layer provides confidentiality, not integrity: an active attacker can
//! flip bits undetected. That is a recorded limitation of the scheme, not
//! something this module attempts to paper over.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit};
use des::{Des, TdesEde3};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

mod cfb;
use cfb::Cfb;

/// How long to wait for the peer's half of the IV exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes encrypted per write buffer fill.
const WRITE_CHUNK: usize = 16 * 1024;

/// The supported block ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Aes,
    Des,
    TripleDes,
}

impl Method {
    /// Maps a configured cipher name. Unrecognized names fall back to AES.
    pub fn from_name(name: &str) -> Method {
        match name {
            "des" => Method::Des,
            "tripledes" => Method::TripleDes,
            _ => Method::Aes,
        }
    }
}

/// A block cipher instantiated from a decoded key.
#[derive(Clone)]
pub enum Block {
    Aes(Aes128),
    Des(Des),
    TripleDes(TdesEde3),
}

impl Block {
    pub fn block_size(&self) -> usize {
        match self {
            Block::Aes(_) => 16,
            Block::Des(_) | Block::TripleDes(_) => 8,
        }
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            Block::Aes(cipher) => cipher.encrypt_block(GenericArray::from_mut_slice(block)),
            Block::Des(cipher) => cipher.encrypt_block(GenericArray::from_mut_slice(block)),
            Block::TripleDes(cipher) => cipher.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }
}

/// Errors raised while preparing a key or exchanging IVs.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("The cipher key is not valid base64")]
    KeyEncoding(#[from] base64::DecodeError),
    #[error("A decoded key of {0} bytes does not fit the selected cipher")]
    KeyLength(usize),
    #[error("Timed out waiting for the peer's initialization vector")]
    Timeout,
    #[error("The stream failed during the initialization vector exchange")]
    Io(#[from] io::Error),
}

/// Decodes a base64 key and instantiates the requested block cipher.
pub fn new_block(method: Method, key: &str) -> Result<Block, HandshakeError> {
    tracing::debug!(?method, "crypt wrapper preparing");
    let key = BASE64.decode(key)?;
    let length = key.len();
    match method {
        Method::Aes => Aes128::new_from_slice(&key).map(Block::Aes),
        Method::Des => Des::new_from_slice(&key).map(Block::Des),
        Method::TripleDes => TdesEde3::new_from_slice(&key).map(Block::TripleDes),
    }
    .map_err(|_| HandshakeError::KeyLength(length))
}

/// Sends `n` random bytes, reads exactly `n` from the peer under
/// [`HANDSHAKE_TIMEOUT`], and derives the shared IV as their XOR.
///
/// Any failure — short write, timeout, I/O error — aborts the exchange;
/// the caller is expected to discard the connection, not retry.
pub async fn exchange_iv<S>(stream: &mut S, n: usize) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    exchange_iv_within(stream, n, HANDSHAKE_TIMEOUT).await
}

async fn exchange_iv_within<S>(
    stream: &mut S,
    n: usize,
    deadline: Duration,
) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sent = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut sent);
    stream.write_all(&sent).await?;
    stream.flush().await?;
    tracing::debug!("sent iv: {:02x?}", sent);

    let mut received = vec![0u8; n];
    match tokio::time::timeout(deadline, stream.read_exact(&mut received)).await {
        Ok(read) => {
            read?;
        }
        Err(_) => return Err(HandshakeError::Timeout),
    }
    tracing::debug!("recv iv: {:02x?}", received);

    for (ours, theirs) in sent.iter_mut().zip(&received) {
        *ours ^= theirs;
    }
    tracing::debug!("xor iv: {:02x?}", sent);
    Ok(sent)
}

/// A byte stream whose reads and writes pass through a pair of CFB
/// keystreams seeded by the IV exchange.
pub struct CryptStream<S> {
    inner: S,
    /// Decrypts inbound bytes; matches the peer's `enc`.
    dec: Cfb,
    /// Encrypts outbound bytes; matches the peer's `dec`.
    enc: Cfb,
    /// Already-encrypted bytes not yet accepted by the inner stream.
    wbuf: Vec<u8>,
    wpos: usize,
}

impl<S> CryptStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps the dialing side of a connection.
    pub async fn client(stream: S, block: Block) -> Result<Self, HandshakeError> {
        Self::wrap(stream, block, HANDSHAKE_TIMEOUT).await
    }

    /// Wraps the accepting side of a connection.
    pub async fn server(stream: S, block: Block) -> Result<Self, HandshakeError> {
        Self::wrap(stream, block, HANDSHAKE_TIMEOUT).await
    }

    async fn wrap(mut stream: S, block: Block, deadline: Duration) -> Result<Self, HandshakeError> {
        let iv = exchange_iv_within(&mut stream, block.block_size(), deadline).await?;
        tracing::warn!(
            "session IV derives from a long-lived key; traffic is confidential but unauthenticated"
        );
        Ok(Self {
            inner: stream,
            dec: Cfb::new(block.clone(), &iv),
            enc: Cfb::new(block, &iv),
            wbuf: Vec::new(),
            wpos: 0,
        })
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Pushes already-encrypted bytes into the inner stream until the
    /// buffer drains or the stream stops accepting.
    fn poll_flush_buffered(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.wpos < self.wbuf.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wbuf[self.wpos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wpos += n;
        }
        self.wbuf.clear();
        self.wpos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for CryptStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut me.inner).poll_read(cx, buf))?;
        me.dec.decrypt(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for CryptStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        // Bytes already run through the keystream are committed; they must
        // reach the wire before new input is accepted.
        ready!(me.poll_flush_buffered(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let take = buf.len().min(WRITE_CHUNK);
        me.wbuf.extend_from_slice(&buf[..take]);
        me.enc.encrypt(&mut me.wbuf[..]);
        if let Poll::Ready(Err(e)) = me.poll_flush_buffered(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_flush_buffered(cx))?;
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_flush_buffered(cx))?;
        Pin::new(&mut me.inner).poll_shutdown(cx)
    }
}

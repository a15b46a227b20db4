use std::{
    io::IoSlice,
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};

use crate::{
    client::options::ServerAddress,
    error::{ErrorKind, Result},
    runtime::TlsConfig,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// A stream to a single server, possibly using TLS.
///
/// Streams stack: the TLS session wraps a base stream, and the per-node read
/// buffer sits on top of whichever variant is in use. Whoever holds the
/// stream owns the whole chain; dropping the top drops everything beneath it.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// An unencrypted connection to the server.
    Plain(BaseStream),

    /// A TLS session over a base connection.
    Tls(Box<tokio_rustls::client::TlsStream<BaseStream>>),
}

/// A raw socket connection: TCP/IP or a UNIX domain socket.
#[derive(Debug)]
pub(crate) enum BaseStream {
    Tcp(TcpStream),

    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl BaseStream {
    async fn try_connect(address: &SocketAddr, connect_timeout: Duration) -> Result<Self> {
        let stream_future = TcpStream::connect(address);

        let stream = if connect_timeout == Duration::from_secs(0) {
            stream_future.await?
        } else {
            tokio::time::timeout(connect_timeout, stream_future)
                .await
                .map_err(|_| crate::error::Error::network_timeout())??
        };

        stream.set_nodelay(true)?;

        let socket = socket2::Socket::from(stream.into_std()?);
        let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        socket.set_tcp_keepalive(&conf)?;
        let std_stream = std::net::TcpStream::from(socket);
        Ok(Self::Tcp(TcpStream::from_std(std_stream)?))
    }

    /// Connects to `address`, resolving hostnames and trying each resolved
    /// peer in sequence with a preference for IPv4.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        match address {
            ServerAddress::Tcp { host, .. } => {
                let mut socket_addrs: Vec<SocketAddr> =
                    tokio::net::lookup_host(address.to_lookup_string())
                        .await
                        .map_err(|e| ErrorKind::DnsResolve {
                            message: format!("failed to resolve \"{}\": {}", host, e),
                        })?
                        .collect();

                if socket_addrs.is_empty() {
                    return Err(ErrorKind::DnsResolve {
                        message: format!("no addresses found for \"{}\"", host),
                    }
                    .into());
                }

                socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

                let mut connect_error = None;
                for socket_addr in &socket_addrs {
                    connect_error = match Self::try_connect(socket_addr, timeout).await {
                        Ok(stream) => return Ok(stream),
                        Err(err) => Some(err),
                    };
                }

                Err(connect_error.unwrap_or_else(|| {
                    ErrorKind::DnsResolve {
                        message: format!("no addresses found for \"{}\"", host),
                    }
                    .into()
                }))
            }

            #[cfg(unix)]
            ServerAddress::Unix { path } => {
                let stream_future = tokio::net::UnixStream::connect(path);
                let stream = if timeout == Duration::from_secs(0) {
                    stream_future.await?
                } else {
                    tokio::time::timeout(timeout, stream_future)
                        .await
                        .map_err(|_| crate::error::Error::network_timeout())??
                };
                Ok(Self::Unix(stream))
            }
        }
    }
}

impl AsyncStream {
    /// Creates a new stream connected to `address`, wrapping it in TLS when a
    /// configuration is provided.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let inner = BaseStream::connect(address, connect_timeout).await?;

        match tls_config {
            Some(cfg) => {
                let session = cfg.wrap(address.host_str(), inner).await?;
                Ok(Self::Tls(Box::new(session)))
            }
            None => Ok(Self::Plain(inner)),
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = AsyncWriteExt::shutdown(self).await;
    }
}

/// Writes every byte referenced by `bufs` to `stream`, looping on partial
/// vectored writes. The caller's buffers are never copied.
pub(crate) async fn write_all_vectored<S>(stream: &mut S, bufs: &[IoSlice<'_>]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut idx = 0;
    let mut skip = 0;

    while idx < bufs.len() {
        let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(bufs.len() - idx);
        iov.push(IoSlice::new(&bufs[idx][skip..]));
        iov.extend(bufs[idx + 1..].iter().map(|buf| IoSlice::new(buf)));

        let mut written = stream.write_vectored(&iov).await?;
        if written == 0 {
            return Err(ErrorKind::from(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "stream refused to accept bytes",
            ))
            .into());
        }

        while idx < bufs.len() {
            let remaining = bufs[idx].len() - skip;
            if written >= remaining {
                written -= remaining;
                idx += 1;
                skip = 0;
            } else {
                skip += written;
                break;
            }
        }
    }

    stream.flush().await?;
    Ok(())
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Plain(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Plain(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Plain(ref mut inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(ref inner) => inner.is_write_vectored(),
            Self::Tls(ref inner) => inner.is_write_vectored(),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Plain(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Plain(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_shutdown(cx),
        }
    }
}

impl AsyncRead for BaseStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_read(cx, buf),

            #[cfg(unix)]
            Self::Unix(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BaseStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_write(cx, buf),

            #[cfg(unix)]
            Self::Unix(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_write_vectored(cx, bufs),

            #[cfg(unix)]
            Self::Unix(ref mut stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_flush(cx),

            #[cfg(unix)]
            Self::Unix(ref mut stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_shutdown(cx),

            #[cfg(unix)]
            Self::Unix(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

use std::{
    fs::File,
    future::Future,
    io::{self, BufReader},
    net::SocketAddr,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::stream::{FuturesUnordered, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{
    self, server::AllowAnyAuthenticatedClient, RootCertStore, ServerConfig,
};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth::Certificate;
use crate::settings::TlsSettings;
use crate::InitializeBrokerError;

pub(crate) enum TransportBuilder {
    Tcp(String),
    Tls(String, TlsAcceptor),
}

impl TransportBuilder {
    pub(crate) fn tcp(addr: impl Into<String>) -> Self {
        TransportBuilder::Tcp(addr.into())
    }

    /// Builds a TLS listener from the `tls` config section. When a CA file
    /// is configured, clients must present a certificate signed by it; the
    /// certificate is handed to the authenticator at CONNECT time.
    pub(crate) fn tls(
        addr: impl Into<String>,
        settings: &TlsSettings,
    ) -> Result<Self, InitializeBrokerError> {
        let cert_path = settings
            .cert_file()
            .ok_or_else(|| InitializeBrokerError::NoCertificate("cert_file".into()))?;
        let key_path = settings
            .key_file()
            .ok_or_else(|| InitializeBrokerError::NoPrivateKey("key_file".into()))?;

        info!("loading server identity from {}", cert_path.display());
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let builder = ServerConfig::builder().with_safe_defaults();
        let config = match settings.ca_file() {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots
                        .add(&cert)
                        .map_err(InitializeBrokerError::Tls)?;
                }
                builder
                    .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
                    .with_single_cert(certs, key)
                    .map_err(InitializeBrokerError::Tls)?
            }
            None => builder
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(InitializeBrokerError::Tls)?,
        };

        let acceptor = TlsAcceptor::from(Arc::new(config));
        Ok(TransportBuilder::Tls(addr.into(), acceptor))
    }

    pub(crate) async fn build(self) -> Result<Transport, InitializeBrokerError> {
        match self {
            TransportBuilder::Tcp(addr) => Transport::new_tcp(addr).await,
            TransportBuilder::Tls(addr, acceptor) => Transport::new_tls(addr, acceptor).await,
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<rustls::Certificate>, InitializeBrokerError> {
    let file = File::open(path)
        .map_err(|e| InitializeBrokerError::ReadFile(path.to_path_buf(), e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| InitializeBrokerError::ReadFile(path.to_path_buf(), e))?;

    if certs.is_empty() {
        return Err(InitializeBrokerError::NoCertificate(path.to_path_buf()));
    }

    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, InitializeBrokerError> {
    let file = File::open(path)
        .map_err(|e| InitializeBrokerError::ReadFile(path.to_path_buf(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| InitializeBrokerError::ReadFile(path.to_path_buf(), e))?
        {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
            Some(_) => continue,
            None => return Err(InitializeBrokerError::NoPrivateKey(path.to_path_buf())),
        }
    }
}

pub(crate) enum Transport {
    Tcp(TcpListener),
    Tls(TcpListener, TlsAcceptor),
}

impl Transport {
    async fn new_tcp(addr: String) -> Result<Self, InitializeBrokerError> {
        let tcp = TcpListener::bind(&addr)
            .await
            .map_err(|e| InitializeBrokerError::BindServer(addr, e))?;

        Ok(Transport::Tcp(tcp))
    }

    async fn new_tls(addr: String, acceptor: TlsAcceptor) -> Result<Self, InitializeBrokerError> {
        let tcp = TcpListener::bind(&addr)
            .await
            .map_err(|e| InitializeBrokerError::BindServer(addr, e))?;

        Ok(Transport::Tls(tcp, acceptor))
    }

    pub(crate) fn incoming(self) -> Incoming {
        match self {
            Self::Tcp(listener) => Incoming::Tcp(IncomingTcp::new(listener)),
            Self::Tls(listener, acceptor) => Incoming::Tls(IncomingTls::new(listener, acceptor)),
        }
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr, InitializeBrokerError> {
        let addr = match self {
            Self::Tcp(listener) => listener.local_addr(),
            Self::Tls(listener, _) => listener.local_addr(),
        };
        addr.map_err(InitializeBrokerError::ConnectionLocalAddress)
    }
}

type HandshakeFuture =
    Pin<Box<dyn Future<Output = io::Result<TlsStream<TcpStream>>> + Send>>;

pub(crate) enum Incoming {
    Tcp(IncomingTcp),
    Tls(IncomingTls),
}

impl Stream for Incoming {
    type Item = io::Result<StreamSelector>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            Self::Tcp(incoming) => Pin::new(incoming).poll_next(cx),
            Self::Tls(incoming) => Pin::new(incoming).poll_next(cx),
        }
    }
}

pub(crate) struct IncomingTcp {
    listener: TcpListener,
}

impl IncomingTcp {
    fn new(listener: TcpListener) -> Self {
        Self { listener }
    }
}

impl Stream for IncomingTcp {
    type Item = io::Result<StreamSelector>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.listener.poll_accept(cx) {
            Poll::Ready(Ok((tcp, _))) => match tcp.set_nodelay(true) {
                Ok(()) => {
                    debug!("accepted TCP connection");
                    Poll::Ready(Some(Ok(StreamSelector::Tcp(tcp))))
                }
                Err(err) => {
                    warn!(
                        "dropping client: unable to set socket options: {}",
                        err
                    );
                    Poll::Ready(Some(Err(err)))
                }
            },
            Poll::Ready(Err(err)) => {
                error!(
                    "dropping client that never finished the TCP handshake: {}",
                    err
                );
                Poll::Ready(Some(Err(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) struct IncomingTls {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    connections: FuturesUnordered<HandshakeFuture>,
}

impl IncomingTls {
    fn new(listener: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self {
            listener,
            acceptor,
            connections: FuturesUnordered::default(),
        }
    }
}

impl Stream for IncomingTls {
    type Item = io::Result<StreamSelector>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, _))) => match stream.set_nodelay(true) {
                    Ok(()) => {
                        let acceptor = self.acceptor.clone();
                        self.connections
                            .push(Box::pin(async move { acceptor.accept(stream).await }));
                    }
                    Err(err) => warn!(
                        "dropping client: unable to set socket options: {}",
                        err
                    ),
                },
                Poll::Ready(Err(err)) => warn!(
                    "dropping client that never finished the TCP handshake: {}",
                    err
                ),
                Poll::Pending => break,
            }
        }

        loop {
            if self.connections.is_empty() {
                return Poll::Pending;
            }

            match Pin::new(&mut self.connections).poll_next(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    debug!("accepted TLS connection");
                    return Poll::Ready(Some(Ok(StreamSelector::Tls(Box::new(stream)))));
                }

                Poll::Ready(Some(Err(err))) => warn!(
                    "dropping client that failed the TLS handshake: {}",
                    err
                ),

                Poll::Ready(None) => {
                    debug!("no TLS handshakes in progress");
                    return Poll::Pending;
                }

                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pub(crate) enum StreamSelector {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl StreamSelector {
    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            StreamSelector::Tcp(stream) => stream.peer_addr(),
            StreamSelector::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// The client certificate presented during the TLS handshake, if any.
    pub(crate) fn peer_certificate(&self) -> Option<Certificate> {
        match self {
            StreamSelector::Tcp(_) => None,
            StreamSelector::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| Certificate::from(cert.0.clone())),
        }
    }
}

impl AsyncRead for StreamSelector {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamSelector::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            StreamSelector::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamSelector {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            StreamSelector::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            StreamSelector::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamSelector::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            StreamSelector::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamSelector::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            StreamSelector::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

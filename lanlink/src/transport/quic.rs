//! Direct peer-to-peer channel over QUIC.
//!
//! A [`ChannelContainer`] is one QUIC endpoint that both accepts and dials.
//! Its `ip:port` candidates are advertised through the relay; the answering
//! peer dials them and the offering peer accepts. Each connection carries a
//! single bidirectional stream of length-prefixed
//! [`ChannelFrame`]s, and the dialer's first frame is always
//! [`ChannelFrame::Hello`].
//!
//! QUIC TLS provides transport encryption only; certificates are ephemeral
//! and not verified.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanlink_proto::channel::{self, ChannelFrame, LENGTH_PREFIX};
use lanlink_proto::signal::SessionId;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};

use super::TransportError;

/// Server name presented when dialing; certificates are not verified.
const SERVER_NAME: &str = "lanlink";

/// Keep-alive interval so a vanished peer is noticed.
const KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Idle timeout after which a silent connection is considered lost.
const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// How long the acceptor waits for a dialer's hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Endpoint crypto
// ---------------------------------------------------------------------------

fn setup_error(what: &str, err: impl std::fmt::Display) -> TransportError {
    TransportError::Io(std::io::Error::other(format!("{what}: {err}")))
}

fn tuned_transport() -> Result<Arc<quinn::TransportConfig>, TransportError> {
    let idle = quinn::IdleTimeout::try_from(IDLE_TIMEOUT)
        .map_err(|e| setup_error("idle timeout out of range", e))?;
    let mut transport = quinn::TransportConfig::default();
    transport
        .keep_alive_interval(Some(KEEP_ALIVE))
        .max_idle_timeout(Some(idle));
    Ok(Arc::new(transport))
}

/// Acceptor side: a throwaway self-signed identity for this endpoint only.
fn ephemeral_server() -> Result<quinn::ServerConfig, TransportError> {
    let identity = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()])
        .map_err(|e| setup_error("self-signed identity", e))?;
    let key = PrivatePkcs8KeyDer::from(identity.key_pair.serialize_der());
    let mut server = quinn::ServerConfig::with_single_cert(vec![identity.cert.into()], key.into())
        .map_err(|e| setup_error("acceptor TLS", e))?;
    server.transport_config(tuned_transport()?);
    Ok(server)
}

/// Dialer side: TLS 1.3, any certificate accepted.
fn trusting_client() -> Result<quinn::ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| setup_error("dialer TLS", e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| setup_error("dialer QUIC crypto", e))?;
    let mut client = quinn::ClientConfig::new(Arc::new(quic));
    client.transport_config(tuned_transport()?);
    Ok(client)
}

/// Peers are found through the room, not through a PKI, so there is no
/// identity to check against.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Addresses under which a container bound to `bound` can be reached.
///
/// A specific bind address is its own only candidate. For an unspecified
/// address every IPv4 interface that is neither loopback nor link-local is
/// listed, falling back to loopback when there is none.
#[must_use]
pub fn gather_candidates(bound: SocketAddr) -> Vec<SocketAddr> {
    if !bound.ip().is_unspecified() {
        return vec![bound];
    }

    let mut candidates = Vec::new();
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => {
            for (name, ip) in interfaces {
                if let IpAddr::V4(v4) = ip
                    && !v4.is_loopback()
                    && !v4.is_link_local()
                {
                    tracing::debug!(iface = %name, ip = %v4, "gathered candidate");
                    let addr = SocketAddr::new(ip, bound.port());
                    if !candidates.contains(&addr) {
                        candidates.push(addr);
                    }
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to list network interfaces"),
    }

    if candidates.is_empty() {
        candidates.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port()));
    }
    candidates
}

// ---------------------------------------------------------------------------
// ChannelContainer
// ---------------------------------------------------------------------------

/// A QUIC endpoint hosting direct channels for one negotiation.
pub struct ChannelContainer {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    candidates: Vec<SocketAddr>,
    max_frame_size: usize,
}

impl std::fmt::Debug for ChannelContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelContainer")
            .field("local_addr", &self.local_addr)
            .field("candidates", &self.candidates)
            .finish_non_exhaustive()
    }
}

impl ChannelContainer {
    /// Binds an endpoint that can both accept and dial.
    ///
    /// Use port 0 to let the OS pick a port.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the address cannot be bound or the
    /// TLS configuration fails.
    pub async fn bind(addr: SocketAddr, max_frame_size: usize) -> Result<Self, TransportError> {
        let mut endpoint = quinn::Endpoint::server(ephemeral_server()?, addr)?;
        endpoint.set_default_client_config(trusting_client()?);

        let local_addr = endpoint.local_addr()?;
        let candidates = gather_candidates(local_addr);
        tracing::debug!(addr = %local_addr, candidates = candidates.len(), "channel container bound");
        Ok(Self {
            endpoint,
            local_addr,
            candidates,
            max_frame_size,
        })
    }

    /// The bound socket address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Addresses to advertise as candidates.
    #[must_use]
    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    /// Waits for the next dialer and reads its hello.
    ///
    /// Returns the channel together with the dialer's session and the
    /// session it asked for.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the endpoint is
    /// closed; other errors concern only the one failed incoming connection.
    pub async fn accept(&self) -> Result<(DirectChannel, SessionId, SessionId), TransportError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(TransportError::ConnectionClosed)?;

        let connection = incoming.await.map_err(|e| {
            tracing::warn!(error = %e, "QUIC accept handshake failed");
            map_connection_error(e, "incoming")
        })?;
        let remote = connection.remote_address();

        let (send, recv) = tokio::time::timeout(HELLO_TIMEOUT, connection.accept_bi())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                tracing::warn!(error = %e, addr = %remote, "QUIC stream accept failed");
                map_connection_error(e, &remote.to_string())
            })?;

        let mut channel = DirectChannel {
            connection,
            writer: FrameWriter {
                send,
                max_frame_size: self.max_frame_size,
            },
            reader: FrameReader {
                recv,
                max_frame_size: self.max_frame_size,
            },
        };

        let hello = tokio::time::timeout(HELLO_TIMEOUT, channel.reader.read_frame())
            .await
            .map_err(|_| TransportError::Timeout)??;
        match hello {
            ChannelFrame::Hello { session, target } => {
                tracing::debug!(addr = %remote, session = %session, "accepted direct channel");
                Ok((channel, session, target))
            }
            other => {
                channel.close();
                Err(TransportError::Protocol(format!(
                    "expected hello, got {other:?}"
                )))
            }
        }
    }

    /// Dials `addr` and introduces this side with a hello frame.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish in time.
    /// - [`TransportError::Unreachable`] if the address cannot be dialed.
    /// - [`TransportError::ConnectionClosed`] or [`TransportError::Io`] for
    ///   stream failures.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        session: SessionId,
        target: SessionId,
        timeout: Duration,
    ) -> Result<DirectChannel, TransportError> {
        let label = addr.to_string();
        let connecting = self.endpoint.connect(addr, SERVER_NAME).map_err(|e| {
            tracing::warn!(error = %e, addr = %addr, "QUIC connect initiation failed");
            TransportError::Unreachable(label.clone())
        })?;

        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| {
                tracing::debug!(addr = %addr, timeout_ms = timeout.as_millis(), "QUIC dial timed out");
                TransportError::Timeout
            })?
            .map_err(|e| map_connection_error(e, &label))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| map_connection_error(e, &label))?;

        let mut channel = DirectChannel {
            connection,
            writer: FrameWriter {
                send,
                max_frame_size: self.max_frame_size,
            },
            reader: FrameReader {
                recv,
                max_frame_size: self.max_frame_size,
            },
        };
        // The hello also flushes the STREAM frame so the acceptor's
        // accept_bi() returns.
        channel
            .writer
            .write_frame(&ChannelFrame::Hello { session, target })
            .await?;
        tracing::debug!(addr = %addr, "dialed direct channel");
        Ok(channel)
    }

    /// Closes the endpoint and every connection on it.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

// ---------------------------------------------------------------------------
// DirectChannel
// ---------------------------------------------------------------------------

/// One open direct channel: a QUIC connection with one bidirectional stream.
pub struct DirectChannel {
    connection: quinn::Connection,
    writer: FrameWriter,
    reader: FrameReader,
}

impl std::fmt::Debug for DirectChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectChannel")
            .field("remote", &self.connection.remote_address())
            .finish_non_exhaustive()
    }
}

impl DirectChannel {
    /// Address of the remote side.
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Splits the channel into its write half, read half and a close handle.
    #[must_use]
    pub fn split(self) -> (FrameWriter, FrameReader, ChannelCloser) {
        (self.writer, self.reader, ChannelCloser(self.connection))
    }

    /// Closes the connection immediately.
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"closed");
    }
}

/// Closes a split channel's connection.
#[derive(Debug, Clone)]
pub struct ChannelCloser(quinn::Connection);

impl ChannelCloser {
    /// Closes the connection; pending reads and writes on both halves fail.
    pub fn close(&self) {
        self.0.close(0u32.into(), b"closed");
    }
}

/// Write half of a direct channel.
#[derive(Debug)]
pub struct FrameWriter {
    send: quinn::SendStream,
    max_frame_size: usize,
}

impl FrameWriter {
    /// Writes one length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Codec`] for oversized frames and
    /// [`TransportError::ConnectionClosed`] once the peer is gone.
    pub async fn write_frame(&mut self, frame: &ChannelFrame) -> Result<(), TransportError> {
        let bytes = channel::encode_framed(frame, self.max_frame_size)?;
        self.send.write_all(&bytes).await.map_err(|e| {
            tracing::debug!(error = %e, "direct channel write failed");
            map_write_error(e)
        })
    }

    /// Signals the end of this side's stream.
    pub fn finish(&mut self) {
        if let Err(e) = self.send.finish() {
            tracing::debug!(error = %e, "direct channel already finished");
        }
    }
}

/// Read half of a direct channel.
#[derive(Debug)]
pub struct FrameReader {
    recv: quinn::RecvStream,
    max_frame_size: usize,
}

impl FrameReader {
    /// Reads the next frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] when the stream or
    /// connection ends, and [`TransportError::Codec`] for oversized or
    /// undecodable frames.
    pub async fn read_frame(&mut self) -> Result<ChannelFrame, TransportError> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        self.recv
            .read_exact(&mut prefix)
            .await
            .map_err(map_read_exact_error)?;
        let len = channel::payload_len(prefix, self.max_frame_size)?;

        let mut payload = vec![0u8; len];
        self.recv
            .read_exact(&mut payload)
            .await
            .map_err(map_read_exact_error)?;
        Ok(channel::decode(&payload)?)
    }
}

// ---------------------------------------------------------------------------
// Error mapping helpers
// ---------------------------------------------------------------------------

/// Map a quinn `ConnectionError` to the appropriate `TransportError`.
fn map_connection_error(err: quinn::ConnectionError, addr: &str) -> TransportError {
    match err {
        quinn::ConnectionError::TimedOut => TransportError::Timeout,
        quinn::ConnectionError::ConnectionClosed(_)
        | quinn::ConnectionError::ApplicationClosed(_)
        | quinn::ConnectionError::LocallyClosed
        | quinn::ConnectionError::Reset => TransportError::ConnectionClosed,
        quinn::ConnectionError::CidsExhausted
        | quinn::ConnectionError::VersionMismatch
        | quinn::ConnectionError::TransportError(_) => TransportError::Unreachable(addr.to_string()),
    }
}

/// Map a quinn `WriteError` to a `TransportError`.
fn map_write_error(err: quinn::WriteError) -> TransportError {
    match err {
        quinn::WriteError::ConnectionLost(_)
        | quinn::WriteError::ClosedStream
        | quinn::WriteError::Stopped(_) => TransportError::ConnectionClosed,
        other => TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("QUIC write error: {other}"),
        )),
    }
}

/// Map a quinn `ReadExactError` to a `TransportError`.
fn map_read_exact_error(err: quinn::ReadExactError) -> TransportError {
    match err {
        quinn::ReadExactError::FinishedEarly(_) => TransportError::ConnectionClosed,
        quinn::ReadExactError::ReadError(read_err) => match read_err {
            quinn::ReadError::ConnectionLost(_)
            | quinn::ReadError::ClosedStream
            | quinn::ReadError::Reset(_) => TransportError::ConnectionClosed,
            other => TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("QUIC read error: {other}"),
            )),
        },
    }
}

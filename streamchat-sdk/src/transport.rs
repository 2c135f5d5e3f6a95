//! TCP/TLS transport for the platform's IRC chat server.
//!
//! [`IrcConnector`] opens the socket, logs in with the bot's credential and
//! joins the channel. Each connection gets a background reader task that
//! answers PINGs and forwards inbound [`Event`]s to a channel shared across
//! reconnects, so the owning process sees one continuous stream.
//!
//! TLS is used when requested or when the address ends in `:6697`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};

use crate::adapter::{Adapter, Connector};
use crate::error::TransportError;
use crate::event::Event;
use crate::irc::Message;

/// Default chat server (TLS).
pub const DEFAULT_SERVER: &str = "irc.chat.twitch.tv:6697";

const CAPABILITIES: &str = "twitch.tv/membership twitch.tv/tags twitch.tv/commands";
#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("enable the `aws-lc-rs` or `ring` feature for TLS");

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const PHASE_HANDSHAKE: u8 = 0;
const PHASE_LIVE: u8 = 1;
const PHASE_DROPPED: u8 = 2;
const PHASE_QUITTING: u8 = 3;
const PHASE_CLOSED: u8 = 4;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens [`IrcAdapter`]s against one server address.
#[derive(Debug, Clone)]
pub struct IrcConnector {
    server_addr: String,
    tls: bool,
    tls_insecure: bool,
    handshake_timeout: Duration,
    events: mpsc::Sender<Event>,
}

impl IrcConnector {
    pub fn new(server_addr: impl Into<String>, events: mpsc::Sender<Event>) -> Self {
        Self {
            server_addr: server_addr.into(),
            tls: false,
            tls_insecure: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            events,
        }
    }

    /// Force TLS even when the port is not 6697.
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Skip TLS certificate verification (for self-signed certs).
    pub fn tls_insecure(mut self, insecure: bool) -> Self {
        self.tls_insecure = insecure;
        self
    }

    /// How long `open` waits for RPL_WELCOME before giving up on the
    /// connection.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }
}

#[async_trait]
impl Connector for IrcConnector {
    async fn open(
        &self,
        channel: &str,
        user: &str,
        credential: &str,
    ) -> Result<Box<dyn Adapter>, TransportError> {
        let (reader, writer) =
            establish_connection(&self.server_addr, self.tls, self.tls_insecure).await?;
        let adapter = IrcAdapter::start(
            reader,
            writer,
            channel,
            user,
            credential,
            self.events.clone(),
            self.handshake_timeout,
        )
        .await?;
        Ok(Box::new(adapter))
    }
}

/// Establish TCP (and optionally TLS) connection to the server.
async fn establish_connection(
    server_addr: &str,
    tls: bool,
    tls_insecure: bool,
) -> Result<(Reader, Writer), TransportError> {
    let use_tls = tls || server_addr.ends_with(":6697");
    let mode = if use_tls { "TLS" } else { "plain" };

    tracing::debug!("Resolving {server_addr}...");
    let tcp = TcpStream::connect(server_addr).await?;
    tracing::debug!("TCP connected to {server_addr} ({mode})");

    if !use_tls {
        let (r, w) = tcp.into_split();
        return Ok((Box::new(r), Box::new(w)));
    }

    let connector = tls_connector(tls_insecure)?;
    let host = server_addr.split(':').next().unwrap_or("localhost");
    let dns_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name {host}: {e}")))?;
    let stream = connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| TransportError::Tls(format!("handshake with {server_addr} failed: {e}")))?;
    tracing::debug!("TLS handshake complete");
    let (r, w) = tokio::io::split(stream);
    Ok((Box::new(r), Box::new(w)))
}

struct Shared {
    phase: AtomicU8,
    writer: Mutex<Writer>,
    credential: RwLock<String>,
    shutdown: Notify,
}

impl Shared {
    fn phase(&self) -> u8 {
        self.phase.load(Ordering::SeqCst)
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        writer.flush().await
    }

    /// Move to `DROPPED` unless the connection is already being shut down
    /// on purpose. Returns true if this call observed an unexpected drop.
    fn mark_dropped(&self) -> bool {
        self.phase
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| match p {
                PHASE_HANDSHAKE | PHASE_LIVE => Some(PHASE_DROPPED),
                _ => None,
            })
            .is_ok()
    }
}

/// One socket to the chat server.
pub struct IrcAdapter {
    shared: Arc<Shared>,
    channel: String,
}

impl IrcAdapter {
    async fn start(
        reader: Reader,
        writer: Writer,
        channel: &str,
        user: &str,
        credential: &str,
        events: mpsc::Sender<Event>,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let channel = channel.trim_start_matches('#').to_lowercase();
        let shared = Arc::new(Shared {
            phase: AtomicU8::new(PHASE_HANDSHAKE),
            writer: Mutex::new(writer),
            credential: RwLock::new(credential.to_string()),
            shutdown: Notify::new(),
        });

        shared.write_line(&format!("CAP REQ :{CAPABILITIES}")).await?;
        let pass = pass_token(&shared.credential.read());
        shared.write_line(&format!("PASS {pass}")).await?;
        shared.write_line(&format!("NICK {}", user.to_lowercase())).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(read_loop(
            BufReader::new(reader),
            shared.clone(),
            channel.clone(),
            events,
            ready_tx,
        ));

        match tokio::time::timeout(handshake_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(TransportError::Disconnected),
            Err(_) => {
                shared.phase.store(PHASE_CLOSED, Ordering::SeqCst);
                shared.shutdown.notify_one();
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no welcome from server after {handshake_timeout:?}"),
                )));
            }
        }

        Ok(Self { shared, channel })
    }

}

#[async_trait]
impl Adapter for IrcAdapter {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        if line.contains(['\r', '\n']) {
            return Err(TransportError::Rejected(
                "line contains CR or LF".to_string(),
            ));
        }
        match self.shared.phase() {
            PHASE_HANDSHAKE => return Err(TransportError::NotConnected),
            PHASE_LIVE => {}
            _ => return Err(TransportError::Disconnected),
        }
        if let Err(e) = self.shared.write_line(line).await {
            tracing::warn!(error = %e, "Write failed, connection dropped");
            self.shared.mark_dropped();
            return Err(TransportError::Disconnected);
        }
        if line.starts_with(crate::irc::QUIT) {
            let _ = self.shared.phase.compare_exchange(
                PHASE_LIVE,
                PHASE_QUITTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.shared.phase.swap(PHASE_CLOSED, Ordering::SeqCst) == PHASE_CLOSED {
            return;
        }
        tracing::debug!(code, reason, channel = %self.channel, "Closing chat connection");
        self.shared.shutdown.notify_one();
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "Socket shutdown failed");
        }
    }

    fn set_credential(&self, credential: &str) {
        *self.shared.credential.write() = credential.to_string();
    }

    fn is_live(&self) -> bool {
        self.shared.phase() == PHASE_LIVE
    }
}

fn pass_token(credential: &str) -> String {
    if credential.starts_with("oauth:") {
        credential.to_string()
    } else {
        format!("oauth:{credential}")
    }
}

fn is_login_failure(text: &str) -> bool {
    text.contains("Login authentication failed")
        || text.contains("Improperly formatted auth")
        || text.contains("Login unsuccessful")
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    channel: String,
    events: mpsc::Sender<Event>,
    ready: oneshot::Sender<Result<(), TransportError>>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut ready = Some(ready);
    let mut line = String::new();
    // 353 replies collected per channel until 366 closes the list.
    let mut names: HashMap<String, Vec<String>> = HashMap::new();

    let reason = loop {
        line.clear();
        let read = tokio::select! {
            r = reader.read_line(&mut line) => r,
            _ = shared.shutdown.notified() => return,
        };
        match read {
            Ok(0) => break "EOF".to_string(),
            Err(e) => break e.to_string(),
            Ok(_) => {}
        }

        let Some(msg) = Message::parse(&line) else {
            continue;
        };
        match msg.command.as_str() {
            "PING" => {
                let token = msg.params.first().map(String::as_str).unwrap_or("");
                if let Err(e) = shared.write_line(&format!("PONG :{token}")).await {
                    break format!("PONG failed: {e}");
                }
            }
            // RPL_WELCOME: login accepted
            "001" => {
                let nick = msg.params.first().cloned().unwrap_or_default();
                if let Err(e) = shared.write_line(&format!("JOIN #{channel}")).await {
                    break format!("JOIN failed: {e}");
                }
                let _ = shared.phase.compare_exchange(
                    PHASE_HANDSHAKE,
                    PHASE_LIVE,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                tracing::info!(%nick, channel = %channel, "Logged in to chat");
                let _ = events.send(Event::Registered { nick }).await;
            }
            "NOTICE" => {
                let target = msg.params.first().cloned().unwrap_or_default();
                let text = msg.params.last().cloned().unwrap_or_default();
                if shared.phase() == PHASE_HANDSHAKE && is_login_failure(&text) {
                    tracing::error!(%text, "Chat server rejected login");
                    shared.phase.store(PHASE_CLOSED, Ordering::SeqCst);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(TransportError::Rejected(text)));
                    }
                    return;
                }
                let msg_id = msg.tag("msg-id").map(str::to_string);
                let _ = events.send(Event::Notice { target, text, msg_id }).await;
            }
            "RECONNECT" => {
                tracing::info!("Server requested reconnect");
                let _ = events.send(Event::Reconnect).await;
            }
            "JOIN" | "PART" => {
                let joined = msg.command == "JOIN";
                let channel = msg.params.first().cloned().unwrap_or_default();
                let nick = msg.nick().unwrap_or("").to_string();
                let event = if joined {
                    Event::Joined { channel, nick }
                } else {
                    Event::Parted { channel, nick }
                };
                let _ = events.send(event).await;
            }
            // RPL_NAMREPLY
            "353" => {
                if msg.params.len() >= 4 {
                    names
                        .entry(msg.params[2].to_lowercase())
                        .or_default()
                        .extend(msg.params[3].split_whitespace().map(str::to_string));
                }
            }
            // RPL_ENDOFNAMES
            "366" => {
                if let Some(channel) = msg.params.get(1) {
                    let nicks = names.remove(&channel.to_lowercase()).unwrap_or_default();
                    let _ = events
                        .send(Event::Names {
                            channel: channel.clone(),
                            nicks,
                        })
                        .await;
                }
            }
            "PRIVMSG" => {
                if msg.params.len() >= 2 {
                    let from = msg.nick().unwrap_or("").to_string();
                    let _ = events
                        .send(Event::Message {
                            from,
                            target: msg.params[0].clone(),
                            text: msg.params[1].clone(),
                            tags: msg.tags.clone(),
                        })
                        .await;
                }
            }
            _ => tracing::trace!(line = %line.trim_end(), "Unhandled line"),
        }
    };

    if !shared.mark_dropped() {
        return;
    }
    if let Some(tx) = ready.take()
        && tx.send(Err(TransportError::Disconnected)).is_ok()
    {
        return;
    }
    tracing::warn!(%reason, channel = %channel, "Chat connection dropped");
    let _ = events.send(Event::Disconnected { reason }).await;
}

/// Crypto backend for TLS: the process-wide default if one is installed,
/// otherwise the one selected by crate features.
fn crypto_provider() -> Arc<CryptoProvider> {
    if let Some(installed) = CryptoProvider::get_default() {
        return installed.clone();
    }
    #[cfg(feature = "ring")]
    let provider = rustls::crypto::ring::default_provider();
    #[cfg(not(feature = "ring"))]
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    Arc::new(provider)
}

fn tls_connector(insecure: bool) -> Result<TlsConnector, TransportError> {
    let provider = crypto_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let config = if insecure {
        tracing::debug!("TLS: certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyServerCert {
                algorithms: provider.signature_verification_algorithms,
            }))
    } else {
        builder.with_root_certificates(rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        })
    }
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any certificate chain (for self-signed test servers) but still
/// checks that the handshake is signed by the presented key.
#[derive(Debug)]
struct AnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Adapter wired to an in-memory server. Returns the adapter, the
    /// server's line reader, its writer and the event receiver.
    async fn start_with_welcome() -> (
        IrcAdapter,
        BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        mpsc::Receiver<Event>,
    ) {
        let (client, server) = duplex(4096);
        let (cr, cw) = tokio::io::split(client);
        let (sr, mut sw) = tokio::io::split(server);
        let (tx, rx) = mpsc::channel(16);

        sw.write_all(b":tmi.example.tv 001 bot :Welcome, GLHF!\r\n").await.unwrap();
        let adapter = IrcAdapter::start(
            Box::new(cr),
            Box::new(cw),
            "#Chan",
            "Bot",
            "secret",
            tx,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        (adapter, BufReader::new(sr), sw, rx)
    }

    async fn next_line<R: AsyncBufRead + Unpin>(r: &mut R) -> String {
        let mut s = String::new();
        r.read_line(&mut s).await.unwrap();
        s.trim_end().to_string()
    }

    #[tokio::test]
    async fn handshake_logs_in_and_joins() {
        let (adapter, mut server, _sw, mut events) = start_with_welcome().await;
        assert_eq!(next_line(&mut server).await, format!("CAP REQ :{CAPABILITIES}"));
        assert_eq!(next_line(&mut server).await, "PASS oauth:secret");
        assert_eq!(next_line(&mut server).await, "NICK bot");
        assert_eq!(next_line(&mut server).await, "JOIN #chan");
        assert!(adapter.is_live());
        assert!(matches!(events.recv().await, Some(Event::Registered { nick }) if nick == "bot"));
    }

    #[tokio::test]
    async fn answers_ping_and_forwards_chat() {
        let (adapter, mut server, mut sw, mut events) = start_with_welcome().await;
        for _ in 0..4 {
            next_line(&mut server).await;
        }
        sw.write_all(b"PING :tmi.example.tv\r\n").await.unwrap();
        assert_eq!(next_line(&mut server).await, "PONG :tmi.example.tv");

        sw.write_all(b":alice!alice@alice.tmi.example.tv PRIVMSG #chan :hello\r\n")
            .await
            .unwrap();
        let _registered = events.recv().await;
        match events.recv().await {
            Some(Event::Message { from, text, .. }) => {
                assert_eq!(from, "alice");
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected event {other:?}"),
        }

        adapter.send("PRIVMSG #chan :hi").await.unwrap();
        assert_eq!(next_line(&mut server).await, "PRIVMSG #chan :hi");
    }

    #[tokio::test]
    async fn missing_welcome_fails_open() {
        let (client, _server) = duplex(4096);
        let (cr, cw) = tokio::io::split(client);
        let (tx, _rx) = mpsc::channel(16);
        let result = IrcAdapter::start(
            Box::new(cr),
            Box::new(cw),
            "chan",
            "bot",
            "oauth:secret",
            tx,
            Duration::from_millis(20),
        )
        .await;
        match result {
            Err(TransportError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("adapter returned without a welcome"),
        }
    }

    #[tokio::test]
    async fn line_breaks_are_rejected() {
        let (adapter, mut server, _sw, _events) = start_with_welcome().await;
        for _ in 0..4 {
            next_line(&mut server).await;
        }
        let err = adapter.send("PRIVMSG #chan :hi\r\nJOIN #other").await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
        assert!(adapter.is_live(), "rejecting a line keeps the connection");

        adapter.send("PRIVMSG #chan :ok").await.unwrap();
        assert_eq!(next_line(&mut server).await, "PRIVMSG #chan :ok");
    }

    #[tokio::test]
    async fn names_parts_are_joined_until_end_of_list() {
        let (_adapter, _server, mut sw, mut events) = start_with_welcome().await;
        let _registered = events.recv().await;
        sw.write_all(
            b":tmi.example.tv 353 bot = #chan :alice bob\r\n\
              :tmi.example.tv 353 bot = #chan :carol\r\n\
              :tmi.example.tv 366 bot #chan :End of /NAMES list\r\n",
        )
        .await
        .unwrap();
        match events.recv().await {
            Some(Event::Names { channel, nicks }) => {
                assert_eq!(channel, "#chan");
                assert_eq!(nicks, vec!["alice", "bob", "carol"]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_failure_is_rejected() {
        let (client, server) = duplex(4096);
        let (cr, cw) = tokio::io::split(client);
        let (_sr, mut sw) = tokio::io::split(server);
        let (tx, _rx) = mpsc::channel(16);
        sw.write_all(b":tmi.example.tv NOTICE * :Login authentication failed\r\n")
            .await
            .unwrap();
        let result = IrcAdapter::start(
            Box::new(cr),
            Box::new(cw),
            "chan",
            "bot",
            "bad",
            tx,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn server_eof_marks_disconnected_and_emits_event() {
        let (adapter, server, sw, mut events) = start_with_welcome().await;
        let _registered = events.recv().await;
        drop(sw);
        drop(server);
        assert!(matches!(events.recv().await, Some(Event::Disconnected { .. })));
        assert!(matches!(
            adapter.send("PRIVMSG #chan :x").await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn deliberate_close_is_silent() {
        let (adapter, _server, _sw, mut events) = start_with_welcome().await;
        let _registered = events.recv().await;
        adapter.close(1000, "bye").await;
        adapter.close(1000, "bye").await;
        assert!(!adapter.is_live());
        assert!(matches!(
            adapter.send("PRIVMSG #chan :x").await,
            Err(TransportError::Disconnected)
        ));
        let quiet = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(!matches!(quiet, Ok(Some(Event::Disconnected { .. }))));
    }

    #[test]
    fn pass_token_adds_prefix_once() {
        assert_eq!(pass_token("abc"), "oauth:abc");
        assert_eq!(pass_token("oauth:abc"), "oauth:abc");
    }
}

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use crate::controls::Control;
use crate::ldap::{bind_request, Ldap};
use crate::protocol::{LdapCodec, LdapOp, OpEnvelope};
use crate::queue::RequestQueue;
use crate::result::{LdapError, LdapResult, ParsedResult, Result};
use crate::search::SearchItem;
use crate::tracker::{MessageTracker, PendingRequest, PendingSink};
use crate::RequestId;

#[cfg(feature = "tls")]
use crate::exop_impl::{construct_exop, StartTLS};

use lber::common::TagClass;
#[cfg(feature = "tls")]
use lber::structures::Sequence;
use lber::structures::{Null, Tag};

use futures_util::sink::SinkExt;
use log::{debug, warn};
#[cfg(feature = "tls")]
use native_tls::TlsConnector;
#[cfg(unix)]
use percent_encoding::percent_decode;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
#[cfg(feature = "tls")]
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Framed};
use url::Url;

#[derive(Debug)]
enum ConnType {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(TlsStream<TcpStream>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for ConnType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls).poll_read(cx, buf),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnType {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls).poll_write(cx, buf),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_flush(cx),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls).poll_flush(cx),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnType::Tcp(ts) => Pin::new(ts).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            ConnType::Tls(tls) => Pin::new(tls).poll_shutdown(cx),
            #[cfg(unix)]
            ConnType::Unix(us) => Pin::new(us).poll_shutdown(cx),
        }
    }
}

/// One server address parsed out of an LDAP URL.
///
/// The `ldap` and `ldaps` schemes name a TCP endpoint; `ldaps` additionally
/// sets `secure`, wrapping the connection in TLS from the first byte. The
/// `ldapi` scheme names a Unix domain socket through its percent-encoded
/// `path`.
#[derive(Clone, Debug)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub path: Option<String>,
}

impl ServerEndpoint {
    /// Parse an LDAP URL into an endpoint.
    pub fn parse(url: &str) -> Result<ServerEndpoint> {
        let url = Url::parse(url)?;
        let host = match url.host_str() {
            Some("") | None => String::from("localhost"),
            Some(h) => String::from(h),
        };
        match url.scheme() {
            "ldap" => Ok(ServerEndpoint {
                host,
                port: url.port().unwrap_or(389),
                secure: false,
                path: None,
            }),
            #[cfg(feature = "tls")]
            "ldaps" => Ok(ServerEndpoint {
                host,
                port: url.port().unwrap_or(636),
                secure: true,
                path: None,
            }),
            #[cfg(unix)]
            "ldapi" => {
                let path = url.host_str().unwrap_or("");
                if path.is_empty() {
                    return Err(LdapError::EmptyUnixPath);
                }
                if path.contains(':') || url.port().is_some() {
                    return Err(LdapError::PortInUnixPath);
                }
                let dec_path = percent_decode(path.as_bytes()).decode_utf8_lossy();
                Ok(ServerEndpoint {
                    host,
                    port: 0,
                    secure: false,
                    path: Some(dec_path.into_owned()),
                })
            }
            s => Err(LdapError::UnknownScheme(String::from(s))),
        }
    }
}

/// Reconnection policy: exponential backoff between connection attempts.
///
/// The delay before attempt _n_ is `initial_delay × 2ⁿ⁻¹`, capped at
/// `max_delay`. `fail_after` bounds the number of consecutive failed
/// attempts per configured server URL; once `urls × fail_after` attempts
/// fail in a row, the connection gives up. The default is to retry forever,
/// starting at 100 ms and backing off to at most 10 s.
#[derive(Clone, Debug)]
pub struct ReconnectOptions {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub fail_after: Option<u32>,
}

impl Default for ReconnectOptions {
    fn default() -> ReconnectOptions {
        ReconnectOptions {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            fail_after: None,
        }
    }
}

impl ReconnectOptions {
    pub fn new() -> ReconnectOptions {
        ReconnectOptions {
            ..Default::default()
        }
    }

    /// Set the delay before the first reconnection attempt.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the ceiling for the backoff delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Give up after this many consecutive failed attempts per server URL.
    pub fn fail_after(mut self, attempts: u32) -> Self {
        self.fail_after = Some(attempts);
        self
    }
}

/// The tunable knobs of a client: timeouts, reconnection, queueing,
/// implicit setup steps, TLS.
///
/// Built like a builder: start from [`new()`](#method.new) and chain
/// `set_*` calls for whatever should differ from the defaults. The fields
/// stay private so settings can grow without breaking callers.
#[derive(Clone, Default)]
pub struct LdapConnSettings {
    conn_timeout: Option<Duration>,
    op_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    reconnect: Option<ReconnectOptions>,
    queue_size: usize,
    queue_disabled: bool,
    no_strict_dn: bool,
    bind_dn: Option<String>,
    bind_password: Option<String>,
    #[cfg(feature = "tls")]
    connector: Option<TlsConnector>,
    #[cfg(feature = "tls")]
    starttls: bool,
    #[cfg(feature = "tls")]
    no_tls_verify: bool,
}

impl LdapConnSettings {
    /// Create an instance of the structure with default settings.
    pub fn new() -> LdapConnSettings {
        LdapConnSettings {
            ..Default::default()
        }
    }

    /// Bound how long a single connection attempt may take; expiry counts
    /// as a failed attempt. The default is no bound.
    pub fn set_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = Some(timeout);
        self
    }

    /// Set the default per-request timeout, which applies to every
    /// operation that doesn't override it with
    /// [`with_timeout()`](struct.Ldap.html#method.with_timeout). A timed
    /// out request is abandoned on the server. Defaults to `None`: requests
    /// wait indefinitely.
    pub fn set_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    /// Emit [`ConnEvent::Idle`](enum.ConnEvent.html) whenever the
    /// connection has had no outstanding requests for this long. Defaults
    /// to `None`, disabling the idle watch.
    pub fn set_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Enable automatic reconnection with the given policy. When enabled,
    /// requests submitted while the connection is down are queued and
    /// dispatched once a connection is reestablished. Defaults to
    /// disabled: the first lost connection ends the client.
    pub fn set_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Bound the number of requests held while the connection is down.
    /// Requests beyond the bound fail immediately. Zero, the default,
    /// means no bound.
    pub fn set_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Start with the request queue frozen: any request submitted while
    /// the connection is down fails immediately instead of waiting.
    pub fn set_queue_disabled(mut self, disabled: bool) -> Self {
        self.queue_disabled = disabled;
        self
    }

    /// When `false`, DN arguments of operations are passed to the server
    /// without the client-side shape check. Defaults to `true`.
    pub fn set_strict_dn(mut self, strict: bool) -> Self {
        self.no_strict_dn = !strict;
        self
    }

    /// Do an implicit simple Bind with these credentials as the last step
    /// of connection setup, before the connection is reported ready. With
    /// reconnection enabled, the bind is repeated on every reestablished
    /// connection.
    pub fn set_bind(mut self, bind_dn: &str, bind_password: &str) -> Self {
        self.bind_dn = Some(String::from(bind_dn));
        self.bind_password = Some(String::from(bind_password));
        self
    }

    #[cfg(feature = "tls")]
    /// Supply the TLS connector to use instead of one built with default
    /// settings, for callers that need custom TLS parameters. With a
    /// plain `ldap` URL, supplying a connector also implies StartTLS
    /// during setup.
    pub fn set_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    #[cfg(feature = "tls")]
    /// Upgrade plain connections to TLS with the StartTLS extended
    /// operation during setup. Off by default.
    pub fn set_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    #[cfg(feature = "tls")]
    /// Whether connection setup will attempt a StartTLS upgrade.
    pub fn starttls(&self) -> bool {
        self.starttls || self.connector.is_some()
    }

    #[cfg(not(feature = "tls"))]
    /// Always `false` when no TLS support is compiled in.
    pub fn starttls(&self) -> bool {
        false
    }

    #[cfg(feature = "tls")]
    /// Skip server certificate verification. Off by default; meant for
    /// test setups with throwaway certificates.
    pub fn set_no_tls_verify(mut self, no_tls_verify: bool) -> Self {
        self.no_tls_verify = no_tls_verify;
        self
    }

    pub(crate) fn strict_dn(&self) -> bool {
        !self.no_strict_dn
    }
}

/// Lifecycle notifications of a connection.
///
/// Events are delivered through the channel returned by
/// [`LdapConnection::events()`](struct.LdapConnection.html#method.events).
/// Error payloads carry rendered messages; the originating typed errors go
/// to the operations that caused them.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ConnEvent {
    /// A connection has completed setup and is serving requests.
    Connected,
    /// One connection attempt failed.
    ConnectError(String),
    /// Gave up connecting; the last attempt timed out.
    ConnectTimeout,
    /// Gave up connecting; the last attempt was refused.
    ConnectRefused,
    /// A socket was established, but StartTLS or the implicit bind failed.
    SetupError(String),
    /// Gave up connecting for another reason, or the socket failed while
    /// serving requests.
    Error(String),
    /// An operation received a result code outside its expected set.
    ResultError(LdapResult),
    /// A request hit its per-request timeout and was abandoned.
    Timeout,
    /// No outstanding requests for the configured idle interval.
    Idle,
    /// The server closed its end of the connection.
    End,
    /// A connection epoch ended; all outstanding requests were purged.
    Closed,
    /// The client was destroyed and will accept no further work.
    Destroyed,
}

/// Out-of-band instructions to the connection task.
#[derive(Debug)]
pub(crate) enum ConnCtl {
    Destroy(oneshot::Sender<()>),
}

enum SessionEnd {
    /// Unbind, destroy, or every handle gone: the client is finished.
    Shutdown,
    /// The socket went away; reconnection policy decides what's next.
    Closed,
}

/// Asynchronous connection to one or more LDAP servers.
///
/// Creating a connection with [`new()`](#method.new) wires up the pair of
/// the connection itself and an [`Ldap`](struct.Ldap.html) handle for
/// performing LDAP operations, but does not yet touch the network. The
/// connection must be spawned on the active Tokio executor before using
/// the handle; the [`drive!`](macro.drive.html) macro does that:
///
/// ```rust,no_run
/// # use ldapmux::LdapConnection;
/// # #[tokio::main]
/// # async fn main() {
/// let (conn, mut ldap) = LdapConnection::new("ldap://localhost:2389").unwrap();
/// ldapmux::drive!(conn);
/// # }
/// ```
///
/// The spawned task owns the socket for its whole life: it dials the next
/// server of the configured list (round-robin), runs connection setup
/// (TLS or StartTLS, then the implicit bind, when configured), serves
/// multiplexed requests, and on connection loss purges every outstanding
/// request and either reconnects with exponential backoff or finishes,
/// according to the reconnection policy. Requests submitted while no
/// connection is available wait in a FIFO queue and are replayed once
/// setup completes.
///
/// The `Ldap` handle can be freely cloned, with each clone capable of
/// launching a separate LDAP operation multiplexed on the connection.
/// Dropping the last handle will close the connection.
pub struct LdapConnection {
    servers: Vec<ServerEndpoint>,
    next_server: usize,
    settings: LdapConnSettings,
    tracker: Arc<Mutex<MessageTracker>>,
    queue: RequestQueue,
    rx: mpsc::UnboundedReceiver<OpEnvelope>,
    id_scrub_rx: mpsc::UnboundedReceiver<RequestId>,
    ctl_rx: mpsc::UnboundedReceiver<ConnCtl>,
    event_tx: mpsc::UnboundedSender<ConnEvent>,
    events: Option<mpsc::UnboundedReceiver<ConnEvent>>,
    unbinding: bool,
    destroyed: bool,
}

impl LdapConnection {
    /// Create a connection to the LDAP server specified by `url`.
    pub fn new(url: &str) -> Result<(Self, Ldap)> {
        Self::with_settings(LdapConnSettings::new(), url)
    }

    /// Create a connection to the LDAP server specified by `url`, using
    /// `settings` to specify additional parameters.
    pub fn with_settings(settings: LdapConnSettings, url: &str) -> Result<(Self, Ldap)> {
        Self::multi_with_settings(settings, &[url])
    }

    /// Create a connection that fails over across several server URLs,
    /// tried in round-robin order.
    pub fn new_multi(urls: &[&str]) -> Result<(Self, Ldap)> {
        Self::multi_with_settings(LdapConnSettings::new(), urls)
    }

    /// Create a failover connection with additional settings.
    pub fn multi_with_settings(settings: LdapConnSettings, urls: &[&str]) -> Result<(Self, Ldap)> {
        if urls.is_empty() {
            return Err(LdapError::EmptyUrlList);
        }
        let servers = urls
            .iter()
            .map(|url| ServerEndpoint::parse(url))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::conn_pair(servers, settings))
    }

    fn conn_pair(servers: Vec<ServerEndpoint>, settings: LdapConnSettings) -> (Self, Ldap) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id_scrub_tx, id_scrub_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Mutex::new(MessageTracker::new()));
        let queue = RequestQueue::new(settings.queue_size, settings.queue_disabled);
        let ldap = Ldap {
            tracker: tracker.clone(),
            tx,
            id_scrub_tx,
            ctl_tx,
            event_tx: event_tx.clone(),
            last_id: 0,
            strict_dn: settings.strict_dn(),
            default_timeout: settings.op_timeout,
            timeout: None,
            controls: None,
        };
        let conn = LdapConnection {
            servers,
            next_server: 0,
            settings,
            tracker,
            queue,
            rx,
            id_scrub_rx,
            ctl_rx,
            event_tx,
            events: Some(event_rx),
            unbinding: false,
            destroyed: false,
        };
        (conn, ldap)
    }

    /// Take the receiving end of the lifecycle event channel. Must be
    /// called before [`drive()`](#method.drive); can be called once.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnEvent>> {
        self.events.take()
    }

    fn emit(&self, event: ConnEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Repeatedly poll the connection until it exits: an unbind, a
    /// destroy, dropping every `Ldap` handle, or running out of
    /// reconnection attempts.
    pub async fn drive(mut self) -> Result<()> {
        // nobody can subscribe once drive consumes the connection; don't
        // let an unwatched channel accumulate events
        self.events = None;
        let res = self.drive_inner().await;
        self.queue.freeze();
        self.queue.purge(|| LdapError::ConnectionClosed);
        self.purge_tracker();
        res
    }

    async fn drive_inner(&mut self) -> Result<()> {
        let budget = self
            .settings
            .reconnect
            .as_ref()
            .and_then(|rec| rec.fail_after)
            .map(|fa| fa as u64 * self.servers.len() as u64);
        let mut attempts: u64 = 0;
        loop {
            if self.destroyed || self.unbinding {
                return Ok(());
            }
            match self.connect_and_setup().await {
                Ok(stream) => {
                    attempts = 0;
                    match self.session(stream).await {
                        SessionEnd::Shutdown => return Ok(()),
                        SessionEnd::Closed => {
                            if self.settings.reconnect.is_none() {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("connect attempt failed: {}", e);
                    attempts += 1;
                    if self.settings.reconnect.is_none() {
                        // one round over the server list, then give up
                        if attempts >= self.servers.len() as u64 {
                            self.emit(exhaustion_event(&e));
                            return Err(e);
                        }
                        continue;
                    }
                    if let Some(budget) = budget {
                        if attempts >= budget {
                            self.emit(exhaustion_event(&e));
                            return Err(LdapError::ReconnectExhausted {
                                source: Box::new(e),
                            });
                        }
                    }
                    self.backoff_wait(attempts).await;
                }
            }
        }
    }

    /// Dial the next server of the list and run the setup phase on the new
    /// socket. Any failure here counts against the reconnection budget.
    async fn connect_and_setup(&mut self) -> Result<Framed<ConnType, LdapCodec>> {
        let server = self.servers[self.next_server].clone();
        self.next_server = (self.next_server + 1) % self.servers.len();
        debug!("connecting to {}:{}", server.host, server.port);
        let transport = match self.settings.conn_timeout {
            Some(timeout) => time::timeout(timeout, self.open_transport(&server))
                .await
                .map_err(|_| LdapError::ConnectTimeout)
                .and_then(|res| res),
            None => self.open_transport(&server).await,
        };
        let ctype = match transport {
            Ok(ctype) => ctype,
            Err(e) => {
                self.emit(ConnEvent::ConnectError(e.to_string()));
                return Err(e);
            }
        };
        let stream = LdapCodec.framed(ctype);
        match self.setup(stream, &server).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.emit(ConnEvent::SetupError(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open_transport(&self, server: &ServerEndpoint) -> Result<ConnType> {
        #[cfg(unix)]
        {
            if let Some(ref path) = server.path {
                return Ok(ConnType::Unix(UnixStream::connect(path.as_str()).await?));
            }
        }
        let stream = TcpStream::connect((server.host.as_str(), server.port)).await?;
        if server.secure {
            #[cfg(feature = "tls")]
            {
                let connector = Self::create_connector(&self.settings)?;
                let tls = TokioTlsConnector::from(connector)
                    .connect(&server.host, stream)
                    .await?;
                return Ok(ConnType::Tls(tls));
            }
            #[cfg(not(feature = "tls"))]
            unreachable!("ldaps scheme is rejected without TLS support");
        }
        Ok(ConnType::Tcp(stream))
    }

    /// The setup phase of a fresh socket: StartTLS when configured on a
    /// plain TCP endpoint, then the implicit simple bind. Errors abort the
    /// attempt before the connection is reported ready.
    async fn setup(
        &mut self,
        stream: Framed<ConnType, LdapCodec>,
        server: &ServerEndpoint,
    ) -> Result<Framed<ConnType, LdapCodec>> {
        #[cfg(feature = "tls")]
        let mut stream = if self.settings.starttls() && !server.secure && server.path.is_none() {
            self.starttls(stream, server).await?
        } else {
            stream
        };
        #[cfg(not(feature = "tls"))]
        let mut stream = stream;
        let _ = server;
        if let (Some(bind_dn), Some(bind_pw)) = (
            self.settings.bind_dn.clone(),
            self.settings.bind_password.clone(),
        ) {
            let res = self
                .setup_exchange(&mut stream, bind_request(&bind_dn, &bind_pw))
                .await?;
            res.success()?;
        }
        Ok(stream)
    }

    /// Send one request on a connection still in setup and wait for its
    /// response. Nothing else can be outstanding during setup, so response
    /// multiplexing doesn't apply.
    async fn setup_exchange(
        &mut self,
        stream: &mut Framed<ConnType, LdapCodec>,
        req: Tag,
    ) -> Result<LdapResult> {
        let id = {
            let mut tracker = self.tracker.lock().expect("tracker mutex (setup)");
            tracker.alloc_id()
        };
        stream.send((id, req, None)).await?;
        loop {
            match stream.next().await {
                None => return Err(LdapError::ConnectionClosed),
                Some(Err(e)) => return Err(LdapError::from(e)),
                Some(Ok((resp_id, (tag, controls)))) => {
                    if resp_id != id {
                        warn!("setup: dropping response for unmatched id {}", resp_id);
                        continue;
                    }
                    self.tracker
                        .lock()
                        .expect("tracker mutex (setup rm)")
                        .remove(id);
                    let mut res = ParsedResult::parse(tag)?.result;
                    res.ctrls = controls;
                    return Ok(res);
                }
            }
        }
    }

    /// Upgrade a plain TCP connection to TLS in place.
    ///
    /// After a successful StartTLS exchange the framed transport is taken
    /// apart, so that no byte of the TLS handshake can reach the LDAP
    /// parser, and the codec is reattached on top of the TLS stream once
    /// the handshake completes.
    #[cfg(feature = "tls")]
    async fn starttls(
        &mut self,
        mut stream: Framed<ConnType, LdapCodec>,
        server: &ServerEndpoint,
    ) -> Result<Framed<ConnType, LdapCodec>> {
        if let ConnType::Tls(_) = stream.get_ref() {
            return Ok(stream);
        }
        let req = Tag::Sequence(Sequence {
            id: 23,
            class: TagClass::Application,
            inner: construct_exop(StartTLS.into()),
        });
        let res = self.setup_exchange(&mut stream, req).await?;
        res.success()?;
        let parts = stream.into_parts();
        let tcp = match parts.io {
            ConnType::Tcp(stream) => stream,
            _ => unreachable!("StartTLS on a non-TCP transport"),
        };
        let connector = Self::create_connector(&self.settings)?;
        let tls = TokioTlsConnector::from(connector)
            .connect(&server.host, tcp)
            .await?;
        Ok(parts.codec.framed(ConnType::Tls(tls)))
    }

    #[cfg(feature = "tls")]
    fn create_connector(settings: &LdapConnSettings) -> Result<TlsConnector> {
        match settings.connector {
            Some(ref connector) => Ok(connector.clone()),
            None => {
                let mut builder = TlsConnector::builder();
                if settings.no_tls_verify {
                    builder.danger_accept_invalid_certs(true);
                }
                Ok(builder.build()?)
            }
        }
    }

    /// Serve multiplexed requests on a ready connection until it ends.
    async fn session(&mut self, mut stream: Framed<ConnType, LdapCodec>) -> SessionEnd {
        // the queue drains strictly before anything newly submitted
        let mut backlog = std::collections::VecDeque::new();
        self.queue.flush(|env| backlog.push_back(env));
        while let Some(env) = backlog.pop_front() {
            if let Err(env) = self.send_op(&mut stream, env).await {
                self.queue
                    .requeue_front(std::iter::once(env).chain(backlog.drain(..)));
                return self.close_epoch(None);
            }
        }
        self.emit(ConnEvent::Connected);
        let idle_timeout = self.settings.idle_timeout;
        let destroy_ack;
        loop {
            let watch_idle = idle_timeout.is_some() && self.pending_count() == 0;
            let idle_delay = idle_timeout.unwrap_or(Duration::from_secs(1));
            tokio::select! {
                env = self.rx.recv() => {
                    match env {
                        None => return SessionEnd::Shutdown,
                        Some(env) => {
                            if let Err(env) = self.send_op(&mut stream, env).await {
                                self.queue.requeue_front(std::iter::once(env));
                                return self.close_epoch(None);
                            }
                        }
                    }
                },
                req_id = self.id_scrub_rx.recv() => {
                    if let Some(req_id) = req_id {
                        let mut tracker = self.tracker.lock().expect("tracker mutex (scrub)");
                        tracker.remove(req_id);
                    }
                },
                ctl = self.ctl_rx.recv() => {
                    if let Some(ConnCtl::Destroy(ack)) = ctl {
                        destroy_ack = ack;
                        break;
                    }
                },
                resp = stream.next() => {
                    match resp {
                        None => {
                            self.emit(ConnEvent::End);
                            return self.close_epoch(None);
                        }
                        Some(Err(e)) => {
                            warn!("socket receive error: {}", e);
                            return self.close_epoch(Some(e.to_string()));
                        }
                        Some(Ok((id, (tag, controls)))) => {
                            self.dispatch_response(id, tag, controls);
                        }
                    }
                },
                _ = time::sleep(idle_delay), if watch_idle => {
                    self.emit(ConnEvent::Idle);
                },
            }
        }
        self.destroy_session(stream, destroy_ack).await;
        SessionEnd::Shutdown
    }

    /// End a connection epoch: report the cause, purge every outstanding
    /// request, and leave reconnection policy to the caller.
    fn close_epoch(&mut self, error: Option<String>) -> SessionEnd {
        if let Some(msg) = error {
            self.emit(ConnEvent::Error(msg));
        }
        self.purge_tracker();
        self.emit(ConnEvent::Closed);
        if self.unbinding {
            SessionEnd::Shutdown
        } else {
            SessionEnd::Closed
        }
    }

    /// Write one request out and register its response sink.
    ///
    /// On a write error the envelope is handed back untouched, so the
    /// caller can park it in the queue for the next connection epoch.
    async fn send_op(
        &mut self,
        stream: &mut Framed<ConnType, LdapCodec>,
        env: OpEnvelope,
    ) -> std::result::Result<(), OpEnvelope> {
        if let Err(e) = stream
            .send((env.id, env.tag.clone(), env.controls.clone()))
            .await
        {
            warn!("socket send error: {}", e);
            return Err(env);
        }
        let OpEnvelope { id, op, tx, .. } = env;
        let do_shutdown = {
            let mut tracker = self.tracker.lock().expect("tracker mutex (send)");
            let mut do_shutdown = false;
            match op {
                LdapOp::Single => {
                    tracker.register(
                        id,
                        PendingRequest {
                            sink: PendingSink::Single(tx),
                        },
                    );
                }
                LdapOp::Search(item_tx) => {
                    tracker.register(
                        id,
                        PendingRequest {
                            sink: PendingSink::Search(item_tx),
                        },
                    );
                    // the request is on the wire; this is what the dispatcher
                    // awaits before handing out the stream
                    let _ = tx.send(Ok((null_tag(), vec![])));
                }
                LdapOp::Abandon(target) => {
                    tracker.abandon(target);
                    tracker.remove(id);
                    let _ = tx.send(Ok((null_tag(), vec![])));
                }
                LdapOp::Unbind => {
                    tracker.register(
                        id,
                        PendingRequest {
                            sink: PendingSink::Unbind(tx),
                        },
                    );
                    do_shutdown = true;
                }
            }
            do_shutdown
        };
        if do_shutdown {
            self.unbinding = true;
            if let Err(e) = stream.get_mut().shutdown().await {
                warn!("socket shutdown error: {}", e);
            }
        }
        Ok(())
    }

    /// Route one decoded response to its requester.
    fn dispatch_response(&mut self, id: RequestId, tag: Tag, controls: Vec<Control>) {
        let mut tracker = self.tracker.lock().expect("tracker mutex (recv)");
        if tracker.is_abandoned(id) {
            return;
        }
        if let Some(PendingRequest {
            sink: PendingSink::Search(tx),
        }) = tracker.fetch(id)
        {
            let tx = tx.clone();
            let protoop = if let Tag::StructureTag(protoop) = tag {
                protoop
            } else {
                warn!("unmatched tag structure for op {}", id);
                return;
            };
            let (item, mut remove) = match protoop.id {
                4 | 25 => (SearchItem::Entry(protoop), false),
                19 => (SearchItem::Referral(protoop), false),
                5 => (SearchItem::Done(protoop), true),
                other => {
                    warn!("unrecognized search op id: {}", other);
                    return;
                }
            };
            if tx.send((item, controls)).is_err() {
                warn!("ldap search item send error, op={}", id);
                remove = true;
            }
            if remove {
                tracker.remove(id);
            }
            return;
        }
        match tracker.remove(id) {
            Some(PendingRequest {
                sink: PendingSink::Single(tx),
            }) => {
                if tx.send(Ok((tag, controls))).is_err() {
                    warn!("ldap result send error, op={}", id);
                }
            }
            Some(PendingRequest {
                sink: PendingSink::Unbind(tx),
            }) => {
                // servers don't answer an UnbindRequest, but don't lose
                // the waiter if one does
                let _ = tx.send(Ok((tag, controls)));
            }
            Some(PendingRequest { sink: _ }) => {
                warn!("response for id {} arrived before its request", id);
            }
            None => warn!("unmatched id: {}", id),
        }
    }

    /// Fail every outstanding request of the ending epoch, except an
    /// outstanding unbind, which is what a closing connection satisfies.
    fn purge_tracker(&mut self) {
        let mut tracker = self.tracker.lock().expect("tracker mutex (purge)");
        tracker.purge(|_id, pending| match pending.sink {
            PendingSink::Single(tx) => {
                let _ = tx.send(Err(LdapError::ConnectionClosed));
            }
            // dropping the item sender terminates the search stream
            PendingSink::Search(_) => (),
            PendingSink::Unbind(tx) => {
                let _ = tx.send(Ok((null_tag(), vec![])));
            }
            PendingSink::Reserved => (),
        });
    }

    /// Sleep out the backoff delay before the next connection attempt,
    /// without going deaf: requests arriving meanwhile are queued (or
    /// failed, per queue policy), and a destroy cuts the wait short.
    async fn backoff_wait(&mut self, attempts: u64) {
        let rec = self
            .settings
            .reconnect
            .clone()
            .unwrap_or_default();
        let exp = u32::try_from(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = rec
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(rec.max_delay);
        debug!("retrying connect in {:?}", delay);
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                env = self.rx.recv() => {
                    match env {
                        None => {
                            self.unbinding = true;
                            return;
                        }
                        Some(env) => self.queue_or_fail(env),
                    }
                    if self.unbinding {
                        return;
                    }
                },
                req_id = self.id_scrub_rx.recv() => {
                    if let Some(req_id) = req_id {
                        let mut tracker = self.tracker.lock().expect("tracker mutex (scrub)");
                        tracker.remove(req_id);
                    }
                },
                ctl = self.ctl_rx.recv() => {
                    if let Some(ConnCtl::Destroy(ack)) = ctl {
                        self.destroy_now(ack);
                        return;
                    }
                },
            }
        }
    }

    /// Handle a request submitted while no connection is available.
    fn queue_or_fail(&mut self, env: OpEnvelope) {
        match env.op {
            // with nothing on the wire, an unbind is already satisfied
            LdapOp::Unbind => {
                let _ = env.tx.send(Ok((null_tag(), vec![])));
                self.unbinding = true;
            }
            // likewise, there's no in-flight request left to abandon
            LdapOp::Abandon(_) => {
                let _ = env.tx.send(Ok((null_tag(), vec![])));
            }
            _ => {
                if let Err(env) = self.queue.enqueue(env) {
                    let _ = env.tx.send(Err(LdapError::QueueUnavailable));
                }
            }
        }
    }

    /// Destroy while a connection is up: best-effort courtesy unbind, then
    /// the common teardown.
    async fn destroy_session(
        &mut self,
        mut stream: Framed<ConnType, LdapCodec>,
        ack: oneshot::Sender<()>,
    ) {
        let id = {
            let mut tracker = self.tracker.lock().expect("tracker mutex (destroy)");
            tracker.alloc_id()
        };
        let req = Tag::Null(Null {
            id: 2,
            class: TagClass::Application,
            inner: (),
        });
        let _ = stream.send((id, req, None)).await;
        let _ = stream.get_mut().shutdown().await;
        self.destroy_now(ack);
    }

    /// The common teardown: freeze and purge the queue, fail everything
    /// outstanding, and mark the client dead.
    fn destroy_now(&mut self, ack: oneshot::Sender<()>) {
        self.destroyed = true;
        self.queue.freeze();
        self.queue.purge(|| LdapError::ConnectionClosed);
        self.purge_tracker();
        self.emit(ConnEvent::Destroyed);
        let _ = ack.send(());
    }

    fn pending_count(&self) -> usize {
        self.tracker.lock().expect("tracker mutex (idle)").pending()
    }
}

fn null_tag() -> Tag {
    Tag::Null(Null {
        ..Default::default()
    })
}

fn exhaustion_event(e: &LdapError) -> ConnEvent {
    match e {
        LdapError::ConnectTimeout => ConnEvent::ConnectTimeout,
        LdapError::Io { source } if source.kind() == io::ErrorKind::ConnectionRefused => {
            ConnEvent::ConnectRefused
        }
        other => ConnEvent::Error(other.to_string()),
    }
}

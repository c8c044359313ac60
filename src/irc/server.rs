//! Server runtime: listeners, the per-connection task, keepalive, and
//! shutdown.
//!
//! One task runs each accept loop (plain and, when enabled, TLS), one task
//! runs the server-wide PING, and every connection gets its own task. The
//! connection task multiplexes the socket, the session's outbound queue,
//! the registration timer, and a keepalive tick.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_rustls::TlsAcceptor;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::tls;

use super::codec::{Frame, IrcCodec};
use super::commands::{self, CommandOutcome};
use super::message::Message;
use super::modes::WhowasEntry;
use super::names::is_valid_channel_name;
use super::oper::{OperConfigFile, OperPolicy};
use super::registry::Registry;
use super::session::{Outbound, Session};

/// Per-line read deadline.
const READ_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// Deadline for one outbound write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Cadence of the server-wide PING and the per-session keepalive check.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Combined read+write trait for type-erased client transports. Both
/// plain `TcpStream` and `TlsStream<TcpStream>` satisfy it.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A connected stream suitable for framing with [`IrcCodec`].
pub type ClientStream = Box<dyn Transport>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    OperPolicy(#[from] super::oper::OperPolicyError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Shared server state: configuration, operator policy, and the registry.
pub struct Server {
    config: RwLock<Arc<Config>>,
    opers: RwLock<Arc<OperPolicy>>,
    pub registry: Registry,
    shutdown: watch::Sender<bool>,
    /// Where the configuration came from, for REHASH. None means the
    /// built-in defaults are in effect and REHASH is a no-op.
    config_path: Option<PathBuf>,
}

impl Server {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Arc<Self>, ServerError> {
        let opers = load_oper_policy(&config)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            opers: RwLock::new(Arc::new(opers)),
            registry: Registry::new(),
            shutdown,
            config_path,
        }))
    }

    /// The active configuration. Handlers take one snapshot per command;
    /// REHASH swaps the Arc underneath.
    pub async fn config(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }

    pub async fn oper_policy(&self) -> Arc<OperPolicy> {
        self.opers.read().await.clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Begin shutdown: the accept and ping loops stop, and every session
    /// is told `ERROR :Server shutting down` before its connection closes.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Re-read both configuration files. On any failure the previous
    /// configuration and policy stay active.
    pub async fn rehash(&self) -> Result<(), ServerError> {
        let Some(path) = self.config_path.as_ref() else {
            return Ok(());
        };
        let config = Config::load(path)?;
        let opers = load_oper_policy(&config)?;

        *self.config.write().await = Arc::new(config);
        *self.opers.write().await = Arc::new(opers);
        Ok(())
    }
}

/// Load the operator policy named by the main configuration. Disabled or
/// unconfigured yields the permissive rank-1 fallback.
fn load_oper_policy(config: &Config) -> Result<OperPolicy, ServerError> {
    if !config.oper_config.enable {
        return Ok(OperPolicy::disabled());
    }
    let data = std::fs::read_to_string(&config.oper_config.file)
        .map_err(crate::config::ConfigError::Io)?;
    let file: OperConfigFile =
        serde_json::from_str(&data).map_err(crate::config::ConfigError::Parse)?;
    Ok(OperPolicy::from_classes(file.classes)?)
}

/// A started server: the shared state, the bound addresses, and the task
/// handles for its loops.
pub struct Running {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub tls_addr: Option<SocketAddr>,
    pub handles: Vec<JoinHandle<()>>,
}

/// Bind the listeners and spawn the server's tasks.
pub async fn start(config: Config, config_path: Option<PathBuf>) -> Result<Running, ServerError> {
    let server = Server::new(config, config_path)?;
    let cfg = server.config().await;

    // Auto-create configured channels with the default modes.
    for name in &cfg.channels.auto_join {
        if !is_valid_channel_name(name, cfg.limits.max_channel_length) {
            warn!(channel = %name, "skipping invalid auto_join channel");
            continue;
        }
        let folded = cfg.features.case_mapping.fold(name);
        let _ = server
            .registry
            .get_or_create_channel(
                &folded,
                name,
                &cfg.channels.default_modes,
                cfg.limits.max_channels,
            )
            .await;
    }

    let plain_addr = format!("{}:{}", cfg.server.listen.host, cfg.server.listen.port);
    let listener = TcpListener::bind(&plain_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: plain_addr.clone(),
            source,
        })?;
    let addr = listener.local_addr().map_err(|source| ServerError::Bind {
        addr: plain_addr,
        source,
    })?;
    info!(%addr, "listening");

    let mut handles = vec![tokio::spawn(accept_loop(listener, Arc::clone(&server), None))];

    let tls_addr = if cfg.server.listen.enable_ssl {
        match tls::load_acceptor(
            cfg.server.ssl.cert_file.as_ref(),
            cfg.server.ssl.key_file.as_ref(),
        ) {
            Ok(acceptor) => {
                let ssl_addr = format!("{}:{}", cfg.server.listen.host, cfg.server.listen.ssl_port);
                let tls_listener =
                    TcpListener::bind(&ssl_addr)
                        .await
                        .map_err(|source| ServerError::Bind {
                            addr: ssl_addr,
                            source,
                        })?;
                let bound = tls_listener.local_addr().ok();
                if let Some(bound) = bound {
                    info!(addr = %bound, "tls listening");
                }
                handles.push(tokio::spawn(accept_loop(
                    tls_listener,
                    Arc::clone(&server),
                    Some(acceptor),
                )));
                bound
            }
            Err(e) => {
                error!("disabling TLS listener: {e}");
                None
            }
        }
    } else {
        None
    };

    handles.push(tokio::spawn(ping_loop(Arc::clone(&server))));

    Ok(Running {
        server,
        addr,
        tls_addr,
        handles,
    })
}

/// Run the server until its loops exit (i.e. until shutdown).
pub async fn run(config: Config, config_path: Option<PathBuf>) -> Result<(), ServerError> {
    let running = start(config, config_path).await?;
    for handle in running.handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Accept loop for one listener. TLS listeners carry an acceptor.
async fn accept_loop(listener: TcpListener, server: Arc<Server>, acceptor: Option<TlsAcceptor>) {
    let mut shutdown = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    handle_connection(server, socket, addr, acceptor).await;
                });
            }
        }
    }
}

/// Run one client connection from accept to teardown.
async fn handle_connection(
    server: Arc<Server>,
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    let secure = acceptor.is_some();
    let stream: ClientStream = match acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls_stream) => Box::new(tls_stream),
            Err(e) => {
                warn!(%addr, "tls handshake failed: {e}");
                return;
            }
        },
        None => Box::new(socket),
    };

    let mut framed = Framed::new(stream, IrcCodec::default());
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let session = Session::new(addr, secure, tx);

    let cfg = server.config().await;
    if !server
        .registry
        .add_connection(Arc::clone(&session), cfg.limits.max_clients)
        .await
    {
        let _ = time::timeout(
            WRITE_TIMEOUT,
            framed.send(Message::new("ERROR", vec!["Server full".into()])),
        )
        .await;
        return;
    }
    drop(cfg);

    info!(%addr, "new connection");
    let reason = session_loop(&server, &session, &mut framed, rx).await;
    teardown(&server, &session, &reason).await;
    info!(%addr, "disconnected");
}

/// The per-connection select loop. Returns the quit reason.
async fn session_loop(
    server: &Arc<Server>,
    session: &Arc<Session>,
    framed: &mut Framed<ClientStream, IrcCodec>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) -> String {
    let mut shutdown = server.shutdown_signal();

    let registration_timeout = server.config().await.limits.registration_timeout;
    let registration_timer = time::sleep(Duration::from_secs(registration_timeout));
    tokio::pin!(registration_timer);
    let mut registration_pending = true;

    let mut keepalive = time::interval(PING_INTERVAL);
    keepalive.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    keepalive.tick().await; // the first tick completes immediately

    let reason = loop {
        tokio::select! {
            read = time::timeout(READ_DEADLINE, framed.next()) => {
                match read {
                    // Per-line read deadline expired.
                    Err(_) => break "Connection timed out".to_owned(),
                    Ok(None) => break "Connection closed".to_owned(),
                    Ok(Some(Err(e))) => {
                        warn!(addr = %session.addr, "read error: {e}");
                        break "Read error".to_owned();
                    }
                    Ok(Some(Ok(Frame::Overlong))) => {
                        session.send(Message::new("ERROR", vec!["Line too long".into()]));
                    }
                    Ok(Some(Ok(Frame::Message(msg)))) => {
                        let cfg = server.config().await;
                        let exceeded = {
                            let mut st = session.state.write().await;
                            st.last_activity = Instant::now();
                            st.check_flood(
                                Instant::now(),
                                cfg.limits.flood_lines,
                                cfg.limits.flood_seconds,
                            )
                        };
                        if exceeded {
                            let who = session.state.read().await.prefix();
                            server
                                .registry
                                .send_snomask(
                                    &cfg.server.name,
                                    'f',
                                    &format!("Excess flood from {who}"),
                                )
                                .await;
                            session.send(Message::new("ERROR", vec!["Excess Flood".into()]));
                            break "Excess Flood".to_owned();
                        }
                        drop(cfg);

                        match commands::dispatch(server, session, msg).await {
                            CommandOutcome::Continue => {}
                            CommandOutcome::Quit(reason) => break reason,
                        }

                        if registration_pending && session.is_registered().await {
                            registration_pending = false;
                        }
                    }
                }
            }

            // Outbound traffic: replies queued by our own handlers and
            // lines broadcast by other sessions' tasks.
            out = rx.recv() => {
                match out {
                    Some(Outbound::Line(msg)) => {
                        match time::timeout(WRITE_TIMEOUT, framed.send(msg)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(addr = %session.addr, "write error: {e}");
                                break "Write error".to_owned();
                            }
                            Err(_) => {
                                warn!(addr = %session.addr, "write deadline expired");
                                break "Write timeout".to_owned();
                            }
                        }
                    }
                    Some(Outbound::Disconnect(reason)) => break reason,
                    None => break "Connection closed".to_owned(),
                }
            }

            // Registration timeout: single-shot, armed until registered.
            _ = &mut registration_timer, if registration_pending => {
                registration_pending = false;
                if !session.is_registered().await {
                    session.send(Message::new("ERROR", vec!["Registration timeout".into()]));
                    break "Registration timeout".to_owned();
                }
            }

            // Keepalive: enforce the PONG deadline set by the ping loop.
            _ = keepalive.tick() => {
                let cfg = server.config().await;
                let st = session.state.read().await;
                let overdue = st.registered
                    && st.waiting_for_pong
                    && st.last_pong.elapsed() > Duration::from_secs(cfg.limits.ping_timeout);
                drop(st);
                if overdue {
                    session.send(Message::new("ERROR", vec!["Ping timeout".into()]));
                    break "Ping timeout".to_owned();
                }
            }

            _ = shutdown.changed() => {
                session.send(Message::new("ERROR", vec!["Server shutting down".into()]));
                break "Server shutting down".to_owned();
            }
        }
    };

    // Flush whatever is already queued (the ERROR line, KILL notices, ...).
    rx.close();
    while let Ok(out) = rx.try_recv() {
        if let Outbound::Line(msg) = out {
            if time::timeout(WRITE_TIMEOUT, framed.send(msg)).await.is_err() {
                break;
            }
        }
    }

    reason
}

/// Server-wide PING: every 30 s, ping registered sessions that are not
/// already waiting on a PONG. The per-session keepalive enforces the
/// deadline.
async fn ping_loop(server: Arc<Server>) {
    let mut shutdown = server.shutdown_signal();
    let mut ticker = time::interval(PING_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let cfg = server.config().await;
                for session in server.registry.sessions().await {
                    let mut st = session.state.write().await;
                    if !st.registered || st.waiting_for_pong {
                        continue;
                    }
                    st.waiting_for_pong = true;
                    drop(st);
                    session.send(Message::new("PING", vec![cfg.server.name.clone()]));
                }
            }
        }
    }
}

/// Remove a departing session everywhere: QUIT to channel peers (each peer
/// once, however many channels are shared), membership and registry
/// removal, WHOWAS, and the disconnect snomask.
async fn teardown(server: &Arc<Server>, session: &Arc<Session>, reason: &str) {
    let cfg = server.config().await;

    let (registered, nick, user, host, realname, prefix, channels) = {
        let st = session.state.read().await;
        (
            st.registered,
            st.nick.clone(),
            st.user.clone(),
            st.host.clone(),
            st.realname.clone(),
            st.prefix(),
            st.channels.iter().cloned().collect::<Vec<_>>(),
        )
    };

    if registered {
        let quit = Message::from_source(&prefix, "QUIT", vec![reason.to_owned()]);
        let mut seen: HashSet<u64> = HashSet::from([session.id]);
        for folded in &channels {
            if let Some(chan) = server.registry.channel(folded).await {
                let members: Vec<Arc<Session>> =
                    chan.state.read().await.members.values().cloned().collect();
                for member in members {
                    if seen.insert(member.id) {
                        member.send(quit.clone());
                    }
                }
            }
        }
    }

    let folded_nick = if nick.is_empty() {
        None
    } else {
        Some(cfg.features.case_mapping.fold(&nick))
    };

    for folded in &channels {
        if let Some(chan) = server.registry.channel(folded).await {
            let empty = match folded_nick.as_deref() {
                Some(key) => chan.state.write().await.remove_member(key),
                None => chan.state.read().await.members.is_empty(),
            };
            if empty {
                server.registry.remove_channel(folded).await;
            }
        }
    }

    server
        .registry
        .remove_connection(session.id, folded_nick.as_deref())
        .await;

    if registered {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        server
            .registry
            .record_whowas(WhowasEntry {
                nick: nick.clone(),
                user: user.clone(),
                host: host.clone(),
                realname,
                disconnect_time: now,
            })
            .await;
        server
            .registry
            .send_snomask(
                &cfg.server.name,
                'c',
                &format!("Client disconnect: {nick} ({user}@{host})"),
            )
            .await;
    }
}

use crate::config::{ServerOptions, TlsSettings};
use crate::connection::Connection;
use crate::dns::{HickoryReverseLookup, NoReverseLookup, ReverseLookup};
use crate::handler::SmtpHandler;
use crate::metrics::{CONNECTION_GAUGE, TOTAL_CONNECTIONS};
use crate::session::canonical_ip;
use crate::tls::{build_contexts, server_config, SniCertResolver};
use anyhow::Context as _;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Notify};
use tokio_rustls::TlsAcceptor;

/// Supervisor-level happenings surfaced to the host on the event
/// channel. Peer-level protocol errors are not reported here; they
/// are part of normal service.
#[derive(Debug)]
pub enum ServerEvent {
    /// The accept loop hit an error. The loop keeps running.
    ListenerError(String),
    /// A connection task died on a transport error mid-transaction.
    ConnectionError { session_id: String, error: String },
}

/// Shutdown progression, broadcast to every connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    Running,
    /// Stop accepting; serving connections close once idle.
    Draining,
    /// Grace expired; connections are told 421 and dropped.
    Force,
}

pub(crate) struct ServerContext {
    pub options: ServerOptions,
    pub server_name: String,
    pub handler: Arc<dyn SmtpHandler>,
    pub resolver: Arc<dyn ReverseLookup>,
    pub tls_resolver: Arc<SniCertResolver>,
    pub tls_acceptor: TlsAcceptor,
    pub phase: watch::Sender<Phase>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
    connections: Mutex<HashSet<String>>,
    drained: Notify,
}

impl ServerContext {
    pub fn register_connection(&self, id: &str) {
        self.connections.lock().insert(id.to_string());
        CONNECTION_GAUGE.inc();
    }

    pub fn deregister_connection(&self, id: &str) {
        let mut connections = self.connections.lock();
        connections.remove(id);
        CONNECTION_GAUGE.dec();
        if connections.is_empty() {
            self.drained.notify_waiters();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn emit(&self, event: ServerEvent) {
        self.events.send(event).ok();
    }
}

/// The SMTP listener supervisor: owns the bound socket, the live
/// connection set and the TLS material.
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
}

impl Server {
    /// Bind the listener and prepare TLS material. The server does
    /// not accept connections until [`Server::run`] is awaited.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        options: ServerOptions,
        handler: impl SmtpHandler,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("bind listener")?;
        let local_addr = listener.local_addr()?;

        let server_name = options.server_name();
        let contexts = build_contexts(options.tls.as_ref(), &server_name)
            .await
            .context("building TLS contexts")?;
        let tls_resolver = Arc::new(SniCertResolver::new(contexts));
        let tls_acceptor = TlsAcceptor::from(server_config(tls_resolver.clone()));

        let resolver: Arc<dyn ReverseLookup> = if options.disable_reverse_lookup {
            Arc::new(NoReverseLookup)
        } else {
            match HickoryReverseLookup::from_system_conf() {
                Ok(resolver) => Arc::new(resolver),
                Err(err) => {
                    tracing::warn!("no system resolver available, reverse DNS disabled: {err:#}");
                    Arc::new(NoReverseLookup)
                }
            }
        };

        let (phase, _) = watch::channel(Phase::Running);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            ctx: Arc::new(ServerContext {
                options,
                server_name,
                handler: Arc::new(handler),
                resolver,
                tls_resolver,
                tls_acceptor,
                phase,
                events: events_tx,
                connections: Mutex::new(HashSet::new()),
                drained: Notify::new(),
            }),
            listener: tokio::sync::Mutex::new(Some(listener)),
            local_addr,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Swap in a different reverse-DNS collaborator.
    pub fn with_reverse_lookup(mut self, resolver: Arc<dyn ReverseLookup>) -> Self {
        // Server was just built and has not been shared yet
        match Arc::get_mut(&mut self.ctx) {
            Some(ctx) => ctx.resolver = resolver,
            None => tracing::error!("with_reverse_lookup called on a running server; ignored"),
        }
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the supervisor event channel. Yields `None` on calls
    /// after the first.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events_rx.lock().take()
    }

    /// Atomically replace the TLS material. Future handshakes use the
    /// new certificates; established sessions are untouched.
    pub async fn update_secure_context(&self, settings: Option<&TlsSettings>) -> anyhow::Result<()> {
        let contexts = build_contexts(settings, &self.ctx.server_name)
            .await
            .context("building TLS contexts")?;
        self.ctx.tls_resolver.replace(contexts);
        Ok(())
    }

    /// Accept connections until [`Server::close`] is called. Returns
    /// once the listener has shut down.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("server is already running or closed"))?;

        let mut phase_rx = self.ctx.phase.subscribe();
        if *phase_rx.borrow() > Phase::Running {
            return Ok(());
        }
        tracing::info!("{} listening on {}", self.ctx.server_name, self.local_addr);

        loop {
            tokio::select! {
                _ = phase_rx.changed() => {
                    if *phase_rx.borrow() > Phase::Running {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => self.accept_one(socket, peer),
                        Err(err) => {
                            tracing::error!("accept failed: {err:#}");
                            self.ctx.emit(ServerEvent::ListenerError(format!("{err:#}")));
                        }
                    }
                }
            }
        }

        // Dropping the listener is what closes the socket.
        drop(listener);
        tracing::debug!("accept loop stopped");
        Ok(())
    }

    fn accept_one(&self, socket: TcpStream, peer: SocketAddr) {
        let ctx = self.ctx.clone();
        TOTAL_CONNECTIONS.inc();

        let remote_ip = canonical_ip(peer.ip());
        if ctx.options.ignored_hosts.contains(&remote_ip) {
            tracing::debug!("dropping connection from ignored host {remote_ip}");
            return;
        }

        if let Some(max) = ctx.options.max_clients {
            if ctx.connection_count() >= max {
                tracing::debug!("rejecting {peer}: connection limit {max} reached");
                let name = ctx.server_name.clone();
                tokio::spawn(async move {
                    let mut socket = socket;
                    let line = format!(
                        "421 {name} Too many connected clients, try again in a moment\r\n"
                    );
                    socket.write_all(line.as_bytes()).await.ok();
                    socket.shutdown().await.ok();
                });
                return;
            }
        }

        tokio::spawn(async move {
            Connection::run(ctx, socket, peer).await;
        });
    }

    /// Two-phase graceful close: stop accepting, give open sessions
    /// up to `close_timeout` to finish, then tell the stragglers
    /// `421 Server shutting down` and drop them. Returns when the
    /// listener is closed and the connection set is empty.
    pub async fn close(&self) {
        tracing::info!("close requested, draining connections");
        self.ctx.phase.send_replace(Phase::Draining);

        let deadline = tokio::time::Instant::now() + self.ctx.options.close_timeout;
        loop {
            let notified = self.ctx.drained.notified();
            if self.ctx.connection_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let stragglers = self.ctx.connection_count();
        if stragglers > 0 {
            tracing::info!("closing {stragglers} connections that outlived the grace period");
            self.ctx.phase.send_replace(Phase::Force);
            loop {
                let notified = self.ctx.drained.notified();
                if self.ctx.connection_count() == 0 {
                    break;
                }
                notified.await;
            }
        }
    }
}

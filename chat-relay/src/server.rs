//! Accept loop and server-wide coordination.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::id::{ClientId, IdAllocator};
use crate::message::{ServerLine, write_line};
use crate::registry::Registry;
use crate::session::{ClientSession, CloseReason, SessionContext};
use crate::shutdown::ShutdownTrigger;

const REJECT_GRACE: Duration = Duration::from_secs(1);

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

struct RelayState {
    registry: Arc<Registry>,
    allocator: Arc<IdAllocator>,
    shutdown: ShutdownTrigger,
    outbound_capacity: usize,
}

impl RelayState {
    fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: Arc::clone(&self.registry),
            allocator: Arc::clone(&self.allocator),
            shutdown: self.shutdown.subscribe(),
            outbound_capacity: self.outbound_capacity,
        }
    }

    /// Raises the shutdown flag, which stops the accept loop and any session
    /// still negotiating, then tells every registered session to close.
    fn shut_down(&self) -> bool {
        if !self.shutdown.trigger() {
            return false;
        }
        let sessions = self.registry.drain();
        info!(sessions = sessions.len(), "relay shutting down");
        for session in sessions {
            session.close(CloseReason::ServerShutdown);
        }
        true
    }
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: &RelayConfig) -> Self {
        let state = RelayState {
            registry: Arc::new(Registry::new()),
            allocator: Arc::new(IdAllocator::new(config.identifiers.clone())),
            shutdown: ShutdownTrigger::new(),
            outbound_capacity: config.outbound_capacity,
        };
        Self {
            listener,
            state: Arc::new(state),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accepts clients until shutdown, then waits for every session to end.
    ///
    /// An accept error is fatal: the relay shuts down and the error is
    /// returned once all sessions have finished.
    pub async fn run(self) -> Result<()> {
        let RelayServer { listener, state } = self;
        let mut signal = state.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        let outcome = loop {
            select! {
                _ = signal.triggered() => break Ok(()),
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_exit(joined);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => admit(stream, peer, &state, &mut sessions),
                    Err(err) => {
                        error!(error = ?err, "failed to accept connection");
                        break Err(anyhow::Error::new(err).context("failed to accept connection"));
                    }
                },
            }
        };

        drop(listener);
        state.shut_down();
        while let Some(joined) = sessions.join_next().await {
            log_session_exit(joined);
        }
        info!("relay stopped");

        outcome
    }

    /// Runs until `signal` resolves, then shuts down.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handle = self.handle();
        let run = self.run();
        tokio::pin!(run);

        select! {
            result = &mut run => result,
            _ = signal => {
                handle.shutdown();
                run.await
            }
        }
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    state: &RelayState,
    sessions: &mut JoinSet<CloseReason>,
) {
    let id = match state.allocator.allocate() {
        Ok(id) => id,
        Err(err) => {
            warn!(%peer, error = %err, "rejecting connection");
            tokio::spawn(reject(stream));
            return;
        }
    };

    info!(client = %id, %peer, "client connected");
    let (reader, writer) = stream.into_split();
    let session = ClientSession::start(id, BufReader::new(reader), writer, state.session_context());
    sessions.spawn(session.run());
}

async fn reject(mut stream: TcpStream) {
    let notice = ServerLine::server_full().to_string();
    let farewell = async {
        write_line(&mut stream, &notice).await?;
        stream.shutdown().await
    };
    if let Ok(Err(err)) = tokio::time::timeout(REJECT_GRACE, farewell).await {
        warn!(error = ?err, "failed to notify rejected client");
    }
}

fn log_session_exit(joined: Result<CloseReason, JoinError>) {
    if let Err(err) = joined {
        warn!(error = ?err, "session task failed");
    }
}

/// Cloneable control surface for a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<RelayState>,
}

impl RelayHandle {
    /// Stops accepting clients and closes every session. Safe to call more
    /// than once and from any task; returns `true` for the first call.
    pub fn shutdown(&self) -> bool {
        self.state.shut_down()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.shutdown.is_triggered()
    }

    /// Identifier and nickname of every Active session, ordered by identifier.
    pub fn active_sessions(&self) -> Vec<(ClientId, String)> {
        let mut sessions: Vec<_> = self
            .state
            .registry
            .snapshot()
            .into_iter()
            .map(|session| (session.id().clone(), session.nickname()))
            .collect();
        sessions.sort();
        sessions
    }

    /// Sends `SYSTEM:<text>` to every Active session.
    pub fn announce(&self, text: &str) -> usize {
        self.state
            .registry
            .broadcast(&ServerLine::System(text.to_string()).to_string())
    }

    pub fn is_identifier_in_use(&self, id: &ClientId) -> bool {
        self.state.allocator.is_in_use(id)
    }
}

//! Per-connection protocol driver.
//!
//! A [`ClientSession`] is owned by the task spawned for its connection and
//! walks the client through negotiation and the chat loop. The
//! [`SessionHandle`] is the part other components may hold: the registry
//! keeps one per Active session to deliver broadcasts, and the server's
//! shutdown sweep uses it to ask the session to close.
//!
//! Outbound traffic goes through a bounded queue drained by a dedicated writer
//! task, so a peer that stops reading only ever fills its own queue.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::DeliveryError;
use crate::id::{ClientId, IdAllocator};
use crate::message::{ServerLine, write_line};
use crate::registry::Registry;
use crate::shutdown::ShutdownSignal;

const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Negotiating,
    Active,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `/quit`.
    Quit,
    /// The client closed its end of the stream.
    Disconnected,
    /// Reading from or writing to the client failed.
    Failed,
    /// A broadcast could not be queued for this client.
    Evicted,
    /// The server is shutting down.
    ServerShutdown,
}

impl CloseReason {
    /// Whether other clients are told that this one left. The shutdown sweep
    /// closes everyone at once, so nobody is left to tell.
    pub fn announces_departure(self) -> bool {
        !matches!(self, CloseReason::ServerShutdown)
    }
}

/// Outcome of offering a broadcast line to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The session is not Active; the line was dropped on purpose.
    Skipped,
}

/// Shared view of one session: identity, state and outbound path.
#[derive(Debug)]
pub struct SessionHandle {
    id: ClientId,
    nickname: Mutex<String>,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<String>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl SessionHandle {
    /// Creates a handle in the `Connecting` state together with the receiving
    /// end of its outbound queue.
    pub fn new(id: ClientId, outbound_capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        let (closed, _) = watch::channel(None);
        let handle = Arc::new(Self {
            id,
            nickname: Mutex::new(String::new()),
            state: Mutex::new(SessionState::Connecting),
            outbound,
            closed,
        });
        (handle, outbound_rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn nickname(&self) -> String {
        lock(&self.nickname).clone()
    }

    /// Replaces the nickname and returns the previous one.
    pub(crate) fn set_nickname(&self, nickname: String) -> String {
        std::mem::replace(&mut *lock(&self.nickname), nickname)
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Moves the session forward. A closed session stays closed.
    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    /// Queues a broadcast line for this client.
    ///
    /// Sessions that are not Active silently skip the line, which keeps
    /// broadcast traffic from interleaving with the nickname prompt. Never
    /// waits: a full queue is reported as [`DeliveryError::Backlogged`].
    pub fn send_message(&self, line: &str) -> Result<Delivery, DeliveryError> {
        if self.state() != SessionState::Active {
            return Ok(Delivery::Skipped);
        }
        self.enqueue(line.to_string())?;
        Ok(Delivery::Queued)
    }

    /// Queues a line regardless of state. Used for the session's own
    /// negotiation and `SYSTEM` replies.
    pub(crate) fn send_private(&self, line: &ServerLine) -> Result<(), DeliveryError> {
        self.enqueue(line.to_string())
    }

    fn enqueue(&self, line: String) -> Result<(), DeliveryError> {
        self.outbound.try_send(line).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Asks the session to close. Only the first call has an effect; it
    /// returns `true` and its reason is the one the session reports.
    pub fn close(&self, reason: CloseReason) -> bool {
        *lock(&self.state) = SessionState::Closed;
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.borrow()
    }

    /// Resolves with the close reason once [`close`](Self::close) was called.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` is alive: we own the sender.
                return CloseReason::Failed;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collaborators a session needs, handed in explicitly at construction.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<Registry>,
    pub allocator: Arc<IdAllocator>,
    pub shutdown: ShutdownSignal,
    pub outbound_capacity: usize,
}

pub struct ClientSession<R> {
    handle: Arc<SessionHandle>,
    lines: Lines<R>,
    registry: Arc<Registry>,
    allocator: Arc<IdAllocator>,
    shutdown: ShutdownSignal,
    writer: JoinHandle<()>,
    joined: bool,
}

impl<R> ClientSession<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Sets up the outbound path for an accepted connection and moves the
    /// session to `Negotiating`. Must be called inside a Tokio runtime.
    pub fn start<W>(id: ClientId, reader: R, writer: W, context: SessionContext) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, outbound) = SessionHandle::new(id, context.outbound_capacity);
        let writer = tokio::spawn(pump_outbound(Arc::clone(&handle), writer, outbound));
        handle.set_state(SessionState::Negotiating);

        Self {
            handle,
            lines: reader.lines(),
            registry: context.registry,
            allocator: context.allocator,
            shutdown: context.shutdown,
            writer,
            joined: false,
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Drives the session to completion and releases everything it holds.
    pub async fn run(mut self) -> CloseReason {
        let reason = match self.negotiate().await {
            Ok(()) => self.chat().await,
            Err(reason) => reason,
        };
        self.finish(reason).await
    }

    async fn negotiate(&mut self) -> Result<(), CloseReason> {
        let id = self.handle.id().clone();
        self.reply(&ServerLine::Identifier(id.clone()))?;
        self.reply(&ServerLine::prompt())?;
        debug!(client = %id, "awaiting nickname");

        let nickname = self.next_line().await?;
        self.handle.set_nickname(nickname.clone());
        self.handle.set_state(SessionState::Active);
        self.registry.add(Arc::clone(&self.handle));
        self.joined = true;

        info!(client = %id, nickname, "client joined");
        self.registry
            .broadcast_except(&id, &ServerLine::joined(&id, &nickname).to_string());
        self.reply(&ServerLine::welcome(&nickname))
    }

    async fn chat(&mut self) -> CloseReason {
        loop {
            let line = match self.next_line().await {
                Ok(line) => line,
                Err(reason) => return reason,
            };
            if let Err(reason) = self.dispatch(Command::interpret(&line)) {
                return reason;
            }
        }
    }

    fn dispatch(&self, command: Command) -> Result<(), CloseReason> {
        let id = self.handle.id();
        match command {
            Command::Chat { text } => {
                let nickname = self.handle.nickname();
                debug!(client = %id, "relaying chat line");
                self.registry
                    .broadcast_except(id, &ServerLine::chat(id, &nickname, &text).to_string());
            }
            Command::Rename { nickname } => {
                let old = self.handle.nickname();
                self.registry
                    .broadcast_except(id, &ServerLine::renamed(id, &old, &nickname).to_string());
                self.handle.set_nickname(nickname.clone());
                info!(client = %id, %old, new = %nickname, "client renamed");
                self.reply(&ServerLine::renamed_confirmation(&nickname))?;
            }
            Command::MissingNickname => self.reply(&ServerLine::missing_nickname())?,
            Command::IdentityQuery => {
                debug!(client = %id, "identifier requested");
                self.reply(&ServerLine::identity(id))?;
            }
            Command::Quit => return Err(CloseReason::Quit),
        }
        Ok(())
    }

    async fn next_line(&mut self) -> Result<String, CloseReason> {
        select! {
            biased;
            reason = self.handle.closed() => Err(reason),
            _ = self.shutdown.triggered() => Err(CloseReason::ServerShutdown),
            line = self.lines.next_line() => match line {
                Ok(Some(line)) => Ok(line),
                Ok(None) => Err(CloseReason::Disconnected),
                Err(err) => {
                    debug!(client = %self.handle.id(), error = ?err, "failed to read from client");
                    Err(CloseReason::Failed)
                }
            },
        }
    }

    fn reply(&self, line: &ServerLine) -> Result<(), CloseReason> {
        self.handle.send_private(line).map_err(|err| {
            debug!(client = %self.handle.id(), error = %err, "failed to queue reply");
            CloseReason::Failed
        })
    }

    async fn finish(self, reason: CloseReason) -> CloseReason {
        let ClientSession {
            handle,
            registry,
            allocator,
            mut writer,
            joined,
            ..
        } = self;

        handle.close(reason);
        let reason = handle.close_reason().unwrap_or(reason);
        let id = handle.id().clone();

        if joined {
            registry.remove(&id);
            let nickname = handle.nickname();
            if reason.announces_departure() {
                registry.broadcast_except(&id, &ServerLine::left(&id, &nickname).to_string());
            }
            info!(client = %id, nickname, ?reason, "client left");
        } else {
            debug!(client = %id, ?reason, "connection closed during negotiation");
        }

        // A peer that stopped reading can hold the writer forever.
        match tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(client = %id, error = ?err, "writer task panicked"),
            Err(_) => {
                debug!(client = %id, "writer did not drain in time, dropping connection");
                writer.abort();
            }
        }
        allocator.release(&id);
        reason
    }
}

/// Drains the outbound queue into the socket until the session closes.
///
/// Only the wait for the next line races the close signal. A line that has
/// started going out is always finished, so the peer never sees a torn line
/// spliced onto the next one. Once closed, lines already queued are flushed
/// before the socket is shut down.
async fn pump_outbound<W>(
    handle: Arc<SessionHandle>,
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select! {
            biased;
            _ = handle.closed() => break,
            line = outbound.recv() => line,
        };
        let Some(line) = line else { break };
        if let Err(err) = write_line(&mut writer, &line).await {
            debug!(client = %handle.id(), error = ?err, "failed to write to client");
            handle.close(CloseReason::Failed);
            return;
        }
    }

    outbound.close();
    while let Some(line) = outbound.recv().await {
        if let Err(err) = write_line(&mut writer, &line).await {
            debug!(client = %handle.id(), error = ?err, "failed to flush queued line");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(client = %handle.id(), error = ?err, "failed to shut down writer");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::timeout;

    use super::*;
    use crate::shutdown::ShutdownTrigger;

    const STEP: Duration = Duration::from_secs(1);

    #[test]
    fn send_message_skips_sessions_that_are_not_active() {
        let (handle, mut rx) = SessionHandle::new(ClientId::new("1"), 4);
        assert_eq!(handle.state(), SessionState::Connecting);
        assert_eq!(handle.send_message("early"), Ok(Delivery::Skipped));

        handle.set_state(SessionState::Negotiating);
        assert_eq!(handle.send_message("still early"), Ok(Delivery::Skipped));

        handle.set_state(SessionState::Active);
        assert_eq!(handle.send_message("hello"), Ok(Delivery::Queued));
        assert_eq!(rx.try_recv().ok().as_deref(), Some("hello"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_reports_backlog() {
        let (handle, _rx) = SessionHandle::new(ClientId::new("1"), 1);
        handle.set_state(SessionState::Active);
        assert_eq!(handle.send_message("one"), Ok(Delivery::Queued));
        assert_eq!(handle.send_message("two"), Err(DeliveryError::Backlogged));
    }

    #[test]
    fn dropped_writer_reports_closed_channel() {
        let (handle, rx) = SessionHandle::new(ClientId::new("1"), 4);
        handle.set_state(SessionState::Active);
        drop(rx);
        assert_eq!(handle.send_message("one"), Err(DeliveryError::Closed));
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_reason() {
        let (handle, _rx) = SessionHandle::new(ClientId::new("1"), 4);
        handle.set_state(SessionState::Active);
        assert!(handle.close(CloseReason::Quit));
        assert!(!handle.close(CloseReason::ServerShutdown));
        assert_eq!(handle.close_reason(), Some(CloseReason::Quit));
        assert_eq!(handle.state(), SessionState::Closed);

        handle.set_state(SessionState::Active);
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(handle.send_message("late"), Ok(Delivery::Skipped));
    }

    #[tokio::test]
    async fn closed_resolves_for_earlier_close() {
        let (handle, _rx) = SessionHandle::new(ClientId::new("1"), 4);
        handle.close(CloseReason::Evicted);
        let reason = timeout(STEP, handle.closed()).await.expect("resolved");
        assert_eq!(reason, CloseReason::Evicted);
    }

    struct Harness {
        context: SessionContext,
        trigger: ShutdownTrigger,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_capacity(16)
        }

        fn with_capacity(outbound_capacity: usize) -> Self {
            let trigger = ShutdownTrigger::new();
            let context = SessionContext {
                registry: Arc::new(Registry::new()),
                allocator: Arc::new(IdAllocator::new(1..=9)),
                shutdown: trigger.subscribe(),
                outbound_capacity,
            };
            Self { context, trigger }
        }

        fn registered(&self, id: &ClientId) -> Arc<SessionHandle> {
            self.context
                .registry
                .snapshot()
                .into_iter()
                .find(|session| session.id() == id)
                .expect("registered")
        }

        /// Starts a session over an in-memory stream and returns the client end.
        fn connect(
            &self,
        ) -> (
            tokio::task::JoinHandle<CloseReason>,
            ClientId,
            Lines<BufReader<ReadHalf<DuplexStream>>>,
            WriteHalf<DuplexStream>,
        ) {
            let id = self.context.allocator.allocate().expect("space available");
            let (server_side, client_side) = tokio::io::duplex(1024);
            let (server_read, server_write) = tokio::io::split(server_side);
            let session = ClientSession::start(
                id.clone(),
                BufReader::new(server_read),
                server_write,
                self.context.clone(),
            );
            let task = tokio::spawn(session.run());
            let (client_read, client_write) = tokio::io::split(client_side);
            (task, id, BufReader::new(client_read).lines(), client_write)
        }
    }

    async fn next(lines: &mut Lines<BufReader<ReadHalf<DuplexStream>>>) -> Option<String> {
        timeout(STEP, lines.next_line())
            .await
            .expect("line within timeout")
            .expect("readable stream")
    }

    #[tokio::test]
    async fn negotiation_then_quit_releases_everything() {
        let harness = Harness::new();
        let (task, id, mut lines, mut writer) = harness.connect();

        assert_eq!(next(&mut lines).await, Some(id.to_string()));
        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("SYSTEM:Please enter a nickname: ")
        );
        assert!(harness.context.registry.is_empty());

        writer.write_all(b"Alice\n/id\n").await.expect("write");
        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("SYSTEM:Welcome to the chat Alice!")
        );
        assert_eq!(next(&mut lines).await, Some(format!("SYSTEM:Your id is: {id}")));
        assert!(harness.context.registry.contains(&id));

        writer.write_all(b"/quit\n").await.expect("write");
        let reason = timeout(STEP, task).await.expect("finished").expect("no panic");
        assert_eq!(reason, CloseReason::Quit);
        assert_eq!(next(&mut lines).await, None);
        assert!(harness.context.registry.is_empty());
        assert!(!harness.context.allocator.is_in_use(&id));
    }

    #[tokio::test]
    async fn eof_during_negotiation_never_registers() {
        let harness = Harness::new();
        let (task, id, mut lines, mut writer) = harness.connect();
        next(&mut lines).await;
        next(&mut lines).await;
        writer.shutdown().await.expect("shutdown");

        let reason = timeout(STEP, task).await.expect("finished").expect("no panic");
        assert_eq!(reason, CloseReason::Disconnected);
        assert!(harness.context.registry.is_empty());
        assert!(!harness.context.allocator.is_in_use(&id));
    }

    #[tokio::test]
    async fn empty_nickname_is_accepted() {
        let harness = Harness::new();
        let (_task, id, mut lines, mut writer) = harness.connect();
        next(&mut lines).await;
        next(&mut lines).await;
        writer.write_all(b"\n").await.expect("write");
        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("SYSTEM:Welcome to the chat !")
        );
        assert!(harness.context.registry.contains(&id));
    }

    #[tokio::test]
    async fn shutdown_signal_ends_negotiating_session() {
        let harness = Harness::new();
        let (task, _id, mut lines, _writer) = harness.connect();
        next(&mut lines).await;
        next(&mut lines).await;

        harness.trigger.trigger();
        let reason = timeout(STEP, task).await.expect("finished").expect("no panic");
        assert_eq!(reason, CloseReason::ServerShutdown);
        assert_eq!(next(&mut lines).await, None);
    }

    #[tokio::test]
    async fn rename_without_name_changes_nothing() {
        let harness = Harness::new();
        let (_task, id, mut lines, mut writer) = harness.connect();
        next(&mut lines).await;
        next(&mut lines).await;
        writer.write_all(b"Alice\n/nick\n").await.expect("write");
        next(&mut lines).await;
        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("SYSTEM:No nickname provided!")
        );

        assert_eq!(harness.registered(&id).nickname(), "Alice");
    }

    #[tokio::test]
    async fn rename_keeps_the_name_as_typed() {
        let harness = Harness::new();
        let (_task, id, mut lines, mut writer) = harness.connect();
        next(&mut lines).await;
        next(&mut lines).await;
        writer.write_all(b"Alice\n/nick  Bob \n").await.expect("write");
        next(&mut lines).await;
        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("SYSTEM:Successfully changed nickname to  Bob ")
        );
        assert_eq!(harness.registered(&id).nickname(), " Bob ");
    }

    #[tokio::test]
    async fn close_while_backed_up_delivers_whole_lines() {
        let harness = Harness::new();
        let (task, id, mut lines, mut writer) = harness.connect();
        next(&mut lines).await;
        next(&mut lines).await;
        writer.write_all(b"Alice\n").await.expect("write");
        next(&mut lines).await;

        // Eight lines overflow the 1024-byte pipe mid-line.
        let sent: Vec<String> = (0..8).map(|i| format!("L{i}{}", "x".repeat(300))).collect();
        let handle = harness.registered(&id);
        for line in &sent {
            assert_eq!(handle.send_message(line), Ok(Delivery::Queued));
        }
        tokio::task::yield_now().await;
        handle.close(CloseReason::ServerShutdown);

        let mut received = Vec::new();
        while let Some(line) = next(&mut lines).await {
            received.push(line);
        }
        assert_eq!(received, sent);

        let reason = timeout(STEP, task).await.expect("finished").expect("no panic");
        assert_eq!(reason, CloseReason::ServerShutdown);
    }

    #[tokio::test]
    async fn evicted_session_tears_itself_down() {
        let harness = Harness::with_capacity(1);
        let (alice_task, alice, mut alice_lines, mut alice_writer) = harness.connect();
        next(&mut alice_lines).await;
        next(&mut alice_lines).await;
        alice_writer.write_all(b"Alice\n").await.expect("write");
        next(&mut alice_lines).await;

        let (_bob_task, bob, mut bob_lines, mut bob_writer) = harness.connect();
        next(&mut bob_lines).await;
        next(&mut bob_lines).await;
        bob_writer.write_all(b"Bob\n").await.expect("write");
        assert_eq!(
            next(&mut bob_lines).await.as_deref(),
            Some("SYSTEM:Welcome to the chat Bob!")
        );

        // Alice stops reading; her pipe and queue fill up.
        let handle = harness.registered(&alice);
        let filler = "x".repeat(300);
        for _ in 0..64 {
            if handle.close_reason().is_some() {
                break;
            }
            harness.context.registry.broadcast_except(&bob, &filler);
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.close_reason(), Some(CloseReason::Evicted));

        assert_eq!(
            next(&mut bob_lines).await,
            Some(format!("{alice}:Alice left the chat!"))
        );
        let reason = timeout(STEP * 3, alice_task)
            .await
            .expect("finished")
            .expect("no panic");
        assert_eq!(reason, CloseReason::Evicted);
        assert!(!harness.context.registry.contains(&alice));
        assert!(harness.context.registry.contains(&bob));
        assert!(!harness.context.allocator.is_in_use(&alice));
    }
}

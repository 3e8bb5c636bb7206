//! The per-connection command queue.
//!
//! At most one command is in flight at a time. The head of the queue is the
//! in-flight command; it is popped when its answer arrives or when it runs
//! out of retries.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use heapless::Deque;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{Error, Result};
use crate::protocol::CommandKind;
use crate::transport::{ConnectionState, Inbound, Link};

/// Hard upper bound of any queue; configured depths are clamped to it.
pub const QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_MAX_DEPTH: usize = 5;

#[derive(Debug)]
pub struct Command {
    pub kind: CommandKind,
    pub frame: Bytes,
    retries_left: u8,
    reply: oneshot::Sender<Result<Bytes>>,
    /// Queue slot held from submission until the command is answered.
    slot: Option<OwnedSemaphorePermit>,
}

impl Command {
    pub fn new(kind: CommandKind, frame: Bytes, retry: u8, reply: oneshot::Sender<Result<Bytes>>) -> Self {
        Self { kind, frame, retries_left: retry, reply, slot: None }
    }

    fn with_slot(mut self, slot: OwnedSemaphorePermit) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    pub fn retries_left(&self) -> u8 {
        self.retries_left
    }

    /// Completes the caller's request. A caller that gave up is ignored.
    pub fn respond(self, result: Result<Bytes>) {
        let Command { reply, slot, .. } = self;
        drop(slot);
        let _ = reply.send(result);
    }
}

/// The queue state machine without any I/O.
#[derive(Debug)]
pub struct CommandQueue {
    entries: Deque<Command, QUEUE_CAPACITY>,
    max_depth: usize,
    in_flight: bool,
}

impl CommandQueue {
    pub fn new(max_depth: usize) -> Self {
        Self { entries: Deque::new(), max_depth: max_depth.clamp(1, QUEUE_CAPACITY), in_flight: false }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Appends to the tail. A full queue hands the command back.
    pub fn push(&mut self, command: Command) -> core::result::Result<(), Command> {
        if self.entries.len() >= self.max_depth {
            return Err(command);
        }
        self.entries.push_back(command)
    }

    /// Marks the head as in flight and returns it for writing. `None` while
    /// another command is in flight or nothing is queued.
    pub fn begin(&mut self) -> Option<&Command> {
        if self.in_flight {
            return None;
        }
        let head = self.entries.front()?;
        self.in_flight = true;
        Some(head)
    }

    pub fn head(&self) -> Option<&Command> {
        self.entries.front()
    }

    /// Pops the in-flight command once its answer arrived.
    pub fn complete(&mut self) -> Option<Command> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        self.entries.pop_front()
    }

    /// Records a timeout or write failure of the in-flight command. Returns
    /// the command when its retry budget is spent; otherwise it stays at the
    /// head to be sent again.
    pub fn fail(&mut self) -> Option<Command> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        match self.entries.front_mut() {
            Some(head) if head.retries_left > 0 => {
                head.retries_left -= 1;
                None
            }
            _ => self.entries.pop_front(),
        }
    }

    /// Pops the head without sending it, e.g. when the link could not be
    /// opened for it.
    pub fn abandon(&mut self) -> Option<Command> {
        self.in_flight = false;
        self.entries.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Command> + '_ {
        self.in_flight = false;
        std::iter::from_fn(move || self.entries.pop_front())
    }
}

#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub command_timeout: Duration,
    /// Pause after each finished command.
    pub command_delay: Duration,
    /// Reconnect this long after the peer closed, even with nothing queued.
    /// `None` connects on demand only.
    pub reconnect_delay: Option<Duration>,
    pub close_when_idle: bool,
    pub max_depth: usize,
    pub retry: u8,
}

/// Submits commands to a connection worker. Dropping the handle stops the
/// worker and closes the connection.
///
/// A request takes one of `max_depth` slots when submitted and frees it when
/// answered, so a full queue is refused at once, even while the worker is
/// still connecting.
#[derive(Debug)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<Command>,
    slots: Arc<Semaphore>,
    state: watch::Receiver<ConnectionState>,
    retry: u8,
    task: JoinHandle<()>,
}

fn stopped() -> Error {
    Error::Transport("connection worker stopped".into())
}

impl QueueHandle {
    pub fn spawn<L: Link>(link: L, settings: QueueSettings, label: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let retry = settings.retry;
        let slots = Arc::new(Semaphore::new(settings.max_depth.clamp(1, QUEUE_CAPACITY)));
        let worker = Worker::new(link, settings, rx, state_tx);
        let span = tracing::info_span!("connection", device = %label);
        let task = tokio::spawn(worker.run().instrument(span));
        Self { tx, slots, state, retry, task }
    }

    pub async fn request(&self, kind: CommandKind, frame: Bytes) -> Result<Bytes> {
        let slot = self.slots.clone().try_acquire_owned().map_err(|_| {
            debug!("maximum queue depth reached, rejecting '{}'", kind.label());
            Error::QueueFull
        })?;
        let (reply, response) = oneshot::channel();
        let command = Command::new(kind, frame, self.retry, reply).with_slot(slot);
        self.tx.send(command).map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Worker<L> {
    link: L,
    settings: QueueSettings,
    queue: CommandQueue,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    deadline: Option<Instant>,
    hold_until: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl<L: Link> Worker<L> {
    fn new(
        link: L,
        settings: QueueSettings,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let queue = CommandQueue::new(settings.max_depth);
        let reconnect_at = settings.reconnect_delay.map(|_| Instant::now());
        Self { link, settings, queue, commands, state, deadline: None, hold_until: None, reconnect_at }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("connection state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    fn holding(&self) -> bool {
        self.hold_until.map_or(false, |until| Instant::now() < until)
    }

    fn pause(&mut self) {
        self.hold_until = match self.settings.command_delay {
            delay if delay.is_zero() => None,
            delay => Some(Instant::now() + delay),
        };
    }

    async fn run(mut self) {
        loop {
            self.dispatch().await;

            if self.settings.close_when_idle && self.queue.is_empty() && self.link.is_open() {
                debug!("no queued commands, closing the connection");
                self.link.close().await;
                self.set_state(ConnectionState::Disconnected);
            }

            let deadline = self.deadline;
            let hold_until = self.hold_until;
            let reconnect_at = self.reconnect_at;
            let open = self.link.is_open();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.enqueue(command),
                    None => break,
                },
                inbound = self.link.receive(), if open => self.on_inbound(inbound).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let label = self.queue.head().map_or("unknown", Command::label);
                    error!("no response received in time for '{}' command", label);
                    self.on_failure(Error::Timeout(label.to_string()));
                }
                _ = sleep_until(hold_until.unwrap_or_else(Instant::now)), if hold_until.is_some() => {
                    self.hold_until = None;
                }
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() && !open => {
                    self.reconnect().await;
                }
            }
        }

        for command in self.queue.drain() {
            command.respond(Err(stopped()));
        }
        self.link.close().await;
        self.set_state(ConnectionState::Disconnected);
    }

    fn enqueue(&mut self, command: Command) {
        if let Err(command) = self.queue.push(command) {
            debug!("maximum queue depth reached, rejecting '{}'", command.label());
            command.respond(Err(Error::QueueFull));
        }
    }

    async fn reconnect(&mut self) {
        debug!("reconnecting");
        self.set_state(ConnectionState::Connecting);
        match self.link.open().await {
            Ok(()) => {
                self.reconnect_at = None;
                self.set_state(ConnectionState::Idle);
            }
            Err(e) => {
                error!("failed to connect: {}", e);
                self.reconnect_at = self.settings.reconnect_delay.map(|delay| Instant::now() + delay);
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn dispatch(&mut self) {
        if self.queue.is_in_flight() || self.queue.is_empty() || self.holding() {
            return;
        }

        if !self.link.is_open() {
            self.set_state(ConnectionState::Connecting);
            if let Err(e) = self.link.open().await {
                error!("failed to open the connection: {}", e);
                self.set_state(ConnectionState::Disconnected);
                if let Some(command) = self.queue.abandon() {
                    command.respond(Err(e));
                }
                self.pause();
                return;
            }
            self.reconnect_at = None;
            self.set_state(ConnectionState::Idle);
        }

        let Some(command) = self.queue.begin() else { return };
        let label = command.label();
        let frame = command.frame.clone();
        debug!("sending '{}' command: {}", label, hex::encode(&frame));

        match self.link.send(&frame).await {
            Ok(()) => {
                self.deadline = Some(Instant::now() + self.settings.command_timeout);
                self.set_state(ConnectionState::Busy);
            }
            Err(e) => {
                error!("error writing command '{}' ({})", label, e);
                self.connection_lost().await;
                self.on_failure(e);
            }
        }
    }

    fn on_failure(&mut self, err: Error) {
        self.deadline = None;
        let head = self.queue.head().map(|c| (c.label(), c.retries_left()));
        match self.queue.fail() {
            Some(command) => command.respond(Err(err)),
            None => {
                if let Some((label, retries)) = head {
                    info!("retry {}, {} retries left", label, retries.saturating_sub(1));
                }
            }
        }
        if self.link.is_open() {
            self.set_state(ConnectionState::Idle);
        }
        self.pause();
    }

    async fn connection_lost(&mut self) {
        self.link.close().await;
        self.set_state(ConnectionState::Disconnected);
        self.reconnect_at = self.settings.reconnect_delay.map(|delay| Instant::now() + delay);
    }

    async fn on_inbound(&mut self, inbound: Result<Option<Inbound>>) {
        let result = match inbound {
            Ok(Some(Inbound::Frame(frame))) => Ok(frame),
            Ok(Some(Inbound::Rejected(e))) => Err(e),
            Ok(None) => {
                warn!("connection closed by peer");
                return self.connection_lost().await;
            }
            Err(e) => {
                error!("connection error: {}", e);
                return self.connection_lost().await;
            }
        };

        match self.queue.complete() {
            Some(command) => {
                debug!("completed '{}' command", command.label());
                command.respond(result);
                self.deadline = None;
                self.set_state(ConnectionState::Idle);
                self.pause();
            }
            None => error!("received data while no command was in progress"),
        }
    }
}

//! Reconnection controller.
//!
//! One tokio task owns the session, the subscriptions, the chat state, the
//! retry timer and the in-flight attempt. Callers talk to it through a
//! cloneable [`ControllerHandle`]; every command, session event, attempt
//! result and timer fire is processed one at a time in a single
//! `tokio::select!` loop, so no state is ever shared mutably.
//!
//! # State machine
//!
//! ```text
//! Idle ──connect──▶ Connecting ──ok──▶ Connected
//!                    ▲   │ fail            │ unexpected close
//!                    │   ▼                 ▼
//!                    └─ timer ◀──────── Disconnected
//! ```
//!
//! Failures wait `min(base * 2^attempts, max)` before the next attempt and
//! the counter resets on every successful connect. `disconnect()` drops the
//! timer, aborts the attempt, tears the session down and lands in `Idle`
//! (never connected) or `Disconnected`.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use bowlchat_proto::descriptor::ChannelLayout;

use crate::api::{ApiError, TokenProvider};
use crate::backoff::Backoff;
use crate::state::{ChatView, ClientEvent, ConnectionState, ConnectionStatus};
use crate::subscription::SubscriptionManager;
use crate::transport::{Connector, Opened, Session, SessionEvent, TransportError};

/// Default capacity of the UI event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default period of the connection health check.
pub const DEFAULT_HEALTH_CHECK: Duration = Duration::from_secs(10);

const COMMAND_CAPACITY: usize = 64;

/// Outcome of a connect attempt as seen by `connect()` callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The token endpoint failed.
    #[error("token fetch failed: {0}")]
    Token(#[from] ApiError),

    /// The transport could not be opened or subscribed.
    #[error("transport failed: {0}")]
    Transport(String),

    /// `disconnect()` aborted the attempt.
    #[error("connect attempt cancelled")]
    Cancelled,

    /// The controller task is gone.
    #[error("controller stopped")]
    Stopped,

    /// The attempt task panicked.
    #[error("connect task failed: {0}")]
    Task(String),
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Tuning for a controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Channel naming.
    pub layout: ChannelLayout,
    /// Retry delay policy.
    pub backoff: Backoff,
    /// Watchdog period; `None` disables it.
    pub health_check: Option<Duration>,
    /// Capacity of the [`ClientEvent`] channel.
    pub event_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            layout: ChannelLayout::default(),
            backoff: Backoff::default(),
            health_check: Some(DEFAULT_HEALTH_CHECK),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectError>>),
    Disconnect(oneshot::Sender<()>),
    Status(oneshot::Sender<ConnectionStatus>),
    ResetReconnection,
    ClearMessages(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    view: ChatView,
}

impl ControllerHandle {
    /// Connects, or joins the attempt already in flight.
    ///
    /// Resolves immediately when already connected. Concurrent callers share
    /// one attempt and one outcome.
    ///
    /// # Errors
    ///
    /// Returns the attempt's failure, [`ConnectError::Cancelled`] if
    /// `disconnect()` aborted it, or [`ConnectError::Stopped`] if the
    /// controller is gone. A failed attempt still schedules a retry.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .await
            .map_err(|_| ConnectError::Stopped)?;
        rx.await.map_err(|_| ConnectError::Stopped)?
    }

    /// Stops connecting and closes the session on purpose. No retry follows.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current reconnection status.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Stopped`] if the controller is gone.
    pub async fn status(&self) -> Result<ConnectionStatus, ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .await
            .map_err(|_| ConnectError::Stopped)?;
        rx.await.map_err(|_| ConnectError::Stopped)
    }

    /// Resets the failed-attempt counter so the next retry uses the base delay.
    pub async fn reset_reconnection(&self) {
        let _ = self.commands.send(Command::ResetReconnection).await;
    }

    /// Empties the message buffer.
    pub async fn clear_messages(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ClearMessages(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Disconnects and stops the controller task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Latest published connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the controller reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Stopped`] if the controller exits first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ConnectError> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| ConnectError::Stopped)
    }

    /// Read-only view of the message buffer and presence set.
    #[must_use]
    pub const fn view(&self) -> &ChatView {
        &self.view
    }
}

/// Starts a controller task.
///
/// Returns the handle and the receiving end of the [`ClientEvent`] channel.
/// The task stops on [`ControllerHandle::shutdown`] or when every handle is
/// dropped. Must be called from within a tokio runtime.
pub fn spawn<P, C>(
    provider: P,
    connector: C,
    options: ControllerOptions,
) -> (ControllerHandle, mpsc::Receiver<ClientEvent>)
where
    P: TokenProvider,
    C: Connector,
{
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(options.event_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let view = ChatView::new();

    let controller = Controller {
        provider: Arc::new(provider),
        connector: Arc::new(connector),
        backoff: options.backoff,
        subs: SubscriptionManager::new(options.layout),
        state: state_tx,
        events: event_tx,
        view: view.clone(),
        epoch: None,
        in_flight: None,
        waiters: Vec::new(),
        timer: None,
        health: options.health_check.filter(|p| !p.is_zero()).map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        }),
        attempts: 0,
        wants_connection: false,
        ever_connected: false,
    };
    tokio::spawn(controller.run(command_rx));

    (
        ControllerHandle {
            commands: command_tx,
            state: state_rx,
            view,
        },
        event_rx,
    )
}

/// A connected session and the channels to subscribe on it.
struct Established<S> {
    opened: Opened<S>,
    channels: Vec<String>,
}

type Attempt<S> = JoinHandle<Result<Established<S>, ConnectError>>;

struct Controller<P, C: Connector> {
    provider: Arc<P>,
    connector: Arc<C>,
    backoff: Backoff,
    subs: SubscriptionManager,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ClientEvent>,
    view: ChatView,
    epoch: Option<Opened<C::Session>>,
    in_flight: Option<Attempt<C::Session>>,
    waiters: Vec<oneshot::Sender<Result<(), ConnectError>>>,
    timer: Option<Pin<Box<Sleep>>>,
    health: Option<Interval>,
    attempts: u32,
    wants_connection: bool,
    ever_connected: bool,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl<P, C> Controller<P, C>
where
    P: TokenProvider,
    C: Connector,
{
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                biased;
                event = recv_session(&mut self.epoch) => self.on_session_event(event),
                joined = join_attempt(&mut self.in_flight) => self.on_attempt_settled(joined),
                () = fire_timer(&mut self.timer) => self.on_timer(),
                command = commands.recv() => {
                    let flow = match command {
                        Some(command) => self.on_command(command),
                        None => {
                            self.disconnect();
                            Flow::Stop
                        }
                    };
                    if flow == Flow::Stop {
                        break;
                    }
                }
                () = tick(&mut self.health) => self.on_health_check(),
            }
        }
        tracing::debug!("controller task exiting");
    }

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect(reply) => self.connect(reply),
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::ResetReconnection => {
                tracing::debug!(attempts = self.attempts, "reconnect counter reset");
                self.attempts = 0;
            }
            Command::ClearMessages(reply) => {
                self.view.write().messages.clear();
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                self.disconnect();
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<(), ConnectError>>) {
        self.wants_connection = true;
        if self.epoch.is_some() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.waiters.push(reply);
        if self.in_flight.is_some() {
            tracing::debug!(waiters = self.waiters.len(), "joining in-flight connect attempt");
            return;
        }
        if self.timer.take().is_some() {
            tracing::debug!("reconnect timer cancelled by explicit connect");
        }
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        let provider = Arc::clone(&self.provider);
        let connector = Arc::clone(&self.connector);
        let fallback = self.subs.layout().room().to_string();
        tracing::info!(attempt = self.attempts + 1, "connecting");

        self.in_flight = Some(tokio::spawn(async move {
            let descriptor = provider.fetch_descriptor().await?;
            let opened = connector.open(&descriptor).await?;
            let channels = if descriptor.channels.is_empty() {
                vec![fallback]
            } else {
                descriptor.channels
            };
            Ok(Established { opened, channels })
        }));
        self.set_state(ConnectionState::Connecting);
    }

    fn on_attempt_settled(
        &mut self,
        joined: Result<Result<Established<C::Session>, ConnectError>, JoinError>,
    ) {
        self.in_flight = None;
        let outcome = match joined {
            Ok(Ok(established)) => self.establish(established),
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_cancelled() => Err(ConnectError::Cancelled),
            Err(e) => Err(ConnectError::Task(e.to_string())),
        };

        match &outcome {
            Ok(()) => {
                tracing::info!("connected");
                self.attempts = 0;
                self.ever_connected = true;
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                tracing::warn!(err = %e, attempts = self.attempts, "connect attempt failed");
                self.schedule_retry();
            }
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn establish(&mut self, established: Established<C::Session>) -> Result<(), ConnectError> {
        let Established {
            mut opened,
            channels,
        } = established;
        if let Err(e) = self.subs.subscribe_all(&opened.session, &channels) {
            let mut chat = self.view.write();
            self.subs.teardown(None::<&C::Session>, &mut chat);
            opened.session.close(false);
            return Err(e.into());
        }
        self.epoch = Some(opened);
        Ok(())
    }

    fn on_session_event(&mut self, event: Option<SessionEvent>) {
        match event {
            Some(SessionEvent::Frame(frame)) => {
                let Some(epoch) = self.epoch.as_ref() else {
                    return;
                };
                let mut out = Vec::new();
                {
                    let mut chat = self.view.write();
                    self.subs.route(frame, &epoch.session, &mut chat, &mut out);
                }
                for event in out {
                    self.emit(event);
                }
            }
            Some(SessionEvent::Error(message)) => {
                tracing::warn!(reason = %message, "transport error");
            }
            Some(SessionEvent::Disconnected {
                intentional,
                reason,
            }) => self.on_session_closed(intentional, &reason),
            None => self.on_session_closed(false, "event stream ended"),
        }
    }

    fn on_session_closed(&mut self, intentional: bool, reason: &str) {
        self.epoch = None;
        {
            let mut chat = self.view.write();
            self.subs.teardown(None::<&C::Session>, &mut chat);
        }
        self.set_state(ConnectionState::Disconnected);
        if intentional {
            tracing::info!(reason = %reason, "session closed");
        } else {
            tracing::warn!(reason = %reason, "session lost");
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        if !self.wants_connection {
            return;
        }
        let delay = self.backoff.delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.timer = Some(Box::pin(tokio::time::sleep(delay)));
        tracing::info!(
            attempt = self.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        self.emit(ClientEvent::ReconnectScheduled {
            attempt: self.attempts,
            delay,
        });
    }

    fn on_timer(&mut self) {
        self.timer = None;
        if self.epoch.is_none() && self.in_flight.is_none() {
            self.start_attempt();
        }
    }

    fn on_health_check(&mut self) {
        if self.wants_connection
            && self.epoch.is_none()
            && self.in_flight.is_none()
            && self.timer.is_none()
        {
            tracing::info!("health check found connection down, reconnecting");
            self.attempts = 0;
            self.start_attempt();
        }
    }

    fn disconnect(&mut self) {
        let was_active = self.wants_connection
            || self.epoch.is_some()
            || self.in_flight.is_some()
            || self.timer.is_some();
        self.wants_connection = false;
        self.timer = None;
        self.attempts = 0;

        if let Some(attempt) = self.in_flight.take() {
            attempt.abort();
            tracing::debug!(waiters = self.waiters.len(), "in-flight attempt aborted");
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(ConnectError::Cancelled));
        }

        {
            let mut chat = self.view.write();
            match self.epoch.take() {
                Some(mut epoch) => {
                    self.subs.teardown(Some(&epoch.session), &mut chat);
                    epoch.session.close(true);
                }
                None => self.subs.teardown(None::<&C::Session>, &mut chat),
            }
        }

        if was_active {
            tracing::info!("disconnected");
        }
        let settled = if self.ever_connected {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Idle
        };
        self.set_state(settled);
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: *self.state.borrow(),
            attempts: self.attempts,
            reconnect_pending: self.timer.is_some(),
            attempt_in_flight: self.in_flight.is_some(),
            max_delay: self.backoff.max(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "connection state changed");
            self.emit(ClientEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::debug!(?event, "client event channel full, dropping event");
        }
    }
}

async fn recv_session<S>(epoch: &mut Option<Opened<S>>) -> Option<SessionEvent> {
    match epoch {
        Some(opened) => opened.events.recv().await,
        None => pending().await,
    }
}

async fn join_attempt<T>(slot: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn fire_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(health: &mut Option<Interval>) {
    match health {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

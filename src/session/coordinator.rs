//! Session state machine for the on/off indicator
//!
//! The coordinator owns the user's connect/disconnect intent and reconciles
//! it with what the background service reports. Every state change goes
//! through [`SessionCoordinator::handle`], fed from one serial input queue:
//! user taps, binding progress, service events, channel notices and timer
//! expiries all arrive there as [`Input`] values.
//!
//! Timers are spawned tasks that post a generation-tagged input back to the
//! queue. Cancelling aborts the task and forgets the generation, so an expiry
//! that was already queued is recognised as stale and ignored.

use super::{BindingHandle, ServiceControl};
use crate::config::SessionSection;
use crate::ipc::{
    ChannelNotice, DEFAULT_ENDPOINT_CAPACITY, Endpoint, ServiceCommand, SessionChannel,
    SessionEvent, SessionState, StatusPayload, TransportError,
};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything the coordinator reacts to
#[derive(Debug)]
pub enum Input {
    Tap,
    /// The indicator became visible
    StartListening,
    /// The indicator is no longer visible
    StopListening,
    TransportReady(Endpoint<ServiceCommand>),
    TransportLost,
    BindingDied,
    Event(SessionEvent),
    Channel(ChannelNotice),
    BindTimeout(u64),
    StopTimeout(u64),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub bind_timeout: Duration,
    pub stop_timeout: Duration,
    /// Label shown until the service reports a configuration name
    pub default_label: String,
    /// Profile sent with every connect; `None` asks the service to reuse
    /// its last successful configuration
    pub connect_profile: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionSection::default())
    }
}

impl From<&SessionSection> for SessionSettings {
    fn from(section: &SessionSection) -> Self {
        Self {
            bind_timeout: section.bind_timeout(),
            stop_timeout: section.stop_timeout(),
            default_label: section.default_label.clone(),
            connect_profile: None,
        }
    }
}

impl SessionSettings {
    pub fn with_connect_profile(mut self, profile: impl Into<String>) -> Self {
        self.connect_profile = Some(profile.into());
        self
    }
}

/// What the indicator renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileView {
    pub label: String,
    pub active: bool,
    pub state: SessionState,
}

/// User-actionable notices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserNotice {
    /// No configuration has ever connected successfully
    SetupRequired,
}

impl fmt::Display for UserNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserNotice::SetupRequired => {
                write!(f, "Connect once from the full application to finish first-time setup")
            }
        }
    }
}

/// Caller side of a running coordinator
pub struct CoordinatorHandle {
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Receiver<TileView>,
    notices: mpsc::UnboundedReceiver<UserNotice>,
}

impl CoordinatorHandle {
    pub fn tap(&self) -> Result<(), TransportError> {
        self.post(Input::Tap)
    }

    pub fn start_listening(&self) -> Result<(), TransportError> {
        self.post(Input::StartListening)
    }

    pub fn stop_listening(&self) -> Result<(), TransportError> {
        self.post(Input::StopListening)
    }

    pub fn shutdown(&self) -> Result<(), TransportError> {
        self.post(Input::Shutdown)
    }

    /// Watch the indicator state
    pub fn view(&self) -> watch::Receiver<TileView> {
        self.view.clone()
    }

    pub async fn next_notice(&mut self) -> Option<UserNotice> {
        self.notices.recv().await
    }

    pub fn try_next_notice(&mut self) -> Option<UserNotice> {
        self.notices.try_recv().ok()
    }

    fn post(&self, input: Input) -> Result<(), TransportError> {
        self.inputs
            .send(input)
            .map_err(|_| TransportError::EndpointTerminated)
    }
}

struct Timer {
    generation: u64,
    task: JoinHandle<()>,
}

impl Timer {
    fn cancel(self) {
        self.task.abort();
    }
}

/// Receiving side of the coordinator's serial context
struct Inbound {
    inputs: mpsc::UnboundedReceiver<Input>,
    events: mpsc::Receiver<SessionEvent>,
    channel: mpsc::UnboundedReceiver<ChannelNotice>,
}

impl Inbound {
    async fn next(&mut self) -> Option<Input> {
        tokio::select! {
            biased;
            Some(input) = self.inputs.recv() => Some(input),
            Some(event) = self.events.recv() => Some(Input::Event(event)),
            Some(notice) = self.channel.recv() => Some(Input::Channel(notice)),
            else => None,
        }
    }

    #[cfg(test)]
    fn try_next(&mut self) -> Option<Input> {
        self.inputs
            .try_recv()
            .ok()
            .or_else(|| self.events.try_recv().ok().map(Input::Event))
            .or_else(|| self.channel.try_recv().ok().map(Input::Channel))
    }
}

pub struct SessionCoordinator<S: ServiceControl> {
    settings: SessionSettings,
    service: S,

    state: SessionState,
    label: String,

    /// A status report has been asked for and not yet received
    waiting_status: bool,
    /// The command channel has a live service endpoint
    transport_ready: bool,
    bound: bool,
    /// A tap arrived before the transport was ready
    tap_pending: bool,
    connection_pending: bool,

    commands: SessionChannel<ServiceCommand>,
    observer: Endpoint<SessionEvent>,
    inputs: mpsc::UnboundedSender<Input>,
    inbound: Option<Inbound>,

    next_generation: u64,
    bind_timer: Option<Timer>,
    stop_timer: Option<Timer>,

    view: watch::Sender<TileView>,
    notices: mpsc::UnboundedSender<UserNotice>,
}

impl<S: ServiceControl> SessionCoordinator<S> {
    pub fn new(settings: SessionSettings, service: S) -> (Self, CoordinatorHandle) {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (observer, events_rx) = Endpoint::new(DEFAULT_ENDPOINT_CAPACITY);
        let (commands, channel_rx) = SessionChannel::with_notices("command");
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let label = settings.default_label.clone();
        let (view, view_rx) = watch::channel(TileView {
            label: label.clone(),
            active: false,
            state: SessionState::Disconnected,
        });

        let handle = CoordinatorHandle {
            inputs: inputs.clone(),
            view: view_rx,
            notices: notices_rx,
        };

        let coordinator = Self {
            settings,
            service,
            state: SessionState::Disconnected,
            label,
            waiting_status: true,
            transport_ready: false,
            bound: false,
            tap_pending: false,
            connection_pending: false,
            commands,
            observer,
            inputs,
            inbound: Some(Inbound {
                inputs: inputs_rx,
                events: events_rx,
                channel: channel_rx,
            }),
            next_generation: 0,
            bind_timer: None,
            stop_timer: None,
            view,
            notices,
        };

        (coordinator, handle)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn connection_pending(&self) -> bool {
        self.connection_pending
    }

    /// Process inputs until shutdown
    pub async fn run(mut self) {
        let Some(mut inbound) = self.inbound.take() else {
            error!("Session coordinator is already running");
            return;
        };

        while let Some(input) = inbound.next().await {
            let shutdown = matches!(input, Input::Shutdown);
            self.handle(input);
            if shutdown {
                break;
            }
        }

        debug!("Session coordinator stopped");
    }

    /// Apply one input and publish the resulting view
    pub fn handle(&mut self, input: Input) {
        debug!("Coordinator input: {:?}", input);

        match input {
            Input::Tap => self.on_tap(),
            Input::StartListening => self.bind(),
            Input::StopListening => self.unbind(),
            Input::TransportReady(endpoint) => self.on_transport_ready(endpoint),
            Input::TransportLost => self.on_transport_lost(),
            Input::BindingDied => {
                warn!("Binding to tunnel service died, rebinding");
                self.unbind();
                self.bind();
            }
            Input::Event(event) => self.on_event(event),
            Input::Channel(ChannelNotice::SubscriberLost(id)) => {
                warn!("Tunnel service endpoint {} is gone", id);
                self.on_transport_lost();
            }
            Input::Channel(ChannelNotice::DeliveryFailed(id)) => {
                warn!("{}", TransportError::DeliveryFailed(id));
            }
            Input::BindTimeout(generation) => self.on_bind_timeout(generation),
            Input::StopTimeout(generation) => self.on_stop_timeout(generation),
            Input::Shutdown => {
                self.cancel_stop_timer();
                self.unbind();
            }
        }

        self.publish();
    }

    fn on_tap(&mut self) {
        match self.state {
            SessionState::Disconnected | SessionState::Error => {
                if self.transport_ready {
                    self.start_vpn();
                } else {
                    self.queue_tap();
                }
            }
            SessionState::Connected => {
                if self.transport_ready {
                    self.stop_vpn();
                } else {
                    self.queue_tap();
                }
            }
            SessionState::Connecting | SessionState::Disconnecting => {
                debug!("Ignoring tap while {:?}", self.state);
            }
        }
    }

    fn queue_tap(&mut self) {
        if self.tap_pending {
            debug!("A tap is already queued");
            return;
        }
        info!("Transport not ready, queueing tap");
        self.tap_pending = true;
        self.bind();
    }

    fn start_vpn(&mut self) {
        self.connection_pending = true;
        if let Err(e) = self.service.start_service() {
            error!("{}", e);
            self.connection_pending = false;
            self.set_state(SessionState::Error);
            return;
        }
        self.send(ServiceCommand::Connect {
            profile: self.settings.connect_profile.clone(),
        });
        self.set_state(SessionState::Connecting);
    }

    fn stop_vpn(&mut self) {
        self.send(ServiceCommand::Disconnect);
        self.set_state(SessionState::Disconnecting);
        self.cancel_stop_timer();
        self.stop_timer = Some(self.schedule(self.settings.stop_timeout, Input::StopTimeout));
    }

    fn on_transport_ready(&mut self, endpoint: Endpoint<ServiceCommand>) {
        if !self.bound {
            debug!("Ignoring transport from a binding that was released");
            return;
        }

        info!("Tunnel service bound");
        self.cancel_bind_timer();
        self.commands.reset();
        self.commands.register(endpoint);
        self.transport_ready = true;

        self.send(ServiceCommand::RegisterObserver(self.observer.clone()));
        if self.waiting_status {
            self.send(ServiceCommand::RequestStatus);
        }

        if self.tap_pending {
            self.tap_pending = false;
            self.on_tap();
        }
    }

    fn on_transport_lost(&mut self) {
        warn!("Lost transport to tunnel service, rebinding");
        self.transport_ready = false;
        self.connection_pending = false;
        self.waiting_status = true;
        self.unbind();
        self.bind();
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.waiting_status = false;
                self.cancel_bind_timer();
                self.connection_pending = false;
                self.set_state(SessionState::Connected);
            }
            SessionEvent::Disconnected => {
                self.connection_pending = false;
                self.cancel_stop_timer();
                self.set_state(SessionState::Disconnected);
            }
            SessionEvent::StatusReport(payload) => self.on_status(payload),
            SessionEvent::Registered => debug!("Observer registered with tunnel service"),
            SessionEvent::Unknown => debug!("Ignoring unknown session event"),
        }
    }

    fn on_status(&mut self, payload: StatusPayload) {
        info!(
            "Status report: {:?} ({})",
            payload.state,
            payload.last_config_name.as_deref().unwrap_or("no configuration")
        );
        self.waiting_status = false;
        self.cancel_bind_timer();

        if let Some(name) = payload.last_config_name {
            self.label = name;
        } else if self.connection_pending && self.settings.connect_profile.is_none() {
            warn!("Connection requested but no configuration has ever been used");
            self.connection_pending = false;
            self.set_state(SessionState::Error);
            if self.notices.send(UserNotice::SetupRequired).is_err() {
                debug!("Nobody is listening for user notices");
            }
            return;
        }

        match payload.state {
            SessionState::Connected => {
                self.connection_pending = false;
                self.set_state(SessionState::Connected);
            }
            SessionState::Connecting | SessionState::Disconnecting => {
                self.set_state(payload.state);
            }
            SessionState::Disconnected | SessionState::Error => {
                let connecting = self.connection_pending && self.state == SessionState::Connecting;
                // Error holds until the next tap
                if !connecting && self.state != SessionState::Error {
                    self.set_state(SessionState::Disconnected);
                }
            }
        }
    }

    fn on_bind_timeout(&mut self, generation: u64) {
        if !Self::take_if_current(&mut self.bind_timer, generation) {
            debug!("Ignoring stale bind timeout");
            return;
        }
        if self.transport_ready {
            return;
        }

        warn!("{}", TransportError::BindTimeout(self.settings.bind_timeout));
        if self.tap_pending {
            info!("Discarding queued tap");
        }
        self.waiting_status = false;
        self.tap_pending = false;
        self.connection_pending = false;
        // The next tap or StartListening binds afresh with a new timer
        self.unbind();
        self.set_state(SessionState::Disconnected);
    }

    fn on_stop_timeout(&mut self, generation: u64) {
        if !Self::take_if_current(&mut self.stop_timer, generation) {
            debug!("Ignoring stale stop timeout");
            return;
        }
        if self.state == SessionState::Disconnecting {
            warn!("No disconnect confirmation, assuming disconnected");
            self.set_state(SessionState::Disconnected);
        }
    }

    fn bind(&mut self) {
        if self.bound {
            return;
        }

        match self.service.bind(BindingHandle::new(self.inputs.clone())) {
            Ok(()) => {
                debug!("Binding to tunnel service");
                self.bound = true;
                self.cancel_bind_timer();
                self.bind_timer =
                    Some(self.schedule(self.settings.bind_timeout, Input::BindTimeout));
            }
            Err(e) => {
                error!("{}", e);
                self.tap_pending = false;
                self.connection_pending = false;
                self.set_state(SessionState::Disconnected);
            }
        }
    }

    fn unbind(&mut self) {
        if !self.bound {
            return;
        }

        debug!("Unbinding from tunnel service");
        self.cancel_bind_timer();
        self.service.unbind();
        self.bound = false;
        self.transport_ready = false;
        self.commands.reset();
    }

    fn send(&self, command: ServiceCommand) {
        debug!("Sending {:?}", command);
        if self.commands.broadcast(command) == 0 {
            warn!("Command was not delivered to the tunnel service");
        }
    }

    fn schedule(&mut self, delay: Duration, fire: fn(u64) -> Input) -> Timer {
        self.next_generation += 1;
        let generation = self.next_generation;
        let inputs = self.inputs.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(fire(generation));
        });
        Timer { generation, task }
    }

    fn take_if_current(timer: &mut Option<Timer>, generation: u64) -> bool {
        if timer.as_ref().map(|t| t.generation) == Some(generation) {
            *timer = None;
            true
        } else {
            false
        }
    }

    fn cancel_bind_timer(&mut self) {
        if let Some(timer) = self.bind_timer.take() {
            timer.cancel();
        }
    }

    fn cancel_stop_timer(&mut self) {
        if let Some(timer) = self.stop_timer.take() {
            timer.cancel();
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("Session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn publish(&self) {
        let next = TileView {
            label: self.label.clone(),
            active: self.state.is_active(),
            state: self.state,
        };
        self.view.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

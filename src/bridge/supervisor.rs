//! Connection Supervisor
//!
//! Owns the lifecycle of one physical BLE link:
//!
//! ```text
//!  Idle ──start──▶ Scanning ──found──▶ Connecting ──ok──▶ Subscribing ──ok──▶ Streaming
//!   ▲                 ▲  │                 │                   │                 │
//!   │                 │  └─timeout─┐       └──────fail─────────┴──fail──┐     link lost
//!   │                 │            ▼                                    ▼        ▼
//!   │                 └──timer── BackingOff ◀──────auto_reconnect── Disconnected(reason)
//!   └───────────────── stop (from any state) ──────────────────────────────────────┘
//! ```
//!
//! Every phase races its operation against the command queue, so a stop
//! aborts whatever is in flight and releases the link before returning to
//! `Idle`. Notifications for one session are decoded and queued for
//! forwarding in arrival order.

use crate::bridge::bus::{event_bus, EventBus, EventStream};
use crate::bridge::locator::DeviceLocator;
use crate::bridge::sink::{Forwarder, ForwardingSink, MidiPortOpener};
use crate::bridge::transport::{BleLink, BleTransport, Subscription};
use crate::domain::error::{BridgeError, BridgeResult};
use crate::domain::models::{
    BridgeCommand, ConnectionState, DeviceDescriptor, DisconnectReason, MessageSeverity,
};
use crate::domain::session::SessionContext;
use crate::domain::settings::Configuration;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for the platform to release a link.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Non-blocking command interface for the UI collaborator.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    config: Arc<Mutex<Configuration>>,
}

impl BridgeHandle {
    /// Start the bridge with the current configuration.
    pub fn start(&self) -> BridgeResult<()> {
        self.config()?.validate()?;
        self.send(BridgeCommand::Start)
    }

    /// Return to `Idle`, releasing the link if one is held.
    pub fn stop(&self) -> BridgeResult<()> {
        self.send(BridgeCommand::Stop)
    }

    /// Stop, apply `config`, and start again.
    pub fn reconfigure(&self, config: Configuration) -> BridgeResult<()> {
        config.validate()?;
        *self
            .config
            .lock()
            .map_err(|_| BridgeError::ChannelClosed)? = config.clone();
        self.send(BridgeCommand::Reconfigure(config))
    }

    pub fn config(&self) -> BridgeResult<Configuration> {
        self.config
            .lock()
            .map(|c| c.clone())
            .map_err(|_| BridgeError::ChannelClosed)
    }

    fn send(&self, command: BridgeCommand) -> BridgeResult<()> {
        self.commands
            .send(command)
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// A running session: the link, its notification stream, and decode state.
struct Stream<L> {
    device: DeviceDescriptor,
    link: L,
    subscription: Subscription,
    session: SessionContext,
}

enum Phase<L> {
    Idle,
    Scanning,
    Connecting(DeviceDescriptor),
    Subscribing(DeviceDescriptor, L),
    Streaming(Stream<L>),
    Disconnected(DisconnectReason),
    BackingOff,
}

impl<L> Phase<L> {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Idle => ConnectionState::Idle,
            Self::Scanning => ConnectionState::Scanning,
            Self::Connecting(_) => ConnectionState::Connecting,
            Self::Subscribing(..) => ConnectionState::Subscribing,
            Self::Streaming(_) => ConnectionState::Streaming,
            Self::Disconnected(reason) => ConnectionState::Disconnected(reason.clone()),
            Self::BackingOff => ConnectionState::BackingOff,
        }
    }
}

enum Step<L> {
    To(Phase<L>),
    Shutdown,
}

/// A command that interrupts the current phase.
enum Interrupt {
    Stop,
    Restart(Configuration),
    Shutdown,
}

pub struct ConnectionSupervisor<T: BleTransport> {
    transport: Arc<T>,
    locator: DeviceLocator<T>,
    opener: Arc<dyn MidiPortOpener>,
    config: Configuration,
    state: ConnectionState,
    bus: EventBus,
    commands: mpsc::UnboundedReceiver<BridgeCommand>,
    forwarder: Option<Forwarder>,
}

impl<T: BleTransport> ConnectionSupervisor<T> {
    pub fn new(
        config: Configuration,
        transport: Arc<T>,
        opener: Arc<dyn MidiPortOpener>,
    ) -> (Self, BridgeHandle, EventStream) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (bus, events) = event_bus();

        let handle = BridgeHandle {
            commands: commands_tx,
            config: Arc::new(Mutex::new(config.clone())),
        };

        let supervisor = Self {
            locator: DeviceLocator::new(transport.clone()),
            transport,
            opener,
            config,
            state: ConnectionState::Idle,
            bus,
            commands: commands_rx,
            forwarder: None,
        };

        (supervisor, handle, events)
    }

    /// Create a supervisor and run it on the current tokio runtime.
    pub fn spawn(
        config: Configuration,
        transport: Arc<T>,
        opener: Arc<dyn MidiPortOpener>,
    ) -> (BridgeHandle, EventStream, JoinHandle<()>) {
        let (supervisor, handle, events) = Self::new(config, transport, opener);
        let task = tokio::spawn(supervisor.run());
        (handle, events, task)
    }

    /// Run until every [`BridgeHandle`] is dropped.
    pub async fn run(mut self) {
        info!("Connection supervisor started");
        let mut phase: Phase<T::Link> = Phase::Idle;

        loop {
            let step = match phase {
                Phase::Idle => self.idle().await,
                Phase::Scanning => self.scanning().await,
                Phase::Connecting(device) => self.connecting(device).await,
                Phase::Subscribing(device, link) => self.subscribing(device, link).await,
                Phase::Streaming(stream) => self.streaming(stream).await,
                Phase::Disconnected(_) => Step::To(self.after_failure()),
                Phase::BackingOff => self.backing_off().await,
            };

            match step {
                Step::To(next) => {
                    self.enter(&next);
                    phase = next;
                }
                Step::Shutdown => break,
            }
        }

        if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Idle);
        }
        info!("Connection supervisor stopped");
    }

    fn enter(&mut self, phase: &Phase<T::Link>) {
        self.set_state(phase.state());
        match phase {
            Phase::Idle => self.forwarder = None,
            Phase::Scanning => self.ensure_forwarder(),
            Phase::Streaming(stream) => self.log(
                format!("MIDI forwarding started: {}", stream.device.name),
                MessageSeverity::Success,
            ),
            _ => {}
        }
    }

    /// The single path that changes state. Emits exactly one status event.
    fn set_state(&mut self, state: ConnectionState) {
        info!("Connection state: {} -> {}", self.state, state);
        self.state = state.clone();
        self.bus.status(state);
    }

    fn ensure_forwarder(&mut self) {
        if self.forwarder.is_none() {
            let sink =
                ForwardingSink::new(self.opener.clone(), &self.config.midi_port, self.bus.clone());
            self.forwarder = Some(Forwarder::spawn(sink));
        }
    }

    fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.bus.log(message, severity);
    }

    /// Classify a command received while a session is active.
    /// `None` means the command does not affect the current phase.
    fn interrupt_for(&self, command: Option<BridgeCommand>) -> Option<Interrupt> {
        match command {
            None => Some(Interrupt::Shutdown),
            Some(BridgeCommand::Start) => {
                debug!("Start ignored: already {}", self.state);
                None
            }
            Some(BridgeCommand::Stop) => Some(Interrupt::Stop),
            Some(BridgeCommand::Reconfigure(config)) => Some(Interrupt::Restart(config)),
        }
    }

    /// Drive `operation` to completion unless a command interrupts it first.
    /// The operation is dropped, and so aborted, on interruption.
    async fn race<F: Future>(&mut self, operation: F) -> Result<F::Output, Interrupt> {
        tokio::pin!(operation);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if let Some(interrupt) = self.interrupt_for(command) {
                        return Err(interrupt);
                    }
                }
                output = &mut operation => return Ok(output),
            }
        }
    }

    /// Tear the session down and act on the interrupting command.
    async fn interrupt(&mut self, interrupt: Interrupt, link: Option<T::Link>) -> Step<T::Link> {
        self.transport.stop_scan().await;
        if let Some(link) = link {
            release(link).await;
            self.log("Disconnected from device", MessageSeverity::Info);
        }
        self.forwarder = None;

        match interrupt {
            Interrupt::Stop => {
                info!("Stop requested");
                Step::To(Phase::Idle)
            }
            Interrupt::Restart(config) => {
                info!("Reconfiguring: {:?}", config);
                self.set_state(ConnectionState::Idle);
                self.config = config;
                Step::To(Phase::Scanning)
            }
            Interrupt::Shutdown => Step::Shutdown,
        }
    }

    /// Where a failed attempt or a lost link leads.
    fn after_failure(&self) -> Phase<T::Link> {
        if self.config.auto_reconnect {
            Phase::BackingOff
        } else {
            Phase::Idle
        }
    }

    fn fail(&self, err: BridgeError) -> Step<T::Link> {
        error!("{}", err);
        self.log(err.to_string(), MessageSeverity::Error);
        if self.config.auto_reconnect {
            self.log(
                format!("Retrying in {} s", self.config.scan_interval),
                MessageSeverity::Info,
            );
        }
        Step::To(self.after_failure())
    }

    async fn idle(&mut self) -> Step<T::Link> {
        loop {
            match self.commands.recv().await {
                None => return Step::Shutdown,
                Some(BridgeCommand::Start) => {
                    if let Err(e) = self.config.validate() {
                        error!("Refusing to start: {}", e);
                        self.log(e.to_string(), MessageSeverity::Error);
                        continue;
                    }
                    return Step::To(Phase::Scanning);
                }
                Some(BridgeCommand::Stop) => debug!("Stop ignored: already idle"),
                Some(BridgeCommand::Reconfigure(config)) => {
                    info!("Reconfiguring: {:?}", config);
                    self.config = config;
                    return Step::To(Phase::Scanning);
                }
            }
        }
    }

    async fn scanning(&mut self) -> Step<T::Link> {
        self.log(
            format!("Scanning for {}...", self.config.device_name),
            MessageSeverity::Info,
        );
        let locator = self.locator.clone();
        let pattern = self.config.device_name.clone();
        let timeout = self.config.scan_timeout();

        match self.race(locator.find_first(&pattern, timeout)).await {
            Err(interrupt) => self.interrupt(interrupt, None).await,
            Ok(Ok(device)) => {
                self.log(
                    format!("Found device: {} ({})", device.name, device.address_string()),
                    MessageSeverity::Info,
                );
                Step::To(Phase::Connecting(device))
            }
            Ok(Err(e)) => self.fail(e),
        }
    }

    async fn connecting(&mut self, device: DeviceDescriptor) -> Step<T::Link> {
        let transport = self.transport.clone();
        let timeout = self.config.connect_timeout();

        let attempt = tokio::time::timeout(timeout, transport.connect(&device));
        match self.race(attempt).await {
            Err(interrupt) => self.interrupt(interrupt, None).await,
            Ok(Ok(Ok(link))) => {
                self.log(format!("Connected: {}", device.name), MessageSeverity::Success);
                Step::To(Phase::Subscribing(device, link))
            }
            Ok(Ok(Err(e))) => self.fail(e),
            Ok(Err(_)) => self.fail(BridgeError::ConnectFailure(format!(
                "timed out after {:?}",
                timeout
            ))),
        }
    }

    async fn subscribing(&mut self, device: DeviceDescriptor, mut link: T::Link) -> Step<T::Link> {
        let timeout = self.config.subscribe_timeout();

        let result = self
            .race(tokio::time::timeout(timeout, link.subscribe()))
            .await;
        let err = match result {
            Err(interrupt) => return self.interrupt(interrupt, Some(link)).await,
            Ok(Ok(Ok(subscription))) => {
                return Step::To(Phase::Streaming(Stream {
                    device,
                    link,
                    subscription,
                    session: SessionContext::new(),
                }));
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => BridgeError::SubscribeFailure(format!("timed out after {:?}", timeout)),
        };

        release(link).await;
        self.fail(err)
    }

    async fn streaming(&mut self, mut stream: Stream<T::Link>) -> Step<T::Link> {
        let reason = loop {
            // Link loss outranks queued notifications
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if let Some(interrupt) = self.interrupt_for(command) {
                        return self.interrupt(interrupt, Some(stream.link)).await;
                    }
                }
                changed = stream.subscription.lost.changed() => {
                    if changed.is_err() {
                        break DisconnectReason::StreamClosed;
                    }
                    let lost = stream.subscription.lost.borrow_and_update().clone();
                    if let Some(reason) = lost {
                        break DisconnectReason::LinkLost(reason);
                    }
                }
                packet = stream.subscription.notifications.recv() => match packet {
                    Some(packet) => self.handle_packet(&mut stream.session, &packet),
                    None => break DisconnectReason::StreamClosed,
                },
            }
        };

        warn!(
            "Lost {} after {} packets ({} framing errors, {} clamped timestamps): {}",
            stream.device.name,
            stream.session.packets(),
            stream.session.framing_errors(),
            stream.session.clamped_events(),
            reason
        );
        self.log(format!("Connection lost: {}", reason), MessageSeverity::Warning);
        release(stream.link).await;
        Step::To(Phase::Disconnected(reason))
    }

    fn handle_packet(&self, session: &mut SessionContext, packet: &[u8]) {
        let decoded = session.decode(packet, Instant::now());

        if let Some(err) = decoded.error {
            warn!("Framing error in {:02X?}: {}", packet, err);
            self.log(format!("Framing error: {}", err), MessageSeverity::Warning);
        }

        if let Some(forwarder) = &self.forwarder {
            for event in decoded.events {
                forwarder.send(event);
            }
        }
    }

    async fn backing_off(&mut self) -> Step<T::Link> {
        let delay = self.config.backoff();
        match self.race(tokio::time::sleep(delay)).await {
            Err(interrupt) => self.interrupt(interrupt, None).await,
            Ok(()) => Step::To(Phase::Scanning),
        }
    }
}

/// Disconnect `link`, giving the platform a bounded time to let go.
async fn release<L: BleLink>(mut link: L) {
    if tokio::time::timeout(RELEASE_TIMEOUT, link.disconnect())
        .await
        .is_err()
    {
        warn!("Timed out releasing BLE link");
    }
}

//! Device lifecycle: registration, session start, main loop, stop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::account::AccountService;
use super::device::{Device, DeviceContext};
use super::dispatch::Dispatcher;
use super::feature::{Feature, Installed};
use super::identity::IdentityStore;
use super::state::SessionState;
use crate::capability::CapabilityRegistry;
use crate::codec::constants::{error_code, method};
use crate::codec::{Message, MessageClass, MessageFactory, TransactionId};
use crate::config::{Config, SessionConfig};
use crate::error::{IdentityFailure, LyncnatError, Result};
use crate::transport::{Backoff, DeviceChannel, TransportHandle};

/// A registered device that has not started its session yet.
pub struct SessionManager<D: Device> {
    name: String,
    api_key: String,
    uuid: Uuid,
    /// Send NAME with the start-session request (first session after
    /// registration)
    announce_name: bool,
    state: SessionState,
    session: SessionConfig,
    factory: MessageFactory,
    dispatcher: Dispatcher<D>,
    transport: TransportHandle,
    account: Arc<dyn AccountService>,
}

impl<D: Device> std::fmt::Debug for SessionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<D: Device> SessionManager<D> {
    /// Resolve the device UUID and bind the device to a transport.
    ///
    /// The UUID comes from the configuration, then the identity store. When
    /// neither knows the device it is registered through `account` and the
    /// new UUID is stored.
    pub async fn new(
        config: &Config,
        device: D,
        registry: CapabilityRegistry<D>,
        transport: TransportHandle,
        account: Arc<dyn AccountService>,
        identity: &dyn IdentityStore,
    ) -> Result<Self> {
        config.validate()?;
        let name = config.device.name.clone();
        let mut state = SessionState::Unregistered;

        let (uuid, announce_name) = match config.device.uuid {
            Some(uuid) => (uuid, false),
            None => match identity.get(&name)? {
                Some(uuid) => (uuid, false),
                None => {
                    let uuid = account.register_device(&name).await?;
                    identity.set(&name, uuid)?;
                    tracing::info!("Registered device '{}' with UUID {}", name, uuid);
                    (uuid, true)
                }
            },
        };
        advance(&mut state, SessionState::Registered);

        let factory = MessageFactory::new(&config.device.username, &config.device.api_key);
        Ok(Self {
            name,
            api_key: config.device.api_key.clone(),
            uuid,
            announce_name,
            state,
            session: config.session.clone(),
            dispatcher: Dispatcher::new(device, registry, factory.clone()),
            factory,
            transport,
            account,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Compose the device with `feature`. Its capabilities join the
    /// descriptor and its callbacks run alongside the device's.
    pub fn with_feature<F: Feature>(self, feature: F) -> Result<Self> {
        self.with_aliased_feature(feature, std::iter::empty::<(String, String)>())
    }

    /// Like [`with_feature`](Self::with_feature), exposing the feature's
    /// events under other names. Each pair maps the feature's event name to
    /// the one the relay sees.
    pub fn with_aliased_feature<F, I, S>(mut self, feature: F, aliases: I) -> Result<Self>
    where
        F: Feature,
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let aliases: HashMap<String, String> = aliases
            .into_iter()
            .map(|(event, alias)| (event.into(), alias.into()))
            .collect();
        self.dispatcher
            .install(Box::new(Installed::new(feature, aliases)?))?;
        Ok(self)
    }

    /// Bring the device online.
    ///
    /// Blocks until the relay accepts the session, retrying with backoff.
    /// Only a rejected identity (or a dead transport) ends the retries, in
    /// which case the device is detached and the error returned.
    pub async fn start(mut self) -> Result<RunningDevice<D>> {
        self.dispatcher
            .device_mut()
            .setup()
            .map_err(|e| LyncnatError::Session(format!("device setup failed: {:#}", e)))?;
        self.dispatcher.setup_features()?;

        let mut channel = self.transport.attach(self.uuid, self.factory.key())?;

        if let Err(e) = self.push_descriptor().await {
            if !e.is_recoverable() {
                return Err(self.abort(e));
            }
            tracing::warn!("Descriptor not sent: {}", e);
        }

        advance(&mut self.state, SessionState::SessionStarting);
        let mut backlog = VecDeque::new();
        if let Err(e) = self.start_session(&mut channel, &mut backlog).await {
            return Err(self.abort(e));
        }
        tracing::info!(device = %self.uuid, "Device started session successfully");

        let ctx = DeviceContext::new(
            self.uuid,
            self.factory.clone(),
            channel.outbound.clone(),
            self.dispatcher.event_names(),
        );
        if let Err(e) = self.factory.keepalive(self.uuid).and_then(|f| ctx.queue(f)) {
            tracing::warn!("First keepalive not sent: {}", e);
        }
        advance(&mut self.state, SessionState::Running);

        let features = self.dispatcher.feature_count();
        let cancel = CancellationToken::new();
        let main_loop = MainLoop {
            dispatcher: self.dispatcher,
            ctx: ctx.clone(),
            factory: self.factory.clone(),
            inbound: channel.inbound,
            backlog,
            session: self.session,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(main_loop.run());
        tracing::info!(
            device = %self.uuid,
            features,
            "Device started"
        );

        Ok(RunningDevice {
            uuid: self.uuid,
            ctx,
            factory: self.factory,
            transport: self.transport,
            cancel,
            task,
        })
    }

    async fn push_descriptor(&mut self) -> Result<()> {
        let descriptor = self.dispatcher.descriptor_json()?;
        self.account
            .push_descriptor(self.uuid, &self.api_key, &descriptor)
            .await?;
        tracing::info!("Descriptor sent successfully");
        Ok(())
    }

    fn abort(&mut self, error: LyncnatError) -> LyncnatError {
        match &error {
            LyncnatError::FatalIdentity(IdentityFailure::Unauthorized) => tracing::error!(
                "Unauthorized. Provided credentials are not valid, device '{}' cannot start",
                self.name
            ),
            LyncnatError::FatalIdentity(IdentityFailure::UnknownDevice) => tracing::error!(
                "Device {} is not recognized by the relay. Was it deleted? \
                 Remove its entry from the identity store and try again",
                self.uuid
            ),
            other => tracing::error!("Device '{}' cannot start: {}", self.name, other),
        }
        self.transport.detach(self.uuid);
        advance(&mut self.state, SessionState::Stopped);
        error
    }

    /// Send start-session until the relay answers with success.
    async fn start_session(
        &mut self,
        channel: &mut DeviceChannel,
        backlog: &mut VecDeque<Message>,
    ) -> Result<()> {
        let mut backoff = Backoff::new(self.session.start_retry_initial());
        loop {
            match self.try_start_session(channel, backlog).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e @ LyncnatError::Session(_)) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Unable to start session ({}). Retrying in {} ms",
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_start_session(
        &mut self,
        channel: &mut DeviceChannel,
        backlog: &mut VecDeque<Message>,
    ) -> Result<()> {
        let name = self.announce_name.then_some(self.name.as_str());
        let (tid, frame) = self.factory.start_session(self.uuid, name)?;
        channel
            .outbound
            .send(frame)
            .await
            .map_err(|_| LyncnatError::Session("transport worker has stopped".to_string()))?;
        tracing::debug!(transaction = %tid, "Start-session request sent");

        let deadline = tokio::time::Instant::now() + self.session.start_timeout();
        loop {
            let message = match tokio::time::timeout_at(deadline, channel.inbound.recv()).await {
                Err(_) => {
                    return Err(LyncnatError::Network(format!(
                        "no start-session response within {} ms",
                        self.session.start_timeout_ms
                    )))
                }
                Ok(None) => {
                    return Err(LyncnatError::Session(
                        "transport worker has stopped".to_string(),
                    ))
                }
                Ok(Some(message)) => message,
            };

            if !is_response_to(&message, tid) {
                backlog.push_back(message);
                continue;
            }
            return match message.class {
                MessageClass::Success => Ok(()),
                _ => Err(start_session_error(&message)),
            };
        }
    }
}

fn is_response_to(message: &Message, tid: TransactionId) -> bool {
    message.transaction_id == tid
        && message.method == method::BINDING
        && message.class.is_response()
}

fn start_session_error(response: &Message) -> LyncnatError {
    match response.error_code() {
        Some((error_code::UNAUTHORIZED, _)) => {
            LyncnatError::FatalIdentity(IdentityFailure::Unauthorized)
        }
        Some((error_code::UNKNOWN_DEVICE, _)) => {
            LyncnatError::FatalIdentity(IdentityFailure::UnknownDevice)
        }
        Some((code, reason)) => {
            LyncnatError::InvalidMessage(format!("start-session refused: {} {}", code, reason))
        }
        None => LyncnatError::InvalidMessage(
            "start-session error response without ERROR-CODE".to_string(),
        ),
    }
}

fn advance(state: &mut SessionState, next: SessionState) {
    if !state.can_transition(next) {
        tracing::warn!("Unexpected session transition {} -> {}", state, next);
    }
    tracing::debug!("Session {} -> {}", state, next);
    *state = next;
}

struct MainLoop<D> {
    dispatcher: Dispatcher<D>,
    ctx: DeviceContext,
    factory: MessageFactory,
    inbound: Receiver<Message>,
    /// Frames that arrived while the session was starting
    backlog: VecDeque<Message>,
    session: SessionConfig,
    cancel: CancellationToken,
}

impl<D: Device> MainLoop<D> {
    async fn run(mut self) -> D {
        let device = self.ctx.device();
        let keepalive_interval = self.session.keepalive_interval();
        let mut interval = tokio::time::interval(self.session.tick_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_keepalive = Instant::now();
        let mut last_tick: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if last_keepalive.elapsed() > keepalive_interval {
                if let Err(e) = self.factory.keepalive(device).and_then(|f| self.ctx.queue(f)) {
                    tracing::warn!(%device, "Keepalive not sent: {}", e);
                }
                last_keepalive = Instant::now();
            }

            let due = match (last_tick, self.dispatcher.device_mut().tick_period()) {
                (Some(last), Some(period)) => last.elapsed() >= period,
                _ => true,
            };
            if due {
                last_tick = Some(Instant::now());
                if let Err(e) = self.dispatcher.device_mut().tick(&self.ctx) {
                    tracing::warn!(%device, "Periodic callback failed: {:#}", e);
                }
            }
            self.dispatcher.tick_features(&self.ctx);

            let next = match self.backlog.pop_front() {
                Some(message) => Some(message),
                None => match self.inbound.try_recv() {
                    Ok(message) => Some(message),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => {
                        tracing::warn!(%device, "Transport worker went away, leaving main loop");
                        break;
                    }
                },
            };
            if let Some(message) = next {
                self.handle(&message);
            }
        }

        tracing::info!(%device, "Main loop stopped");
        self.dispatcher.into_device()
    }

    fn handle(&mut self, message: &Message) {
        match self.dispatcher.dispatch(message) {
            Ok(Some(response)) => {
                if let Err(e) = self.ctx.queue(response) {
                    tracing::warn!("Response to {} not sent: {}", method::name(message.method), e);
                }
            }
            Ok(None) => {}
            Err(e @ LyncnatError::ActionFailed { .. }) => tracing::error!("{}", e),
            Err(e) => tracing::warn!(
                "Dropping {} {}: {}",
                method::name(message.method),
                message.class,
                e
            ),
        }
    }
}

/// Handle to a device whose session is running.
pub struct RunningDevice<D> {
    uuid: Uuid,
    ctx: DeviceContext,
    factory: MessageFactory,
    transport: TransportHandle,
    cancel: CancellationToken,
    task: JoinHandle<D>,
}

impl<D> std::fmt::Debug for RunningDevice<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningDevice")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<D> RunningDevice<D> {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> SessionState {
        if self.task.is_finished() {
            SessionState::Stopped
        } else {
            SessionState::Running
        }
    }

    /// Outbound handle that can be moved to other tasks.
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn send_event(&self, name: &str, payload: Option<&[u8]>) -> Result<()> {
        self.ctx.send_event(name, payload)
    }

    pub fn send_log(&self, level: u8, message: &str) -> Result<()> {
        self.ctx.send_log(level, message)
    }

    pub fn subscribe(&self, event: &str) -> Result<()> {
        self.ctx.subscribe(event)
    }

    pub fn unsubscribe(&self, event: &str) -> Result<()> {
        self.ctx.unsubscribe(event)
    }

    /// Stop the main loop, end the session and detach from the transport.
    ///
    /// Returns the device state as the main loop left it.
    pub async fn stop(self) -> Result<D> {
        self.cancel.cancel();
        let device = self
            .task
            .await
            .map_err(|e| LyncnatError::Session(format!("main loop failed: {}", e)))?;

        if let Err(e) = self
            .factory
            .end_session(self.uuid)
            .and_then(|f| self.ctx.queue(f))
        {
            tracing::warn!("Session could not be ended: {}", e);
        }
        self.transport.detach(self.uuid);
        tracing::info!(device = %self.uuid, "Successfully stopped device");
        Ok(device)
    }
}

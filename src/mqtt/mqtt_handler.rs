//! Broker session: connection lifecycle, subscriptions, publishing and teardown
//!
//! `MqttSession::connect` performs the initial handshake on the caller's task, then hands
//! the rumqttc event loop to a driver task. The driver is the only place that touches the
//! socket; it updates the connection state, keeps subscriptions alive across reconnects and
//! invokes the [`SessionEvents`] callbacks.
//!
//! ```text
//!  dispatch loop ── try_publish ──► AsyncClient ══► EventLoop ◄── driver task ──► callbacks
//!                                       (request channel)          (poll, reconnect)
//! ```

use super::config::{ReconnectPolicy, SessionSettings};
use super::events::{MessageHandler, SessionEvents};
use super::message_manager::{DeliveryToken, InboundMessage, ReceiptLedger};
use super::subscriptions::SubscriptionRegistry;
use crate::controller::dispatch::CommandSink;
use crate::error::{ConnectionError, PublishError, SubscriptionError};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const COMMAND_QOS: QoS = QoS::AtMostOnce;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Host and port extracted from a `tcp://host:port` style address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn parse(address: &str) -> Result<Self, ConnectionError> {
        let invalid = |reason: &str| ConnectionError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "tcp" | "mqtt" => {}
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        if !matches!(url.path(), "" | "/") {
            return Err(invalid("unexpected path"));
        }

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a callback, keeping a panic inside it away from the transport task
fn guarded(what: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("{} callback panicked; event dropped", what);
    }
}

/// State shared between the session handle and its driver task
struct SessionShared {
    address: String,
    client_id: String,
    client: AsyncClient,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<SubscriptionRegistry>,
    receipts: Mutex<ReceiptLedger>,
    disconnect_requested: AtomicBool,
    shutdown: CancellationToken,
    /// Cancelled when the driver task exits
    finished: CancellationToken,
}

impl SessionShared {
    fn new(address: String, client_id: String, client: AsyncClient) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            address,
            client_id,
            client,
            state,
            subscriptions: Mutex::new(SubscriptionRegistry::default()),
            receipts: Mutex::new(ReceiptLedger::default()),
            disconnect_requested: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Session state {} -> {}", previous, next);
        }
    }

    /// Queues a SUBSCRIBE for every registered topic
    fn resubscribe(&self) {
        let mut registry = lock(&self.subscriptions);
        for topic in registry.topics() {
            registry.mark_requested(&topic);
            match self.client.try_subscribe(topic.as_str(), COMMAND_QOS) {
                Ok(()) => info!("Re-subscribing to '{}'", topic),
                Err(e) => {
                    error!("Failed to re-subscribe to '{}': {}", topic, e);
                    registry.lapse_all();
                    break;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Turns transport events into state changes and callbacks
struct EventDispatch {
    shared: Arc<SessionShared>,
    events: Arc<dyn SessionEvents>,
    connected_once: bool,
}

impl EventDispatch {
    fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                debug!("CONNACK, session present: {}", ack.session_present);
                self.on_connack();
            }
            Event::Incoming(Packet::SubAck(suback)) => {
                let refused = suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if refused {
                    warn!("Broker refused subscription request {}", suback.pkid);
                    let topic = lock(&self.shared.subscriptions).on_refused(suback.pkid);
                    if let Some(topic) = topic {
                        let events = &self.events;
                        guarded("subscribe failed", || {
                            events.on_subscribe_failed(&topic, suback.pkid)
                        });
                    }
                    return Flow::Continue;
                }

                let topic = lock(&self.shared.subscriptions).on_suback(suback.pkid);
                match topic {
                    Some(topic) => {
                        let events = &self.events;
                        guarded("subscribed", || events.on_subscribed(&topic, suback.pkid));
                    }
                    None => debug!("SUBACK {} matches no pending subscription", suback.pkid),
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let handler = lock(&self.shared.subscriptions).handler_for(&publish.topic);
                match handler {
                    Some(handler) => {
                        let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                        guarded("message", || handler.on_message_arrived(&message));
                    }
                    None => debug!(
                        "Dropping message on '{}': no active subscription",
                        publish.topic
                    ),
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                let receipt = lock(&self.shared.receipts).complete(pkid);
                let events = &self.events;
                guarded("delivery", || events.on_delivery_complete(&receipt));
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                match lock(&self.shared.subscriptions).on_outgoing(pkid) {
                    Some(topic) => debug!("SUBSCRIBE {} sent for '{}'", pkid, topic),
                    None => debug!("SUBSCRIBE {} sent for an unknown topic", pkid),
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("DISCONNECT sent to {}", self.shared.address);
                self.shared.set_state(ConnectionState::Disconnected);
                return Flow::Stop;
            }
            other => debug!("Transport event: {:?}", other),
        }
        Flow::Continue
    }

    fn on_connack(&mut self) {
        let is_reconnect = self.connected_once;
        self.connected_once = true;
        self.shared.set_state(ConnectionState::Connected);

        // clean sessions forget subscriptions, so they are re-requested before anyone
        // hears about the reconnect
        if is_reconnect {
            self.shared.resubscribe();
        }

        let events = &self.events;
        guarded("connected", || events.on_connected(is_reconnect));
    }

    fn on_connection_error(&mut self, cause: &str) {
        let was_connected = self.shared.state() == ConnectionState::Connected;

        lock(&self.shared.subscriptions).lapse_all();
        let dropped = lock(&self.shared.receipts).abandon();
        if dropped > 0 {
            warn!("{} command(s) may not have reached the broker", dropped);
        }
        self.shared.set_state(ConnectionState::Disconnected);

        if was_connected {
            let events = &self.events;
            guarded("connection lost", || events.on_connection_lost(cause));
        } else {
            debug!("Reconnect attempt failed: {}", cause);
        }
    }
}

/// Owns the event loop; polls it until disconnect, cancellation or giving up
struct SessionDriver {
    dispatch: EventDispatch,
    eventloop: EventLoop,
    policy: ReconnectPolicy,
    attempts: u32,
}

impl SessionDriver {
    async fn run(mut self) {
        let shutdown = self.dispatch.shared.shutdown.clone();
        let _finished = self.dispatch.shared.finished.clone().drop_guard();
        info!("Session driver started for {}", self.dispatch.shared.address);

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    if matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                        self.attempts = 0;
                    }
                    if self.dispatch.handle_event(event) == Flow::Stop {
                        break;
                    }
                }
                Err(e) => {
                    if self.dispatch.shared.disconnect_requested.load(Ordering::SeqCst) {
                        debug!("Transport closed after disconnect: {}", e);
                        break;
                    }
                    self.dispatch.on_connection_error(&e.to_string());

                    self.attempts += 1;
                    let Some(delay) = self.policy.delay_for(self.attempts) else {
                        let attempts = self.attempts - 1;
                        let events = &self.dispatch.events;
                        guarded("gave up", || events.on_gave_up(attempts));
                        break;
                    };

                    debug!("Reconnect attempt {} in {:?}", self.attempts, delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.dispatch.shared.set_state(ConnectionState::Connecting);
                }
            }
        }

        self.dispatch.shared.set_state(ConnectionState::Disconnected);
        info!("Session driver stopped");
    }
}

/// One broker connection
pub struct MqttSession {
    shared: Arc<SessionShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    /// Cancelled once `close` has fully finished
    closed: CancellationToken,
}

impl MqttSession {
    /// Connects and starts the driver task
    ///
    /// Blocks until the broker answers with CONNACK or `connect_timeout` elapses.
    pub async fn connect(
        settings: SessionSettings,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Self, ConnectionError> {
        let (mut eventloop, shared) = Self::prepare(&settings)?;
        info!(
            "Connecting to {} as '{}' (clean session: {})",
            shared.address, shared.client_id, settings.clean_session
        );

        Self::wait_for_connack(&mut eventloop, &settings).await?;

        let mut dispatch = EventDispatch {
            shared: shared.clone(),
            events,
            connected_once: false,
        };
        dispatch.on_connack();

        let driver = SessionDriver {
            dispatch,
            eventloop,
            policy: settings.reconnect,
            attempts: 0,
        };
        let handle = tokio::spawn(driver.run());

        Ok(Self {
            shared,
            driver: Mutex::new(Some(handle)),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    fn prepare(
        settings: &SessionSettings,
    ) -> Result<(EventLoop, Arc<SessionShared>), ConnectionError> {
        let broker = BrokerAddress::parse(&settings.address)?;

        let client_id = match &settings.client_id {
            Some(id) if id.is_empty() || id.starts_with(char::is_whitespace) => {
                return Err(ConnectionError::InvalidClientId(id.clone()));
            }
            Some(id) => id.clone(),
            None => format!("teleop-bridge-{}", uuid::Uuid::new_v4().simple()),
        };

        let mut options = MqttOptions::new(client_id.clone(), broker.host, broker.port);
        options
            .set_keep_alive(settings.keep_alive)
            .set_clean_session(settings.clean_session);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let shared = Arc::new(SessionShared::new(
            settings.address.clone(),
            client_id,
            client,
        ));
        Ok((eventloop, shared))
    }

    async fn wait_for_connack(
        eventloop: &mut EventLoop,
        settings: &SessionSettings,
    ) -> Result<(), ConnectionError> {
        let address = settings.address.clone();
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(event) => debug!("Handshake event: {:?}", event),
                    Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                        return Err(match code {
                            ConnectReturnCode::BadUserNamePassword
                            | ConnectReturnCode::NotAuthorized => ConnectionError::NotAuthorized {
                                address: address.clone(),
                            },
                            other => ConnectionError::Refused {
                                address: address.clone(),
                                code: format!("{:?}", other),
                            },
                        });
                    }
                    Err(source) => {
                        return Err(ConnectionError::Unreachable {
                            address: address.clone(),
                            source,
                        })
                    }
                }
            }
        };

        tokio::time::timeout(settings.connect_timeout, handshake)
            .await
            .map_err(|_| ConnectionError::Timeout {
                address: settings.address.clone(),
                secs: settings.connect_timeout.as_secs(),
            })?
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Registers `handler` as the one handler for `topic` and subscribes
    ///
    /// The subscription is re-established automatically after every reconnect.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SubscriptionError> {
        if topic.is_empty() {
            return Err(SubscriptionError::EmptyTopic);
        }
        let state = self.state();
        if state != ConnectionState::Connected
            || self.shared.disconnect_requested.load(Ordering::SeqCst)
        {
            return Err(SubscriptionError::NotConnected {
                topic: topic.to_string(),
                state,
            });
        }

        let mut registry = lock(&self.shared.subscriptions);
        registry.register(topic, handler);
        registry.mark_requested(topic);
        if let Err(source) = self.shared.client.try_subscribe(topic, COMMAND_QOS) {
            registry.remove(topic);
            return Err(SubscriptionError::Rejected {
                topic: topic.to_string(),
                source,
            });
        }

        info!("Subscribing to '{}'", topic);
        Ok(())
    }

    /// Queues `payload` for transmission and returns immediately
    ///
    /// Nothing is queued while the session is not connected; the command is dropped and
    /// the caller decides whether to log it.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<DeliveryToken, PublishError> {
        if self.shared.disconnect_requested.load(Ordering::SeqCst) {
            return Err(PublishError::Closed {
                topic: topic.to_string(),
            });
        }
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(PublishError::NotConnected {
                topic: topic.to_string(),
                state,
            });
        }

        let mut receipts = lock(&self.shared.receipts);
        let token = receipts.issue();
        match self
            .shared
            .client
            .try_publish(topic, COMMAND_QOS, false, payload.to_vec())
        {
            Ok(()) => {
                debug!("Queued {} bytes for '{}' as {}", payload.len(), topic, token);
                Ok(token)
            }
            Err(source) => {
                receipts.revoke(token);
                Err(PublishError::Rejected {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Requests a graceful DISCONNECT; later calls do nothing
    pub fn disconnect(&self) {
        if self.shared.disconnect_requested.swap(true, Ordering::SeqCst) {
            debug!("Disconnect already requested");
            return;
        }

        let was_connected = self.state() == ConnectionState::Connected;
        self.shared.set_state(ConnectionState::Disconnected);

        if !was_connected {
            // nothing to flush, stop any pending reconnect right away
            self.shared.shutdown.cancel();
            return;
        }
        match self.shared.client.try_disconnect() {
            Ok(()) => info!("Disconnecting from {}", self.shared.address),
            Err(e) => {
                warn!("Failed to queue DISCONNECT: {}", e);
                self.shared.shutdown.cancel();
            }
        }
    }

    /// Stops the driver task and releases the socket
    ///
    /// Later or concurrent calls wait for the first one to finish and do nothing else.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("Session already closing, waiting for it to finish");
            let done = async {
                tokio::select! {
                    _ = self.closed.cancelled() => {}
                    _ = self.shared.finished.cancelled() => {}
                }
            };
            if tokio::time::timeout(CLOSE_GRACE, done).await.is_err() {
                debug!("Driver still running after {:?}, cancelling", CLOSE_GRACE);
            }
            self.shared.shutdown.cancel();
            return;
        }
        if !self.shared.disconnect_requested.load(Ordering::SeqCst) {
            self.shared.shutdown.cancel();
        }

        let driver = lock(&self.driver).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                debug!("Driver still running after {:?}, cancelling", CLOSE_GRACE);
                self.shared.shutdown.cancel();
                if let Err(e) = driver.await {
                    warn!("Session driver ended abnormally: {}", e);
                }
            }
        }

        self.shared.shutdown.cancel();
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Session to {} closed", self.shared.address);
        self.closed.cancel();
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl CommandSink for MqttSession {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<DeliveryToken, PublishError> {
        MqttSession::publish(self, topic, payload)
    }

    fn disconnect(&self) {
        MqttSession::disconnect(self)
    }

    async fn close(&self) {
        MqttSession::close(self).await
    }
}

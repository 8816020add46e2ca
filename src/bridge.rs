//! Orchestration of the treadmill link and the FTMS peripheral.
//!
//! [`Bridge`] owns one [`TreadmillLink`] and, while the bridge is active,
//! one [`FitnessServer`] running on its own task. It is the only place that
//! talks to both sides:
//!
//! - Status updates from the link are relayed to the server task as
//!   [`ServerEvent::StatusUpdated`].
//! - Commands accepted on the control point are queued and executed by a
//!   single dispatcher task, so the control point answers without waiting
//!   for the treadmill.
//! - [`Bridge::run_auto_loop`] discovers, connects and reconnects.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    ble::{DeviceClient, StatusCallback, TreadmillLink},
    error::{BridgeError, Result},
    ftms::{CommandSink, ControlPoint},
    server::{BluezPeripheral, FitnessServer, PeripheralBackend, ServerEvent},
    types::{BridgeConfig, DeviceCommand, DeviceStatus, DiscoveredDevice},
};

/// Advertised name used when neither an override nor a treadmill name is known
pub const FALLBACK_FTMS_NAME: &str = "Kingsmith FTMS";

/// Hook invoked by the auto loop whenever connection state changes
pub type StateChangeHook = Arc<dyn Fn() + Send + Sync>;

/// Forwards status callbacks to the active server task, if any
///
/// The link invokes the callback on its notification task; the relay only
/// enqueues an event, it never touches the peripheral itself.
#[derive(Clone, Default)]
pub struct StatusRelay {
    target: Arc<StdMutex<Option<mpsc::UnboundedSender<ServerEvent>>>>,
}

impl StatusRelay {
    /// Create a relay with no server attached
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Status callback to hand to the treadmill link
    #[must_use]
    pub fn callback(&self) -> StatusCallback {
        let relay = self.clone();
        Arc::new(move |_status: &DeviceStatus| relay.status_updated())
    }

    fn status_updated(&self) {
        let target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(events) = target.as_ref() {
            // A closed channel means the server is shutting down
            let _ = events.send(ServerEvent::StatusUpdated);
        }
    }

    fn attach(&self, events: mpsc::UnboundedSender<ServerEvent>) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
    }

    /// Detach `events`, unless another server has been attached since
    fn detach(&self, events: &mpsc::UnboundedSender<ServerEvent>) {
        let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        if target.as_ref().is_some_and(|current| current.same_channel(events)) {
            *target = None;
        }
    }
}

/// Fire-and-forget queue in front of the command dispatcher
#[derive(Debug, Clone)]
pub struct CommandQueue {
    commands: mpsc::UnboundedSender<DeviceCommand>,
}

impl CommandSink for CommandQueue {
    fn submit(&self, command: DeviceCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| BridgeError::DispatchUnavailable)
    }
}

/// A running FTMS server task
struct BridgeActivation {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Bridges a treadmill link to an FTMS peripheral
pub struct Bridge<L: TreadmillLink = DeviceClient, P: PeripheralBackend = BluezPeripheral> {
    config: BridgeConfig,
    link: Arc<L>,
    backend: P,
    relay: StatusRelay,
    activation: Mutex<Option<BridgeActivation>>,
    active: Arc<AtomicBool>,
    treadmill_name: RwLock<Option<String>>,
    commands: CommandQueue,
    dispatcher: JoinHandle<()>,
    auto_loop_stop: watch::Sender<bool>,
}

impl Bridge {
    /// Create a bridge on the BLE adapter named in `config`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new(config: BridgeConfig) -> Result<Self> {
        let relay = StatusRelay::new();
        let link = DeviceClient::new(&config, Some(relay.callback())).await?;
        let backend = BluezPeripheral::new(config.adapter.clone());
        Ok(Self::from_parts(config, Arc::new(link), backend, relay))
    }
}

impl<L: TreadmillLink, P: PeripheralBackend> Bridge<L, P> {
    /// Assemble a bridge from its parts and start the command dispatcher.
    ///
    /// `relay` must be the relay whose callback `link` reports status to.
    /// Must be called from within a Tokio runtime.
    pub fn from_parts(config: BridgeConfig, link: Arc<L>, backend: P, relay: StatusRelay) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();
        let dispatcher = spawn_dispatcher(link.clone(), queue);
        let (auto_loop_stop, _) = watch::channel(false);

        Self {
            config,
            link,
            backend,
            relay,
            activation: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            treadmill_name: RwLock::new(None),
            commands: CommandQueue { commands },
            dispatcher,
            auto_loop_stop,
        }
    }

    /// Configuration the bridge was created with
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Scan for peripherals
    ///
    /// # Errors
    ///
    /// Returns the link's transport error if scanning fails.
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.link.scan(timeout, None).await
    }

    /// Connect to the treadmill at `address`, recording `name` for advertising.
    ///
    /// Failures are logged and reported as `false`.
    pub async fn connect_treadmill(&self, address: &str, name: Option<&str>) -> bool {
        match self.link.connect(address).await {
            Ok(()) => {
                *self.treadmill_name.write().await = name.map(str::to_string);
                info!(
                    "Connected to treadmill {} ({})",
                    name.unwrap_or("unnamed"),
                    address
                );
                true
            }
            Err(e) => {
                error!("Failed to connect to treadmill {}: {}", address, e);
                false
            }
        }
    }

    /// Stop the bridge, then disconnect the treadmill and forget its name
    pub async fn disconnect_treadmill(&self) {
        self.stop_bridge().await;

        if let Err(e) = self.link.disconnect().await {
            warn!("Error while disconnecting treadmill: {}", e);
        }
        *self.treadmill_name.write().await = None;
    }

    /// Register the FTMS service and start advertising.
    ///
    /// Returns `true` if the bridge is active afterwards. Requires a
    /// connected treadmill; a second call while active is a no-op.
    pub async fn start_bridge(&self) -> bool {
        let mut activation = self.activation.lock().await;
        if activation.is_some() {
            debug!("FTMS bridge already active");
            return true;
        }

        if !self.link.is_connected().await {
            warn!("Cannot start FTMS bridge: treadmill not connected");
            return false;
        }

        let name = advertised_name(
            self.config.ftms_device_name.as_deref(),
            self.treadmill_name.read().await.as_deref(),
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registration = match self
            .backend
            .register(&name, self.link.subscribe_status(), events_tx.clone())
            .await
        {
            Ok(registration) => registration,
            Err(e) => {
                error!("Failed to start FTMS bridge: {}", e);
                return false;
            }
        };

        let sink: Arc<dyn CommandSink> = Arc::new(self.commands.clone());
        let server = FitnessServer::new(
            registration,
            ControlPoint::new(Some(sink)),
            self.link.subscribe_status(),
        );
        let (shutdown, shutdown_rx) = oneshot::channel();

        self.relay.attach(events_tx.clone());
        self.active.store(true, Ordering::SeqCst);

        let relay = self.relay.clone();
        let active = self.active.clone();
        let task = tokio::spawn(async move {
            server.run(events_rx, shutdown_rx).await;
            relay.detach(&events_tx);
            active.store(false, Ordering::SeqCst);
        });

        *activation = Some(BridgeActivation { shutdown, task });
        info!("FTMS bridge started as '{}'", name);
        true
    }

    /// Unregister the FTMS service and wait for cleanup to finish. Idempotent.
    pub async fn stop_bridge(&self) {
        let mut activation = self.activation.lock().await;
        let Some(BridgeActivation { shutdown, task }) = activation.take() else {
            return;
        };

        // The task may already be gone if the runtime cancelled it
        let _ = shutdown.send(());
        if let Err(e) = task.await {
            error!("FTMS server task failed: {}", e);
            self.active.store(false, Ordering::SeqCst);
        }
        info!("FTMS bridge stopped");
    }

    /// Start the belt
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] without a treadmill, or the write error.
    pub async fn start_belt(&self) -> Result<()> {
        self.send_connected(DeviceCommand::Start).await
    }

    /// Stop the belt
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] without a treadmill, or the write error.
    pub async fn stop_belt(&self) -> Result<()> {
        self.send_connected(DeviceCommand::Stop).await
    }

    /// Set the belt speed in km/h (clamped to the supported range)
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] without a treadmill, or the write error.
    pub async fn set_speed(&self, speed_kmh: f64) -> Result<()> {
        self.send_connected(DeviceCommand::set_speed(speed_kmh)).await
    }

    async fn send_connected(&self, command: DeviceCommand) -> Result<()> {
        if !self.link.is_connected().await {
            return Err(BridgeError::NotConnected);
        }
        self.link.send(command).await
    }

    /// Latest treadmill status
    pub fn get_status(&self) -> Option<DeviceStatus> {
        self.link.latest_status()
    }

    /// Whether the treadmill link is up
    pub async fn is_connected(&self) -> bool {
        self.link.is_connected().await
    }

    /// Whether the FTMS peripheral is registered
    pub fn bridge_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Address of the connected treadmill
    pub async fn treadmill_address(&self) -> Option<String> {
        self.link.address().await
    }

    /// Name recorded when the treadmill was connected
    pub async fn treadmill_name(&self) -> Option<String> {
        self.treadmill_name.read().await.clone()
    }

    /// Discover, connect and reconnect until [`Bridge::stop_auto_loop`] is called.
    ///
    /// A failing iteration is logged and retried after the scan interval.
    /// Stop requests made while no loop is running are discarded.
    pub async fn run_auto_loop(&self, on_state_change: Option<StateChangeHook>) {
        self.auto_loop_stop.send_replace(false);
        let mut stop = self.auto_loop_stop.subscribe();
        let mut was_connected = false;
        info!(
            "Auto-discovery started (prefix '{}', every {:?})",
            self.config.name_prefix,
            self.config.scan_interval()
        );

        loop {
            if stop_requested(&mut stop) {
                break;
            }

            if let Err(e) = self
                .auto_iteration(&mut was_connected, on_state_change.as_ref())
                .await
            {
                error!("Auto-discovery iteration failed: {}", e);
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.scan_interval()) => {}
                () = wait_for_stop(&mut stop) => break,
            }
        }

        self.auto_loop_stop.send_replace(false);
        info!("Auto-discovery stopped");
    }

    /// Ask a running [`Bridge::run_auto_loop`] to return
    pub fn stop_auto_loop(&self) {
        self.auto_loop_stop.send_replace(true);
    }

    async fn auto_iteration(
        &self,
        was_connected: &mut bool,
        on_state_change: Option<&StateChangeHook>,
    ) -> Result<()> {
        if self.link.is_connected().await {
            *was_connected = true;
            return Ok(());
        }

        if std::mem::take(was_connected) {
            warn!("Treadmill connection lost");
            self.stop_bridge().await;
            if let Err(e) = self.link.disconnect().await {
                debug!("Cleanup after link loss failed: {}", e);
            }
            notify_state_change(on_state_change);
        }

        let devices = self
            .link
            .scan(
                self.config.discovery_scan_timeout(),
                Some(self.config.name_prefix.as_str()),
            )
            .await?;
        let Some(device) = devices.into_iter().next() else {
            debug!("No treadmill found");
            return Ok(());
        };

        info!("Auto-connecting to {} ({})", device.name, device.address);
        let name = device.has_name().then_some(device.name.as_str());
        if self.connect_treadmill(&device.address, name).await {
            *was_connected = true;
            if self.config.auto_start_bridge && !self.start_bridge().await {
                warn!("Auto-start of the FTMS bridge failed");
            }
            notify_state_change(on_state_change);
        }

        Ok(())
    }
}

impl<L: TreadmillLink, P: PeripheralBackend> Drop for Bridge<L, P> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Advertised FTMS name: override, then "`<treadmill>` FTMS", then the fallback
#[must_use]
pub fn advertised_name(override_name: Option<&str>, treadmill_name: Option<&str>) -> String {
    if let Some(name) = override_name.filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    match treadmill_name.filter(|name| !name.is_empty()) {
        Some(name) => format!("{name} FTMS"),
        None => FALLBACK_FTMS_NAME.to_string(),
    }
}

/// Execute queued commands one at a time
fn spawn_dispatcher<L: TreadmillLink>(
    link: Arc<L>,
    mut queue: mpsc::UnboundedReceiver<DeviceCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = queue.recv().await {
            if !link.is_connected().await {
                warn!("Dropping {}: treadmill not connected", command);
                continue;
            }
            match link.send(command).await {
                Ok(()) => debug!("Dispatched {}", command),
                Err(e) => error!("Failed to send {}: {}", command, e),
            }
        }
    })
}

fn notify_state_change(hook: Option<&StateChangeHook>) {
    if let Some(hook) = hook {
        hook();
    }
}

fn stop_requested(stop: &mut watch::Receiver<bool>) -> bool {
    *stop.borrow_and_update()
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if stop.changed().await.is_err() {
            return std::future::pending().await;
        }
        if stop_requested(stop) {
            return;
        }
    }
}

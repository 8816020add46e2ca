use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
        ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{BridgeError, Result},
    protocol::{build_status_request_frame, parse_status},
    types::{BridgeConfig, ConnectionState, DeviceCommand, DeviceStatus, DiscoveredDevice},
    DEVICE_NOTIFY_CHAR_UUID, DEVICE_SERVICE_UUID, DEVICE_WRITE_CHAR_UUID,
};

/// Callback invoked with every freshly parsed status
///
/// Runs on the notification task, not on the caller of [`DeviceClient::connect`].
pub type StatusCallback = Arc<dyn Fn(&DeviceStatus) + Send + Sync>;

/// Services never used for the vendor protocol: GAP, GATT, Device Information
const GENERIC_SERVICES: [u32; 3] = [0x1800, 0x1801, 0x180A];

/// Upper bound on the implicit scan `connect` runs for an unknown address
const IMPLICIT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Treadmill-side operations the bridge relies on
///
/// [`DeviceClient`] is the BLE implementation.
#[async_trait]
pub trait TreadmillLink: Send + Sync + 'static {
    /// Discover nearby peripherals, optionally filtered by name prefix
    async fn scan(&self, timeout: Duration, name_prefix: Option<&str>)
        -> Result<Vec<DiscoveredDevice>>;

    /// Connect to `address`, replacing any existing link
    async fn connect(&self, address: &str) -> Result<()>;

    /// Tear down the link; safe to call when not connected
    async fn disconnect(&self) -> Result<()>;

    /// Whether the transport currently reports the link as up
    async fn is_connected(&self) -> bool;

    /// Write a belt command; a no-op when not connected
    async fn send(&self, command: DeviceCommand) -> Result<()>;

    /// Address of the connected treadmill
    async fn address(&self) -> Option<String>;

    /// Latest parsed status, if any
    fn latest_status(&self) -> Option<DeviceStatus>;

    /// Read handle on the status cell
    fn subscribe_status(&self) -> watch::Receiver<Option<DeviceStatus>>;
}

/// Notify/write pair selected on connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicPair {
    /// Characteristic carrying status notifications
    pub notify: Characteristic,
    /// Characteristic accepting commands
    pub write: Characteristic,
}

/// BLE central link to a WalkingPad treadmill
///
/// Owns the connection, the poll task and the status cell. Scans and
/// connects share one lock because connecting may scan internally.
pub struct DeviceClient {
    manager: Manager,
    adapter_id: String,
    stats_interval: Duration,
    connect_timeout: Duration,
    scan_lock: Mutex<()>,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    lifecycle: LinkLifecycle<DeviceConnection>,
    status: Arc<watch::Sender<Option<DeviceStatus>>>,
    on_status: Option<StatusCallback>,
    command_gate: CommandGate,
}

impl DeviceClient {
    /// Create a client using the adapter named in `config`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new(config: &BridgeConfig, on_status: Option<StatusCallback>) -> Result<Self> {
        let manager = Manager::new().await?;
        let (status, _) = watch::channel(None);

        Ok(Self {
            manager,
            adapter_id: config.adapter.clone(),
            stats_interval: config.stats_interval(),
            connect_timeout: config.connect_timeout(),
            scan_lock: Mutex::new(()),
            peripherals: Mutex::new(HashMap::new()),
            lifecycle: LinkLifecycle::new(),
            status: Arc::new(status),
            on_status,
            command_gate: CommandGate::new(config.min_command_interval()),
        })
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        self.lifecycle.state().await
    }

    /// Start the belt
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if the write fails.
    pub async fn send_start(&self) -> Result<()> {
        self.send_command(DeviceCommand::Start).await
    }

    /// Stop the belt
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if the write fails.
    pub async fn send_stop(&self) -> Result<()> {
        self.send_command(DeviceCommand::Stop).await
    }

    /// Set the target speed in km/h
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if the write fails.
    pub async fn send_speed(&self, speed_kmh: f64) -> Result<()> {
        self.send_command(DeviceCommand::set_speed(speed_kmh)).await
    }

    /// Resolve the configured adapter, falling back to the first one
    async fn central(&self) -> Result<Adapter> {
        let adapters = self.manager.adapters().await?;
        let mut fallback = None;

        for adapter in adapters {
            let info = adapter.adapter_info().await.unwrap_or_default();
            if info.starts_with(&self.adapter_id) {
                return Ok(adapter);
            }
            fallback.get_or_insert(adapter);
        }

        fallback.ok_or_else(|| BridgeError::DeviceNotFound("no Bluetooth adapter".to_string()))
    }

    /// Run one discovery window. Callers hold `scan_lock`.
    async fn discover(&self, window: Duration) -> Result<Vec<DiscoveredDevice>> {
        let central = self.central().await?;

        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(window).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        let mut known = self.peripherals.lock().await;
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };

            let address = properties.address.to_string();
            let name = properties
                .local_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| address.clone());
            let advertises_ftms = properties
                .services
                .iter()
                .any(|uuid| short_uuid(*uuid) == short_uuid(DEVICE_SERVICE_UUID));

            devices.push(DiscoveredDevice {
                address: address.clone(),
                name,
                advertises_ftms,
            });
            known.insert(address, peripheral);
        }

        debug!("Discovery window finished with {} peripheral(s)", devices.len());
        Ok(devices)
    }

    async fn known_peripheral(&self, address: &str) -> Option<Peripheral> {
        self.peripherals
            .lock()
            .await
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(address))
            .map(|(_, peripheral)| peripheral.clone())
    }

    /// Connect and set up notifications, polling and the command writer
    async fn establish(&self, address: &str) -> Result<DeviceConnection> {
        let peripheral = {
            let _scan_guard = self.scan_lock.lock().await;

            let peripheral = match self.known_peripheral(address).await {
                Some(peripheral) => peripheral,
                None => {
                    debug!("{} not seen yet, scanning before connect", address);
                    self.discover(self.connect_timeout.min(IMPLICIT_SCAN_TIMEOUT))
                        .await?;
                    self.known_peripheral(address)
                        .await
                        .ok_or_else(|| BridgeError::DeviceNotFound(address.to_string()))?
                }
            };

            timeout(self.connect_timeout, peripheral.connect())
                .await
                .map_err(|_| BridgeError::Timeout {
                    timeout_ms: u64::try_from(self.connect_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })?
                .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;

            peripheral
        };

        info!("Connected to WalkingPad at {}", address);

        match self.attach(&peripheral, address).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                if let Err(disconnect_error) = peripheral.disconnect().await {
                    debug!("Disconnect after failed setup: {}", disconnect_error);
                }
                Err(e)
            }
        }
    }

    async fn attach(&self, peripheral: &Peripheral, address: &str) -> Result<DeviceConnection> {
        peripheral.discover_services().await?;

        let services: Vec<Service> = peripheral.services().into_iter().collect();
        for service in &services {
            info!("  Service: {}", service.uuid);
            for characteristic in &service.characteristics {
                info!(
                    "    Char: {} [{:?}]",
                    characteristic.uuid, characteristic.properties
                );
            }
        }

        let pair = select_characteristics(&services)?;
        info!(
            "Using notify char: {}, write char: {}",
            pair.notify.uuid, pair.write.uuid
        );

        peripheral.subscribe(&pair.notify).await?;
        let notifications = peripheral.notifications().await?;
        let notification_task = spawn_notification_task(
            notifications,
            pair.notify.uuid,
            self.status.clone(),
            self.on_status.clone(),
        );

        let writer = LinkWriter::new(peripheral.clone(), pair.write);
        if let Err(e) = writer.write(&build_status_request_frame()).await {
            notification_task.abort();
            let _ = notification_task.await;
            return Err(e);
        }

        let poll_task = spawn_poll_task(writer.clone(), self.stats_interval);

        Ok(DeviceConnection {
            address: address.to_string(),
            writer,
            notification_task,
            poll_task,
        })
    }

    async fn writer(&self) -> Option<LinkWriter> {
        self.lifecycle
            .read(|connection| connection.writer.clone())
            .await
    }

    async fn send_command(&self, command: DeviceCommand) -> Result<()> {
        let Some(writer) = self.writer().await else {
            debug!("Dropping {}: not connected", command);
            return Ok(());
        };
        if !writer.is_connected().await {
            debug!("Dropping {}: link is down", command);
            return Ok(());
        }

        self.command_gate.wait_turn().await;
        writer.write(&command.to_frame()).await
    }
}

#[async_trait]
impl TreadmillLink for DeviceClient {
    async fn scan(
        &self,
        timeout: Duration,
        name_prefix: Option<&str>,
    ) -> Result<Vec<DiscoveredDevice>> {
        info!("Scanning for BLE devices ({:?})...", timeout);

        let discovered = {
            let _scan_guard = self.scan_lock.lock().await;
            self.discover(timeout).await?
        };

        let devices = filter_and_sort(discovered, name_prefix);
        info!("Scan completed. Found {} candidate device(s)", devices.len());
        Ok(devices)
    }

    async fn connect(&self, address: &str) -> Result<()> {
        self.lifecycle.connect(|| self.establish(address)).await
    }

    async fn disconnect(&self) -> Result<()> {
        let result = self.lifecycle.disconnect().await;
        info!("Disconnected from WalkingPad");
        result
    }

    async fn is_connected(&self) -> bool {
        match self.writer().await {
            Some(writer) => writer.is_connected().await,
            None => false,
        }
    }

    async fn send(&self, command: DeviceCommand) -> Result<()> {
        self.send_command(command).await
    }

    async fn address(&self) -> Option<String> {
        self.lifecycle
            .read(|connection| connection.address.clone())
            .await
    }

    fn latest_status(&self) -> Option<DeviceStatus> {
        self.status.borrow().clone()
    }

    fn subscribe_status(&self) -> watch::Receiver<Option<DeviceStatus>> {
        self.status.subscribe()
    }
}

impl Drop for DeviceClient {
    fn drop(&mut self) {
        if let Some(connection) = self.lifecycle.current.get_mut().take() {
            connection.notification_task.abort();
            connection.poll_task.abort();
        }
    }
}

/// Write handle on the selected command characteristic
#[derive(Clone)]
struct LinkWriter {
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_type: WriteType,
}

impl LinkWriter {
    fn new(peripheral: Peripheral, characteristic: Characteristic) -> Self {
        let write_type = if characteristic
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        Self {
            peripheral,
            characteristic,
            write_type,
        }
    }

    async fn write(&self, frame: &Bytes) -> Result<()> {
        debug!("Sending frame: {:02X?}", &frame[..]);
        self.peripheral
            .write(&self.characteristic, frame, self.write_type)
            .await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }
}

/// Active link to the treadmill
struct DeviceConnection {
    address: String,
    writer: LinkWriter,
    notification_task: JoinHandle<()>,
    poll_task: JoinHandle<()>,
}

/// A live link that must be torn down explicitly
#[async_trait]
trait ClosableLink: Send + 'static {
    /// Stop the link's tasks, wait for them, then drop the transport link
    async fn close(self) -> Result<()>;
}

#[async_trait]
impl ClosableLink for DeviceConnection {
    async fn close(self) -> Result<()> {
        self.poll_task.abort();
        let _ = self.poll_task.await;
        self.notification_task.abort();
        let _ = self.notification_task.await;

        if self.writer.is_connected().await {
            self.writer.peripheral.disconnect().await?;
        } else {
            debug!("Link to {} already down", self.address);
        }
        Ok(())
    }
}

/// Connection slot plus state, with connect and disconnect never interleaving
///
/// Each transition holds `transition` from start to finish, so at most one
/// link (and one set of link tasks) exists at any time.
struct LinkLifecycle<C> {
    transition: Mutex<()>,
    current: Mutex<Option<C>>,
    state: RwLock<ConnectionState>,
}

impl<C: ClosableLink> LinkLifecycle<C> {
    fn new() -> Self {
        Self {
            transition: Mutex::new(()),
            current: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn read<R>(&self, f: impl FnOnce(&C) -> R + Send) -> Option<R> {
        self.current.lock().await.as_ref().map(f)
    }

    /// Close any existing link, then install the one `establish` produces
    async fn connect<F, Fut>(&self, establish: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<C>> + Send,
    {
        let _transition = self.transition.lock().await;

        // Also clears a link that dropped without an explicit disconnect
        self.close_current().await?;
        *self.state.write().await = ConnectionState::Connecting;

        match establish().await {
            Ok(connection) => {
                let stale = self.current.lock().await.replace(connection);
                if let Some(stale) = stale {
                    if let Err(e) = stale.close().await {
                        warn!("Failed to close replaced link: {}", e);
                    }
                }
                *self.state.write().await = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        self.close_current().await
    }

    /// Callers hold `transition`
    async fn close_current(&self) -> Result<()> {
        let connection = self.current.lock().await.take();
        let result = match connection {
            Some(connection) => {
                *self.state.write().await = ConnectionState::Disconnecting;
                connection.close().await
            }
            None => Ok(()),
        };

        *self.state.write().await = ConnectionState::Disconnected;
        result
    }
}

/// Minimum spacing between belt commands; a zero interval never waits
struct CommandGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl CommandGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until the previous command is at least `min_interval` old
    async fn wait_turn(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                trace!("Delaying command until minimum interval has elapsed");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

fn spawn_notification_task(
    mut notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    notify_uuid: Uuid,
    status: Arc<watch::Sender<Option<DeviceStatus>>>,
    on_status: Option<StatusCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            if notification.uuid != notify_uuid {
                continue;
            }
            match parse_status(&notification.value) {
                Some(parsed) => {
                    status.send_replace(Some(parsed.clone()));
                    if let Some(callback) = &on_status {
                        callback(&parsed);
                    }
                }
                None => trace!("Ignoring non-status frame: {:02X?}", notification.value),
            }
        }
        debug!("Notification stream ended");
    })
}

fn spawn_poll_task(writer: LinkWriter, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let request = build_status_request_frame();
        loop {
            tokio::time::sleep(interval).await;
            if !writer.is_connected().await {
                debug!("Link reported down, stopping status poll");
                break;
            }
            if let Err(e) = writer.write(&request).await {
                warn!("Stats poll failed: {}", e);
            }
        }
    })
}

/// 16-bit alias of a Bluetooth base UUID (top 32 bits)
#[allow(clippy::cast_possible_truncation)]
const fn short_uuid(uuid: Uuid) -> u32 {
    (uuid.as_u128() >> 96) as u32
}

fn is_generic_service(uuid: Uuid) -> bool {
    GENERIC_SERVICES.contains(&short_uuid(uuid))
}

fn can_notify(characteristic: &Characteristic) -> bool {
    characteristic.properties.contains(CharPropFlags::NOTIFY)
}

fn can_write(characteristic: &Characteristic) -> bool {
    characteristic
        .properties
        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
}

/// Pick the notify/write characteristics, first match wins:
///
/// 1. The known UUIDs, if they carry the needed property.
/// 2. A non-generic service holding both a notify and a write characteristic.
/// 3. The first notify and first write found in any non-generic service.
///
/// # Errors
///
/// Returns [`BridgeError::CharacteristicNotFound`] when no notify or no write
/// characteristic survives all three tiers.
pub fn select_characteristics(services: &[Service]) -> Result<CharacteristicPair> {
    let characteristics = || services.iter().flat_map(|s| s.characteristics.iter());
    let vendor_services = || services.iter().filter(|s| !is_generic_service(s.uuid));

    let exact_notify =
        characteristics().find(|c| c.uuid == DEVICE_NOTIFY_CHAR_UUID && can_notify(c));
    let exact_write =
        characteristics().find(|c| c.uuid == DEVICE_WRITE_CHAR_UUID && can_write(c));

    if let (Some(notify), Some(write)) = (exact_notify, exact_write) {
        return Ok(CharacteristicPair {
            notify: notify.clone(),
            write: write.clone(),
        });
    }

    for service in vendor_services() {
        let notify = service.characteristics.iter().find(|c| can_notify(c));
        let write = service.characteristics.iter().find(|c| can_write(c));
        if let (Some(notify), Some(write)) = (notify, write) {
            info!(
                "Using vendor service {}: notify={}, write={}",
                service.uuid, notify.uuid, write.uuid
            );
            return Ok(CharacteristicPair {
                notify: notify.clone(),
                write: write.clone(),
            });
        }
    }

    let vendor_characteristics = || vendor_services().flat_map(|s| s.characteristics.iter());
    let notify = exact_notify.or_else(|| vendor_characteristics().find(|c| can_notify(c)));
    let write = exact_write.or_else(|| vendor_characteristics().find(|c| can_write(c)));

    let notify = notify.ok_or(BridgeError::CharacteristicNotFound {
        kind: "notify",
        expected: DEVICE_NOTIFY_CHAR_UUID,
    })?;
    let write = write.ok_or(BridgeError::CharacteristicNotFound {
        kind: "write",
        expected: DEVICE_WRITE_CHAR_UUID,
    })?;

    if notify.uuid != DEVICE_NOTIFY_CHAR_UUID {
        warn!("Notify: falling back to {}", notify.uuid);
    }
    if write.uuid != DEVICE_WRITE_CHAR_UUID {
        warn!("Write: falling back to {}", write.uuid);
    }

    Ok(CharacteristicPair {
        notify: notify.clone(),
        write: write.clone(),
    })
}

/// Order scan results: FTMS advertisers first, then named devices, then by address
pub fn sort_discovered(devices: &mut [DiscoveredDevice]) {
    devices.sort_by(|a, b| {
        b.advertises_ftms
            .cmp(&a.advertises_ftms)
            .then_with(|| b.has_name().cmp(&a.has_name()))
            .then_with(|| a.address.cmp(&b.address))
    });
}

/// Keep devices whose name starts with `name_prefix` (case-insensitive) and sort them
#[must_use]
pub fn filter_and_sort(
    devices: Vec<DiscoveredDevice>,
    name_prefix: Option<&str>,
) -> Vec<DiscoveredDevice> {
    let prefix = name_prefix.map(str::to_uppercase);
    let mut devices: Vec<DiscoveredDevice> = devices
        .into_iter()
        .filter(|device| {
            prefix
                .as_deref()
                .is_none_or(|prefix| device.name.to_uppercase().starts_with(prefix))
        })
        .collect();
    sort_discovered(&mut devices);
    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    const GAP_SERVICE: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);
    const DEVICE_NAME_CHAR: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_0080_5f9b_34fb);
    const VENDOR_SERVICE: Uuid = Uuid::from_u128(0x0000_fe00_0000_1000_8000_0080_5f9b_34fb);
    const VENDOR_NOTIFY: Uuid = Uuid::from_u128(0x0000_fe01_0000_1000_8000_0080_5f9b_34fb);
    const VENDOR_WRITE: Uuid = Uuid::from_u128(0x0000_fe02_0000_1000_8000_0080_5f9b_34fb);
    const OTHER_SERVICE: Uuid = Uuid::from_u128(0x0000_fff0_0000_1000_8000_0080_5f9b_34fb);
    const OTHER_WRITE: Uuid = Uuid::from_u128(0x0000_fff2_0000_1000_8000_0080_5f9b_34fb);

    fn characteristic(service: Uuid, uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: service,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    fn service(uuid: Uuid, characteristics: Vec<Characteristic>) -> Service {
        Service {
            uuid,
            primary: true,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    fn device(address: &str, name: &str, advertises_ftms: bool) -> DiscoveredDevice {
        DiscoveredDevice {
            address: address.to_string(),
            name: name.to_string(),
            advertises_ftms,
        }
    }

    #[test]
    fn test_uuid_constants() {
        assert_eq!(short_uuid(DEVICE_SERVICE_UUID), 0x1826);
        assert_eq!(
            DEVICE_NOTIFY_CHAR_UUID.to_string(),
            "00002acd-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            DEVICE_WRITE_CHAR_UUID.to_string(),
            "00002ad9-0000-1000-8000-00805f9b34fb"
        );
        assert!(is_generic_service(GAP_SERVICE));
        assert!(!is_generic_service(DEVICE_SERVICE_UUID));
    }

    #[test]
    fn test_select_exact_characteristics() {
        let services = vec![
            service(
                GAP_SERVICE,
                vec![characteristic(GAP_SERVICE, DEVICE_NAME_CHAR, CharPropFlags::READ)],
            ),
            service(
                VENDOR_SERVICE,
                vec![
                    characteristic(VENDOR_SERVICE, VENDOR_NOTIFY, CharPropFlags::NOTIFY),
                    characteristic(VENDOR_SERVICE, VENDOR_WRITE, CharPropFlags::WRITE),
                ],
            ),
            service(
                DEVICE_SERVICE_UUID,
                vec![
                    characteristic(DEVICE_SERVICE_UUID, DEVICE_NOTIFY_CHAR_UUID, CharPropFlags::NOTIFY),
                    characteristic(
                        DEVICE_SERVICE_UUID,
                        DEVICE_WRITE_CHAR_UUID,
                        CharPropFlags::WRITE_WITHOUT_RESPONSE,
                    ),
                ],
            ),
        ];

        let pair = select_characteristics(&services).unwrap();
        assert_eq!(pair.notify.uuid, DEVICE_NOTIFY_CHAR_UUID);
        assert_eq!(pair.write.uuid, DEVICE_WRITE_CHAR_UUID);
    }

    #[test]
    fn test_exact_uuid_without_property_is_skipped() {
        let services = vec![
            service(
                DEVICE_SERVICE_UUID,
                vec![
                    characteristic(DEVICE_SERVICE_UUID, DEVICE_NOTIFY_CHAR_UUID, CharPropFlags::READ),
                    characteristic(DEVICE_SERVICE_UUID, DEVICE_WRITE_CHAR_UUID, CharPropFlags::WRITE),
                ],
            ),
            service(
                VENDOR_SERVICE,
                vec![
                    characteristic(VENDOR_SERVICE, VENDOR_NOTIFY, CharPropFlags::NOTIFY),
                    characteristic(VENDOR_SERVICE, VENDOR_WRITE, CharPropFlags::WRITE),
                ],
            ),
        ];

        let pair = select_characteristics(&services).unwrap();
        assert_eq!(pair.notify.uuid, VENDOR_NOTIFY);
        assert_eq!(pair.write.uuid, VENDOR_WRITE);
    }

    #[test]
    fn test_select_same_service_pair_skips_generic_services() {
        let services = vec![
            service(
                GAP_SERVICE,
                vec![
                    characteristic(GAP_SERVICE, DEVICE_NAME_CHAR, CharPropFlags::NOTIFY),
                    characteristic(GAP_SERVICE, VENDOR_WRITE, CharPropFlags::WRITE),
                ],
            ),
            service(
                VENDOR_SERVICE,
                vec![characteristic(
                    VENDOR_SERVICE,
                    VENDOR_NOTIFY,
                    CharPropFlags::NOTIFY | CharPropFlags::WRITE,
                )],
            ),
        ];

        let pair = select_characteristics(&services).unwrap();
        assert_eq!(pair.notify.uuid, VENDOR_NOTIFY);
        assert_eq!(pair.write.uuid, VENDOR_NOTIFY);
    }

    #[test]
    fn test_select_falls_back_across_services() {
        let services = vec![
            service(
                VENDOR_SERVICE,
                vec![characteristic(VENDOR_SERVICE, VENDOR_NOTIFY, CharPropFlags::NOTIFY)],
            ),
            service(
                OTHER_SERVICE,
                vec![characteristic(OTHER_SERVICE, OTHER_WRITE, CharPropFlags::WRITE_WITHOUT_RESPONSE)],
            ),
        ];

        let pair = select_characteristics(&services).unwrap();
        assert_eq!(pair.notify.uuid, VENDOR_NOTIFY);
        assert_eq!(pair.write.uuid, OTHER_WRITE);
    }

    #[test]
    fn test_fallback_keeps_exact_match() {
        let services = vec![
            service(
                DEVICE_SERVICE_UUID,
                vec![characteristic(DEVICE_SERVICE_UUID, DEVICE_NOTIFY_CHAR_UUID, CharPropFlags::NOTIFY)],
            ),
            service(
                OTHER_SERVICE,
                vec![characteristic(OTHER_SERVICE, OTHER_WRITE, CharPropFlags::WRITE)],
            ),
        ];

        let pair = select_characteristics(&services).unwrap();
        assert_eq!(pair.notify.uuid, DEVICE_NOTIFY_CHAR_UUID);
        assert_eq!(pair.write.uuid, OTHER_WRITE);
    }

    #[test]
    fn test_select_reports_missing_characteristics() {
        let only_generic = vec![service(
            GAP_SERVICE,
            vec![
                characteristic(GAP_SERVICE, DEVICE_NAME_CHAR, CharPropFlags::NOTIFY),
                characteristic(GAP_SERVICE, VENDOR_WRITE, CharPropFlags::WRITE),
            ],
        )];
        let error = select_characteristics(&only_generic).unwrap_err();
        assert!(matches!(
            error,
            BridgeError::CharacteristicNotFound { kind: "notify", .. }
        ));

        let notify_only = vec![service(
            VENDOR_SERVICE,
            vec![characteristic(VENDOR_SERVICE, VENDOR_NOTIFY, CharPropFlags::NOTIFY)],
        )];
        let error = select_characteristics(&notify_only).unwrap_err();
        assert!(error.is_discovery_error());
        assert!(matches!(
            error,
            BridgeError::CharacteristicNotFound { kind: "write", .. }
        ));
    }

    #[test]
    fn test_scan_ordering() {
        let mut devices = vec![
            device("00:00:00:00:00:03", "00:00:00:00:00:03", false),
            device("00:00:00:00:00:02", "KS-SC-BLR2C", false),
            device("00:00:00:00:00:01", "00:00:00:00:00:01", true),
        ];
        sort_discovered(&mut devices);

        let order: Vec<&str> = devices.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(
            order,
            vec!["00:00:00:00:00:01", "00:00:00:00:00:02", "00:00:00:00:00:03"]
        );
    }

    #[test]
    fn test_scan_ordering_breaks_ties_by_address() {
        let mut devices = vec![
            device("CC:00:00:00:00:00", "KS-SC-B", true),
            device("AA:00:00:00:00:00", "KS-SC-C", true),
            device("BB:00:00:00:00:00", "KS-SC-A", true),
        ];
        sort_discovered(&mut devices);

        assert_eq!(devices[0].address, "AA:00:00:00:00:00");
        assert_eq!(devices[1].address, "BB:00:00:00:00:00");
        assert_eq!(devices[2].address, "CC:00:00:00:00:00");
    }

    #[test]
    fn test_name_prefix_filter_is_case_insensitive() {
        let devices = vec![
            device("00:00:00:00:00:01", "ks-sc-blr2c", false),
            device("00:00:00:00:00:02", "Polar H10", true),
            device("00:00:00:00:00:03", "KS-SC-A1", true),
        ];

        let filtered = filter_and_sort(devices.clone(), Some("KS-SC-"));
        let names: Vec<&str> = filtered.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["KS-SC-A1", "ks-sc-blr2c"]);

        assert_eq!(filter_and_sort(devices, None).len(), 3);
    }

    fn status_frame(speed_raw: u8, steps: u32) -> Vec<u8> {
        let mut frame = vec![0xF8, 0xA2, 1, speed_raw, 1, 0, 0, 60, 0, 0, 5];
        frame.extend_from_slice(&steps.to_be_bytes()[1..]);
        frame.extend_from_slice(&[0, 0, 0, 0, 0]);
        frame
    }

    #[tokio::test]
    async fn test_notification_task_publishes_status_frames_in_order() {
        let (status, _keep) = watch::channel(None);
        let status = Arc::new(status);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let callback: StatusCallback = Arc::new(move |parsed: &DeviceStatus| {
            recorder.lock().unwrap().push(parsed.clone());
        });

        let notifications = futures::stream::iter(vec![
            // Right characteristic, wrong marker
            ValueNotification {
                uuid: DEVICE_NOTIFY_CHAR_UUID,
                value: vec![0xF7, 0xA2, 0x00, 0x00],
            },
            // Valid frame on an unrelated characteristic
            ValueNotification {
                uuid: VENDOR_NOTIFY,
                value: status_frame(99, 1),
            },
            ValueNotification {
                uuid: DEVICE_NOTIFY_CHAR_UUID,
                value: status_frame(25, 100),
            },
            // Truncated frame
            ValueNotification {
                uuid: DEVICE_NOTIFY_CHAR_UUID,
                value: status_frame(40, 7)[..10].to_vec(),
            },
            ValueNotification {
                uuid: DEVICE_NOTIFY_CHAR_UUID,
                value: status_frame(32, 250),
            },
        ])
        .boxed();

        let task = spawn_notification_task(
            notifications,
            DEVICE_NOTIFY_CHAR_UUID,
            status.clone(),
            Some(callback),
        );
        tokio_test::assert_ok!(task.await);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!((seen[0].speed_kmh - 2.5).abs() < 1e-9);
        assert_eq!(seen[0].step_count, 100);
        assert!((seen[1].speed_kmh - 3.2).abs() < 1e-9);
        assert_eq!(seen[1].step_count, 250);
        assert_eq!(*status.borrow(), Some(seen[1].clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_gate_spaces_consecutive_commands() {
        let gate = CommandGate::new(Duration::from_millis(690));
        let started = Instant::now();

        gate.wait_turn().await;
        assert!(started.elapsed() < Duration::from_millis(1));

        gate.wait_turn().await;
        let gap = started.elapsed();
        assert!(gap >= Duration::from_millis(690), "gap was {gap:?}");
        assert!(gap < Duration::from_millis(700), "gap was {gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_gate_zero_interval_never_waits() {
        let gate = CommandGate::new(Duration::ZERO);
        let started = Instant::now();

        for _ in 0..5 {
            gate.wait_turn().await;
        }
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_gate_skips_wait_after_idle_period() {
        let gate = CommandGate::new(Duration::from_millis(690));
        gate.wait_turn().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let resumed = Instant::now();
        gate.wait_turn().await;
        assert!(resumed.elapsed() < Duration::from_millis(1));
    }

    struct FakeConnection {
        live: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClosableLink for FakeConnection {
        async fn close(self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct LinkCounters {
        live: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl LinkCounters {
        async fn establish(self, delay: Duration) -> Result<FakeConnection> {
            tokio::time::sleep(delay).await;
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(FakeConnection { live: self.live })
        }
    }

    #[tokio::test]
    async fn test_concurrent_connects_keep_a_single_link() {
        let lifecycle = Arc::new(LinkLifecycle::<FakeConnection>::new());
        let counters = LinkCounters::default();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    lifecycle
                        .connect(|| counters.establish(Duration::from_millis(20)))
                        .await
                })
            })
            .collect();
        for task in tasks {
            tokio_test::assert_ok!(tokio_test::assert_ok!(task.await));
        }

        assert_eq!(counters.live.load(Ordering::SeqCst), 1);
        assert_eq!(counters.peak.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect_leaves_no_link() {
        let lifecycle = Arc::new(LinkLifecycle::<FakeConnection>::new());
        let counters = LinkCounters::default();

        let connecting = {
            let lifecycle = lifecycle.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                lifecycle
                    .connect(|| counters.establish(Duration::from_millis(50)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lifecycle.state().await, ConnectionState::Connecting);

        tokio_test::assert_ok!(lifecycle.disconnect().await);
        tokio_test::assert_ok!(tokio_test::assert_ok!(connecting.await));

        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.state().await, ConnectionState::Disconnected);
        assert!(lifecycle.read(|_| ()).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_closes_previous_link() {
        let lifecycle = LinkLifecycle::<FakeConnection>::new();
        let counters = LinkCounters::default();

        tokio_test::assert_ok!(
            lifecycle
                .connect(|| counters.clone().establish(Duration::ZERO))
                .await
        );
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);

        tokio_test::assert_err!(
            lifecycle
                .connect(|| async { Err::<FakeConnection, _>(BridgeError::NotConnected) })
                .await
        );
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.state().await, ConnectionState::Disconnected);
    }
}

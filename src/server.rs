//! FTMS peripheral exposed to fitness apps.
//!
//! [`FitnessServer`] owns the GATT registration and the control point state
//! machine. Everything that touches the registration runs on the server's
//! own task: status updates and control writes reach it as [`ServerEvent`]s
//! over a channel instead of being applied from the sender's context.

use async_trait::async_trait;
use bluer::{
    adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType},
    gatt::local::{
        Application, ApplicationHandle, Characteristic, CharacteristicNotifier,
        CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead,
        CharacteristicWrite, CharacteristicWriteMethod, ReqError, Service,
    },
};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::{BridgeError, Result},
    ftms::{
        encode_feature, encode_treadmill_data, ControlPoint, APPEARANCE_RUNNING_WALKING,
        CONTROL_POINT_UUID, FEATURE_UUID, FTMS_SERVICE_UUID, TREADMILL_DATA_UUID,
    },
    types::DeviceStatus,
};

/// Work handed to the server task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A new treadmill status is available; push Treadmill Data
    StatusUpdated,
    /// A client wrote to the control point
    ControlPointWrite(Vec<u8>),
}

/// A live FTMS GATT service plus advertisement
#[async_trait]
pub trait GattRegistration: Send + 'static {
    /// Notify a Treadmill Data frame to every subscribed client
    async fn notify_treadmill_data(&mut self, frame: &[u8]);

    /// Indicate a control point response to every subscribed client
    async fn indicate_control_response(&mut self, response: &[u8]);

    /// Withdraw the advertisement and the service
    async fn unregister(self);
}

/// Something able to publish the FTMS service on an adapter
#[async_trait]
pub trait PeripheralBackend: Send + Sync + 'static {
    /// Registration produced by [`PeripheralBackend::register`]
    type Registration: GattRegistration;

    /// Register the service and start advertising as `advertised_name`.
    ///
    /// Reads of Treadmill Data are served from `status`; control point
    /// writes are forwarded to `events`.
    async fn register(
        &self,
        advertised_name: &str,
        status: watch::Receiver<Option<DeviceStatus>>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Self::Registration>;
}

/// The FTMS peripheral: one registration, one control session
pub struct FitnessServer<R: GattRegistration> {
    registration: R,
    control_point: ControlPoint,
    status: watch::Receiver<Option<DeviceStatus>>,
}

impl<R: GattRegistration> FitnessServer<R> {
    /// Wrap a registration
    pub const fn new(
        registration: R,
        control_point: ControlPoint,
        status: watch::Receiver<Option<DeviceStatus>>,
    ) -> Self {
        Self {
            registration,
            control_point,
            status,
        }
    }

    /// Push the Treadmill Data frame for the latest status
    pub async fn notify(&mut self) {
        let frame = encode_treadmill_data(self.status.borrow().as_ref());
        self.registration.notify_treadmill_data(&frame).await;
    }

    /// Run one control point write through the state machine and indicate the response
    pub async fn handle_control_write(&mut self, value: &[u8]) {
        match self.control_point.handle_write(value) {
            Some(response) => {
                self.registration.indicate_control_response(&response).await;
            }
            None => debug!("Ignoring empty control point write"),
        }
    }

    /// Serve events until `shutdown` fires (or its sender is dropped), then unregister.
    ///
    /// Unregistering happens exactly once, on every exit path.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        info!("FTMS server running");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(ServerEvent::StatusUpdated) => self.notify().await,
                    Some(ServerEvent::ControlPointWrite(value)) => {
                        self.handle_control_write(&value).await;
                    }
                    None => break,
                },
            }
        }

        self.registration.unregister().await;
        info!("FTMS server stopped");
    }
}

/// BlueZ-backed peripheral on a named adapter
#[derive(Debug, Clone)]
pub struct BluezPeripheral {
    adapter: String,
}

impl BluezPeripheral {
    /// Use the adapter called `adapter` (e.g. `hci0`)
    #[must_use]
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
        }
    }

    fn unavailable(&self, error: &bluer::Error) -> BridgeError {
        BridgeError::AdapterUnavailable {
            adapter: self.adapter.clone(),
            reason: error.to_string(),
        }
    }
}

type Subscribers = Arc<Mutex<Vec<CharacteristicNotifier>>>;

/// FTMS service and advertisement registered with BlueZ
///
/// Dropping the handles unregisters them.
pub struct BluezRegistration {
    advertisement: AdvertisementHandle,
    application: ApplicationHandle,
    data_subscribers: Subscribers,
    control_subscribers: Subscribers,
    _session: bluer::Session,
}

#[async_trait]
impl GattRegistration for BluezRegistration {
    async fn notify_treadmill_data(&mut self, frame: &[u8]) {
        push_to_subscribers(&self.data_subscribers, frame, "Treadmill Data").await;
    }

    async fn indicate_control_response(&mut self, response: &[u8]) {
        debug!("Control point response: {:02X?}", response);
        push_to_subscribers(&self.control_subscribers, response, "Control Point").await;
    }

    async fn unregister(self) {
        drop(self.advertisement);
        drop(self.application);
        info!("FTMS advertisement and service unregistered");
    }
}

#[async_trait]
impl PeripheralBackend for BluezPeripheral {
    type Registration = BluezRegistration;

    async fn register(
        &self,
        advertised_name: &str,
        status: watch::Receiver<Option<DeviceStatus>>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<BluezRegistration> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| self.unavailable(&e))?;
        let adapter = session
            .adapter(&self.adapter)
            .map_err(|e| self.unavailable(&e))?;
        if !adapter.is_powered().await.map_err(|e| self.unavailable(&e))? {
            adapter
                .set_powered(true)
                .await
                .map_err(|e| self.unavailable(&e))?;
        }

        let data_subscribers = Subscribers::default();
        let control_subscribers = Subscribers::default();

        let application = Application {
            services: vec![Service {
                uuid: FTMS_SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    feature_characteristic(),
                    treadmill_data_characteristic(status, data_subscribers.clone()),
                    control_point_characteristic(events, control_subscribers.clone()),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let application = adapter.serve_gatt_application(application).await?;
        info!("FTMS GATT service registered on {}", self.adapter);

        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: [FTMS_SERVICE_UUID].into_iter().collect(),
            local_name: Some(advertised_name.to_string()),
            appearance: Some(APPEARANCE_RUNNING_WALKING),
            discoverable: Some(true),
            ..Default::default()
        };
        let advertisement = adapter.advertise(advertisement).await?;
        info!("Advertising as '{}' with FTMS service", advertised_name);

        Ok(BluezRegistration {
            advertisement,
            application,
            data_subscribers,
            control_subscribers,
            _session: session,
        })
    }
}

fn feature_characteristic() -> Characteristic {
    Characteristic {
        uuid: FEATURE_UUID,
        read: Some(CharacteristicRead {
            read: true,
            fun: Box::new(|_request| {
                async move {
                    debug!("Feature characteristic read");
                    Ok(encode_feature().to_vec())
                }
                .boxed()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn treadmill_data_characteristic(
    status: watch::Receiver<Option<DeviceStatus>>,
    subscribers: Subscribers,
) -> Characteristic {
    Characteristic {
        uuid: TREADMILL_DATA_UUID,
        read: Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |_request| {
                let frame = encode_treadmill_data(status.borrow().as_ref()).to_vec();
                async move { Ok(frame) }.boxed()
            }),
            ..Default::default()
        }),
        notify: Some(CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let subscribers = subscribers.clone();
                async move {
                    info!("Treadmill Data notification session started");
                    subscribers.lock().await.push(notifier);
                }
                .boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn control_point_characteristic(
    events: mpsc::UnboundedSender<ServerEvent>,
    subscribers: Subscribers,
) -> Characteristic {
    Characteristic {
        uuid: CONTROL_POINT_UUID,
        write: Some(CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, _request| {
                if events.send(ServerEvent::ControlPointWrite(value)).is_err() {
                    warn!("Control point write received after server shutdown");
                }
                async move { Ok::<(), ReqError>(()) }.boxed()
            })),
            ..Default::default()
        }),
        notify: Some(CharacteristicNotify {
            indicate: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let subscribers = subscribers.clone();
                async move {
                    info!("Control Point indication session started");
                    subscribers.lock().await.push(notifier);
                }
                .boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Send `value` to every live subscriber, dropping those that went away
async fn push_to_subscribers(subscribers: &Mutex<Vec<CharacteristicNotifier>>, value: &[u8], what: &str) {
    let mut subscribers = subscribers.lock().await;
    let mut live = Vec::with_capacity(subscribers.len());

    for mut notifier in subscribers.drain(..) {
        if notifier.is_stopped() {
            debug!("{} subscriber left", what);
            continue;
        }
        match notifier.notify(value.to_vec()).await {
            Ok(()) => live.push(notifier),
            Err(e) => warn!("{} notification error: {}", what, e),
        }
    }

    *subscribers = live;
}

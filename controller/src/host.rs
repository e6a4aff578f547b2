use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use boiler_common::{
    connectivity::{LinkStatus, NetError, WifiDriver},
    ha::transport::{BrokerOptions, MqttTransport, TransportError, TransportEvent},
    indicator::{self, FatalReason, Indicator, NullIndicator},
    record::{PersistentRegion, StorageError},
    sensor::{HeaterOutput, SensorBus, SensorError},
    store::STORAGE_CAPACITY,
    timesync::RealTimeClock,
    BoilerController, ConfigStore, NetworkConfig, SensorId, TransitionError,
};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    app::{spawn_stdin_reader, App, ControlHardware, Platform},
    ntp::UdpNtp,
};

const AMBIENT_ID: SensorId = SensorId(0x0100_0000_0000_0028);
const BOILER_IN_ID: SensorId = SensorId(0x0200_0000_0000_0028);
const BOILER_OUT_ID: SensorId = SensorId(0x0300_0000_0000_0028);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct BusView {
    stats: boiler_common::types::OneWireBusStats,
    #[serde(rename = "averageMs")]
    average_ms: u32,
    sensors: Vec<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("BOILER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.boiler"));
    let region = FileRegion::open(data_dir.join("storage.bin"), STORAGE_CAPACITY)
        .with_context(|| format!("failed to open storage under {}", data_dir.display()))?;

    let mut store = match ConfigStore::open(Box::new(region)) {
        Ok(store) => store,
        Err(err) => {
            warn!("config store: {err}");
            indicator::halt(FatalReason::StorageUnavailable, &mut LogIndicator::default());
        }
    };
    if store.boot_count() == 0 {
        seed_from_env(&mut store);
    }

    let heater_on = Arc::new(AtomicBool::new(false));
    let hardware = ControlHardware {
        bus: SimulatedBus::new(heater_on.clone()),
        heater: SimulatedHeater(heater_on),
        heartbeat: NullIndicator,
    };

    let (lines_tx, lines_rx) = mpsc::channel();
    spawn_stdin_reader(lines_tx)?;

    let platform = Platform {
        wifi: HostWifi::default(),
        ntp: UdpNtp::new(std::env::var("NTP_SERVER").unwrap_or_else(|_| "pool.ntp.org".into()))?,
        clock: LoggingClock,
        mqtt: RumqttcTransport::new(Handle::current()),
        status_led: LogIndicator::default(),
        console: Some(lines_rx),
        console_out: Box::new(std::io::stdout()),
    };

    let app = App::boot(store, hardware, platform, clock_ms);
    let controller = app.controller();
    thread::Builder::new()
        .name("app".into())
        .spawn(move || app.run(clock_ms))
        .context("failed to spawn application thread")?;

    let router = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/bus", get(handle_get_bus))
        .route("/api/start", post(handle_start))
        .route("/api/stop", post(handle_stop))
        .route("/api/reset", post(handle_reset))
        .with_state(controller);

    let port = std::env::var("BOILER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("status server listening on http://{addr}");
    axum::serve(listener, router).await?;
    Ok(())
}

/// First-boot defaults so the simulator comes up connected and configured.
fn seed_from_env(store: &mut ConfigStore) {
    let mut network = store.network();
    let ssid = std::env::var("BOILER_WIFI_SSID").unwrap_or_else(|_| "host".into());
    let pass = std::env::var("BOILER_WIFI_PASS").unwrap_or_default();
    if let Err(err) = network.set_credentials(&ssid, &pass) {
        warn!("ignoring wifi seed: {err}");
    }

    let mut mqtt = store.mqtt();
    for (var, name) in [
        ("MQTT_HOST", "host"),
        ("MQTT_PORT", "port"),
        ("MQTT_USER", "user"),
        ("MQTT_PASS", "pass"),
        ("MQTT_BASE_TOPIC", "base"),
        ("MQTT_DEVICE", "device"),
    ] {
        if let Ok(value) = std::env::var(var) {
            if let Err(err) = mqtt.set_var(name, &value) {
                warn!("ignoring {var}: {err}");
            }
        }
    }
    mqtt.enabled = std::env::var("MQTT_HOST").is_ok();

    let mut roles = store.sensor_roles();
    roles.ambient = AMBIENT_ID;
    roles.boiler_in = BOILER_IN_ID;
    roles.boiler_out = BOILER_OUT_ID;

    let saved = store
        .save_network(&network)
        .and_then(|()| store.save_mqtt(&mqtt))
        .and_then(|()| store.save_sensor_roles(&roles));
    match saved {
        Ok(()) => info!("seeded first-boot configuration"),
        Err(err) => warn!("failed to seed configuration: {err}"),
    }
}

async fn handle_get_status(State(controller): State<BoilerController>) -> impl IntoResponse {
    Json(controller.snapshot())
}

async fn handle_get_bus(State(controller): State<BoilerController>) -> impl IntoResponse {
    let stats = controller.bus_stats();
    Json(BusView {
        stats,
        average_ms: stats.average_ms(),
        sensors: controller
            .discovered_sensors()
            .into_iter()
            .map(|id| id.to_string())
            .collect(),
    })
}

fn transition_response(result: Result<(), TransitionError>) -> axum::response::Response {
    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => error_response(StatusCode::CONFLICT, &err.to_string()),
    }
}

async fn handle_start(State(controller): State<BoilerController>) -> impl IntoResponse {
    transition_response(controller.start())
}

async fn handle_stop(State(controller): State<BoilerController>) -> impl IntoResponse {
    transition_response(controller.stop())
}

async fn handle_reset(State(controller): State<BoilerController>) -> impl IntoResponse {
    transition_response(controller.reset())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn clock_ms() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    // Wraps like the device millisecond counter.
    START.get_or_init(Instant::now).elapsed().as_millis() as u32
}

/// Persistent region mirrored to a single file, rewritten on flush.
struct FileRegion {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl FileRegion {
    fn open(path: PathBuf, capacity: usize) -> anyhow::Result<Self> {
        let mut bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        bytes.resize(capacity, 0);
        Ok(Self { path, bytes })
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), StorageError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(StorageError::OutOfRange {
                offset,
                len,
                capacity: self.bytes.len(),
            }),
        }
    }
}

impl PersistentRegion for FileRegion {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        self.check(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StorageError::Io(err.to_string()))?;
        }
        std::fs::write(&self.path, &self.bytes).map_err(|err| StorageError::Io(err.to_string()))
    }
}

/// Three-sensor thermal model: the outlet warms while the heater runs and
/// relaxes toward ambient otherwise.
struct SimulatedBus {
    heater_on: Arc<AtomicBool>,
    ambient: f32,
    boiler_out: f32,
    cursor: usize,
    last_step: Instant,
}

impl SimulatedBus {
    const IDS: [SensorId; 3] = [AMBIENT_ID, BOILER_IN_ID, BOILER_OUT_ID];
    const HEAT_RATE_C_PER_S: f32 = 0.4;
    const LOSS_PER_S: f32 = 0.01;

    fn new(heater_on: Arc<AtomicBool>) -> Self {
        Self {
            heater_on,
            ambient: 18.0,
            boiler_out: 35.0,
            cursor: 0,
            last_step: Instant::now(),
        }
    }

    fn step(&mut self) {
        let dt = self.last_step.elapsed().as_secs_f32();
        self.last_step = Instant::now();
        if self.heater_on.load(Ordering::Relaxed) {
            self.boiler_out += Self::HEAT_RATE_C_PER_S * dt;
        }
        self.boiler_out -= (self.boiler_out - self.ambient) * Self::LOSS_PER_S * dt;
    }
}

impl SensorBus for SimulatedBus {
    fn reset_search(&mut self) {
        self.cursor = 0;
    }

    fn select_next(&mut self) -> Result<bool, SensorError> {
        if self.cursor < Self::IDS.len() {
            self.cursor += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn address(&self) -> SensorId {
        self.cursor
            .checked_sub(1)
            .and_then(|index| Self::IDS.get(index).copied())
            .unwrap_or(SensorId::INVALID)
    }

    fn start_conversion(&mut self) -> Result<(), SensorError> {
        self.step();
        Ok(())
    }

    fn read_temperature(&mut self, id: SensorId) -> Result<f32, SensorError> {
        match id {
            AMBIENT_ID => Ok(self.ambient),
            BOILER_IN_ID => Ok(self.ambient + (self.boiler_out - self.ambient) * 0.6),
            BOILER_OUT_ID => Ok(self.boiler_out),
            other => Err(SensorError::NotPresent(other)),
        }
    }
}

struct SimulatedHeater(Arc<AtomicBool>);

impl HeaterOutput for SimulatedHeater {
    fn set(&mut self, on: bool) {
        if self.0.swap(on, Ordering::Relaxed) != on {
            info!("heater {}", if on { "on" } else { "off" });
        }
    }
}

#[derive(Debug, Default)]
struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&mut self, on: bool) {
        debug!("status led {}", if on { "on" } else { "off" });
    }
}

/// The host is always associated; the address is whatever the default route
/// would use.
#[derive(Debug, Default)]
struct HostWifi {
    configured: bool,
}

impl WifiDriver for HostWifi {
    fn configure(&mut self, config: &NetworkConfig) -> Result<(), NetError> {
        info!("simulated wifi join `{}`", config.wifi_ssid);
        self.configured = true;
        Ok(())
    }

    fn begin_connect(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    fn link_status(&mut self) -> LinkStatus {
        if self.configured {
            LinkStatus::Connected
        } else {
            LinkStatus::Idle
        }
    }

    fn ip_address(&mut self) -> Option<Ipv4Addr> {
        let route = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        if route.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).is_err() {
            return Some(Ipv4Addr::LOCALHOST);
        }
        match route.local_addr().ok()?.ip() {
            std::net::IpAddr::V4(address) => Some(address),
            std::net::IpAddr::V6(_) => Some(Ipv4Addr::LOCALHOST),
        }
    }

    fn disconnect(&mut self) {
        self.configured = false;
    }
}

/// The host clock is owned by the OS; report drift instead of setting it.
struct LoggingClock;

impl RealTimeClock for LoggingClock {
    fn set_time(&mut self, now: DateTime<Utc>) {
        let drift = Utc::now().signed_duration_since(now).num_milliseconds();
        info!("ntp time {} (system drift {drift} ms)", now.to_rfc3339());
    }
}

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
    events: mpsc::Receiver<TransportEvent>,
}

/// Non-blocking adapter over rumqttc. The event loop runs as a tokio task and
/// stops on the first connection error; reconnecting is left to the caller.
struct RumqttcTransport {
    runtime: Handle,
    session: Option<Session>,
}

impl RumqttcTransport {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            session: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.session
            .as_ref()
            .map(|session| &session.client)
            .ok_or(TransportError::NotConnected)
    }
}

impl MqttTransport for RumqttcTransport {
    fn connect(&mut self, options: &BrokerOptions) -> Result<(), TransportError> {
        self.disconnect();

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(u64::from(options.keep_alive_secs)));
        if let Some(user) = &options.username {
            mqtt_options
                .set_credentials(user.clone(), options.password.clone().unwrap_or_default());
        }
        mqtt_options.set_last_will(LastWill::new(
            options.last_will.topic.clone(),
            options.last_will.payload.clone(),
            QoS::AtMostOnce,
            options.last_will.retain,
        ));

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 64);
        let (tx, rx) = mpsc::channel();
        let task = self.runtime.spawn(async move {
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => TransportEvent::Connected,
                    Ok(Event::Incoming(Incoming::Publish(message))) => TransportEvent::Message {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    },
                    Ok(_) => continue,
                    Err(err) => {
                        warn!("mqtt connection error: {err}");
                        let _ = tx.send(TransportEvent::Disconnected);
                        break;
                    }
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        self.session = Some(Session {
            client,
            task,
            events: rx,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.client.try_disconnect();
            session.task.abort();
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, retain, payload.as_bytes().to_vec())
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.session.as_ref()?.events.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn simulated_bus_enumerates_three_sensors() {
        let mut bus = SimulatedBus::new(Arc::new(AtomicBool::new(false)));
        let found = boiler_common::sensor::enumerate(&mut bus).unwrap();
        assert_eq!(found, SimulatedBus::IDS.to_vec());
        assert!(matches!(
            bus.read_temperature(SensorId(7)),
            Err(SensorError::NotPresent(_))
        ));
    }

    #[test]
    fn simulated_outlet_warms_with_heater() {
        let heater = Arc::new(AtomicBool::new(true));
        let mut bus = SimulatedBus::new(heater);
        let start = bus.read_temperature(BOILER_OUT_ID).unwrap();
        bus.last_step -= Duration::from_secs(10);
        bus.start_conversion().unwrap();
        assert!(bus.read_temperature(BOILER_OUT_ID).unwrap() > start);
    }

    #[test]
    fn file_region_persists_on_flush() {
        let dir = std::env::temp_dir().join(format!("boiler-region-{}", std::process::id()));
        let path = dir.join("storage.bin");
        let mut region = FileRegion::open(path.clone(), 64).unwrap();
        region.write(8, &[1, 2, 3]).unwrap();
        region.flush().unwrap();

        let mut reopened = FileRegion::open(path, 64).unwrap();
        let mut buf = [0; 3];
        reopened.read(8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert!(reopened.write(62, &[0; 3]).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn env_seed_sets_roles_and_credentials() {
        let mut store = ConfigStore::open(Box::new(boiler_common::record::MemoryRegion::new(
            STORAGE_CAPACITY,
        )))
        .unwrap();
        seed_from_env(&mut store);
        assert!(store.network().has_credentials());
        assert_eq!(store.sensor_roles().boiler_out, BOILER_OUT_ID);
    }
}

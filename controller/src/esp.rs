use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::mpsc,
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use boiler_common::{
    connectivity::{LinkStatus, NetError, WifiDriver},
    ha::transport::{BrokerOptions, MqttTransport, TransportError, TransportEvent},
    indicator::{self, FatalReason, Indicator},
    record::{PersistentRegion, StorageError},
    sensor::{HeaterOutput, SensorBus, SensorError, DS18B20_FAMILY_CODE},
    store::STORAGE_CAPACITY,
    timesync::RealTimeClock,
    ConfigStore, NetworkConfig, SensorId,
};
use chrono::{DateTime, Utc};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, LwtConfiguration, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys,
    wifi::EspWifi,
};
use log::{debug, info, warn};
use one_wire_bus::{Address, OneWire, SearchState};

use crate::{
    app::{spawn_stdin_reader, App, ControlHardware, Platform, APP_TICK_MS},
    ntp::UdpNtp,
};

const NVS_NAMESPACE: &str = "boiler";
const NVS_STORAGE_KEY: &str = "storage";
const NTP_SERVER: &str = "pool.ntp.org";
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
const ONE_WIRE_PIN: i32 = 4;
const HEATER_PIN: i32 = 5;
const STATUS_LED_PIN: i32 = 48;
const HEARTBEAT_LED_PIN: i32 = 2;

pub fn run() -> anyhow::Result<()> {
    sys::link_patches();
    EspLogger::initialize_default();

    let mut status_led = GpioIndicator::new(STATUS_LED_PIN);

    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = match NvsRegion::open(nvs_partition.clone())
        .map_err(|err| anyhow!("{err}"))
        .and_then(|region| ConfigStore::open(Box::new(region)).map_err(|err| anyhow!("{err}")))
    {
        Ok(store) => store,
        Err(err) => {
            warn!("config store: {err:#}");
            indicator::halt(FatalReason::StorageUnavailable, &mut status_led);
        }
    };

    let sys_loop = EspSystemEventLoop::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition)).context("wifi driver")?;

    let hardware = ControlHardware {
        bus: Ds18b20Bus::new(ONE_WIRE_PIN)?,
        heater: GpioHeater::new(HEATER_PIN)?,
        heartbeat: GpioIndicator::new(HEARTBEAT_LED_PIN),
    };

    let (lines_tx, lines_rx) = mpsc::channel();
    spawn_stdin_reader(lines_tx)?;

    let platform = Platform {
        wifi: EspWifiDriver { wifi },
        ntp: UdpNtp::new(NTP_SERVER.to_string())?,
        clock: SystemClock,
        mqtt: EspMqttTransport::default(),
        status_led,
        console: Some(lines_rx),
        console_out: Box::new(std::io::stdout()),
    };

    let mut app = App::boot(store, hardware, platform, clock_ms);
    let watchdog = TaskWatchdog::subscribe_current(WATCHDOG_TIMEOUT)?;
    loop {
        app.poll(clock_ms());
        watchdog.feed();
        thread::sleep(Duration::from_millis(APP_TICK_MS));
    }
}

fn clock_ms() -> u32 {
    let micros = unsafe { sys::esp_timer_get_time() };
    (micros / 1_000) as u32
}

/// The whole record image kept in one NVS blob.
struct NvsRegion {
    nvs: EspNvs<NvsDefault>,
    bytes: Vec<u8>,
}

impl NvsRegion {
    fn open(partition: EspDefaultNvsPartition) -> Result<Self, StorageError> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .map_err(|err| StorageError::Io(err.to_string()))?;
        let mut bytes = vec![0_u8; STORAGE_CAPACITY];
        let found = nvs
            .get_blob(NVS_STORAGE_KEY, &mut bytes)
            .map_err(|err| StorageError::Io(err.to_string()))?
            .map(<[u8]>::len);
        match found {
            Some(len) => bytes[len..].fill(0),
            None => bytes.fill(0),
        }
        Ok(Self { nvs, bytes })
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

impl PersistentRegion for NvsRegion {
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
        self.nvs
            .set_blob(NVS_STORAGE_KEY, &self.bytes)
            .map_err(|err| StorageError::Io(err.to_string()))
    }
}

type OneWirePin = PinDriver<'static, AnyIOPin, InputOutput>;

/// DS18B20 devices on one open-drain GPIO.
struct Ds18b20Bus {
    wire: OneWire<OneWirePin>,
    delay: Ets,
    search: Option<SearchState>,
    current: SensorId,
    exhausted: bool,
}

impl Ds18b20Bus {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::input_output_od(AnyIOPin::new(pin)) }?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        let wire = OneWire::new(pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;
        Ok(Self {
            wire,
            delay: Ets,
            search: None,
            current: SensorId::INVALID,
            exhausted: false,
        })
    }
}

impl SensorBus for Ds18b20Bus {
    fn reset_search(&mut self) {
        self.search = None;
        self.current = SensorId::INVALID;
        self.exhausted = false;
    }

    fn select_next(&mut self) -> Result<bool, SensorError> {
        if self.exhausted {
            return Ok(false);
        }
        loop {
            let found = self
                .wire
                .device_search(self.search.as_ref(), false, &mut self.delay)
                .map_err(|err| SensorError::Bus(format!("{err:?}")))?;
            let Some((address, state)) = found else {
                self.exhausted = true;
                return Ok(false);
            };
            self.search = Some(state);
            if address.family_code() == DS18B20_FAMILY_CODE {
                self.current = SensorId(address.0);
                return Ok(true);
            }
        }
    }

    fn address(&self) -> SensorId {
        self.current
    }

    fn start_conversion(&mut self) -> Result<(), SensorError> {
        ds18b20::start_simultaneous_temp_measurement(&mut self.wire, &mut self.delay)
            .map_err(|err| SensorError::Bus(format!("{err:?}")))?;
        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);
        Ok(())
    }

    fn read_temperature(&mut self, id: SensorId) -> Result<f32, SensorError> {
        let sensor = Ds18b20::new::<core::convert::Infallible>(Address(id.0))
            .map_err(|_| SensorError::NotPresent(id))?;
        let data = sensor
            .read_data(&mut self.wire, &mut self.delay)
            .map_err(|err| SensorError::ReadFailed(id, format!("{err:?}")))?;
        Ok(data.temperature)
    }
}

struct GpioHeater {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioHeater {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }?;
        pin.set_low()?;
        Ok(Self { pin })
    }
}

impl HeaterOutput for GpioHeater {
    fn set(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive heater output: {err}");
        }
    }
}

/// LED on a GPIO; missing hardware degrades to a no-op.
struct GpioIndicator {
    pin: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

impl GpioIndicator {
    fn new(pin: i32) -> Self {
        match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
            Ok(mut driver) => {
                let _ = driver.set_low();
                Self { pin: Some(driver) }
            }
            Err(err) => {
                warn!("LED unavailable on GPIO{pin}: {err}");
                Self { pin: None }
            }
        }
    }
}

impl Indicator for GpioIndicator {
    fn set(&mut self, on: bool) {
        let Some(pin) = self.pin.as_mut() else {
            return;
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive LED: {err}");
        }
    }
}

struct EspWifiDriver {
    wifi: EspWifi<'static>,
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<EspNetif> {
    if !network.use_static_ip {
        return Ok(EspNetif::new_with_conf(&NetifConfiguration::wifi_default_client())?);
    }
    let mask = Mask::try_from(network.subnet)
        .map_err(|_| anyhow!("invalid subnet mask: {}", network.subnet))?;
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: network.static_ip,
                subnet: Subnet {
                    gateway: network.gateway,
                    mask,
                },
                dns: Some(network.dns),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };
    Ok(EspNetif::new_with_conf(&conf)?)
}

impl WifiDriver for EspWifiDriver {
    fn configure(&mut self, config: &NetworkConfig) -> Result<(), NetError> {
        let netif = build_sta_netif(config).map_err(|err| NetError::Config(format!("{err:#}")))?;
        self.wifi
            .swap_netif_sta(netif)
            .map_err(|err| NetError::Driver(err.to_string()))?;

        let auth_method = if config.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let client = ClientConfiguration {
            ssid: config
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| NetError::Config("wifi ssid too long".into()))?,
            password: config
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| NetError::Config("wifi password too long".into()))?,
            auth_method,
            ..Default::default()
        };
        self.wifi
            .set_configuration(&Configuration::Client(client))
            .map_err(|err| NetError::Driver(err.to_string()))
    }

    fn begin_connect(&mut self) -> Result<(), NetError> {
        let started = self
            .wifi
            .is_started()
            .map_err(|err| NetError::Driver(err.to_string()))?;
        if !started {
            self.wifi
                .start()
                .map_err(|err| NetError::Driver(err.to_string()))?;
            match sys::esp!(unsafe { sys::esp_wifi_set_ps(sys::wifi_ps_type_t_WIFI_PS_NONE) }) {
                Ok(()) => debug!("wifi modem sleep off"),
                Err(err) => warn!("wifi modem sleep left on: {err}"),
            }
        }
        self.wifi
            .connect()
            .map_err(|err| NetError::Driver(err.to_string()))
    }

    fn link_status(&mut self) -> LinkStatus {
        match self.wifi.is_connected() {
            Ok(true) => LinkStatus::Connected,
            Ok(false) => LinkStatus::Connecting,
            Err(err) => {
                warn!("wifi status query failed: {err}");
                LinkStatus::Failed
            }
        }
    }

    fn ip_address(&mut self) -> Option<Ipv4Addr> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }
}

/// Sets the libc wall clock used by ESP-IDF.
struct SystemClock;

impl RealTimeClock for SystemClock {
    fn set_time(&mut self, now: DateTime<Utc>) {
        let tv = sys::timeval {
            tv_sec: now.timestamp() as _,
            tv_usec: now.timestamp_subsec_micros() as _,
        };
        let rc = unsafe { sys::settimeofday(&tv, core::ptr::null()) };
        if rc != 0 {
            warn!("settimeofday failed with code {rc}");
        }
    }
}

/// ESP-IDF MQTT client with its callback bridged onto a channel. The client
/// is dropped on disconnect so reconnects stay under the caller's control.
#[derive(Default)]
struct EspMqttTransport {
    client: Option<EspMqttClient<'static>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
}

impl EspMqttTransport {
    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, TransportError> {
        self.client.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl MqttTransport for EspMqttTransport {
    fn connect(&mut self, options: &BrokerOptions) -> Result<(), TransportError> {
        self.disconnect();

        let url = format!("mqtt://{}:{}", options.host, options.port);
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id.as_str()),
            username: options.username.as_deref(),
            password: options.password.as_deref(),
            keep_alive_interval: Some(Duration::from_secs(u64::from(options.keep_alive_secs))),
            disable_auto_reconnect: true,
            lwt: Some(LwtConfiguration {
                topic: options.last_will.topic.as_str(),
                payload: options.last_will.payload.as_bytes(),
                qos: QoS::AtMostOnce,
                retain: options.last_will.retain,
            }),
            ..Default::default()
        };

        let (tx, rx) = mpsc::channel();
        let client = EspMqttClient::new_cb(&url, &conf, move |event| {
            let forwarded = match event.payload() {
                EventPayload::Connected(_) => Some(TransportEvent::Connected),
                EventPayload::Disconnected => Some(TransportEvent::Disconnected),
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } => Some(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                }),
                EventPayload::Error(err) => {
                    warn!("mqtt client error: {err:?}");
                    None
                }
                _ => None,
            };
            if let Some(event) = forwarded {
                let _ = tx.send(event);
            }
        })
        .map_err(|err| TransportError::Io(err.to_string()))?;

        self.client = Some(client);
        self.events = Some(rx);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.events = None;
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
        self.client()?
            .enqueue(topic, QoS::AtMostOnce, retain, payload.as_bytes())
            .map(|_| ())
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.as_ref()?.try_recv().ok()
    }
}

/// The application loop's subscription to the task watchdog. A stalled poll
/// pass longer than the timeout resets the chip.
struct TaskWatchdog;

impl TaskWatchdog {
    fn subscribe_current(timeout: Duration) -> anyhow::Result<Self> {
        let config = sys::esp_task_wdt_config_t {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        tolerate_invalid_state(unsafe { sys::esp_task_wdt_init(&config) })
            .context("task watchdog init")?;
        tolerate_invalid_state(unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) })
            .context("task watchdog subscribe")?;
        info!("app loop watched, timeout {}s", timeout.as_secs());
        Ok(Self)
    }

    fn feed(&self) {
        let _ = unsafe { sys::esp_task_wdt_reset() };
    }
}

// INVALID_STATE: already initialized by sdkconfig or already subscribed.
fn tolerate_invalid_state(rc: sys::esp_err_t) -> Result<(), sys::EspError> {
    if rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    sys::EspError::convert(rc)
}

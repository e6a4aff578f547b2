use std::{
    collections::{BTreeMap, VecDeque},
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};

use crate::{
    connectivity::{LinkStatus, NetError, WifiDriver},
    config::NetworkConfig,
    ha::transport::{BrokerOptions, MqttTransport, TransportError, TransportEvent},
    indicator::Indicator,
    sensor::{HeaterOutput, SensorBus, SensorError},
    timesync::{NtpTransport, RealTimeClock, NTP_PACKET_SIZE},
    types::SensorId,
};

fn lock<T>(shared: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
struct MockSensor {
    celsius: f32,
    failing: bool,
}

#[derive(Debug, Default)]
struct BusState {
    sensors: BTreeMap<u64, MockSensor>,
    cursor: Option<usize>,
    fail_search: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn with_sensors(sensors: &[(SensorId, f32)]) -> Self {
        let bus = Self::default();
        for (id, celsius) in sensors {
            bus.set_temperature(*id, *celsius);
        }
        bus
    }

    pub fn fail_search(&self, fail: bool) {
        lock(&self.state).fail_search = fail;
    }

    pub fn fail_read(&self, id: SensorId, fail: bool) {
        if let Some(sensor) = lock(&self.state).sensors.get_mut(&id.0) {
            sensor.failing = fail;
        }
    }

    pub fn set_temperature(&self, id: SensorId, celsius: f32) {
        let mut state = lock(&self.state);
        let sensor = state.sensors.entry(id.0).or_insert(MockSensor {
            celsius,
            failing: false,
        });
        sensor.celsius = celsius;
    }

    pub fn remove(&self, id: SensorId) {
        lock(&self.state).sensors.remove(&id.0);
    }
}

impl SensorBus for MockBus {
    fn reset_search(&mut self) {
        lock(&self.state).cursor = None;
    }

    fn select_next(&mut self) -> Result<bool, SensorError> {
        let mut state = lock(&self.state);
        if state.fail_search {
            return Err(SensorError::Bus("search aborted".into()));
        }
        let next = state.cursor.map_or(0, |index| index + 1);
        if next < state.sensors.len() {
            state.cursor = Some(next);
            Ok(true)
        } else {
            state.cursor = Some(state.sensors.len());
            Ok(false)
        }
    }

    fn address(&self) -> SensorId {
        let state = lock(&self.state);
        state
            .cursor
            .and_then(|index| state.sensors.keys().nth(index))
            .map_or(SensorId::INVALID, |raw| SensorId(*raw))
    }

    fn start_conversion(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read_temperature(&mut self, id: SensorId) -> Result<f32, SensorError> {
        let state = lock(&self.state);
        match state.sensors.get(&id.0) {
            None => Err(SensorError::NotPresent(id)),
            Some(sensor) if sensor.failing => {
                Err(SensorError::ReadFailed(id, "crc mismatch".into()))
            }
            Some(sensor) => Ok(sensor.celsius),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockHeater {
    on: Arc<Mutex<bool>>,
}

impl MockHeater {
    pub fn is_on(&self) -> bool {
        *lock(&self.on)
    }
}

impl HeaterOutput for MockHeater {
    fn set(&mut self, on: bool) {
        *lock(&self.on) = on;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockIndicator {
    writes: Arc<Mutex<Vec<bool>>>,
}

impl MockIndicator {
    pub fn writes(&self) -> Vec<bool> {
        lock(&self.writes).clone()
    }
}

impl Indicator for MockIndicator {
    fn set(&mut self, on: bool) {
        lock(&self.writes).push(on);
    }
}

#[derive(Debug)]
struct WifiState {
    link: LinkStatus,
    ip: Option<Ipv4Addr>,
    now_ms: u32,
    connect_attempts: Vec<u32>,
    disconnects: usize,
    status_polls: usize,
    ssid: Option<String>,
}

impl Default for WifiState {
    fn default() -> Self {
        Self {
            link: LinkStatus::Idle,
            ip: None,
            now_ms: 0,
            connect_attempts: Vec::new(),
            disconnects: 0,
            status_polls: 0,
            ssid: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockWifi {
    state: Arc<Mutex<WifiState>>,
}

impl MockWifi {
    pub fn set_link(&self, link: LinkStatus) {
        lock(&self.state).link = link;
    }

    pub fn set_ip(&self, ip: Option<Ipv4Addr>) {
        lock(&self.state).ip = ip;
    }

    /// Timestamp recorded against subsequent connect attempts.
    pub fn set_now(&self, now_ms: u32) {
        lock(&self.state).now_ms = now_ms;
    }

    pub fn connect_attempts(&self) -> Vec<u32> {
        lock(&self.state).connect_attempts.clone()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    pub fn status_polls(&self) -> usize {
        lock(&self.state).status_polls
    }

    pub fn last_ssid(&self) -> Option<String> {
        lock(&self.state).ssid.clone()
    }
}

impl WifiDriver for MockWifi {
    fn configure(&mut self, config: &NetworkConfig) -> Result<(), NetError> {
        lock(&self.state).ssid = Some(config.wifi_ssid.clone());
        Ok(())
    }

    fn begin_connect(&mut self) -> Result<(), NetError> {
        let mut state = lock(&self.state);
        let now = state.now_ms;
        state.connect_attempts.push(now);
        Ok(())
    }

    fn link_status(&mut self) -> LinkStatus {
        let mut state = lock(&self.state);
        state.status_polls += 1;
        state.link
    }

    fn ip_address(&mut self) -> Option<Ipv4Addr> {
        lock(&self.state).ip
    }

    fn disconnect(&mut self) {
        lock(&self.state).disconnects += 1;
    }
}

#[derive(Debug, Default)]
struct NtpState {
    sent: usize,
    responses: VecDeque<[u8; NTP_PACKET_SIZE]>,
}

#[derive(Debug, Clone, Default)]
pub struct MockNtp {
    state: Arc<Mutex<NtpState>>,
}

impl MockNtp {
    pub fn sent(&self) -> usize {
        lock(&self.state).sent
    }

    pub fn push_response(&self, packet: &[u8; NTP_PACKET_SIZE]) {
        lock(&self.state).responses.push_back(*packet);
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).responses.len()
    }
}

impl NtpTransport for MockNtp {
    fn send(&mut self, _request: &[u8; NTP_PACKET_SIZE]) -> Result<(), NetError> {
        lock(&self.state).sent += 1;
        Ok(())
    }

    fn try_recv(&mut self, buffer: &mut [u8; NTP_PACKET_SIZE]) -> Option<usize> {
        let packet = lock(&self.state).responses.pop_front()?;
        buffer.copy_from_slice(&packet);
        Some(NTP_PACKET_SIZE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockClock {
    times: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl MockClock {
    pub fn times(&self) -> Vec<DateTime<Utc>> {
        lock(&self.times).clone()
    }
}

impl RealTimeClock for MockClock {
    fn set_time(&mut self, at: DateTime<Utc>) {
        lock(&self.times).push(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Subscribe(String),
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
}

#[derive(Debug, Default)]
struct TransportState {
    sent: Vec<Sent>,
    connects: Vec<BrokerOptions>,
    disconnects: usize,
    events: VecDeque<TransportEvent>,
    fail_publish: bool,
    refuse_connect: bool,
    withhold_connack: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn sent(&self) -> Vec<Sent> {
        lock(&self.state).sent.clone()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Publish { topic, payload, .. } => Some((topic.clone(), payload.clone())),
                Sent::Subscribe(_) => None,
            })
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Subscribe(topic) => Some(topic.clone()),
                Sent::Publish { .. } => None,
            })
            .collect()
    }

    pub fn connects(&self) -> Vec<BrokerOptions> {
        lock(&self.state).connects.clone()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.state).disconnects
    }

    /// Forgets recorded traffic. Pending inbound events are kept.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.sent.clear();
        state.connects.clear();
        state.disconnects = 0;
    }

    pub fn fail_publish(&self, fail: bool) {
        lock(&self.state).fail_publish = fail;
    }

    pub fn refuse_connect(&self, refuse: bool) {
        lock(&self.state).refuse_connect = refuse;
    }

    pub fn withhold_connack(&self, withhold: bool) {
        lock(&self.state).withhold_connack = withhold;
    }

    pub fn inject_message(&self, topic: &str, payload: &[u8]) {
        lock(&self.state).events.push_back(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn inject_disconnect(&self) {
        lock(&self.state).events.push_back(TransportEvent::Disconnected);
    }
}

impl MqttTransport for MockTransport {
    fn connect(&mut self, options: &BrokerOptions) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.connects.push(options.clone());
        if state.refuse_connect {
            return Err(TransportError::Rejected("connection refused".into()));
        }
        if !state.withhold_connack {
            state.events.push_back(TransportEvent::Connected);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = lock(&self.state);
        state.disconnects += 1;
        state.events.clear();
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        lock(&self.state).sent.push(Sent::Subscribe(topic.to_string()));
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.fail_publish {
            return Err(TransportError::Io("publish queue full".into()));
        }
        state.sent.push(Sent::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        lock(&self.state).events.pop_front()
    }
}

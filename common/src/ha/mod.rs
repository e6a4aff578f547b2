pub mod dispatch;
pub mod entities;
pub mod publish;
pub mod transport;

use tracing::{debug, error, info, warn};

use crate::{
    boiler::BoilerController,
    config::MqttConfig,
    events::Signal,
    state_machine::PolledStateMachine,
    store::ConfigStore,
    template::TemplateError,
    timer::Timer,
    topics::{PAYLOAD_OFFLINE, PAYLOAD_ONLINE},
};

use self::{
    dispatch::{dispatch, subscriptions, HandlerContext, Outcome},
    entities::EntityTable,
    publish::Publisher,
    transport::{BrokerOptions, LastWill, MqttTransport, TransportEvent},
};

pub use self::entities::Property;

pub const CONNECT_TIMEOUT_MS: u32 = 10_000;
pub const BACKOFF_INITIAL_MS: u32 = 2_000;
pub const BACKOFF_MAX_MS: u32 = 60_000;
pub const KEEP_ALIVE_SECS: u16 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaState {
    WaitForNetConnection,
    ConnectingToBroker,
    SendSubscriptions,
    SendConfigs,
    SendOnlineAvail,
    Connected,
}

/// Reconnect delay: immediate first, then doubling up to a cap.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> u32 {
        let delay = match self.failures {
            0 => 0,
            n => BACKOFF_INITIAL_MS
                .saturating_mul(1u32 << (n - 1).min(16))
                .min(BACKOFF_MAX_MS),
        };
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

pub struct HaClient<T> {
    transport: T,
    config: MqttConfig,
    table: EntityTable,
    subscriptions: Vec<String>,
    controller: BoilerController,
    machine: PolledStateMachine<HaState>,
    timer: Timer,
    backoff: Backoff,
    index: usize,
    connack: bool,
    publisher: Publisher,
    reconfigure: Signal,
}

impl<T: MqttTransport> HaClient<T> {
    pub fn new(
        transport: T,
        config: MqttConfig,
        controller: BoilerController,
    ) -> Result<Self, TemplateError> {
        let table = EntityTable::build(&config)?;
        Ok(Self {
            subscriptions: subscriptions(&table),
            transport,
            config,
            table,
            controller,
            machine: PolledStateMachine::new(HaState::WaitForNetConnection),
            timer: Timer::expired(),
            backoff: Backoff::default(),
            index: 0,
            connack: false,
            publisher: Publisher::new(),
            reconfigure: Signal::new(),
        })
    }

    pub fn reconfigure_signal(&self) -> &Signal {
        &self.reconfigure
    }

    pub fn set_config(&mut self, config: MqttConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn state(&self) -> HaState {
        self.machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.machine.is(HaState::Connected)
    }

    pub fn table(&self) -> &EntityTable {
        &self.table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn poll(&mut self, now_ms: u32, network_available: bool, store: &mut ConfigStore) {
        if self.reconfigure.take() {
            self.rebuild();
            return;
        }

        if !network_available && !self.machine.is(HaState::WaitForNetConnection) {
            warn!("network lost; dropping broker connection");
            self.backoff.reset();
            self.fail(now_ms);
            return;
        }

        if !self.machine.is(HaState::WaitForNetConnection) && self.drain_events(store) {
            self.fail(now_ms);
            return;
        }

        match self.machine.state() {
            HaState::WaitForNetConnection => {
                if self.machine.is_first_time() {
                    self.index = 0;
                    if !self.config.enabled {
                        info!("mqtt integration disabled");
                    }
                }
                if self.config.enabled && network_available && self.timer.is_expired(now_ms) {
                    self.machine.change_state(HaState::ConnectingToBroker);
                }
            }
            HaState::ConnectingToBroker => self.connecting(now_ms),
            HaState::SendSubscriptions => {
                let topic = &self.subscriptions[self.index];
                if let Err(err) = self.transport.subscribe(topic) {
                    warn!("subscribe to {topic} failed: {err}");
                    self.fail(now_ms);
                    return;
                }
                debug!("subscribed {topic}");
                self.index += 1;
                if self.index == self.subscriptions.len() {
                    self.index = 0;
                    self.machine.change_state(HaState::SendConfigs);
                }
            }
            HaState::SendConfigs => {
                let entity = &self.table.entities[self.index];
                if let Err(err) =
                    self.transport
                        .publish(&entity.config_topic, &entity.config_body, true)
                {
                    warn!("discovery publish to {} failed: {err}", entity.config_topic);
                    self.fail(now_ms);
                    return;
                }
                self.index += 1;
                if self.index == self.table.entities.len() {
                    self.index = 0;
                    self.machine.change_state(HaState::SendOnlineAvail);
                }
            }
            HaState::SendOnlineAvail => {
                if let Err(err) =
                    self.transport
                        .publish(&self.table.common_avail, PAYLOAD_ONLINE, true)
                {
                    warn!("availability publish failed: {err}");
                    self.fail(now_ms);
                    return;
                }
                self.machine.change_state(HaState::Connected);
            }
            HaState::Connected => {
                if self.machine.is_first_time() {
                    info!("home assistant integration online");
                    self.backoff.reset();
                    self.publisher.force();
                }
                let controller = &self.controller;
                let result = self.publisher.poll(
                    now_ms,
                    || controller.snapshot(),
                    &self.table,
                    &mut self.transport,
                );
                if let Err(err) = result {
                    warn!("state publish failed: {err}");
                    self.fail(now_ms);
                }
            }
        }
    }

    fn connecting(&mut self, now_ms: u32) {
        if self.machine.is_first_time() {
            let options = self.broker_options();
            info!("connecting to mqtt broker {}:{}", options.host, options.port);
            self.connack = false;
            if let Err(err) = self.transport.connect(&options) {
                warn!("mqtt connect failed: {err}");
                self.fail(now_ms);
                return;
            }
            self.timer.arm(now_ms, CONNECT_TIMEOUT_MS);
        }
        if self.connack {
            info!("connected to mqtt broker");
            self.index = 0;
            self.machine.change_state(HaState::SendSubscriptions);
        } else if self.timer.is_expired(now_ms) {
            warn!("mqtt connect timed out after {CONNECT_TIMEOUT_MS} ms");
            self.fail(now_ms);
        }
    }

    /// Handles pending transport events. Returns true when the connection
    /// must be torn down.
    fn drain_events(&mut self, store: &mut ConfigStore) -> bool {
        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::Connected => self.connack = true,
                TransportEvent::Disconnected => {
                    warn!("mqtt broker connection lost");
                    return true;
                }
                TransportEvent::Message { topic, payload } => {
                    if !self.is_connected() {
                        debug!("dropping early mqtt message on {topic}");
                        continue;
                    }
                    let mut ctx = HandlerContext {
                        controller: &self.controller,
                        store: &mut *store,
                    };
                    if dispatch(&self.table, &mut ctx, &topic, &payload) == Outcome::Resync {
                        self.backoff.reset();
                        return true;
                    }
                }
            }
        }
        false
    }

    fn broker_options(&self) -> BrokerOptions {
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        BrokerOptions {
            client_id: self.config.device_name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: non_empty(&self.config.user),
            password: non_empty(&self.config.pass),
            keep_alive_secs: KEEP_ALIVE_SECS,
            last_will: LastWill {
                topic: self.table.common_avail.clone(),
                payload: PAYLOAD_OFFLINE.to_string(),
                retain: true,
            },
        }
    }

    fn rebuild(&mut self) {
        match EntityTable::build(&self.config) {
            Ok(table) => {
                info!("mqtt configuration changed; reconnecting");
                self.subscriptions = subscriptions(&table);
                self.table = table;
            }
            Err(err) => error!("mqtt topics could not be rebuilt: {err}"),
        }
        self.transport.disconnect();
        self.backoff.reset();
        self.timer = Timer::expired();
        self.machine.change_state(HaState::WaitForNetConnection);
    }

    fn fail(&mut self, now_ms: u32) {
        self.transport.disconnect();
        let delay = self.backoff.next_delay();
        if delay > 0 {
            info!("mqtt reconnect in {delay} ms");
        }
        self.timer.arm(now_ms, delay);
        self.publisher = Publisher::new();
        self.machine.change_state(HaState::WaitForNetConnection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BoilerConfig, SensorRoleConfig},
        record::MemoryRegion,
        store::STORAGE_CAPACITY,
        testing::{MockTransport, Sent},
        types::BoilerMode,
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        client: HaClient<MockTransport>,
        transport: MockTransport,
        controller: BoilerController,
        store: ConfigStore,
    }

    fn fixture() -> Fixture {
        let transport = MockTransport::default();
        let controller =
            BoilerController::new(BoilerConfig::default(), SensorRoleConfig::default());
        let config = MqttConfig {
            enabled: true,
            ..MqttConfig::default()
        };
        Fixture {
            client: HaClient::new(transport.clone(), config, controller.clone()).unwrap(),
            transport,
            controller,
            store: ConfigStore::open(Box::new(MemoryRegion::new(STORAGE_CAPACITY))).unwrap(),
        }
    }

    impl Fixture {
        fn tick(&mut self, now_ms: u32, online: bool) {
            self.client.poll(now_ms, online, &mut self.store);
        }

        fn connect(&mut self, start_ms: u32) -> u32 {
            let mut now = start_ms;
            while !self.client.is_connected() {
                self.tick(now, true);
                now += 10;
                assert!(now < start_ms + 5_000, "never connected");
            }
            (now - start_ms) / 10
        }
    }

    #[test]
    fn stays_idle_without_network() {
        let mut fx = fixture();
        for now in (0..10_000).step_by(10) {
            fx.tick(now, false);
        }
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);
        assert!(fx.transport.connects().is_empty());
    }

    #[test]
    fn connection_sequence_sends_one_item_per_tick() {
        let mut fx = fixture();
        let subscriptions = dispatch::ROUTES.len();
        let configs = entities::ENTITIES.len();

        fx.tick(0, true);
        assert_eq!(fx.client.state(), HaState::ConnectingToBroker);
        fx.tick(10, true);
        assert_eq!(fx.client.state(), HaState::ConnectingToBroker);
        let options = fx.transport.connects()[0].clone();
        assert_eq!(options.last_will.topic, "homeassistant/boiler/avail");
        assert_eq!(options.last_will.payload, "offline");
        assert!(options.last_will.retain);

        // The broker acknowledgement is picked up on the following tick.
        fx.tick(20, true);
        assert_eq!(fx.client.state(), HaState::SendSubscriptions);
        assert!(fx.transport.subscriptions().is_empty());

        let mut now = 30;
        for sent in 1..=subscriptions {
            fx.tick(now, true);
            now += 10;
            assert_eq!(fx.transport.subscriptions().len(), sent);
        }
        assert_eq!(fx.client.state(), HaState::SendConfigs);

        for sent in 1..=configs {
            fx.tick(now, true);
            now += 10;
            assert_eq!(fx.transport.published().len(), sent);
        }
        assert_eq!(fx.client.state(), HaState::SendOnlineAvail);

        fx.tick(now, true);
        assert!(fx.client.is_connected());
        let last = fx.transport.sent().last().cloned();
        assert_eq!(
            last,
            Some(Sent::Publish {
                topic: "homeassistant/boiler/avail".into(),
                payload: "online".into(),
                retain: true,
            })
        );
    }

    #[test]
    fn connected_client_dispatches_commands() {
        let mut fx = fixture();
        fx.connect(0);
        fx.transport.inject_message(
            "homeassistant/water_heater/boiler_heater/mode/set",
            b"performance",
        );
        fx.tick(5_000, true);
        assert_eq!(fx.controller.mode(), BoilerMode::Performance);
        assert_eq!(fx.store.boiler().mode, BoilerMode::Performance);
    }

    #[test]
    fn broker_loss_restarts_from_first_subscription_with_backoff() {
        let mut fx = fixture();
        fx.connect(0);
        fx.transport.clear();

        fx.transport.inject_disconnect();
        fx.tick(1_000, true);
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);

        // First retry is immediate.
        fx.tick(1_010, true);
        assert_eq!(fx.client.state(), HaState::ConnectingToBroker);

        // Broker refuses; subsequent retries back off.
        fx.transport.refuse_connect(true);
        fx.tick(1_020, true);
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);
        fx.tick(1_030, true);
        fx.tick(1_020 + BACKOFF_INITIAL_MS - 10, true);
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);
        fx.tick(1_020 + BACKOFF_INITIAL_MS, true);
        assert_eq!(fx.client.state(), HaState::ConnectingToBroker);

        fx.transport.refuse_connect(false);
        fx.transport.clear();
        fx.connect(5_000);
        assert_eq!(
            fx.transport.subscriptions()[0],
            "homeassistant/water_heater/boiler_heater/mode/set"
        );
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u32> = (0..8).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![0, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]
        );
        backoff.reset();
        assert_eq!(backoff.next_delay(), 0);
    }

    #[test]
    fn connect_times_out_without_connack() {
        let mut fx = fixture();
        fx.transport.withhold_connack(true);
        fx.tick(0, true);
        fx.tick(10, true);
        assert_eq!(fx.client.state(), HaState::ConnectingToBroker);
        fx.tick(10 + CONNECT_TIMEOUT_MS, true);
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);
        assert!(fx.transport.disconnects() >= 1);
    }

    #[test]
    fn platform_birth_forces_full_resync() {
        let mut fx = fixture();
        fx.connect(0);
        for now in (3_000..3_500).step_by(10) {
            fx.tick(now, true);
        }
        fx.transport.clear();

        fx.transport.inject_message("homeassistant/status", b"online");
        fx.tick(4_000, true);
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);
        let ticks = fx.connect(4_010);
        assert!(ticks as usize >= dispatch::ROUTES.len() + entities::ENTITIES.len() + 2);
        assert_eq!(fx.transport.subscriptions().len(), dispatch::ROUTES.len());
    }

    #[test]
    fn network_loss_drops_connection() {
        let mut fx = fixture();
        fx.connect(0);
        fx.tick(3_000, false);
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);
        fx.tick(3_010, false);
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);
        fx.tick(3_020, true);
        assert_eq!(fx.client.state(), HaState::ConnectingToBroker);
    }

    #[test]
    fn reconfigure_rebuilds_topics() {
        let mut fx = fixture();
        fx.connect(0);
        let mut config = fx.client.config().clone();
        config.set_var("device", "cellar").unwrap();
        fx.client.set_config(config);
        fx.client.reconfigure_signal().raise();
        fx.tick(3_000, true);
        assert_eq!(fx.client.state(), HaState::WaitForNetConnection);
        assert_eq!(fx.client.table().common_avail, "homeassistant/cellar/avail");
    }
}

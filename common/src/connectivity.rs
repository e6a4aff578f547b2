use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::NetworkConfig, events::AppEvent, events::Signal, state_machine::PolledStateMachine,
    timer::Timer,
};

pub const RETRY_DELAY_MS: u32 = 5_000;
pub const ASSOCIATION_TIMEOUT_MS: u32 = 10_000;
pub const ADDRESS_TIMEOUT_MS: u32 = 10_000;
pub const LINK_POLL_MS: u32 = 2_000;
pub const DISCONNECT_DELAY_MS: u32 = 2_000;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("wifi driver error: {0}")]
    Driver(String),
    #[error("unsupported network configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

pub trait WifiDriver: Send {
    fn configure(&mut self, config: &NetworkConfig) -> Result<(), NetError>;
    fn begin_connect(&mut self) -> Result<(), NetError>;
    fn link_status(&mut self) -> LinkStatus;
    fn ip_address(&mut self) -> Option<Ipv4Addr>;
    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetState {
    WaitForConfig,
    Connecting,
    WaitForAddress,
    Connected,
    DelayAfterDisconnect,
    RetryDelay,
}

pub struct ConnectivityManager<W> {
    driver: W,
    config: NetworkConfig,
    machine: PolledStateMachine<NetState>,
    timer: Timer,
    address: Option<Ipv4Addr>,
    reconfigure: Signal,
}

impl<W: WifiDriver> ConnectivityManager<W> {
    pub fn new(driver: W, config: NetworkConfig) -> Self {
        Self {
            driver,
            config,
            machine: PolledStateMachine::new(NetState::WaitForConfig),
            timer: Timer::expired(),
            address: None,
            reconfigure: Signal::new(),
        }
    }

    pub fn reconfigure_signal(&self) -> &Signal {
        &self.reconfigure
    }

    pub fn set_config(&mut self, config: NetworkConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> NetState {
        self.machine.state()
    }

    /// True only once associated with an address assigned.
    pub fn is_available(&self) -> bool {
        self.machine.is(NetState::Connected)
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn poll(&mut self, now_ms: u32) -> Option<AppEvent> {
        if self.reconfigure.take() {
            info!("network configuration changed; reconnecting");
            let was_available = self.is_available();
            self.drop_link();
            self.machine.change_state(self.idle_state());
            return was_available.then_some(AppEvent::NetworkDown);
        }

        match self.machine.state() {
            NetState::WaitForConfig => {
                if self.machine.is_first_time() && !self.config.has_credentials() {
                    info!("no wifi credentials configured");
                }
                if self.config.has_credentials() {
                    self.machine.change_state(NetState::Connecting);
                }
                None
            }
            NetState::Connecting => {
                self.connecting(now_ms);
                None
            }
            NetState::WaitForAddress => self.wait_for_address(now_ms),
            NetState::Connected => self.connected(now_ms),
            NetState::DelayAfterDisconnect => {
                if self.machine.is_first_time() {
                    self.driver.disconnect();
                    self.timer.arm(now_ms, DISCONNECT_DELAY_MS);
                }
                if self.timer.is_expired(now_ms) {
                    self.machine.change_state(self.idle_state());
                }
                None
            }
            NetState::RetryDelay => {
                if self.machine.is_first_time() {
                    self.timer.arm(now_ms, RETRY_DELAY_MS);
                }
                if self.timer.is_expired(now_ms) {
                    self.machine.change_state(self.idle_state());
                }
                None
            }
        }
    }

    fn idle_state(&self) -> NetState {
        if self.config.has_credentials() {
            NetState::Connecting
        } else {
            NetState::WaitForConfig
        }
    }

    fn connecting(&mut self, now_ms: u32) {
        if self.machine.is_first_time() {
            let mode = if self.config.use_static_ip {
                "static"
            } else {
                "dhcp"
            };
            info!("connecting to `{}` ({mode})", self.config.wifi_ssid);
            let started = self
                .driver
                .configure(&self.config)
                .and_then(|()| self.driver.begin_connect());
            if let Err(err) = started {
                warn!("wifi connect failed: {err}; retrying in {RETRY_DELAY_MS} ms");
                self.machine.change_state(NetState::RetryDelay);
                return;
            }
            self.timer.arm(now_ms, ASSOCIATION_TIMEOUT_MS);
            return;
        }

        match self.driver.link_status() {
            LinkStatus::Connected => self.machine.change_state(NetState::WaitForAddress),
            LinkStatus::Failed | LinkStatus::Disconnected => {
                warn!("wifi association failed; retrying in {RETRY_DELAY_MS} ms");
                self.drop_link();
                self.machine.change_state(NetState::RetryDelay);
            }
            LinkStatus::Idle | LinkStatus::Connecting => {
                if self.timer.is_expired(now_ms) {
                    warn!("wifi association timed out; retrying in {RETRY_DELAY_MS} ms");
                    self.drop_link();
                    self.machine.change_state(NetState::RetryDelay);
                }
            }
        }
    }

    fn wait_for_address(&mut self, now_ms: u32) -> Option<AppEvent> {
        if self.machine.is_first_time() {
            self.timer.arm(now_ms, ADDRESS_TIMEOUT_MS);
        }
        if self.driver.link_status() != LinkStatus::Connected {
            warn!("wifi link dropped before address assignment");
            self.machine.change_state(NetState::DelayAfterDisconnect);
            return None;
        }
        match self.driver.ip_address().filter(|ip| !ip.is_unspecified()) {
            Some(address) => {
                info!("network up, address {address}");
                self.address = Some(address);
                self.machine.change_state(NetState::Connected);
                Some(AppEvent::NetworkUp { address })
            }
            None => {
                if self.timer.is_expired(now_ms) {
                    warn!("no address assigned within {ADDRESS_TIMEOUT_MS} ms; retrying");
                    self.drop_link();
                    self.machine.change_state(NetState::RetryDelay);
                }
                None
            }
        }
    }

    fn connected(&mut self, now_ms: u32) -> Option<AppEvent> {
        if self.machine.is_first_time() {
            self.timer.arm(now_ms, LINK_POLL_MS);
            return None;
        }
        if !self.timer.is_expired(now_ms) {
            return None;
        }
        self.timer.arm(now_ms, LINK_POLL_MS);

        let linked = self.driver.link_status() == LinkStatus::Connected;
        let addressed = self
            .driver
            .ip_address()
            .is_some_and(|ip| !ip.is_unspecified());
        if linked && addressed {
            return None;
        }
        warn!("network link lost");
        self.address = None;
        self.machine.change_state(NetState::DelayAfterDisconnect);
        Some(AppEvent::NetworkDown)
    }

    fn drop_link(&mut self) {
        self.address = None;
        self.driver.disconnect();
    }
}

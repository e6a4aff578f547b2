use thiserror::Error;

pub const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker request rejected: {0}")]
    Rejected(String),
    #[error("transport i/o failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub last_will: LastWill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// Non-blocking MQTT client as seen by the protocol engine. Requests are
/// queued; completion and inbound traffic surface through `poll_event`.
pub trait MqttTransport: Send {
    fn connect(&mut self, options: &BrokerOptions) -> Result<(), TransportError>;
    fn disconnect(&mut self);
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError>;
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

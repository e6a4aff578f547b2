use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    record::{FieldReader, FieldWriter, RecordCodec},
    types::{BoilerMode, SensorId, SensorRole, TargetTemps},
};

pub const WIFI_SSID_MAX: usize = 32;
pub const WIFI_PASS_MAX: usize = 64;
pub const MQTT_HOST_MAX: usize = 64;
pub const MQTT_USER_MAX: usize = 32;
pub const MQTT_PASS_MAX: usize = 64;
pub const MQTT_NAME_MAX: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} longer than {max} bytes")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} out of range")]
    OutOfRange { field: &'static str },
    #[error("{field} may only contain letters, digits, '_' and '-'")]
    InvalidChars { field: &'static str },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ConfigError> {
    if value.len() > max {
        Err(ConfigError::TooLong { field, max })
    } else {
        Ok(())
    }
}

fn check_topic_word(field: &'static str, value: &str) -> Result<(), ConfigError> {
    check_len(field, value, MQTT_NAME_MAX)?;
    if value.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::InvalidChars { field });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub use_static_ip: bool,
    pub static_ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            use_static_ip: false,
            static_ip: Ipv4Addr::UNSPECIFIED,
            subnet: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            dns: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl NetworkConfig {
    pub fn has_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }

    pub fn set_credentials(&mut self, ssid: &str, pass: &str) -> Result<(), ConfigError> {
        check_len("ssid", ssid, WIFI_SSID_MAX)?;
        check_len("password", pass, WIFI_PASS_MAX)?;
        if ssid.trim().is_empty() {
            return Err(ConfigError::Empty { field: "ssid" });
        }
        self.wifi_ssid = ssid.to_string();
        self.wifi_pass = pass.to_string();
        Ok(())
    }

    pub fn set_static(
        &mut self,
        ip: Ipv4Addr,
        subnet: Ipv4Addr,
        gateway: Ipv4Addr,
        dns: Option<Ipv4Addr>,
    ) -> Result<(), ConfigError> {
        if ip.is_unspecified() {
            return Err(ConfigError::OutOfRange { field: "ip" });
        }
        let mask = u32::from(subnet);
        // Contiguous leading ones only.
        if mask == 0 || mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(ConfigError::OutOfRange { field: "subnet" });
        }
        self.use_static_ip = true;
        self.static_ip = ip;
        self.subnet = subnet;
        self.gateway = gateway;
        self.dns = dns.unwrap_or(gateway);
        Ok(())
    }

    pub fn set_dhcp(&mut self) {
        self.use_static_ip = false;
    }
}

impl RecordCodec for NetworkConfig {
    const SIZE: usize = WIFI_SSID_MAX + WIFI_PASS_MAX + 1 + 4 * 4;

    fn encode(&self, out: &mut [u8]) {
        FieldWriter::new(out)
            .str(&self.wifi_ssid, WIFI_SSID_MAX)
            .str(&self.wifi_pass, WIFI_PASS_MAX)
            .u8(u8::from(self.use_static_ip))
            .bytes(&self.static_ip.octets())
            .bytes(&self.subnet.octets())
            .bytes(&self.gateway.octets())
            .bytes(&self.dns.octets());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut reader = FieldReader::new(bytes);
        Self {
            wifi_ssid: reader.str(WIFI_SSID_MAX),
            wifi_pass: reader.str(WIFI_PASS_MAX),
            use_static_ip: reader.u8() != 0,
            static_ip: Ipv4Addr::from(reader.array::<4>()),
            subnet: Ipv4Addr::from(reader.array::<4>()),
            gateway: Ipv4Addr::from(reader.array::<4>()),
            dns: Ipv4Addr::from(reader.array::<4>()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BootCounter(pub u32);

impl RecordCodec for BootCounter {
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        FieldWriter::new(out).u32(self.0);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self(FieldReader::new(bytes).u32())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensorRoleConfig {
    pub ambient: SensorId,
    pub boiler_in: SensorId,
    pub boiler_out: SensorId,
}

impl SensorRoleConfig {
    pub fn is_configured(&self) -> bool {
        SensorRole::ALL.iter().all(|role| self.get(*role).is_valid())
    }

    pub fn get(&self, role: SensorRole) -> SensorId {
        match role {
            SensorRole::Ambient => self.ambient,
            SensorRole::BoilerIn => self.boiler_in,
            SensorRole::BoilerOut => self.boiler_out,
        }
    }
}

impl RecordCodec for SensorRoleConfig {
    const SIZE: usize = 3 * 8;

    fn encode(&self, out: &mut [u8]) {
        FieldWriter::new(out)
            .u64(self.ambient.0)
            .u64(self.boiler_in.0)
            .u64(self.boiler_out.0);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut reader = FieldReader::new(bytes);
        Self {
            ambient: SensorId(reader.u64()),
            boiler_in: SensorId(reader.u64()),
            boiler_out: SensorId(reader.u64()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub base_topic: String,
    pub device_name: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            base_topic: "homeassistant".to_string(),
            device_name: "boiler".to_string(),
        }
    }
}

impl MqttConfig {
    /// Applies one named variable, as set from the console.
    pub fn set_var(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        match name {
            "enabled" => match value {
                "1" | "on" | "true" | "yes" => self.enabled = true,
                "0" | "off" | "false" | "no" => self.enabled = false,
                _ => return Err(ConfigError::OutOfRange { field: "enabled" }),
            },
            "host" => {
                check_len("host", value, MQTT_HOST_MAX)?;
                if value.is_empty() {
                    return Err(ConfigError::Empty { field: "host" });
                }
                self.host = value.to_string();
            }
            "port" => {
                self.port = value
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or(ConfigError::OutOfRange { field: "port" })?;
            }
            "user" => {
                check_len("user", value, MQTT_USER_MAX)?;
                self.user = value.to_string();
            }
            "pass" => {
                check_len("pass", value, MQTT_PASS_MAX)?;
                self.pass = value.to_string();
            }
            "base" => {
                check_topic_word("base", value)?;
                self.base_topic = value.to_string();
            }
            "device" => {
                check_topic_word("device", value)?;
                self.device_name = value.to_string();
            }
            _ => return Err(ConfigError::OutOfRange { field: "variable" }),
        }
        Ok(())
    }

    pub const VARS: [&'static str; 7] =
        ["enabled", "host", "port", "user", "pass", "base", "device"];
}

impl RecordCodec for MqttConfig {
    const SIZE: usize = 1 + MQTT_HOST_MAX + 2 + MQTT_USER_MAX + MQTT_PASS_MAX + 2 * MQTT_NAME_MAX;

    fn encode(&self, out: &mut [u8]) {
        FieldWriter::new(out)
            .u8(u8::from(self.enabled))
            .str(&self.host, MQTT_HOST_MAX)
            .u16(self.port)
            .str(&self.user, MQTT_USER_MAX)
            .str(&self.pass, MQTT_PASS_MAX)
            .str(&self.base_topic, MQTT_NAME_MAX)
            .str(&self.device_name, MQTT_NAME_MAX);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut reader = FieldReader::new(bytes);
        Self {
            enabled: reader.u8() != 0,
            host: reader.str(MQTT_HOST_MAX),
            port: reader.u16(),
            user: reader.str(MQTT_USER_MAX),
            pass: reader.str(MQTT_PASS_MAX),
            base_topic: reader.str(MQTT_NAME_MAX),
            device_name: reader.str(MQTT_NAME_MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoilerConfig {
    pub targets: TargetTemps,
    pub mode: BoilerMode,
}

impl Default for BoilerConfig {
    fn default() -> Self {
        Self {
            targets: TargetTemps::default(),
            mode: BoilerMode::Off,
        }
    }
}

impl BoilerConfig {
    pub fn sanitize(&mut self) {
        let defaults = TargetTemps::default();
        if !self.targets.set_point.is_finite() {
            self.targets.set_point = defaults.set_point;
        }
        if !self.targets.hysteresis.is_finite() || self.targets.hysteresis <= 0.0 {
            self.targets.hysteresis = defaults.hysteresis;
        }
        self.targets.set_point = self
            .targets
            .set_point
            .clamp(TargetTemps::MIN_SET_POINT, TargetTemps::MAX_SET_POINT);
        self.targets.hysteresis = self.targets.hysteresis.min(TargetTemps::MAX_HYSTERESIS);
        if self.mode == BoilerMode::Undefined {
            self.mode = BoilerMode::Off;
        }
    }
}

impl RecordCodec for BoilerConfig {
    const SIZE: usize = 4 + 4 + 1;

    fn encode(&self, out: &mut [u8]) {
        FieldWriter::new(out)
            .f32(self.targets.set_point)
            .f32(self.targets.hysteresis)
            .u8(self.mode.to_byte());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut reader = FieldReader::new(bytes);
        Self {
            targets: TargetTemps {
                set_point: reader.f32(),
                hysteresis: reader.f32(),
            },
            mode: BoilerMode::from_byte(reader.u8()),
        }
    }
}

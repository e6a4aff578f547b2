use thiserror::Error;

use crate::types::{FaultReason, SensorId};

pub const DS18B20_FAMILY_CODE: u8 = 0x28;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor {0} not present on the bus")]
    NotPresent(SensorId),
    #[error("sensor {0} read failed: {1}")]
    ReadFailed(SensorId, String),
    #[error("one-wire bus error: {0}")]
    Bus(String),
}

impl SensorError {
    pub fn fault_reason(&self) -> FaultReason {
        match self {
            Self::NotPresent(_) => FaultReason::SensorNotFound,
            Self::ReadFailed(..) => FaultReason::SensorReadFailed,
            Self::Bus(_) => FaultReason::BusCommError,
        }
    }
}

/// Logical one-wire bus contract. Enumeration is a cursor: `reset_search`
/// followed by `select_next` until it returns `false`, reading `address` after
/// each `true`.
pub trait SensorBus: Send {
    fn reset_search(&mut self);
    fn select_next(&mut self) -> Result<bool, SensorError>;
    fn address(&self) -> SensorId;
    /// Starts a simultaneous conversion on every device.
    fn start_conversion(&mut self) -> Result<(), SensorError>;
    /// Temperature in Celsius from the last conversion.
    fn read_temperature(&mut self, id: SensorId) -> Result<f32, SensorError>;
}

pub trait HeaterOutput: Send {
    fn set(&mut self, on: bool);
}

/// Walks the bus and returns every device id found.
pub fn enumerate(bus: &mut dyn SensorBus) -> Result<Vec<SensorId>, SensorError> {
    let mut found = Vec::new();
    bus.reset_search();
    while bus.select_next()? {
        let id = bus.address();
        if !found.contains(&id) {
            found.push(id);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBus;

    #[test]
    fn enumerate_lists_each_device_once() {
        let mut bus = MockBus::with_sensors(&[(SensorId(1), 20.0), (SensorId(2), 30.0)]);
        assert_eq!(enumerate(&mut bus), Ok(vec![SensorId(1), SensorId(2)]));
        // A second walk restarts from the first device.
        assert_eq!(enumerate(&mut bus).map(|ids| ids.len()), Ok(2));
    }

    #[test]
    fn enumerate_propagates_bus_errors() {
        let mut bus = MockBus::with_sensors(&[(SensorId(1), 20.0)]);
        bus.fail_search(true);
        assert!(matches!(enumerate(&mut bus), Err(SensorError::Bus(_))));
    }

    #[test]
    fn errors_map_to_fault_reasons() {
        assert_eq!(
            SensorError::NotPresent(SensorId(5)).fault_reason(),
            FaultReason::SensorNotFound
        );
        assert_eq!(
            SensorError::ReadFailed(SensorId(5), "crc".into()).fault_reason(),
            FaultReason::SensorReadFailed
        );
        assert_eq!(
            SensorError::Bus("short".into()).fault_reason(),
            FaultReason::BusCommError
        );
    }
}

use tracing::warn;

use crate::{
    config::{BootCounter, BoilerConfig, MqttConfig, NetworkConfig, SensorRoleConfig},
    record::{check_range, PersistentRecord, PersistentRegion, RecordCodec, StorageError},
};

pub const STORAGE_CAPACITY: usize = 1024;

/// Byte offsets of each record. Partitions are contiguous, in this order, and
/// never overlap.
pub mod partition {
    use super::*;

    const fn stored<T: RecordCodec>() -> usize {
        PersistentRecord::<T>::STORED_SIZE
    }

    pub const NETWORK: usize = 0;
    pub const BOOT_COUNTER: usize = NETWORK + stored::<NetworkConfig>();
    pub const SENSOR_ROLES: usize = BOOT_COUNTER + stored::<BootCounter>();
    pub const MQTT: usize = SENSOR_ROLES + stored::<SensorRoleConfig>();
    pub const BOILER: usize = MQTT + stored::<MqttConfig>();
    pub const END: usize = BOILER + stored::<BoilerConfig>();
}

const _: () = assert!(
    partition::END <= STORAGE_CAPACITY,
    "persistent partitions exceed storage capacity"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStatus {
    pub name: &'static str,
    pub offset: usize,
    pub valid: bool,
}

pub struct ConfigStore {
    region: Box<dyn PersistentRegion>,
    network: PersistentRecord<NetworkConfig>,
    boot_counter: PersistentRecord<BootCounter>,
    sensor_roles: PersistentRecord<SensorRoleConfig>,
    mqtt: PersistentRecord<MqttConfig>,
    boiler: PersistentRecord<BoilerConfig>,
}

impl ConfigStore {
    pub fn open(mut region: Box<dyn PersistentRegion>) -> Result<Self, StorageError> {
        check_range(0, partition::END, region.capacity())?;

        let mut network = PersistentRecord::new(partition::NETWORK);
        let mut boot_counter = PersistentRecord::new(partition::BOOT_COUNTER);
        let mut sensor_roles = PersistentRecord::new(partition::SENSOR_ROLES);
        let mut mqtt = PersistentRecord::new(partition::MQTT);
        let mut boiler = PersistentRecord::new(partition::BOILER);

        network.load(region.as_mut())?;
        boot_counter.load(region.as_mut())?;
        sensor_roles.load(region.as_mut())?;
        mqtt.load(region.as_mut())?;
        boiler.load(region.as_mut())?;

        let store = Self {
            region,
            network,
            boot_counter,
            sensor_roles,
            mqtt,
            boiler,
        };

        for status in store.record_status() {
            if !status.valid {
                warn!(
                    "persistent record `{}` at offset {} is invalid; using defaults",
                    status.name, status.offset
                );
            }
        }

        Ok(store)
    }

    pub fn record_status(&self) -> [RecordStatus; 5] {
        [
            status("network", &self.network),
            status("boot_counter", &self.boot_counter),
            status("sensor_roles", &self.sensor_roles),
            status("mqtt", &self.mqtt),
            status("boiler", &self.boiler),
        ]
    }

    pub fn network(&self) -> NetworkConfig {
        self.network.get().unwrap_or_default()
    }

    pub fn save_network(&mut self, network: &NetworkConfig) -> Result<(), StorageError> {
        self.network.store(self.region.as_mut(), network)
    }

    pub fn boot_count(&self) -> u32 {
        self.boot_counter.get().unwrap_or_default().0
    }

    pub fn increment_boot_count(&mut self) -> Result<u32, StorageError> {
        let next = BootCounter(self.boot_count().wrapping_add(1));
        self.boot_counter.store(self.region.as_mut(), &next)?;
        Ok(next.0)
    }

    pub fn sensor_roles(&self) -> SensorRoleConfig {
        self.sensor_roles.get().unwrap_or_default()
    }

    pub fn save_sensor_roles(&mut self, roles: &SensorRoleConfig) -> Result<(), StorageError> {
        self.sensor_roles.store(self.region.as_mut(), roles)
    }

    pub fn mqtt(&self) -> MqttConfig {
        self.mqtt.get().unwrap_or_default()
    }

    pub fn save_mqtt(&mut self, mqtt: &MqttConfig) -> Result<(), StorageError> {
        self.mqtt.store(self.region.as_mut(), mqtt)
    }

    pub fn boiler(&self) -> BoilerConfig {
        let mut config = self.boiler.get().unwrap_or_default();
        config.sanitize();
        config
    }

    pub fn save_boiler(&mut self, boiler: &BoilerConfig) -> Result<(), StorageError> {
        self.boiler.store(self.region.as_mut(), boiler)
    }

    pub fn erase_all(&mut self) -> Result<(), StorageError> {
        let region = self.region.as_mut();
        self.network.erase(region)?;
        self.boot_counter.erase(region)?;
        self.sensor_roles.erase(region)?;
        self.mqtt.erase(region)?;
        self.boiler.erase(region)
    }
}

fn status<T: RecordCodec>(name: &'static str, record: &PersistentRecord<T>) -> RecordStatus {
    RecordStatus {
        name,
        offset: record.offset(),
        valid: record.is_valid(),
    }
}

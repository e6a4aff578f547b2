pub mod boiler;
pub mod config;
pub mod connectivity;
pub mod console;
pub mod events;
pub mod ha;
pub mod indicator;
pub mod record;
pub mod sensor;
pub mod state_machine;
pub mod store;
pub mod template;
pub mod timer;
pub mod timesync;
pub mod topics;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use boiler::{BoilerController, ControlLoop, TransitionError};
pub use config::{BoilerConfig, ConfigError, MqttConfig, NetworkConfig, SensorRoleConfig};
pub use connectivity::{ConnectivityManager, LinkStatus, NetError, NetState, WifiDriver};
pub use events::{AppEvent, EventBus, EventKind, Signal};
pub use ha::{transport::MqttTransport, HaClient, HaState};
pub use record::{PersistentRegion, StorageError};
pub use sensor::{HeaterOutput, SensorBus, SensorError};
pub use store::ConfigStore;
pub use timesync::{NtpTransport, RealTimeClock, TimeSyncClient};
pub use types::{
    BoilerMode, Command, ControllerSnapshot, ControllerState, FaultReason, SensorId, SensorRole,
    TargetTemps, TemperatureState,
};

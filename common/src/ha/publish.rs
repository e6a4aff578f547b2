use tracing::debug;

use super::{
    entities::{EntityTable, Property},
    transport::{MqttTransport, TransportError},
};
use crate::{
    state_machine::PolledStateMachine,
    timer::Timer,
    topics::{PAYLOAD_OFF, PAYLOAD_OFFLINE, PAYLOAD_ON, PAYLOAD_ONLINE},
    types::{ControllerSnapshot, SensorRole},
};

pub const THROTTLE_MS: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase {
    DoForce,
    CalcWork,
    SendUpdates,
}

fn temperature(value: Option<f32>) -> Option<String> {
    value.map(|celsius| format!("{celsius:.2}"))
}

fn availability(value: Option<f32>) -> Option<String> {
    let payload = if value.is_some() {
        PAYLOAD_ONLINE
    } else {
        PAYLOAD_OFFLINE
    };
    Some(payload.to_string())
}

pub fn render(property: Property, snapshot: &ControllerSnapshot) -> Option<String> {
    let temps = &snapshot.temperatures;
    match property {
        Property::State => Some(snapshot.state.as_str().to_string()),
        Property::Fault => Some(snapshot.fault.as_str().to_string()),
        Property::Mode => Some(snapshot.mode.as_str().to_string()),
        Property::Heater => {
            Some(if temps.heater_on { PAYLOAD_ON } else { PAYLOAD_OFF }.to_string())
        }
        Property::TargetTemperature => Some(format!("{:.1}", temps.set_point)),
        Property::CurrentTemperature => temperature(temps.boiler_out),
        Property::Ambient => temperature(temps.reading(SensorRole::Ambient)),
        Property::AmbientAvail => availability(temps.reading(SensorRole::Ambient)),
        Property::BoilerIn => temperature(temps.reading(SensorRole::BoilerIn)),
        Property::BoilerInAvail => availability(temps.reading(SensorRole::BoilerIn)),
        Property::BoilerOut => temperature(temps.reading(SensorRole::BoilerOut)),
        Property::BoilerOutAvail => availability(temps.reading(SensorRole::BoilerOut)),
        Property::Hysteresis => Some(format!("{:.1}", temps.hysteresis)),
    }
}

pub struct Publisher {
    machine: PolledStateMachine<PublishPhase>,
    throttle: Timer,
    last_sequence: Option<u64>,
    shadow: Vec<Option<String>>,
    outgoing: Vec<Option<String>>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            machine: PolledStateMachine::new(PublishPhase::DoForce),
            throttle: Timer::expired(),
            last_sequence: None,
            shadow: vec![None; Property::COUNT],
            outgoing: vec![None; Property::COUNT],
        }
    }

    pub fn phase(&self) -> PublishPhase {
        self.machine.state()
    }

    pub fn force(&mut self) {
        self.machine.change_state(PublishPhase::DoForce);
    }

    /// One unit of work: compute pending properties or send one of them.
    /// Returns the property sent this tick, if any.
    pub fn poll(
        &mut self,
        now_ms: u32,
        snapshot: impl FnOnce() -> ControllerSnapshot,
        table: &EntityTable,
        transport: &mut dyn MqttTransport,
    ) -> Result<Option<Property>, TransportError> {
        match self.machine.state() {
            PublishPhase::DoForce => {
                let snapshot = snapshot();
                for property in Property::ALL {
                    self.outgoing[property as usize] = render(property, &snapshot);
                }
                self.last_sequence = Some(snapshot.temperatures.sequence);
                self.throttle.arm(now_ms, THROTTLE_MS);
                debug!("forcing full property resync");
                self.machine.change_state(PublishPhase::SendUpdates);
                self.send_next(table, transport)
            }
            PublishPhase::CalcWork => {
                self.calc_work(now_ms, &snapshot());
                if self.outgoing.iter().any(Option::is_some) {
                    self.machine.change_state(PublishPhase::SendUpdates);
                    return self.send_next(table, transport);
                }
                Ok(None)
            }
            PublishPhase::SendUpdates => self.send_next(table, transport),
        }
    }

    fn calc_work(&mut self, now_ms: u32, snapshot: &ControllerSnapshot) {
        let throttled_due = self.throttle.is_expired(now_ms);
        if throttled_due {
            self.throttle.arm(now_ms, THROTTLE_MS);
        }
        let sequence = snapshot.temperatures.sequence;
        let sequence_changed = self.last_sequence != Some(sequence);
        let check_slow = throttled_due && sequence_changed;
        if check_slow {
            self.last_sequence = Some(sequence);
        }

        for property in Property::ALL {
            if !property.is_fast() && !check_slow {
                continue;
            }
            let index = property as usize;
            let value = render(property, snapshot);
            if value.is_some() && value != self.shadow[index] {
                self.outgoing[index] = value;
            }
        }
    }

    fn send_next(
        &mut self,
        table: &EntityTable,
        transport: &mut dyn MqttTransport,
    ) -> Result<Option<Property>, TransportError> {
        let Some(property) = Property::ALL
            .into_iter()
            .find(|property| self.outgoing[*property as usize].is_some())
        else {
            self.machine.change_state(PublishPhase::CalcWork);
            return Ok(None);
        };

        let index = property as usize;
        if let Some(payload) = self.outgoing[index].take() {
            transport.publish(table.property_topic(property), &payload, property.retained())?;
            self.shadow[index] = Some(payload);
        }

        if self.outgoing.iter().all(Option::is_none) {
            self.machine.change_state(PublishPhase::CalcWork);
        }
        Ok(Some(property))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MqttConfig,
        testing::{MockTransport, Sent},
        types::{BoilerMode, ControllerState, FaultReason, TargetTemps, TemperatureState},
    };
    use pretty_assertions::assert_eq;

    fn snapshot() -> ControllerSnapshot {
        let mut temperatures = TemperatureState::new(TargetTemps::default());
        temperatures.ambient = Some(19.0);
        temperatures.boiler_out = Some(48.25);
        temperatures.sequence = 4;
        ControllerSnapshot {
            state: ControllerState::Halted,
            fault: FaultReason::None,
            mode: BoilerMode::Eco,
            temperatures,
        }
    }

    fn table() -> EntityTable {
        EntityTable::build(&MqttConfig::default()).unwrap()
    }

    #[test]
    fn renders_payloads() {
        let snap = snapshot();
        assert_eq!(render(Property::State, &snap).as_deref(), Some("Halted"));
        assert_eq!(render(Property::Mode, &snap).as_deref(), Some("eco"));
        assert_eq!(render(Property::CurrentTemperature, &snap).as_deref(), Some("48.25"));
        assert_eq!(render(Property::BoilerIn, &snap), None);
        assert_eq!(render(Property::BoilerInAvail, &snap).as_deref(), Some("offline"));
        assert_eq!(render(Property::Heater, &snap).as_deref(), Some("OFF"));
    }

    #[test]
    fn forced_resync_sends_each_property_once_in_order() {
        let table = table();
        let mut transport = MockTransport::default();
        let mut publisher = Publisher::new();
        let snap = snapshot();

        let mut sent = Vec::new();
        for tick in 0..40 {
            if let Some(property) = publisher
                .poll(tick * 10, || snap, &table, &mut transport)
                .unwrap()
            {
                sent.push(property);
            }
        }
        let expected: Vec<Property> = Property::ALL
            .into_iter()
            .filter(|property| render(*property, &snap).is_some())
            .collect();
        assert_eq!(sent, expected);
        assert_eq!(transport.published().len(), expected.len());
        assert_eq!(publisher.phase(), PublishPhase::CalcWork);
    }

    #[test]
    fn steady_state_only_sends_changes() {
        let table = table();
        let mut transport = MockTransport::default();
        let mut publisher = Publisher::new();
        let mut snap = snapshot();
        for tick in 0..20 {
            publisher.poll(tick * 10, || snap, &table, &mut transport).unwrap();
        }
        transport.clear();

        // Fast fields go out on the next tick, without waiting for throttle.
        snap.state = ControllerState::Running;
        publisher.poll(200, || snap, &table, &mut transport).unwrap();
        assert_eq!(
            transport.sent(),
            vec![Sent::Publish {
                topic: "homeassistant/sensor/boiler_state/state".into(),
                payload: "Running".into(),
                retain: false,
            }]
        );
        transport.clear();

        // A reading change waits for the throttle interval and a new sequence.
        snap.temperatures.boiler_out = Some(49.0);
        snap.temperatures.sequence += 1;
        for now in (210..1_000).step_by(10) {
            publisher.poll(now, || snap, &table, &mut transport).unwrap();
        }
        assert!(transport.sent().is_empty());

        for now in (1_000..1_200).step_by(10) {
            publisher.poll(now, || snap, &table, &mut transport).unwrap();
        }
        let topics: Vec<String> = transport.published().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/water_heater/boiler_heater/current_temperature".to_string(),
                "homeassistant/sensor/boiler_boiler_out/temperature".to_string(),
            ]
        );
    }

    #[test]
    fn unchanged_sequence_skips_slow_fields() {
        let table = table();
        let mut transport = MockTransport::default();
        let mut publisher = Publisher::new();
        let mut snap = snapshot();
        for tick in 0..20 {
            publisher.poll(tick * 10, || snap, &table, &mut transport).unwrap();
        }
        transport.clear();

        // Same sequence: the change is not observed even after the throttle.
        snap.temperatures.ambient = Some(25.0);
        for now in (200..3_000).step_by(10) {
            publisher.poll(now, || snap, &table, &mut transport).unwrap();
        }
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn publish_failure_is_reported() {
        let table = table();
        let mut transport = MockTransport::default();
        transport.fail_publish(true);
        let mut publisher = Publisher::new();
        let snap = snapshot();
        assert!(publisher.poll(0, || snap, &table, &mut transport).is_err());
    }
}

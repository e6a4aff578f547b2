use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    config::{BoilerConfig, SensorRoleConfig},
    indicator::Indicator,
    sensor::{enumerate, HeaterOutput, SensorBus, SensorError},
    state_machine::PolledStateMachine,
    timer::Timer,
    types::{
        BoilerMode, Command, ControllerSnapshot, ControllerState, FaultReason, OneWireBusStats,
        SensorId, SensorRole, TargetTemps, TemperatureState,
    },
};

pub const CONTROL_PERIOD_MS: u32 = 1_000;
pub const ENUMERATION_INTERVAL_MS: u32 = 30_000;

const MIN_PLAUSIBLE_C: f32 = -55.0;
const MAX_PLAUSIBLE_C: f32 = 125.0;
const POWER_ON_RESET_C: f32 = 85.0;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{command:?} is only accepted in {required:?}, controller is {actual:?}")]
pub struct TransitionError {
    pub command: Command,
    pub required: ControllerState,
    pub actual: ControllerState,
}

/// Two-point control law. Turns on at or below `set_point - hysteresis`,
/// off at or above `set_point`, otherwise keeps the current output.
pub fn heater_demand(heater_on: bool, temperature: f32, targets: TargetTemps) -> bool {
    if temperature >= targets.set_point {
        false
    } else if temperature <= targets.lower_threshold() {
        true
    } else {
        heater_on
    }
}

#[derive(Debug)]
struct Shared {
    state: ControllerState,
    fault: FaultReason,
    mode: BoilerMode,
    command: Command,
    temps: TemperatureState,
    roles: SensorRoleConfig,
    roles_reloaded: bool,
    discovered: Vec<SensorId>,
    bus_stats: OneWireBusStats,
}

impl Shared {
    fn bump(&mut self) {
        self.temps.sequence += 1;
    }
}

enum FaultUpdate {
    Keep,
    Latch(FaultReason),
    Clear,
}

// What the control loop picks up from the shared side at the start of a tick.
struct Intake {
    command: Command,
    roles: SensorRoleConfig,
    targets: TargetTemps,
    roles_reloaded: bool,
}

#[derive(Debug, Clone)]
pub struct BoilerController {
    shared: Arc<Mutex<Shared>>,
}

impl BoilerController {
    pub fn new(config: BoilerConfig, roles: SensorRoleConfig) -> Self {
        let state = if roles.is_configured() {
            ControllerState::Halted
        } else {
            ControllerState::WaitForValidConfig
        };
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state,
                fault: FaultReason::None,
                mode: config.mode,
                command: Command::Idle,
                temps: TemperatureState::new(config.targets),
                roles,
                roles_reloaded: false,
                discovered: Vec::new(),
                bus_stats: OneWireBusStats::default(),
            })),
        }
    }

    // The guarded data stays consistent after a panic elsewhere: every
    // critical section only assigns plain values.
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let shared = self.lock();
        ControllerSnapshot {
            state: shared.state,
            fault: shared.fault,
            mode: shared.mode,
            temperatures: shared.temps,
        }
    }

    pub fn temperatures(&self) -> TemperatureState {
        self.lock().temps
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state
    }

    pub fn fault(&self) -> FaultReason {
        self.lock().fault
    }

    pub fn mode(&self) -> BoilerMode {
        self.lock().mode
    }

    pub fn targets(&self) -> TargetTemps {
        self.lock().temps.targets()
    }

    pub fn roles(&self) -> SensorRoleConfig {
        self.lock().roles
    }

    pub fn pending_command(&self) -> Command {
        self.lock().command
    }

    pub fn discovered_sensors(&self) -> Vec<SensorId> {
        self.lock().discovered.clone()
    }

    pub fn bus_stats(&self) -> OneWireBusStats {
        self.lock().bus_stats
    }

    pub fn clear_bus_stats(&self) {
        self.lock().bus_stats = OneWireBusStats::default();
    }

    pub fn start(&self) -> Result<(), TransitionError> {
        self.post(Command::Start, ControllerState::Halted)
    }

    pub fn stop(&self) -> Result<(), TransitionError> {
        self.post(Command::Stop, ControllerState::Running)
    }

    pub fn reset(&self) -> Result<(), TransitionError> {
        self.post(Command::Reset, ControllerState::Faulted)
    }

    /// Like [`start`](Self::start) but silently ignores a wrong state.
    /// Returns whether the command was posted.
    pub fn start_if_safe(&self) -> bool {
        self.post(Command::Start, ControllerState::Halted).is_ok()
    }

    pub fn stop_if_safe(&self) -> bool {
        self.post(Command::Stop, ControllerState::Running).is_ok()
    }

    pub fn reset_if_safe(&self) -> bool {
        self.post(Command::Reset, ControllerState::Faulted).is_ok()
    }

    fn post(&self, command: Command, required: ControllerState) -> Result<(), TransitionError> {
        let mut shared = self.lock();
        if shared.state != required {
            return Err(TransitionError {
                command,
                required,
                actual: shared.state,
            });
        }
        shared.command = command;
        Ok(())
    }

    pub fn set_targets(&self, targets: TargetTemps) {
        let mut shared = self.lock();
        if shared.temps.targets() == targets {
            return;
        }
        shared.temps.set_point = targets.set_point;
        shared.temps.hysteresis = targets.hysteresis;
        shared.bump();
    }

    pub fn set_mode(&self, mode: BoilerMode) {
        self.lock().mode = mode;
    }

    pub fn reload_config(&self, roles: SensorRoleConfig) {
        let mut shared = self.lock();
        shared.roles = roles;
        shared.roles_reloaded = true;
    }

    fn take_intake(&self) -> Intake {
        let mut shared = self.lock();
        Intake {
            command: std::mem::take(&mut shared.command),
            roles: shared.roles,
            targets: shared.temps.targets(),
            roles_reloaded: std::mem::take(&mut shared.roles_reloaded),
        }
    }
}

pub struct ControlLoop<B, H> {
    controller: BoilerController,
    machine: PolledStateMachine<ControllerState>,
    bus: B,
    heater: H,
    heater_on: bool,
    enumeration_timer: Timer,
}

impl<B: SensorBus, H: HeaterOutput> ControlLoop<B, H> {
    pub fn new(controller: BoilerController, bus: B, mut heater: H) -> Self {
        heater.set(false);
        let initial = controller.state();
        Self {
            controller,
            machine: PolledStateMachine::new(initial),
            bus,
            heater,
            heater_on: false,
            enumeration_timer: Timer::expired(),
        }
    }

    pub fn controller(&self) -> &BoilerController {
        &self.controller
    }

    pub fn tick(&mut self, now_ms: u32) {
        let intake = self.controller.take_intake();

        if intake.roles_reloaded && !self.machine.is(ControllerState::Faulted) {
            info!("sensor roles reloaded");
            self.enter(Self::idle_state(&intake.roles));
        }

        match self.machine.state() {
            ControllerState::WaitForValidConfig => self.wait_for_config(now_ms, &intake),
            ControllerState::Halted => self.halted(now_ms, &intake),
            ControllerState::Running => self.running(&intake),
            ControllerState::Faulted => self.faulted(&intake),
        }
    }

    fn idle_state(roles: &SensorRoleConfig) -> ControllerState {
        if roles.is_configured() {
            ControllerState::Halted
        } else {
            ControllerState::WaitForValidConfig
        }
    }

    fn wait_for_config(&mut self, now_ms: u32, intake: &Intake) {
        if self.machine.is_first_time() {
            warn!("sensor roles not configured; waiting for configuration");
            self.enumeration_timer = Timer::expired();
        }
        if intake.roles.is_configured() {
            self.enter(ControllerState::Halted);
            return;
        }
        if self.enumeration_timer.is_expired(now_ms) {
            self.enumeration_timer.arm(now_ms, ENUMERATION_INTERVAL_MS);
            // Without roles there is nothing to fault on; failures only count.
            let _ = self.scan();
        }
    }

    fn halted(&mut self, now_ms: u32, intake: &Intake) {
        if self.machine.is_first_time() {
            info!("controller halted");
            self.enumeration_timer = Timer::expired();
        }

        if self.enumeration_timer.is_expired(now_ms) {
            self.enumeration_timer.arm(now_ms, ENUMERATION_INTERVAL_MS);
            match self.scan() {
                Ok(found) => {
                    if let Some(role) = SensorRole::ALL
                        .into_iter()
                        .find(|role| !found.contains(&intake.roles.get(*role)))
                    {
                        let id = intake.roles.get(role);
                        self.latch_fault(&SensorError::NotPresent(id), role);
                        return;
                    }
                }
                Err(err) => {
                    self.latch_fault(&err, SensorRole::Ambient);
                    return;
                }
            }
        }

        if self.sample(&intake.roles).is_none() {
            return;
        }

        if intake.command == Command::Start {
            self.enter(ControllerState::Running);
        }
    }

    fn running(&mut self, intake: &Intake) {
        if self.machine.is_first_time() {
            info!(
                "controller running, set point {:.1} C, hysteresis {:.1} C",
                intake.targets.set_point, intake.targets.hysteresis
            );
        }

        let Some(readings) = self.sample(&intake.roles) else {
            return;
        };

        if intake.command == Command::Stop {
            self.enter(ControllerState::Halted);
            return;
        }

        let boiler_out = readings[2];
        let demand = heater_demand(self.heater_on, boiler_out, intake.targets);
        if demand != self.heater_on {
            info!(
                "heater {} at {:.2} C",
                if demand { "on" } else { "off" },
                boiler_out
            );
        }
        self.set_heater(demand);
    }

    fn faulted(&mut self, intake: &Intake) {
        if self.machine.is_first_time() {
            error!(
                "controller faulted: {}; waiting for reset",
                self.controller.fault().as_str()
            );
        }
        if intake.command == Command::Reset {
            info!("fault cleared by reset");
            self.transition(Self::idle_state(&intake.roles), FaultUpdate::Clear);
        }
    }

    fn scan(&mut self) -> Result<Vec<SensorId>, SensorError> {
        let started = Instant::now();
        let result = enumerate(&mut self.bus);
        let elapsed_ms = u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX);

        let mut shared = self.controller.lock();
        match &result {
            Ok(found) => {
                shared
                    .bus_stats
                    .record_enumeration(elapsed_ms, found.len() as u32);
                if shared.discovered != *found {
                    debug!("bus enumeration found {} device(s)", found.len());
                    shared.discovered = found.clone();
                }
            }
            Err(err) => {
                shared.bus_stats.record_error();
                warn!("bus enumeration failed: {err}");
            }
        }
        result
    }

    fn sample(&mut self, roles: &SensorRoleConfig) -> Option<[f32; 3]> {
        let mut readings = [None; 3];
        let mut failure = None;

        match self.bus.start_conversion() {
            Ok(()) => {
                for (slot, role) in readings.iter_mut().zip(SensorRole::ALL) {
                    match self.read_role(roles.get(role)) {
                        Ok(value) => *slot = Some(value),
                        Err(err) => {
                            failure.get_or_insert((err, role));
                        }
                    }
                }
            }
            Err(err) => failure = Some((err, SensorRole::Ambient)),
        }

        self.publish_readings(readings);

        match failure {
            Some((err, role)) => {
                self.latch_fault(&err, role);
                None
            }
            None => Some(readings.map(|value| value.unwrap_or_default())),
        }
    }

    fn read_role(&mut self, id: SensorId) -> Result<f32, SensorError> {
        let value = self.bus.read_temperature(id)?;
        if !value.is_finite() || !(MIN_PLAUSIBLE_C..=MAX_PLAUSIBLE_C).contains(&value) {
            return Err(SensorError::ReadFailed(id, format!("implausible {value}")));
        }
        if value == POWER_ON_RESET_C {
            return Err(SensorError::ReadFailed(id, "power-on reset value".to_string()));
        }
        Ok(value)
    }

    fn publish_readings(&self, readings: [Option<f32>; 3]) {
        let mut shared = self.controller.lock();
        let mut changed = false;
        for (value, role) in readings.into_iter().zip(SensorRole::ALL) {
            let slot = shared.temps.reading_mut(role);
            if *slot != value {
                *slot = value;
                changed = true;
            }
        }
        if changed {
            shared.bump();
        }
    }

    fn latch_fault(&mut self, err: &SensorError, role: SensorRole) {
        error!("{} sensor fault: {err}", role.as_str());
        self.transition(
            ControllerState::Faulted,
            FaultUpdate::Latch(err.fault_reason()),
        );
    }

    fn enter(&mut self, state: ControllerState) {
        self.transition(state, FaultUpdate::Keep);
    }

    // State, fault and heater shadow change under one lock so a snapshot
    // never pairs Running with a fault or Faulted without one.
    fn transition(&mut self, state: ControllerState, fault: FaultUpdate) {
        let heater_switched = state != ControllerState::Running && self.heater_on;
        if heater_switched {
            self.heater.set(false);
            self.heater_on = false;
        }
        if !self.machine.is(state) {
            debug!("boiler {} -> {}", self.machine.state().as_str(), state.as_str());
        }
        self.machine.change_state(state);

        let mut shared = self.controller.lock();
        match fault {
            FaultUpdate::Keep => {}
            FaultUpdate::Latch(reason) => {
                if shared.fault == FaultReason::None {
                    shared.fault = reason;
                }
            }
            FaultUpdate::Clear => shared.fault = FaultReason::None,
        }
        shared.state = state;
        if heater_switched {
            shared.temps.heater_on = false;
            shared.bump();
        }
    }

    fn set_heater(&mut self, on: bool) {
        if self.heater_on == on {
            return;
        }
        self.heater.set(on);
        self.heater_on = on;
        let mut shared = self.controller.lock();
        shared.temps.heater_on = on;
        shared.bump();
    }
}

impl<B, H> ControlLoop<B, H>
where
    B: SensorBus + 'static,
    H: HeaterOutput + 'static,
{
    pub fn spawn<I>(
        mut self,
        mut heartbeat: I,
        clock: fn() -> u32,
    ) -> std::io::Result<thread::JoinHandle<()>>
    where
        I: Indicator + 'static,
    {
        thread::Builder::new()
            .name("boiler".to_string())
            .spawn(move || {
                let mut beat = false;
                loop {
                    self.tick(clock());
                    beat = !beat;
                    heartbeat.set(beat);
                    thread::sleep(Duration::from_millis(u64::from(CONTROL_PERIOD_MS)));
                }
            })
    }
}

use std::{
    io::{BufRead, Write},
    sync::mpsc::{Receiver, Sender, TryRecvError},
    thread,
    time::Duration,
};

use boiler_common::{
    console::{self, CommandContext, CommandStatus, SystemStatus},
    indicator::{self, FatalReason, Indicator, StatusIndicator},
    AppEvent, BoilerController, ConfigStore, ConnectivityManager, ControlLoop, EventBus, EventKind,
    HaClient, HeaterOutput, MqttTransport, NtpTransport, RealTimeClock, SensorBus, TimeSyncClient,
    WifiDriver,
};
use tracing::{debug, info, warn};

/// Cadence of the cooperative application loop.
pub const APP_TICK_MS: u64 = 10;

/// Devices handed to the control thread.
pub struct ControlHardware<B, H, I> {
    pub bus: B,
    pub heater: H,
    pub heartbeat: I,
}

/// Devices polled by the application loop.
pub struct Platform<W, N, C, T, L> {
    pub wifi: W,
    pub ntp: N,
    pub clock: C,
    pub mqtt: T,
    pub status_led: L,
    pub console: Option<Receiver<String>>,
    pub console_out: Box<dyn Write + Send>,
}

pub struct App<W, N, C, T, L> {
    store: ConfigStore,
    events: EventBus,
    controller: BoilerController,
    connectivity: ConnectivityManager<W>,
    timesync: TimeSyncClient<N, C>,
    ha: HaClient<T>,
    status: StatusIndicator<L>,
    console: Option<Receiver<String>>,
    console_out: Box<dyn Write + Send>,
    uptime_ms: u64,
    last_ms: u32,
}

impl<W, N, C, T, L> App<W, N, C, T, L>
where
    W: WifiDriver,
    N: NtpTransport,
    C: RealTimeClock,
    T: MqttTransport,
    L: Indicator,
{
    /// Starts the control thread and wires every cooperative service.
    /// Unrecoverable startup failures halt with the status indicator blinking.
    pub fn boot<B, H, I>(
        mut store: ConfigStore,
        hardware: ControlHardware<B, H, I>,
        platform: Platform<W, N, C, T, L>,
        clock_ms: fn() -> u32,
    ) -> Self
    where
        B: SensorBus + 'static,
        H: HeaterOutput + 'static,
        I: Indicator + 'static,
    {
        let Platform {
            wifi,
            ntp,
            clock,
            mqtt,
            mut status_led,
            console,
            console_out,
        } = platform;

        match store.increment_boot_count() {
            Ok(count) => info!("boot #{count}"),
            Err(err) => warn!("failed to persist boot counter: {err}"),
        }

        let controller = BoilerController::new(store.boiler(), store.sensor_roles());
        let control = ControlLoop::new(controller.clone(), hardware.bus, hardware.heater);
        if let Err(err) = control.spawn(hardware.heartbeat, clock_ms) {
            warn!("control thread spawn failed: {err}");
            indicator::halt(FatalReason::ThreadSpawn, &mut status_led);
        }

        let ha = match HaClient::new(mqtt, store.mqtt(), controller.clone()) {
            Ok(ha) => ha,
            Err(err) => {
                warn!("mqtt entity table: {err}");
                indicator::halt(FatalReason::EntityTable, &mut status_led);
            }
        };
        let connectivity = ConnectivityManager::new(wifi, store.network());

        let mut events = EventBus::new();
        events.subscribe_signal(
            EventKind::NetworkConfigChanged,
            connectivity.reconfigure_signal(),
        );
        events.subscribe_signal(EventKind::MqttConfigChanged, ha.reconfigure_signal());
        events.subscribe(EventKind::NetworkUp, |event| {
            if let AppEvent::NetworkUp { address } = event {
                info!("network up at {address}");
            }
        });
        events.subscribe(EventKind::NetworkDown, |_| info!("network down"));
        events.subscribe(EventKind::TimeSynced, |event| {
            if let AppEvent::TimeSynced { at } = event {
                info!("wall clock set to {}", at.to_rfc3339());
            }
        });

        Self {
            store,
            events,
            controller,
            connectivity,
            timesync: TimeSyncClient::new(ntp, clock),
            ha,
            status: StatusIndicator::new(status_led),
            console,
            console_out,
            uptime_ms: 0,
            last_ms: clock_ms(),
        }
    }

    pub fn controller(&self) -> BoilerController {
        self.controller.clone()
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            uptime_ms: self.uptime_ms,
            network_up: self.connectivity.is_available(),
            address: self.connectivity.address(),
            broker_connected: self.ha.is_connected(),
            last_time_sync: self.timesync.last_sync(),
        }
    }

    /// One pass over every cooperative service.
    pub fn poll(&mut self, now_ms: u32) {
        self.uptime_ms += u64::from(now_ms.wrapping_sub(self.last_ms));
        self.last_ms = now_ms;

        self.run_console();

        if self.connectivity.reconfigure_signal().is_raised() {
            self.connectivity.set_config(self.store.network());
        }
        if let Some(event) = self.connectivity.poll(now_ms) {
            self.events.publish(&event);
        }

        let online = self.connectivity.is_available();
        if let Some(event) = self.timesync.poll(now_ms, online) {
            self.events.publish(&event);
        }

        if self.ha.reconfigure_signal().is_raised() {
            self.ha.set_config(self.store.mqtt());
        }
        self.ha.poll(now_ms, online, &mut self.store);

        self.status.update(online, self.ha.is_connected(), now_ms);
    }

    fn run_console(&mut self) {
        let status = self.system_status();
        let Some(input) = &self.console else {
            return;
        };
        let mut closed = false;
        loop {
            let line = match input.try_recv() {
                Ok(line) => line,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            };
            let mut ctx = CommandContext {
                controller: &self.controller,
                store: &mut self.store,
                events: &mut self.events,
                status,
            };
            match console::execute(&line, self.console_out.as_mut(), &mut ctx) {
                Ok(CommandStatus::Ok) => {}
                Ok(outcome) => debug!("console `{}` -> {outcome:?}", line.trim()),
                Err(err) => warn!("console write failed: {err}"),
            }
            let _ = self.console_out.flush();
        }
        if closed {
            debug!("console input closed");
            self.console = None;
        }
    }

    pub fn run(mut self, clock_ms: fn() -> u32) -> ! {
        loop {
            self.poll(clock_ms());
            thread::sleep(Duration::from_millis(APP_TICK_MS));
        }
    }
}

/// Forwards console lines from stdin (the UART on the device) to the
/// application loop.
pub fn spawn_stdin_reader(lines: Sender<String>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if lines.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}

use std::{
    io::{self, Write},
    net::Ipv4Addr,
};

use chrono::{DateTime, Utc};

use crate::{
    boiler::BoilerController,
    config::MqttConfig,
    events::{AppEvent, EventBus},
    store::ConfigStore,
    types::{BoilerMode, SensorId, SensorRole, TargetTemps},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    Usage,
    Failed,
    Unknown,
}

/// Read-only runtime facts for `sys show` and `net show`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemStatus {
    pub uptime_ms: u64,
    pub network_up: bool,
    pub address: Option<Ipv4Addr>,
    pub broker_connected: bool,
    pub last_time_sync: Option<DateTime<Utc>>,
}

pub struct CommandContext<'a> {
    pub controller: &'a BoilerController,
    pub store: &'a mut ConfigStore,
    pub events: &'a mut EventBus,
    pub status: SystemStatus,
}

type Handler = fn(&mut dyn Write, &[&str], &mut CommandContext<'_>) -> io::Result<CommandStatus>;

pub struct CommandEntry {
    pub name: &'static str,
    pub usage: &'static str,
    handler: Handler,
}

pub static COMMANDS: [CommandEntry; 5] = [
    CommandEntry {
        name: "help",
        usage: "help",
        handler: help,
    },
    CommandEntry {
        name: "boiler",
        usage: "boiler show|start|stop|reset|scan|stats [clear]|setpoint <c>|hysteresis <c>|\
                mode <off|eco|performance>|roles <ambient> <in> <out>",
        handler: boiler,
    },
    CommandEntry {
        name: "net",
        usage: "net show|wifi <ssid> [pass]|dhcp|static <ip> <mask> <gateway> [dns]",
        handler: net,
    },
    CommandEntry {
        name: "mqtt",
        usage: "mqtt show|set <enabled|host|port|user|pass|base|device> <value>",
        handler: mqtt,
    },
    CommandEntry {
        name: "sys",
        usage: "sys show",
        handler: sys,
    },
];

/// Splits on whitespace; `"..."` keeps spaces inside one word.
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_word = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

pub fn execute(
    line: &str,
    out: &mut dyn Write,
    ctx: &mut CommandContext<'_>,
) -> io::Result<CommandStatus> {
    let words = split_words(line);
    let args: Vec<&str> = words.iter().map(String::as_str).collect();
    let Some(name) = args.first() else {
        return Ok(CommandStatus::Ok);
    };
    let Some(entry) = COMMANDS.iter().find(|entry| entry.name == *name) else {
        writeln!(out, "unknown command `{name}`; try `help`")?;
        return Ok(CommandStatus::Unknown);
    };
    let status = (entry.handler)(out, &args, ctx)?;
    if status == CommandStatus::Usage {
        writeln!(out, "usage: {}", entry.usage)?;
    }
    Ok(status)
}

fn help(
    out: &mut dyn Write,
    _args: &[&str],
    _ctx: &mut CommandContext<'_>,
) -> io::Result<CommandStatus> {
    for entry in &COMMANDS {
        writeln!(out, "  {}", entry.usage)?;
    }
    Ok(CommandStatus::Ok)
}

fn fmt_reading(value: Option<f32>) -> String {
    value.map_or_else(|| "--".to_string(), |c| format!("{c:.2} C"))
}

fn failed(out: &mut dyn Write, message: impl std::fmt::Display) -> io::Result<CommandStatus> {
    writeln!(out, "error: {message}")?;
    Ok(CommandStatus::Failed)
}

fn persist_boiler(out: &mut dyn Write, ctx: &mut CommandContext<'_>) -> io::Result<CommandStatus> {
    let mut config = ctx.store.boiler();
    config.targets = ctx.controller.targets();
    config.mode = ctx.controller.mode();
    match ctx.store.save_boiler(&config) {
        Ok(()) => Ok(CommandStatus::Ok),
        Err(err) => failed(out, err),
    }
}

fn parse_celsius(value: Option<&&str>) -> Option<f32> {
    value.and_then(|v| v.parse::<f32>().ok())
}

fn boiler(
    out: &mut dyn Write,
    args: &[&str],
    ctx: &mut CommandContext<'_>,
) -> io::Result<CommandStatus> {
    let controller = ctx.controller;
    match args.get(1).copied().unwrap_or("show") {
        "show" => {
            let snapshot = controller.snapshot();
            let temps = snapshot.temperatures;
            writeln!(out, "state:      {}", snapshot.state.as_str())?;
            writeln!(out, "fault:      {}", snapshot.fault.as_str())?;
            writeln!(out, "mode:       {}", snapshot.mode.as_str())?;
            writeln!(out, "heater:     {}", if temps.heater_on { "on" } else { "off" })?;
            writeln!(out, "set point:  {:.1} C", temps.set_point)?;
            writeln!(out, "hysteresis: {:.1} C", temps.hysteresis)?;
            let roles = controller.roles();
            for role in SensorRole::ALL {
                writeln!(
                    out,
                    "{:<11} {} [{}]",
                    format!("{}:", role.as_str()),
                    fmt_reading(temps.reading(role)),
                    roles.get(role)
                )?;
            }
            Ok(CommandStatus::Ok)
        }
        "start" => match controller.start() {
            Ok(()) => Ok(CommandStatus::Ok),
            Err(err) => failed(out, err),
        },
        "stop" => match controller.stop() {
            Ok(()) => Ok(CommandStatus::Ok),
            Err(err) => failed(out, err),
        },
        "reset" => match controller.reset() {
            Ok(()) => Ok(CommandStatus::Ok),
            Err(err) => failed(out, err),
        },
        "scan" => {
            let roles = controller.roles();
            let found = controller.discovered_sensors();
            if found.is_empty() {
                writeln!(out, "no sensors discovered")?;
            }
            for id in found {
                let role = SensorRole::ALL
                    .into_iter()
                    .find(|role| roles.get(*role) == id)
                    .map_or("unassigned", SensorRole::as_str);
                writeln!(out, "{id}  {role}")?;
            }
            Ok(CommandStatus::Ok)
        }
        "stats" => {
            if args.get(2) == Some(&"clear") {
                controller.clear_bus_stats();
                return Ok(CommandStatus::Ok);
            }
            let stats = controller.bus_stats();
            writeln!(out, "enumerations: {}", stats.enumerations)?;
            writeln!(out, "errors:       {}", stats.errors)?;
            writeln!(
                out,
                "duration ms:  min {} / avg {} / max {}",
                stats.min_ms,
                stats.average_ms(),
                stats.max_ms
            )?;
            writeln!(out, "devices:      {}", stats.last_device_count)?;
            Ok(CommandStatus::Ok)
        }
        "setpoint" => {
            let Some(set_point) = parse_celsius(args.get(2)) else {
                return Ok(CommandStatus::Usage);
            };
            if !TargetTemps::is_valid_set_point(set_point) {
                return failed(
                    out,
                    format!(
                        "set point must be within {}..={} C",
                        TargetTemps::MIN_SET_POINT,
                        TargetTemps::MAX_SET_POINT
                    ),
                );
            }
            controller.set_targets(TargetTemps {
                set_point,
                ..controller.targets()
            });
            persist_boiler(out, ctx)
        }
        "hysteresis" => {
            let Some(hysteresis) = parse_celsius(args.get(2)) else {
                return Ok(CommandStatus::Usage);
            };
            if !TargetTemps::is_valid_hysteresis(hysteresis) {
                return failed(
                    out,
                    format!("hysteresis must be within (0, {}] C", TargetTemps::MAX_HYSTERESIS),
                );
            }
            controller.set_targets(TargetTemps {
                hysteresis,
                ..controller.targets()
            });
            persist_boiler(out, ctx)
        }
        "mode" => {
            let Some(mode) = args.get(2).and_then(|value| BoilerMode::parse(value)) else {
                return Ok(CommandStatus::Usage);
            };
            controller.set_mode(mode);
            persist_boiler(out, ctx)
        }
        "roles" => {
            let [_, _, ambient, boiler_in, boiler_out] = args else {
                return Ok(CommandStatus::Usage);
            };
            let parsed: Result<Vec<SensorId>, _> = [ambient, boiler_in, boiler_out]
                .iter()
                .map(|word| word.parse::<SensorId>())
                .collect();
            let Ok(ids) = parsed else {
                return failed(out, "sensor ids are 16 hex digits");
            };
            let mut roles = ctx.store.sensor_roles();
            roles.ambient = ids[0];
            roles.boiler_in = ids[1];
            roles.boiler_out = ids[2];
            if let Err(err) = ctx.store.save_sensor_roles(&roles) {
                return failed(out, err);
            }
            controller.reload_config(roles);
            Ok(CommandStatus::Ok)
        }
        _ => Ok(CommandStatus::Usage),
    }
}

fn parse_ip(value: Option<&&str>) -> Option<Ipv4Addr> {
    value.and_then(|v| v.parse().ok())
}

fn net(
    out: &mut dyn Write,
    args: &[&str],
    ctx: &mut CommandContext<'_>,
) -> io::Result<CommandStatus> {
    let mut network = ctx.store.network();
    match args.get(1).copied().unwrap_or("show") {
        "show" => {
            writeln!(out, "ssid:    {}", network.wifi_ssid)?;
            writeln!(
                out,
                "pass:    {}",
                if network.wifi_pass.is_empty() { "(none)" } else { "****" }
            )?;
            if network.use_static_ip {
                writeln!(
                    out,
                    "static:  {} mask {} gw {} dns {}",
                    network.static_ip, network.subnet, network.gateway, network.dns
                )?;
            } else {
                writeln!(out, "dhcp")?;
            }
            let link = match (ctx.status.network_up, ctx.status.address) {
                (true, Some(address)) => format!("up ({address})"),
                _ => "down".to_string(),
            };
            writeln!(out, "link:    {link}")?;
            return Ok(CommandStatus::Ok);
        }
        "wifi" => {
            let Some(ssid) = args.get(2) else {
                return Ok(CommandStatus::Usage);
            };
            if let Err(err) = network.set_credentials(ssid, args.get(3).copied().unwrap_or("")) {
                return failed(out, err);
            }
        }
        "dhcp" => network.set_dhcp(),
        "static" => {
            let (Some(ip), Some(mask), Some(gateway)) = (
                parse_ip(args.get(2)),
                parse_ip(args.get(3)),
                parse_ip(args.get(4)),
            ) else {
                return Ok(CommandStatus::Usage);
            };
            let dns = match args.get(5) {
                Some(_) => match parse_ip(args.get(5)) {
                    Some(dns) => Some(dns),
                    None => return Ok(CommandStatus::Usage),
                },
                None => None,
            };
            if let Err(err) = network.set_static(ip, mask, gateway, dns) {
                return failed(out, err);
            }
        }
        _ => return Ok(CommandStatus::Usage),
    }

    if let Err(err) = ctx.store.save_network(&network) {
        return failed(out, err);
    }
    ctx.events.publish(&AppEvent::NetworkConfigChanged);
    Ok(CommandStatus::Ok)
}

fn mqtt(
    out: &mut dyn Write,
    args: &[&str],
    ctx: &mut CommandContext<'_>,
) -> io::Result<CommandStatus> {
    let mut config = ctx.store.mqtt();
    match args.get(1).copied().unwrap_or("show") {
        "show" => {
            for var in MqttConfig::VARS {
                let value = match var {
                    "enabled" => config.enabled.to_string(),
                    "host" => config.host.clone(),
                    "port" => config.port.to_string(),
                    "user" => config.user.clone(),
                    "pass" if config.pass.is_empty() => "(none)".to_string(),
                    "pass" => "****".to_string(),
                    "base" => config.base_topic.clone(),
                    _ => config.device_name.clone(),
                };
                writeln!(out, "{var:<8} {value}")?;
            }
            writeln!(
                out,
                "broker   {}",
                if ctx.status.broker_connected { "connected" } else { "disconnected" }
            )?;
            Ok(CommandStatus::Ok)
        }
        "set" => {
            let (Some(var), Some(value)) = (args.get(2), args.get(3)) else {
                return Ok(CommandStatus::Usage);
            };
            if let Err(err) = config.set_var(var, value) {
                return failed(out, err);
            }
            if let Err(err) = ctx.store.save_mqtt(&config) {
                return failed(out, err);
            }
            ctx.events.publish(&AppEvent::MqttConfigChanged);
            Ok(CommandStatus::Ok)
        }
        _ => Ok(CommandStatus::Usage),
    }
}

fn sys(
    out: &mut dyn Write,
    args: &[&str],
    ctx: &mut CommandContext<'_>,
) -> io::Result<CommandStatus> {
    if args.get(1).is_some_and(|sub| *sub != "show") {
        return Ok(CommandStatus::Usage);
    }
    let uptime_s = ctx.status.uptime_ms / 1_000;
    writeln!(out, "boot:     #{}", ctx.store.boot_count())?;
    writeln!(
        out,
        "uptime:   {}d {:02}:{:02}:{:02}",
        uptime_s / 86_400,
        (uptime_s / 3_600) % 24,
        (uptime_s / 60) % 60,
        uptime_s % 60
    )?;
    match ctx.status.last_time_sync {
        Some(at) => writeln!(out, "time:     synced {}", at.to_rfc3339())?,
        None => writeln!(out, "time:     not synced")?,
    }
    for record in ctx.store.record_status() {
        writeln!(
            out,
            "record:   {:<13} @{:<4} {}",
            record.name,
            record.offset,
            if record.valid { "ok" } else { "invalid" }
        )?;
    }
    Ok(CommandStatus::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BoilerConfig, SensorRoleConfig},
        events::{EventKind, Signal},
        record::MemoryRegion,
        store::STORAGE_CAPACITY,
        types::{Command, ControllerState},
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        controller: BoilerController,
        store: ConfigStore,
        events: EventBus,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                controller: BoilerController::new(
                    BoilerConfig::default(),
                    SensorRoleConfig::default(),
                ),
                store: ConfigStore::open(Box::new(MemoryRegion::new(STORAGE_CAPACITY))).unwrap(),
                events: EventBus::new(),
            }
        }

        fn run(&mut self, line: &str) -> (CommandStatus, String) {
            let mut out = Vec::new();
            let mut ctx = CommandContext {
                controller: &self.controller,
                store: &mut self.store,
                events: &mut self.events,
                status: SystemStatus::default(),
            };
            let status = execute(line, &mut out, &mut ctx).unwrap();
            (status, String::from_utf8(out).unwrap())
        }
    }

    #[test]
    fn splits_quoted_words() {
        assert_eq!(
            split_words(r#"net wifi "My Network" pw"#),
            vec!["net", "wifi", "My Network", "pw"]
        );
        assert_eq!(split_words("   "), Vec::<String>::new());
        assert_eq!(split_words(r#"mqtt set pass """#), vec!["mqtt", "set", "pass", ""]);
    }

    #[test]
    fn unknown_and_usage() {
        let mut fx = Fixture::new();
        assert_eq!(fx.run("frobnicate").0, CommandStatus::Unknown);
        let (status, out) = fx.run("boiler setpoint");
        assert_eq!(status, CommandStatus::Usage);
        assert!(out.starts_with("usage: boiler"));
        assert_eq!(fx.run("").0, CommandStatus::Ok);
    }

    #[test]
    fn roles_persist_and_reload_controller() {
        let mut fx = Fixture::new();
        let (status, _) =
            fx.run("boiler roles 28ff000000000001 28ff000000000002 28:ff:00:00:00:00:00:03");
        assert_eq!(status, CommandStatus::Ok);
        let roles = fx.store.sensor_roles();
        assert!(roles.is_configured());
        assert_eq!(roles.boiler_out, SensorId(0x28ff_0000_0000_0003));
        assert_eq!(fx.controller.roles(), roles);

        assert_eq!(fx.run("boiler roles 1 2").0, CommandStatus::Usage);
        assert_eq!(fx.run("boiler roles 1 2 xyz").0, CommandStatus::Failed);
    }

    #[test]
    fn strict_commands_report_wrong_state() {
        let mut fx = Fixture::new();
        assert_eq!(fx.controller.state(), ControllerState::WaitForValidConfig);
        let (status, out) = fx.run("boiler start");
        assert_eq!(status, CommandStatus::Failed);
        assert!(out.contains("Halted"));
        assert_eq!(fx.controller.pending_command(), Command::Idle);
    }

    #[test]
    fn setpoint_and_mode_are_validated_and_persisted() {
        let mut fx = Fixture::new();
        assert_eq!(fx.run("boiler setpoint 90").0, CommandStatus::Failed);
        assert_eq!(fx.run("boiler setpoint 62.5").0, CommandStatus::Ok);
        assert_eq!(fx.run("boiler hysteresis 3").0, CommandStatus::Ok);
        assert_eq!(fx.run("boiler mode eco").0, CommandStatus::Ok);
        assert_eq!(fx.run("boiler mode turbo").0, CommandStatus::Usage);

        let saved = fx.store.boiler();
        assert_eq!(saved.targets.set_point, 62.5);
        assert_eq!(saved.targets.hysteresis, 3.0);
        assert_eq!(saved.mode, BoilerMode::Eco);
        assert_eq!(fx.controller.targets(), saved.targets);
    }

    #[test]
    fn config_changes_publish_events() {
        let mut fx = Fixture::new();
        let net_signal = Signal::new();
        let mqtt_signal = Signal::new();
        fx.events
            .subscribe_signal(EventKind::NetworkConfigChanged, &net_signal);
        fx.events
            .subscribe_signal(EventKind::MqttConfigChanged, &mqtt_signal);

        assert_eq!(fx.run(r#"net wifi "Cellar AP" secret"#).0, CommandStatus::Ok);
        assert!(net_signal.take());
        assert_eq!(fx.store.network().wifi_ssid, "Cellar AP");

        assert_eq!(
            fx.run("net static 192.168.1.50 255.255.255.0 192.168.1.1").0,
            CommandStatus::Ok
        );
        assert!(fx.store.network().use_static_ip);
        assert_eq!(fx.run("net static 192.168.1.50 nope").0, CommandStatus::Usage);

        assert_eq!(fx.run("mqtt set host broker.lan").0, CommandStatus::Ok);
        assert!(mqtt_signal.take());
        assert_eq!(fx.store.mqtt().host, "broker.lan");
        assert_eq!(fx.run("mqtt set port 0").0, CommandStatus::Failed);
        assert!(!mqtt_signal.is_raised());

        let (_, shown) = fx.run("mqtt show");
        assert!(shown.contains("broker.lan"));
    }

    #[test]
    fn sys_show_reports_records() {
        let mut fx = Fixture::new();
        fx.store.increment_boot_count().unwrap();
        let (status, out) = fx.run("sys show");
        assert_eq!(status, CommandStatus::Ok);
        assert!(out.contains("boot:     #1"));
        assert!(out.contains("boot_counter"));
    }
}

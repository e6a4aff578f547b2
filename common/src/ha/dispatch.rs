use tracing::{debug, info, warn};

use super::{
    entities::{EntityId, EntityTable},
    transport::MAX_MQTT_PAYLOAD_BYTES,
};
use crate::{
    boiler::BoilerController,
    store::ConfigStore,
    topics::{
        PAYLOAD_ONLINE, PAYLOAD_PRESS, SUFFIX_CMD, SUFFIX_HA_STATUS, SUFFIX_MODE_SET, SUFFIX_SET,
        SUFFIX_TEMPERATURE_SET,
    },
    types::{BoilerMode, TargetTemps},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRoot {
    Entity(EntityId),
    Base,
}

pub struct HandlerContext<'a> {
    pub controller: &'a BoilerController,
    pub store: &'a mut ConfigStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    Ignored,
    Resync,
}

type Handler = fn(&mut HandlerContext<'_>, &str) -> Outcome;

pub struct Route {
    pub root: TopicRoot,
    pub suffix: &'static str,
    handler: Handler,
}

pub static ROUTES: [Route; 7] = [
    Route {
        root: TopicRoot::Entity(EntityId::WaterHeater),
        suffix: SUFFIX_MODE_SET,
        handler: set_mode,
    },
    Route {
        root: TopicRoot::Entity(EntityId::WaterHeater),
        suffix: SUFFIX_TEMPERATURE_SET,
        handler: set_temperature,
    },
    Route {
        root: TopicRoot::Entity(EntityId::Start),
        suffix: SUFFIX_CMD,
        handler: press_start,
    },
    Route {
        root: TopicRoot::Entity(EntityId::Stop),
        suffix: SUFFIX_CMD,
        handler: press_stop,
    },
    Route {
        root: TopicRoot::Entity(EntityId::Reset),
        suffix: SUFFIX_CMD,
        handler: press_reset,
    },
    Route {
        root: TopicRoot::Entity(EntityId::Hysteresis),
        suffix: SUFFIX_SET,
        handler: set_hysteresis,
    },
    Route {
        root: TopicRoot::Base,
        suffix: SUFFIX_HA_STATUS,
        handler: platform_status,
    },
];

fn prefix<'t>(table: &'t EntityTable, root: TopicRoot) -> &'t str {
    match root {
        TopicRoot::Entity(entity) => table.root(entity),
        TopicRoot::Base => &table.base,
    }
}

pub fn subscriptions(table: &EntityTable) -> Vec<String> {
    ROUTES
        .iter()
        .map(|route| format!("{}{}", prefix(table, route.root), route.suffix))
        .collect()
}

/// Exact match: the topic is the prefix immediately followed by the suffix.
fn find_route(table: &EntityTable, topic: &str) -> Option<&'static Route> {
    ROUTES.iter().find(|route| {
        let prefix = prefix(table, route.root);
        topic.len() == prefix.len() + route.suffix.len()
            && topic.starts_with(prefix)
            && topic.ends_with(route.suffix)
    })
}

pub fn dispatch(
    table: &EntityTable,
    ctx: &mut HandlerContext<'_>,
    topic: &str,
    payload: &[u8],
) -> Outcome {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized mqtt payload on {topic} ({} bytes)",
            payload.len()
        );
        return Outcome::Ignored;
    }
    let Ok(payload) = std::str::from_utf8(payload) else {
        warn!("dropping non-utf8 mqtt payload on {topic}");
        return Outcome::Ignored;
    };
    let Some(route) = find_route(table, topic) else {
        warn!("no handler for mqtt topic {topic}");
        return Outcome::Ignored;
    };
    debug!("mqtt {topic} <- {payload}");
    (route.handler)(ctx, payload.trim())
}

fn persist_boiler(ctx: &mut HandlerContext<'_>) {
    let mut config = ctx.store.boiler();
    config.targets = ctx.controller.targets();
    config.mode = ctx.controller.mode();
    if let Err(err) = ctx.store.save_boiler(&config) {
        warn!("failed to persist boiler settings: {err}");
    }
}

fn parse_celsius(payload: &str) -> Option<f32> {
    payload.parse::<f32>().ok().filter(|value| value.is_finite())
}

fn set_mode(ctx: &mut HandlerContext<'_>, payload: &str) -> Outcome {
    let Some(mode) = BoilerMode::parse(payload) else {
        warn!("ignoring unknown boiler mode `{payload}`");
        return Outcome::Ignored;
    };
    ctx.controller.set_mode(mode);
    persist_boiler(ctx);
    info!("mode set to {} via mqtt", mode.as_str());
    Outcome::Handled
}

fn set_temperature(ctx: &mut HandlerContext<'_>, payload: &str) -> Outcome {
    let Some(set_point) = parse_celsius(payload).filter(|v| TargetTemps::is_valid_set_point(*v))
    else {
        warn!("ignoring invalid set point `{payload}`");
        return Outcome::Ignored;
    };
    let targets = TargetTemps {
        set_point,
        ..ctx.controller.targets()
    };
    ctx.controller.set_targets(targets);
    persist_boiler(ctx);
    info!("set point {set_point:.1} C via mqtt");
    Outcome::Handled
}

fn set_hysteresis(ctx: &mut HandlerContext<'_>, payload: &str) -> Outcome {
    let Some(hysteresis) =
        parse_celsius(payload).filter(|v| TargetTemps::is_valid_hysteresis(*v))
    else {
        warn!("ignoring invalid hysteresis `{payload}`");
        return Outcome::Ignored;
    };
    let targets = TargetTemps {
        hysteresis,
        ..ctx.controller.targets()
    };
    ctx.controller.set_targets(targets);
    persist_boiler(ctx);
    info!("hysteresis {hysteresis:.1} C via mqtt");
    Outcome::Handled
}

fn press(payload: &str, name: &str, action: impl FnOnce() -> bool) -> Outcome {
    if payload != PAYLOAD_PRESS {
        warn!("ignoring {name} payload `{payload}`");
        return Outcome::Ignored;
    }
    if action() {
        info!("{name} requested via mqtt");
    } else {
        debug!("{name} ignored in current controller state");
    }
    Outcome::Handled
}

fn press_start(ctx: &mut HandlerContext<'_>, payload: &str) -> Outcome {
    press(payload, "start", || ctx.controller.start_if_safe())
}

fn press_stop(ctx: &mut HandlerContext<'_>, payload: &str) -> Outcome {
    press(payload, "stop", || ctx.controller.stop_if_safe())
}

fn press_reset(ctx: &mut HandlerContext<'_>, payload: &str) -> Outcome {
    press(payload, "reset", || ctx.controller.reset_if_safe())
}

fn platform_status(_ctx: &mut HandlerContext<'_>, payload: &str) -> Outcome {
    if payload == PAYLOAD_ONLINE {
        info!("home assistant came online; resynchronizing");
        Outcome::Resync
    } else {
        Outcome::Ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BoilerConfig, MqttConfig, SensorRoleConfig},
        record::MemoryRegion,
        store::STORAGE_CAPACITY,
        types::{Command, ControllerState},
    };
    use pretty_assertions::assert_eq;

    fn fixture() -> (EntityTable, BoilerController, ConfigStore) {
        let table = EntityTable::build(&MqttConfig::default()).unwrap();
        let controller =
            BoilerController::new(BoilerConfig::default(), SensorRoleConfig::default());
        let store = ConfigStore::open(Box::new(MemoryRegion::new(STORAGE_CAPACITY))).unwrap();
        (table, controller, store)
    }

    fn send(
        table: &EntityTable,
        controller: &BoilerController,
        store: &mut ConfigStore,
        topic: &str,
        payload: &str,
    ) -> Outcome {
        let mut ctx = HandlerContext { controller, store };
        dispatch(table, &mut ctx, topic, payload.as_bytes())
    }

    #[test]
    fn subscribes_to_every_route() {
        let (table, ..) = fixture();
        let topics = subscriptions(&table);
        assert_eq!(topics.len(), ROUTES.len());
        assert_eq!(topics[0], "homeassistant/water_heater/boiler_heater/mode/set");
        assert_eq!(topics[6], "homeassistant/status");
    }

    #[test]
    fn exact_topic_match_only() {
        let (table, controller, mut store) = fixture();
        let topic = "homeassistant/water_heater/boiler_heater/temperature/set";
        assert_eq!(send(&table, &controller, &mut store, topic, "61.5"), Outcome::Handled);
        assert_eq!(controller.targets().set_point, 61.5);
        assert_eq!(store.boiler().targets.set_point, 61.5);

        for near_miss in [
            "homeassistant/water_heater/boiler_heater/temperature/set/x",
            "xhomeassistant/water_heater/boiler_heater/temperature/set",
            "homeassistant/water_heater/boiler_heater/temperature",
            "homeassistant/water_heater/boiler_heaterX/temperature/set",
        ] {
            assert_eq!(
                send(&table, &controller, &mut store, near_miss, "40"),
                Outcome::Ignored,
                "{near_miss}"
            );
        }
        assert_eq!(controller.targets().set_point, 61.5);
    }

    #[test]
    fn invalid_values_are_dropped() {
        let (table, controller, mut store) = fixture();
        let topic = "homeassistant/number/boiler_hysteresis/set";
        assert_eq!(send(&table, &controller, &mut store, topic, "0"), Outcome::Ignored);
        assert_eq!(send(&table, &controller, &mut store, topic, "abc"), Outcome::Ignored);
        assert_eq!(send(&table, &controller, &mut store, topic, "3.5"), Outcome::Handled);
        assert_eq!(controller.targets().hysteresis, 3.5);

        let mode = "homeassistant/water_heater/boiler_heater/mode/set";
        assert_eq!(send(&table, &controller, &mut store, mode, "eco"), Outcome::Handled);
        assert_eq!(controller.mode(), BoilerMode::Eco);
        assert_eq!(store.boiler().mode, BoilerMode::Eco);
    }

    #[test]
    fn buttons_use_safe_commands() {
        let (table, controller, mut store) = fixture();
        assert_eq!(controller.state(), ControllerState::WaitForValidConfig);
        let start = "homeassistant/button/boiler_start/cmd";
        assert_eq!(send(&table, &controller, &mut store, start, "PRESS"), Outcome::Handled);
        assert_eq!(controller.pending_command(), Command::Idle);
        assert_eq!(send(&table, &controller, &mut store, start, "press"), Outcome::Ignored);
    }

    #[test]
    fn oversized_and_binary_payloads_are_dropped() {
        let (table, controller, mut store) = fixture();
        let topic = "homeassistant/water_heater/boiler_heater/mode/set";
        let mut ctx = HandlerContext {
            controller: &controller,
            store: &mut store,
        };
        let big = vec![b'a'; MAX_MQTT_PAYLOAD_BYTES + 1];
        assert_eq!(dispatch(&table, &mut ctx, topic, &big), Outcome::Ignored);
        assert_eq!(dispatch(&table, &mut ctx, topic, &[0xff, 0xfe]), Outcome::Ignored);
        assert_eq!(controller.mode(), BoilerMode::Off);
    }

    #[test]
    fn platform_birth_requests_resync() {
        let (table, controller, mut store) = fixture();
        assert_eq!(
            send(&table, &controller, &mut store, "homeassistant/status", "online"),
            Outcome::Resync
        );
        assert_eq!(
            send(&table, &controller, &mut store, "homeassistant/status", "offline"),
            Outcome::Ignored
        );
    }
}

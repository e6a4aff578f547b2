use crate::{
    config::MqttConfig,
    template::{expand, measure, TemplateError},
    topics::{
        common_avail, entity_root, SUFFIX_AVAIL, SUFFIX_CONFIG, SUFFIX_CURRENT_TEMPERATURE,
        SUFFIX_MODE, SUFFIX_STATE, SUFFIX_TEMPERATURE,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityId {
    WaterHeater,
    Ambient,
    BoilerIn,
    BoilerOut,
    State,
    Fault,
    Heater,
    Start,
    Stop,
    Reset,
    Hysteresis,
}

impl EntityId {
    pub const COUNT: usize = 11;
}

/// Static description of one entity. Config templates take `%1` device name,
/// `%2` common availability topic, `%3` entity root topic, `%4` display name,
/// `%5` object id.
#[derive(Debug)]
pub struct EntityDescriptor {
    pub id: EntityId,
    pub component: &'static str,
    pub object: &'static str,
    pub name: &'static str,
    pub config: &'static str,
}

macro_rules! temperature_sensor {
    () => {
        concat!(
            "{'name':'%4','uniq_id':'%1_%5','stat_t':'%3/temperature',",
            "'avty':[{'t':'%2'},{'t':'%3/avail'}],'avty_mode':'all',",
            "'dev_cla':'temperature','stat_cla':'measurement','unit_of_meas':'°C',",
            "'dev':{'ids':['%1'],'name':'%1'}}"
        )
    };
}

macro_rules! button {
    () => {
        concat!(
            "{'name':'%4','uniq_id':'%1_%5','cmd_t':'%3/cmd','pl_prs':'PRESS',",
            "'avty_t':'%2','dev':{'ids':['%1'],'name':'%1'}}"
        )
    };
}

pub static ENTITIES: [EntityDescriptor; EntityId::COUNT] = [
    EntityDescriptor {
        id: EntityId::WaterHeater,
        component: "water_heater",
        object: "heater",
        name: "Boiler",
        config: concat!(
            "{'name':'%4','uniq_id':'%1_%5','avty_t':'%2',",
            "'mode_stat_t':'%3/mode','mode_cmd_t':'%3/mode/set',",
            "'temp_stat_t':'%3/temperature','temp_cmd_t':'%3/temperature/set',",
            "'curr_temp_t':'%3/current_temperature','modes':['off','eco','performance'],",
            "'min_temp':20,'max_temp':80,'precision':0.5,'temp_unit':'C',",
            "'dev':{'ids':['%1'],'name':'%1','mf':'boiler-controller','mdl':'one-wire boiler'}}"
        ),
    },
    EntityDescriptor {
        id: EntityId::Ambient,
        component: "sensor",
        object: "ambient",
        name: "Ambient temperature",
        config: temperature_sensor!(),
    },
    EntityDescriptor {
        id: EntityId::BoilerIn,
        component: "sensor",
        object: "boiler_in",
        name: "Boiler inlet temperature",
        config: temperature_sensor!(),
    },
    EntityDescriptor {
        id: EntityId::BoilerOut,
        component: "sensor",
        object: "boiler_out",
        name: "Boiler outlet temperature",
        config: temperature_sensor!(),
    },
    EntityDescriptor {
        id: EntityId::State,
        component: "sensor",
        object: "state",
        name: "Controller state",
        config: concat!(
            "{'name':'%4','uniq_id':'%1_%5','stat_t':'%3/state','avty_t':'%2',",
            "'ic':'mdi:state-machine','dev':{'ids':['%1'],'name':'%1'}}"
        ),
    },
    EntityDescriptor {
        id: EntityId::Fault,
        component: "sensor",
        object: "fault",
        name: "Fault",
        config: concat!(
            "{'name':'%4','uniq_id':'%1_%5','stat_t':'%3/state','avty_t':'%2',",
            "'ic':'mdi:alert','ent_cat':'diagnostic','dev':{'ids':['%1'],'name':'%1'}}"
        ),
    },
    EntityDescriptor {
        id: EntityId::Heater,
        component: "binary_sensor",
        object: "heating",
        name: "Heater",
        config: concat!(
            "{'name':'%4','uniq_id':'%1_%5','stat_t':'%3/state','avty_t':'%2',",
            "'dev_cla':'heat','pl_on':'ON','pl_off':'OFF','dev':{'ids':['%1'],'name':'%1'}}"
        ),
    },
    EntityDescriptor {
        id: EntityId::Start,
        component: "button",
        object: "start",
        name: "Start",
        config: button!(),
    },
    EntityDescriptor {
        id: EntityId::Stop,
        component: "button",
        object: "stop",
        name: "Stop",
        config: button!(),
    },
    EntityDescriptor {
        id: EntityId::Reset,
        component: "button",
        object: "reset",
        name: "Reset",
        config: button!(),
    },
    EntityDescriptor {
        id: EntityId::Hysteresis,
        component: "number",
        object: "hysteresis",
        name: "Hysteresis",
        config: concat!(
            "{'name':'%4','uniq_id':'%1_%5','stat_t':'%3/state','cmd_t':'%3/set',",
            "'avty_t':'%2','min':0.5,'max':20,'step':0.5,'unit_of_meas':'°C','mode':'box',",
            "'ent_cat':'config','dev':{'ids':['%1'],'name':'%1'}}"
        ),
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    State,
    Fault,
    Mode,
    Heater,
    TargetTemperature,
    CurrentTemperature,
    Ambient,
    AmbientAvail,
    BoilerIn,
    BoilerInAvail,
    BoilerOut,
    BoilerOutAvail,
    Hysteresis,
}

impl Property {
    pub const COUNT: usize = 13;

    pub const ALL: [Property; Self::COUNT] = [
        Self::State,
        Self::Fault,
        Self::Mode,
        Self::Heater,
        Self::TargetTemperature,
        Self::CurrentTemperature,
        Self::Ambient,
        Self::AmbientAvail,
        Self::BoilerIn,
        Self::BoilerInAvail,
        Self::BoilerOut,
        Self::BoilerOutAvail,
        Self::Hysteresis,
    ];

    pub fn is_fast(self) -> bool {
        matches!(self, Self::State | Self::Fault | Self::Mode)
    }

    pub fn retained(self) -> bool {
        matches!(
            self,
            Self::AmbientAvail | Self::BoilerInAvail | Self::BoilerOutAvail
        )
    }

    fn location(self) -> (EntityId, &'static str) {
        match self {
            Self::State => (EntityId::State, SUFFIX_STATE),
            Self::Fault => (EntityId::Fault, SUFFIX_STATE),
            Self::Mode => (EntityId::WaterHeater, SUFFIX_MODE),
            Self::Heater => (EntityId::Heater, SUFFIX_STATE),
            Self::TargetTemperature => (EntityId::WaterHeater, SUFFIX_TEMPERATURE),
            Self::CurrentTemperature => (EntityId::WaterHeater, SUFFIX_CURRENT_TEMPERATURE),
            Self::Ambient => (EntityId::Ambient, SUFFIX_TEMPERATURE),
            Self::AmbientAvail => (EntityId::Ambient, SUFFIX_AVAIL),
            Self::BoilerIn => (EntityId::BoilerIn, SUFFIX_TEMPERATURE),
            Self::BoilerInAvail => (EntityId::BoilerIn, SUFFIX_AVAIL),
            Self::BoilerOut => (EntityId::BoilerOut, SUFFIX_TEMPERATURE),
            Self::BoilerOutAvail => (EntityId::BoilerOut, SUFFIX_AVAIL),
            Self::Hysteresis => (EntityId::Hysteresis, SUFFIX_STATE),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub descriptor: &'static EntityDescriptor,
    pub root: String,
    pub config_topic: String,
    pub config_body: String,
}

#[derive(Debug, Clone)]
pub struct EntityTable {
    pub base: String,
    pub common_avail: String,
    pub entities: Vec<Entity>,
    property_topics: Vec<String>,
    largest_message: usize,
}

impl EntityTable {
    pub fn build(config: &MqttConfig) -> Result<Self, TemplateError> {
        let base = config.base_topic.as_str();
        let device = config.device_name.as_str();
        let common_avail = common_avail(base, device)?;

        let mut entities = Vec::with_capacity(ENTITIES.len());
        let mut largest_message = 0;
        for (index, descriptor) in ENTITIES.iter().enumerate() {
            debug_assert_eq!(descriptor.id as usize, index);
            let root = entity_root(base, descriptor.component, device, descriptor.object)?;
            let args = [
                device,
                common_avail.as_str(),
                root.as_str(),
                descriptor.name,
                descriptor.object,
            ];
            largest_message = largest_message.max(measure(descriptor.config, &args)?);
            let config_body = expand(descriptor.config, &args)?;
            entities.push(Entity {
                descriptor,
                config_topic: format!("{root}{SUFFIX_CONFIG}"),
                config_body,
                root,
            });
        }

        let property_topics = Property::ALL
            .iter()
            .map(|property| {
                let (entity, suffix) = property.location();
                format!("{}{suffix}", entities[entity as usize].root)
            })
            .collect();

        Ok(Self {
            base: base.to_string(),
            common_avail,
            entities,
            property_topics,
            largest_message,
        })
    }

    pub fn root(&self, entity: EntityId) -> &str {
        &self.entities[entity as usize].root
    }

    pub fn property_topic(&self, property: Property) -> &str {
        &self.property_topics[property as usize]
    }

    pub fn largest_message(&self) -> usize {
        self.largest_message
    }
}

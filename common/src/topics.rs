use crate::template::{expand, TemplateError};

pub const SUFFIX_CONFIG: &str = "/config";
pub const SUFFIX_AVAIL: &str = "/avail";
pub const SUFFIX_MODE: &str = "/mode";
pub const SUFFIX_MODE_SET: &str = "/mode/set";
pub const SUFFIX_TEMPERATURE: &str = "/temperature";
pub const SUFFIX_TEMPERATURE_SET: &str = "/temperature/set";
pub const SUFFIX_CURRENT_TEMPERATURE: &str = "/current_temperature";
pub const SUFFIX_STATE: &str = "/state";
pub const SUFFIX_SET: &str = "/set";
pub const SUFFIX_CMD: &str = "/cmd";
/// Home Assistant birth/last-will topic under the discovery base.
pub const SUFFIX_HA_STATUS: &str = "/status";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";
pub const PAYLOAD_PRESS: &str = "PRESS";
pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

const ENTITY_ROOT: &str = "%1/%2/%3_%4";
const COMMON_AVAIL: &str = "%1/%2/avail";

/// `<base>/<component>/<device>_<object>`
pub fn entity_root(
    base: &str,
    component: &str,
    device: &str,
    object: &str,
) -> Result<String, TemplateError> {
    expand(ENTITY_ROOT, &[base, component, device, object])
}

/// `<base>/<device>/avail`, shared by every entity and used as last will.
pub fn common_avail(base: &str, device: &str) -> Result<String, TemplateError> {
    expand(COMMON_AVAIL, &[base, device])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_roots() {
        assert_eq!(
            entity_root("homeassistant", "sensor", "boiler", "ambient").unwrap(),
            "homeassistant/sensor/boiler_ambient"
        );
        assert_eq!(
            common_avail("homeassistant", "boiler").unwrap(),
            "homeassistant/boiler/avail"
        );
    }
}

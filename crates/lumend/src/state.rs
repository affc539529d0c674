use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// Snapshot of a fixture's light state.
///
/// Covers the primary channel and the independent ambient ("background")
/// channel, plus the optional power-off timer countdown. Every field has a
/// defined default; incoming property maps only overwrite the fields they
/// carry, so a partial update never invalidates the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub main_power: bool,
    /// 1-100.
    pub main_brightness: u8,
    /// 2700-6500 Kelvin.
    pub color_temperature: u16,

    pub bg_power: bool,
    /// 1-100.
    pub bg_brightness: u8,
    /// Packed 0xRRGGBB.
    pub bg_rgb: u32,

    /// Minutes until the fixture's power-off timer fires, if armed.
    pub timer_minutes: Option<u32>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            main_power: false,
            main_brightness: 80,
            color_temperature: 4500,
            bg_power: false,
            bg_brightness: 50,
            bg_rgb: 0xFF_6B_00,
            timer_minutes: None,
        }
    }
}

impl DeviceState {
    /// Apply a property map from a `get_prop` result or a notification.
    ///
    /// Fixtures are inconsistent about value encodings: a brightness sent as
    /// a number may come back as a numeral string. Both are accepted here.
    /// Unknown keys and unparsable values leave the prior state unchanged.
    pub fn apply_properties(&mut self, props: &Map<String, Value>) {
        if let Some(on) = props.get("power").and_then(value_as_power) {
            self.main_power = on;
        }
        if let Some(bright) = props.get("bright").and_then(value_as_i64) {
            self.main_brightness = bright.clamp(1, 100) as u8;
        }
        if let Some(ct) = props.get("ct").and_then(value_as_i64) {
            self.color_temperature = ct.clamp(2700, 6500) as u16;
        }
        if let Some(on) = props.get("bg_power").and_then(value_as_power) {
            self.bg_power = on;
        }
        if let Some(bright) = props.get("bg_bright").and_then(value_as_i64) {
            self.bg_brightness = bright.clamp(1, 100) as u8;
        }
        if let Some(rgb) = props.get("bg_rgb").and_then(value_as_i64) {
            self.bg_rgb = rgb.clamp(0, 0xFF_FF_FF) as u32;
        }
    }

    pub fn bg_red(&self) -> u8 {
        ((self.bg_rgb >> 16) & 0xFF) as u8
    }

    pub fn bg_green(&self) -> u8 {
        ((self.bg_rgb >> 8) & 0xFF) as u8
    }

    pub fn bg_blue(&self) -> u8 {
        (self.bg_rgb & 0xFF) as u8
    }
}

pub fn rgb_from_components(red: u8, green: u8, blue: u8) -> u32 {
    (u32::from(red) << 16) | (u32::from(green) << 8) | u32::from(blue)
}

fn value_as_power(value: &Value) -> Option<bool> {
    value.as_str().map(|s| s == "on")
}

fn value_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

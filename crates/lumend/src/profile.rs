use serde::Deserialize;
use serde::Serialize;

use crate::state::DeviceState;

/// A named bundle of settings for both light channels.
///
/// Profiles are what schedules reference and what users apply as one-shot
/// "modes". They are plain records, persisted by the settings layer (the
/// daemon reads them from config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub description: String,

    pub main_power: bool,
    #[serde(default = "default_brightness")]
    pub main_brightness: u8,
    #[serde(default = "default_color_temperature")]
    pub color_temperature: u16,

    #[serde(default)]
    pub bg_power: bool,
    #[serde(default = "default_bg_brightness")]
    pub bg_brightness: u8,
    #[serde(default = "default_bg_rgb")]
    pub bg_rgb: u32,
}

fn default_brightness() -> u8 {
    80
}

fn default_color_temperature() -> u16 {
    4500
}

fn default_bg_brightness() -> u8 {
    50
}

fn default_bg_rgb() -> u32 {
    0xFF_FF_FF
}

impl Profile {
    /// Capture the current device state as a new profile.
    pub fn from_state(state: &DeviceState, id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            icon: String::new(),
            description: String::new(),
            main_power: state.main_power,
            main_brightness: state.main_brightness,
            color_temperature: state.color_temperature,
            bg_power: state.bg_power,
            bg_brightness: state.bg_brightness,
            bg_rgb: state.bg_rgb,
        }
    }

    /// Built-in profiles used when the config defines none.
    pub fn defaults() -> Vec<Profile> {
        vec![
            Profile {
                id: "work".to_string(),
                name: "Work".to_string(),
                icon: "briefcase".to_string(),
                description: "Maximum cool light for focused work".to_string(),
                main_power: true,
                main_brightness: 100,
                color_temperature: 5500,
                bg_power: false,
                bg_brightness: 0,
                bg_rgb: 0xFF_FF_FF,
            },
            Profile {
                id: "cinema".to_string(),
                name: "Cinema".to_string(),
                icon: "film".to_string(),
                description: "Low warm light with blue ambient glow".to_string(),
                main_power: true,
                main_brightness: 20,
                color_temperature: 2700,
                bg_power: true,
                bg_brightness: 30,
                bg_rgb: 0x00_66_FF,
            },
            Profile {
                id: "relax".to_string(),
                name: "Relax".to_string(),
                icon: "moon".to_string(),
                description: "Soft warm light with orange ambient".to_string(),
                main_power: true,
                main_brightness: 50,
                color_temperature: 3500,
                bg_power: true,
                bg_brightness: 20,
                bg_rgb: 0xFF_8C_00,
            },
            Profile {
                id: "sleep".to_string(),
                name: "Sleep".to_string(),
                icon: "bed".to_string(),
                description: "Very dim warm light before bed".to_string(),
                main_power: true,
                main_brightness: 30,
                color_temperature: 2700,
                bg_power: false,
                bg_brightness: 0,
                bg_rgb: 0xFF_FF_FF,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_state_captures_both_channels() {
        let state = DeviceState {
            main_power: true,
            main_brightness: 65,
            color_temperature: 3000,
            bg_power: true,
            bg_brightness: 10,
            bg_rgb: 0x00_FF_00,
            timer_minutes: Some(15),
        };
        let profile = Profile::from_state(&state, "custom", "Custom");
        assert_eq!(profile.id, "custom");
        assert!(profile.main_power);
        assert_eq!(profile.main_brightness, 65);
        assert_eq!(profile.bg_rgb, 0x00_FF_00);
    }

    #[test]
    fn test_default_profiles_have_unique_ids() {
        let defaults = Profile::defaults();
        let mut ids: Vec<_> = defaults.iter().map(|p| p.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), defaults.len());
    }
}

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use serde_json::Value;
use serde_json::json;

/// Transition effect sent with every state-changing command.
const EFFECT: &str = "smooth";

/// Transition duration in milliseconds.
const EFFECT_DURATION_MS: i64 = 500;

/// Cron job type for the power-off timer. The fixtures only implement type 0.
const CRON_POWER_OFF: i64 = 0;

/// A single request ready to be written to the wire.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: i64,
    pub method: String,
    pub params: Vec<Value>,
}

impl Command {
    /// Serialize to the wire format: one JSON object followed by `\r\n`.
    pub fn to_wire(&self) -> String {
        let object = json!({
            "id": self.id,
            "method": self.method,
            "params": self.params,
        });
        format!("{object}\r\n")
    }
}

/// Builds commands with per-instance monotonically increasing ids.
///
/// Each connection client owns its own factory so that ids never collide
/// across fixtures when one process controls several of them. Ids are never
/// reused for the lifetime of the factory.
#[derive(Debug)]
pub struct CommandFactory {
    next_id: AtomicI64,
}

impl CommandFactory {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn command(&self, method: &str, params: Vec<Value>) -> Command {
        Command {
            id: self.next_id(),
            method: method.to_string(),
            params,
        }
    }

    pub fn set_power(&self, on: bool) -> Command {
        self.command(
            "set_power",
            vec![
                json!(if on { "on" } else { "off" }),
                json!(EFFECT),
                json!(EFFECT_DURATION_MS),
            ],
        )
    }

    /// Brightness is clamped to the fixture's accepted range of [1, 100].
    pub fn set_brightness(&self, value: u8) -> Command {
        let brightness = value.clamp(1, 100);
        self.command(
            "set_bright",
            vec![json!(brightness), json!(EFFECT), json!(EFFECT_DURATION_MS)],
        )
    }

    /// Color temperature is clamped to [2700, 6500] Kelvin.
    pub fn set_color_temperature(&self, kelvin: u16) -> Command {
        let ct = kelvin.clamp(2700, 6500);
        self.command(
            "set_ct_abx",
            vec![json!(ct), json!(EFFECT), json!(EFFECT_DURATION_MS)],
        )
    }

    pub fn toggle(&self) -> Command {
        self.command("toggle", Vec::new())
    }

    pub fn bg_set_power(&self, on: bool) -> Command {
        self.command(
            "bg_set_power",
            vec![
                json!(if on { "on" } else { "off" }),
                json!(EFFECT),
                json!(EFFECT_DURATION_MS),
            ],
        )
    }

    pub fn bg_set_brightness(&self, value: u8) -> Command {
        let brightness = value.clamp(1, 100);
        self.command(
            "bg_set_bright",
            vec![json!(brightness), json!(EFFECT), json!(EFFECT_DURATION_MS)],
        )
    }

    /// RGB is a single integer in [0, 0xFFFFFF].
    pub fn bg_set_rgb(&self, rgb: u32) -> Command {
        let rgb = rgb.min(0xFF_FF_FF);
        self.command(
            "bg_set_rgb",
            vec![json!(rgb), json!(EFFECT), json!(EFFECT_DURATION_MS)],
        )
    }

    pub fn bg_toggle(&self) -> Command {
        self.command("bg_toggle", Vec::new())
    }

    /// Arm the fixture's power-off timer, in minutes.
    pub fn cron_add(&self, minutes: u32) -> Command {
        self.command("cron_add", vec![json!(CRON_POWER_OFF), json!(minutes)])
    }

    pub fn cron_del(&self) -> Command {
        self.command("cron_del", vec![json!(CRON_POWER_OFF)])
    }

    pub fn cron_get(&self) -> Command {
        self.command("cron_get", vec![json!(CRON_POWER_OFF)])
    }

    pub fn get_properties(&self, props: &[&str]) -> Command {
        self.command("get_prop", props.iter().map(|p| json!(p)).collect())
    }

    /// Persist the current state as the fixture's power-on default.
    pub fn set_default(&self) -> Command {
        self.command("set_default", Vec::new())
    }

    pub fn set_name(&self, name: &str) -> Command {
        self.command("set_name", vec![json!(name)])
    }
}

impl Default for CommandFactory {
    fn default() -> Self {
        Self::new()
    }
}

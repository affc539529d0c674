use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::net::Client;
use crate::net::ConnectionError;
use crate::profile::Profile;
use crate::protocol::CommandFactory;
use crate::protocol::props_map;
use crate::state::DeviceState;
use crate::state::rgb_from_components;

/// Notifications arriving this soon after a locally issued command are
/// assumed to be echoes of it and must not overwrite optimistic state.
const COMMAND_COOLDOWN: Duration = Duration::from_secs(2);

/// Background state refresh cadence while connected.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Properties fetched by a full state refresh, in result order.
const REFRESH_PROPS: [&str; 6] = ["power", "bright", "ct", "bg_power", "bg_bright", "bg_rgb"];

type LastCommand = Arc<Mutex<Option<Instant>>>;

/// High-level control of one fixture.
///
/// Owns the connection client and the authoritative `DeviceState`. State is
/// updated three ways, in priority order: optimistically when a local
/// command succeeds, from property-query results, and from unsolicited
/// notifications (unless they land inside the command cooldown). Observers
/// subscribe to a watch channel for the current snapshot.
pub struct Controller {
    client: Client,
    factory: Arc<CommandFactory>,
    state: Arc<watch::Sender<DeviceState>>,
    last_command: LastCommand,
    device: Mutex<Option<Device>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let client = Client::new(notify_tx);

        let (state_tx, _) = watch::channel(DeviceState::default());
        let state = Arc::new(state_tx);
        let last_command: LastCommand = Arc::new(Mutex::new(None));

        tokio::spawn(run_notifications(
            notify_rx,
            state.clone(),
            last_command.clone(),
        ));

        Self {
            client,
            factory: Arc::new(CommandFactory::new()),
            state,
            last_command,
            device: Mutex::new(None),
            poll_task: Mutex::new(None),
        }
    }

    /// Connect to a fixture, fetch its current state, and start the
    /// background refresh poll.
    pub async fn connect(&self, device: Device) -> Result<(), ConnectionError> {
        self.client.connect(&device).await?;
        info!(name = %device.name, addr = %device.endpoint(), "connected to device");
        if let Ok(mut current) = self.device.lock() {
            *current = Some(device);
        }

        refresh_state(&self.client, &self.factory, &self.state, &self.last_command).await?;
        self.start_polling();
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.stop_polling();
        self.client.disconnect().await;
        if let Ok(mut current) = self.device.lock() {
            *current = None;
        }
        self.state.send_replace(DeviceState::default());
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn device(&self) -> Option<Device> {
        self.device.lock().ok().and_then(|d| d.clone())
    }

    /// Observe state snapshots. The receiver always sees the latest value.
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    // Primary channel.

    pub async fn set_power(&self, on: bool) -> Result<(), ConnectionError> {
        self.mark_command();
        self.client.send(self.factory.set_power(on)).await?;
        self.state.send_modify(|s| s.main_power = on);
        Ok(())
    }

    pub async fn set_brightness(&self, value: u8) -> Result<(), ConnectionError> {
        self.mark_command();
        let value = value.clamp(1, 100);
        self.client.send(self.factory.set_brightness(value)).await?;
        self.state.send_modify(|s| s.main_brightness = value);
        Ok(())
    }

    pub async fn set_color_temperature(&self, kelvin: u16) -> Result<(), ConnectionError> {
        self.mark_command();
        let kelvin = kelvin.clamp(2700, 6500);
        self.client
            .send(self.factory.set_color_temperature(kelvin))
            .await?;
        self.state.send_modify(|s| s.color_temperature = kelvin);
        Ok(())
    }

    pub async fn toggle(&self) -> Result<(), ConnectionError> {
        self.mark_command();
        self.client.send(self.factory.toggle()).await?;
        self.state.send_modify(|s| s.main_power = !s.main_power);
        Ok(())
    }

    // Ambient channel.

    pub async fn set_bg_power(&self, on: bool) -> Result<(), ConnectionError> {
        self.mark_command();
        self.client.send(self.factory.bg_set_power(on)).await?;
        self.state.send_modify(|s| s.bg_power = on);
        Ok(())
    }

    pub async fn set_bg_brightness(&self, value: u8) -> Result<(), ConnectionError> {
        self.mark_command();
        let value = value.clamp(1, 100);
        self.client
            .send(self.factory.bg_set_brightness(value))
            .await?;
        self.state.send_modify(|s| s.bg_brightness = value);
        Ok(())
    }

    pub async fn set_bg_rgb(&self, rgb: u32) -> Result<(), ConnectionError> {
        self.mark_command();
        let rgb = rgb.min(0xFF_FF_FF);
        self.client.send(self.factory.bg_set_rgb(rgb)).await?;
        self.state.send_modify(|s| s.bg_rgb = rgb);
        Ok(())
    }

    pub async fn set_bg_color(&self, red: u8, green: u8, blue: u8) -> Result<(), ConnectionError> {
        self.set_bg_rgb(rgb_from_components(red, green, blue)).await
    }

    pub async fn toggle_bg(&self) -> Result<(), ConnectionError> {
        self.mark_command();
        self.client.send(self.factory.bg_toggle()).await?;
        self.state.send_modify(|s| s.bg_power = !s.bg_power);
        Ok(())
    }

    // Power-off timer.

    pub async fn set_sleep_timer(&self, minutes: u32) -> Result<(), ConnectionError> {
        self.mark_command();
        self.client.send(self.factory.cron_add(minutes)).await?;
        self.state.send_modify(|s| s.timer_minutes = Some(minutes));
        Ok(())
    }

    pub async fn cancel_sleep_timer(&self) -> Result<(), ConnectionError> {
        self.mark_command();
        self.client.send(self.factory.cron_del()).await?;
        self.state.send_modify(|s| s.timer_minutes = None);
        Ok(())
    }

    /// Query the fixture for the actual remaining timer minutes.
    pub async fn refresh_sleep_timer(&self) -> Result<(), ConnectionError> {
        let reply = self.client.send(self.factory.cron_get()).await?;
        let minutes = reply
            .first()
            .and_then(|entry| entry.get("delay"))
            .and_then(Value::as_u64)
            .map(|m| m as u32);
        self.state.send_modify(|s| s.timer_minutes = minutes);
        Ok(())
    }

    // Utilities.

    /// Persist the current state as the fixture's power-on default.
    pub async fn save_default(&self) -> Result<(), ConnectionError> {
        self.client.send(self.factory.set_default()).await?;
        Ok(())
    }

    /// Rename the fixture, on the device and in our record of it.
    pub async fn rename(&self, name: &str) -> Result<(), ConnectionError> {
        self.client.send(self.factory.set_name(name)).await?;
        if let Ok(mut current) = self.device.lock() {
            if let Some(device) = current.as_mut() {
                device.name = name.to_string();
            }
        }
        Ok(())
    }

    /// Re-query the fixture's full state.
    ///
    /// Skipped silently inside the command cooldown: state is already
    /// optimistically current, and asking again would race the echo.
    pub async fn refresh(&self) -> Result<(), ConnectionError> {
        refresh_state(&self.client, &self.factory, &self.state, &self.last_command).await
    }

    /// Apply a profile to both channels, as the sequence of individual
    /// commands the fixture understands.
    pub async fn apply_profile(&self, profile: &Profile) -> Result<(), ConnectionError> {
        info!(profile = %profile.id, "applying profile");
        if profile.main_power {
            self.set_power(true).await?;
            self.set_brightness(profile.main_brightness).await?;
            self.set_color_temperature(profile.color_temperature).await?;
        } else {
            self.set_power(false).await?;
        }

        if profile.bg_power {
            self.set_bg_power(true).await?;
            self.set_bg_brightness(profile.bg_brightness).await?;
            self.set_bg_rgb(profile.bg_rgb).await?;
        } else {
            self.set_bg_power(false).await?;
        }
        Ok(())
    }

    fn mark_command(&self) {
        if let Ok(mut stamp) = self.last_command.lock() {
            *stamp = Some(Instant::now());
        }
    }

    fn start_polling(&self) {
        self.stop_polling();

        let client = self.client.clone();
        let factory = self.factory.clone();
        let state = self.state.clone();
        let last_command = self.last_command.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                if !client.is_connected() {
                    break;
                }
                if let Err(e) = refresh_state(&client, &factory, &state, &last_command).await {
                    // A single failed background refresh is not fatal; only
                    // stop once the connection itself is gone.
                    warn!("background state refresh failed: {e}");
                    if !client.is_connected() {
                        break;
                    }
                }
            }
            debug!("state poll loop stopped");
        });

        if let Ok(mut poll) = self.poll_task.lock() {
            *poll = Some(task);
        }
    }

    fn stop_polling(&self) {
        if let Ok(mut poll) = self.poll_task.lock() {
            if let Some(task) = poll.take() {
                task.abort();
            }
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

fn within_cooldown(last_command: &LastCommand) -> bool {
    last_command
        .lock()
        .ok()
        .and_then(|stamp| *stamp)
        .is_some_and(|at| at.elapsed() < COMMAND_COOLDOWN)
}

async fn refresh_state(
    client: &Client,
    factory: &CommandFactory,
    state: &watch::Sender<DeviceState>,
    last_command: &LastCommand,
) -> Result<(), ConnectionError> {
    if within_cooldown(last_command) {
        return Ok(());
    }
    let reply = client.send(factory.get_properties(&REFRESH_PROPS)).await?;
    let props = props_map(&REFRESH_PROPS, &reply);
    state.send_modify(|s| s.apply_properties(&props));
    Ok(())
}

/// Apply notifications to device state, unless they arrive within the
/// cooldown after a local command, in which case the optimistic local value
/// wins and the echo is dropped.
async fn run_notifications(
    mut notifications: mpsc::UnboundedReceiver<crate::protocol::Notification>,
    state: Arc<watch::Sender<DeviceState>>,
    last_command: LastCommand,
) {
    while let Some(notification) = notifications.recv().await {
        if within_cooldown(&last_command) {
            debug!(
                method = %notification.method,
                "suppressing notification within command cooldown"
            );
            continue;
        }
        state.send_modify(|s| s.apply_properties(&notification.params));
    }
}

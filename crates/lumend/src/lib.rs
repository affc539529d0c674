pub mod api;
pub mod config;
pub mod controller;
pub mod device;
pub mod net;
pub mod profile;
pub mod protocol;
pub mod schedule;
pub mod state;

pub use config::Config;
pub use config::LogLevel;
pub use controller::Controller;
pub use device::Device;
pub use net::Client;
pub use net::ConnectionError;
pub use profile::Profile;
pub use schedule::ScheduleEngine;
pub use schedule::ScheduleRule;
pub use state::DeviceState;

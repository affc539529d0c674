//! Time-window automation: rules that pick a profile by wall-clock time and
//! the engine that evaluates them once per minute.

mod engine;
mod rule;

pub use engine::ScheduleEngine;
pub use engine::ScheduleEvent;
pub use rule::ScheduleRule;
pub use rule::Weekday;
pub use rule::all_days;

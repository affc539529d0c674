//! Wire protocol for line-delimited JSON fixture control.
//!
//! Each request, result, and notification is a single JSON object terminated
//! by `\r\n`. Requests carry a client-assigned monotonically increasing id;
//! results are correlated back by that id. Notifications carry a method name
//! and a changed-property map instead of an id.

pub mod command;
pub mod response;

pub use command::Command;
pub use command::CommandFactory;
pub use response::DeviceError;
pub use response::Notification;
pub use response::Reply;
pub use response::Response;
pub use response::props_map;

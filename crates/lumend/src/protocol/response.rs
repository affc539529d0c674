use serde_json::Map;
use serde_json::Value;

/// A decoded protocol line.
#[derive(Debug, Clone)]
pub enum Response {
    /// A result correlated to a request by id.
    Reply(Reply),
    /// An unsolicited state-change notification.
    Notification(Notification),
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub id: i64,
    pub outcome: Result<Vec<Value>, DeviceError>,
}

/// Error payload returned by the fixture for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device error {code}: {message}")]
pub struct DeviceError {
    pub code: i64,
    pub message: String,
}

/// An unsolicited property-change report from the fixture.
///
/// Notifications share no id space with command replies; the changed
/// properties are applied to device state directly.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Map<String, Value>,
}

impl Response {
    /// Decode one wire line.
    ///
    /// Returns `None` for anything that is not a recognizable protocol
    /// object: non-JSON, or JSON carrying neither a method nor an id. A
    /// single corrupt line must never terminate the session, so callers drop
    /// `None` and keep reading.
    pub fn parse(line: &str) -> Option<Response> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let object = value.as_object()?;

        if let Some(method) = object.get("method").and_then(Value::as_str) {
            let params = object
                .get("params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            return Some(Response::Notification(Notification {
                method: method.to_string(),
                params,
            }));
        }

        let id = object.get("id").and_then(Value::as_i64)?;

        if let Some(error) = object.get("error").and_then(Value::as_object) {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Some(Response::Reply(Reply {
                id,
                outcome: Err(DeviceError { code, message }),
            }));
        }

        let result = object
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Some(Response::Reply(Reply {
            id,
            outcome: Ok(result),
        }))
    }
}

/// Pair a `get_prop` result list with the property names that were requested.
///
/// The fixture returns values positionally, in request order. Extra requested
/// names past the end of the result are left out.
pub fn props_map(names: &[&str], values: &[Value]) -> Map<String, Value> {
    names
        .iter()
        .zip(values.iter())
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

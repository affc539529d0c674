use serde::Deserialize;
use serde::Serialize;

/// Default control port for LAN fixtures.
pub const DEFAULT_PORT: u16 = 55443;

/// A controllable light fixture on the local network.
///
/// Created from a discovery advertisement or a manual probe. Two devices are
/// the same fixture when their ids match, regardless of address; the address
/// and name are refreshed when a fixture reappears on a new lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier reported by the fixture itself.
    pub id: String,
    pub model: String,
    pub ip_address: String,
    pub port: u16,
    pub name: String,
    pub firmware_version: String,
    pub supported_methods: Vec<String>,
}

impl Device {
    /// A device known only by address, e.g. a manual entry before probing.
    pub fn manual(ip_address: &str, port: u16) -> Self {
        Self {
            id: format!("manual_{ip_address}"),
            model: "unknown".to_string(),
            ip_address: ip_address.to_string(),
            port,
            name: "Light".to_string(),
            firmware_version: String::new(),
            supported_methods: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }

    pub fn supports(&self, method: &str) -> bool {
        self.supported_methods.iter().any(|m| m == method)
    }

    /// Parse a discovery response block.
    ///
    /// The block is a set of `\r\n`-separated `Key: value` headers. A
    /// response without a usable `id` or without a parsable address in
    /// `location` yields `None` and is discarded by the caller.
    pub fn from_discovery_response(response: &str) -> Option<Device> {
        let mut id = String::new();
        let mut model = String::new();
        let mut ip_address = String::new();
        let mut port = DEFAULT_PORT;
        let mut name = "Light".to_string();
        let mut firmware_version = String::new();
        let mut supported_methods = Vec::new();

        for line in response.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "id" => id = value.to_string(),
                "model" => model = value.to_string(),
                "location" => {
                    // e.g. yeelight://192.168.1.50:55443
                    let Some((_, address)) = value.split_once("//") else {
                        continue;
                    };
                    match address.rsplit_once(':') {
                        Some((host, p)) => {
                            ip_address = host.to_string();
                            port = p.parse().unwrap_or(DEFAULT_PORT);
                        }
                        None => ip_address = address.to_string(),
                    }
                }
                "name" => {
                    if !value.is_empty() {
                        name = value.to_string();
                    }
                }
                "fw_ver" => firmware_version = value.to_string(),
                "support" => {
                    supported_methods = value.split_whitespace().map(str::to_string).collect();
                }
                _ => {}
            }
        }

        if id.is_empty() || ip_address.is_empty() {
            return None;
        }

        Some(Device {
            id,
            model,
            ip_address,
            port,
            name,
            firmware_version,
            supported_methods,
        })
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::net::UdpSocket;
use std::time::Duration;
use std::time::Instant;

use socket2::Domain;
use socket2::Protocol;
use socket2::SockAddr;
use socket2::Socket;
use socket2::Type;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use super::connection::Client;
use super::connection::ConnectionError;
use crate::device::Device;
use crate::protocol::CommandFactory;

/// SSDP-style discovery group the fixtures listen on.
const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const MULTICAST_PORT: u16 = 1982;

const SEARCH_MESSAGE: &str = "M-SEARCH * HTTP/1.1\r\n\
    HOST: 239.255.255.250:1982\r\n\
    MAN: \"ssdp:discover\"\r\n\
    ST: wifi_bulb\r\n\r\n";

/// Receive in short slices so the overall deadline is checked regularly.
const RECV_SLICE: Duration = Duration::from_millis(500);

const RESPONSE_BUFFER: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to create discovery socket: {0}")]
    Socket(#[source] std::io::Error),

    #[error("failed to bind discovery socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to join multicast group: {0}")]
    MulticastJoin(#[source] std::io::Error),

    #[error("failed to send search message: {0}")]
    Send(#[source] std::io::Error),

    #[error("failed to receive search responses: {0}")]
    Receive(#[source] std::io::Error),

    #[error("probe failed: {0}")]
    Probe(#[source] ConnectionError),

    #[error("discovery task was cancelled")]
    Cancelled,
}

/// Search the local network for fixtures.
///
/// One search datagram is sent to the discovery group, then responses are
/// collected until `timeout` elapses. Results are deduplicated by fixture
/// id: the same fixture answering twice (or via both unicast and multicast)
/// yields one entry. Socket I/O is blocking-with-timeout by design, so the
/// whole search runs on the blocking pool.
pub async fn search(timeout: Duration) -> Result<Vec<Device>, DiscoveryError> {
    tokio::task::spawn_blocking(move || search_blocking(timeout))
        .await
        .map_err(|_| DiscoveryError::Cancelled)?
}

/// Background variant of `search`: a short sweep where failure means an
/// empty result rather than an error.
pub async fn quick_scan() -> Vec<Device> {
    match search(Duration::from_secs(3)).await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("quick scan failed: {e}");
            Vec::new()
        }
    }
}

fn search_blocking(timeout: Duration) -> Result<Vec<Device>, DiscoveryError> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(DiscoveryError::Socket)?;
    socket
        .set_reuse_address(true)
        .map_err(DiscoveryError::Socket)?;
    socket
        .bind(&SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            MULTICAST_PORT,
        )))
        .map_err(DiscoveryError::Bind)?;
    socket
        .join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED)
        .map_err(DiscoveryError::MulticastJoin)?;
    socket
        .set_multicast_ttl_v4(2)
        .map_err(DiscoveryError::Socket)?;
    socket
        .set_read_timeout(Some(RECV_SLICE.min(timeout)))
        .map_err(DiscoveryError::Socket)?;

    let socket: UdpSocket = socket.into();
    let result = run_search(&socket, timeout);

    // Group membership must not leak, whatever happened above; the socket
    // itself closes on drop.
    if let Err(e) = socket.leave_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED) {
        debug!("failed to leave multicast group: {e}");
    }

    result
}

fn run_search(socket: &UdpSocket, timeout: Duration) -> Result<Vec<Device>, DiscoveryError> {
    socket
        .send_to(
            SEARCH_MESSAGE.as_bytes(),
            SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT),
        )
        .map_err(DiscoveryError::Send)?;

    let deadline = Instant::now() + timeout;
    let mut found: HashMap<String, Device> = HashMap::new();
    let mut buffer = [0u8; RESPONSE_BUFFER];

    while Instant::now() < deadline {
        match socket.recv_from(&mut buffer) {
            Ok((len, _)) => {
                if let Ok(text) = std::str::from_utf8(&buffer[..len]) {
                    collect_response(&mut found, text);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(DiscoveryError::Receive(e)),
        }
    }

    Ok(found.into_values().collect())
}

/// Parse one response block into the result set, deduplicating by id.
/// A later advertisement for a known id wins, picking up address changes.
fn collect_response(found: &mut HashMap<String, Device>, response: &str) {
    match Device::from_discovery_response(response) {
        Some(device) => {
            debug!(id = %device.id, addr = %device.endpoint(), "discovery response");
            found.insert(device.id.clone(), device);
        }
        None => debug!("discarding unusable discovery response"),
    }
}

/// Probe a single address directly, bypassing multicast.
///
/// Opens a short-lived session, queries identifying properties, and
/// synthesizes a `Device` from the answers. The session is closed before
/// returning, success or failure.
pub async fn probe(ip_address: &str, port: u16) -> Result<Device, DiscoveryError> {
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let client = Client::new(notify_tx);

    let result = probe_with(&client, ip_address, port).await;
    client.disconnect().await;
    result
}

async fn probe_with(client: &Client, ip_address: &str, port: u16) -> Result<Device, DiscoveryError> {
    let target = Device::manual(ip_address, port);
    client.connect(&target).await.map_err(DiscoveryError::Probe)?;

    let factory = CommandFactory::new();
    let reply = client
        .send(factory.get_properties(&["model", "name", "fw_ver"]))
        .await
        .map_err(DiscoveryError::Probe)?;

    let field = |index: usize| {
        reply
            .get(index)
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let model = field(0);
    let name = field(1);
    let firmware_version = field(2);

    Ok(Device {
        id: format!("yeelight_{}", ip_address.replace('.', "_")),
        model: if model.is_empty() {
            "unknown".to_string()
        } else {
            model
        },
        ip_address: ip_address.to_string(),
        port,
        name: if name.is_empty() {
            format!("Light ({ip_address})")
        } else {
            name
        },
        firmware_version,
        supported_methods: Vec::new(),
    })
}

/// Check whether a known device still answers at its recorded address.
pub async fn verify(device: &Device) -> bool {
    let (notify_tx, _notify_rx) = mpsc::unbounded_channel();
    let client = Client::new(notify_tx);
    let reachable = client.connect(device).await.is_ok();
    client.disconnect().await;
    reachable
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::ratelimit::RateLimiter;
use crate::device::Device;
use crate::protocol::Command;
use crate::protocol::Notification;
use crate::protocol::Response;

/// How long a request may stay unresolved before it fails with `Timeout`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive chunk size; protocol lines are far smaller than this.
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected to a device")]
    NotConnected,

    #[error("connection to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection lost")]
    ConnectionLost,

    #[error("transport write failed: {0}")]
    Transport(#[source] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Device(#[from] crate::protocol::DeviceError),

    #[error("client task stopped")]
    Closed,
}

type ReplyPayload = Result<Vec<serde_json::Value>, ConnectionError>;

enum Control {
    Connect {
        device: Device,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Send {
        command: Command,
        reply: oneshot::Sender<ReplyPayload>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Events produced by the per-session reader and timeout tasks.
///
/// Every event carries the epoch of the session it belongs to; events from a
/// torn-down session are discarded so nothing bleeds across reconnects.
enum SessionEvent {
    Line {
        epoch: u64,
        line: String,
    },
    Closed {
        epoch: u64,
    },
    Timeout {
        epoch: u64,
        id: i64,
    },
    WriteFailed {
        epoch: u64,
        id: i64,
        error: std::io::Error,
    },
}

/// Handle to one fixture's TCP session.
///
/// All mutable session state (socket halves, pending request table, receive
/// buffer) is owned by a single background task; this handle only talks to
/// it over a command channel, so every mutation is serialized through one
/// logical owner. One client manages exactly one fixture at a time;
/// controlling several fixtures means several independent clients.
#[derive(Debug, Clone)]
pub struct Client {
    control_tx: mpsc::UnboundedSender<Control>,
    state_rx: watch::Receiver<ConnectionState>,
    limiter: Arc<RateLimiter>,
    send_gate: Arc<Mutex<()>>,
}

impl Client {
    /// Spawn the owning task. Notifications decoded from the wire are
    /// forwarded to `notifications`; if the receiver is dropped they are
    /// discarded.
    pub fn new(notifications: mpsc::UnboundedSender<Notification>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = ClientActor {
            control_rx,
            event_tx,
            event_rx,
            notify_tx: notifications,
            state_tx,
            session: None,
            epoch: 0,
        };
        tokio::spawn(actor.run());

        Self {
            control_tx,
            state_rx,
            limiter: Arc::new(RateLimiter::default()),
            send_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open a session to the device, tearing down any prior one first.
    ///
    /// Pending requests from the old session are failed synchronously before
    /// the new dial begins. Resolves once the transport is ready, or with a
    /// typed error on transport failure.
    pub async fn connect(&self, device: &Device) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Connect {
                device: device.clone(),
                reply: tx,
            })
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Send a request and await its result payload.
    ///
    /// Waits for rate-limiter admission first, so requests reach the wire in
    /// admission order. Exactly one of three outcomes resolves the call: a
    /// matching result, connection teardown, or the 10 second timeout.
    pub async fn send(&self, command: Command) -> Result<Vec<serde_json::Value>, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        {
            // Admission and enqueueing happen under one gate. The gate is
            // fair, so callers enqueue in exactly the order the limiter
            // admitted them; it is released before awaiting the reply, so
            // requests still overlap on the wire.
            let _gate = self.send_gate.lock().await;
            self.limiter.admit().await;
            self.control_tx
                .send(Control::Send { command, reply: tx })
                .map_err(|_| ConnectionError::Closed)?;
        }
        rx.await.map_err(|_| ConnectionError::ConnectionLost)?
    }

    /// Tear down the session. Every still-pending request is resolved with
    /// `ConnectionLost` before this returns.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .control_tx
            .send(Control::Disconnect { reply: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct Session {
    /// Outgoing lines, drained by the writer task. The owning task never
    /// performs transport I/O itself, so a stalled peer cannot wedge it.
    write_tx: mpsc::UnboundedSender<(i64, String)>,
    pending: HashMap<i64, oneshot::Sender<ReplyPayload>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ClientActor {
    control_rx: mpsc::UnboundedReceiver<Control>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    state_tx: watch::Sender<ConnectionState>,
    session: Option<Session>,
    epoch: u64,
}

impl ClientActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(control) => self.handle_control(control).await,
                    // All handles dropped: tear down and exit.
                    None => break,
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }
        self.teardown(ConnectionState::Disconnected);
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Connect { device, reply } => {
                self.teardown(ConnectionState::Connecting);

                let addr = device.endpoint();
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        let (read_half, write_half) = stream.into_split();
                        self.epoch += 1;
                        let reader =
                            tokio::spawn(run_reader(read_half, self.event_tx.clone(), self.epoch));
                        let (write_tx, write_rx) = mpsc::unbounded_channel();
                        let writer = tokio::spawn(run_writer(
                            write_half,
                            write_rx,
                            self.event_tx.clone(),
                            self.epoch,
                        ));
                        self.session = Some(Session {
                            write_tx,
                            pending: HashMap::new(),
                            reader,
                            writer,
                        });
                        let _ = self.state_tx.send(ConnectionState::Connected);
                        debug!(%addr, "connected");
                        let _ = reply.send(Ok(()));
                    }
                    Err(source) => {
                        let _ = self.state_tx.send(ConnectionState::Failed);
                        let _ = reply.send(Err(ConnectionError::ConnectFailed { addr, source }));
                    }
                }
            }
            Control::Send { command, reply } => self.handle_send(command, reply),
            Control::Disconnect { reply } => {
                self.teardown(ConnectionState::Disconnected);
                let _ = reply.send(());
            }
        }
    }

    fn handle_send(&mut self, command: Command, reply: oneshot::Sender<ReplyPayload>) {
        let Some(session) = self.session.as_mut() else {
            let _ = reply.send(Err(ConnectionError::NotConnected));
            return;
        };

        let id = command.id;
        session.pending.insert(id, reply);

        if session.write_tx.send((id, command.to_wire())).is_err() {
            // Writer already exited; its failure event will tear the
            // session down, but this request was never queued.
            if let Some(tx) = session.pending.remove(&id) {
                let _ = tx.send(Err(ConnectionError::ConnectionLost));
            }
            return;
        }

        // The timeout clock starts at queueing, so it also covers a write
        // the peer never drains.
        let event_tx = self.event_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(REQUEST_TIMEOUT).await;
            let _ = event_tx.send(SessionEvent::Timeout { epoch, id });
        });
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Line { epoch, line } => {
                if epoch == self.epoch {
                    self.handle_line(&line);
                }
            }
            SessionEvent::Closed { epoch } => {
                if epoch == self.epoch && self.session.is_some() {
                    warn!("connection closed by peer");
                    self.teardown(ConnectionState::Disconnected);
                }
            }
            SessionEvent::Timeout { epoch, id } => {
                if epoch != self.epoch {
                    return;
                }
                // Removal is the atomic resolution point: if the result beat
                // us here the entry is already gone and this is a no-op.
                if let Some(session) = self.session.as_mut() {
                    if let Some(tx) = session.pending.remove(&id) {
                        debug!(id, "request timed out");
                        let _ = tx.send(Err(ConnectionError::Timeout));
                    }
                }
            }
            SessionEvent::WriteFailed { epoch, id, error } => {
                if epoch != self.epoch {
                    return;
                }
                warn!(id, "transport write failed: {error}");
                if let Some(session) = self.session.as_mut() {
                    if let Some(tx) = session.pending.remove(&id) {
                        let _ = tx.send(Err(ConnectionError::Transport(error)));
                    }
                }
                // The transport is broken; everything else pending fails too.
                self.teardown(ConnectionState::Disconnected);
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(response) = Response::parse(line) else {
            debug!(line, "dropping malformed protocol line");
            return;
        };

        match response {
            // Notifications never consult the pending table; replies and
            // notifications share no id space.
            Response::Notification(notification) => {
                let _ = self.notify_tx.send(notification);
            }
            Response::Reply(reply) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                match session.pending.remove(&reply.id) {
                    Some(tx) => {
                        let _ = tx.send(reply.outcome.map_err(ConnectionError::from));
                    }
                    // Arrived after its own timeout or for an id we never
                    // issued; dropped silently per protocol.
                    None => debug!(id = reply.id, "result for unknown id"),
                }
            }
        }
    }

    /// Drop the session, failing every pending request exactly once.
    fn teardown(&mut self, next: ConnectionState) {
        if let Some(mut session) = self.session.take() {
            session.reader.abort();
            session.writer.abort();
            for (_, tx) in session.pending.drain() {
                let _ = tx.send(Err(ConnectionError::ConnectionLost));
            }
        }
        let _ = self.state_tx.send(next);
    }
}

/// Per-session write loop. Keeping transport writes off the owning task
/// means a peer that stops reading stalls only this task; the owner stays
/// responsive and teardown aborts the stalled write.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<(i64, String)>,
    events: mpsc::UnboundedSender<SessionEvent>,
    epoch: u64,
) {
    while let Some((id, line)) = outgoing.recv().await {
        if let Err(error) = write_half.write_all(line.as_bytes()).await {
            let _ = events.send(SessionEvent::WriteFailed { epoch, id, error });
            return;
        }
    }
}

/// Per-session receive loop: accumulate bytes, extract `\r\n`-terminated
/// lines, and hand them to the owning task. Exits on EOF, transport error,
/// or abort; the buffer dies with the task, so reconnects start clean.
async fn run_reader(
    mut read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<SessionEvent>,
    epoch: u64,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match read_half.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                while let Some(end) = buffer.windows(2).position(|w| w == b"\r\n") {
                    let raw: Vec<u8> = buffer.drain(..end + 2).collect();
                    match std::str::from_utf8(&raw[..end]) {
                        Ok(line) => {
                            let line = line.to_string();
                            if events.send(SessionEvent::Line { epoch, line }).is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!("dropping non-utf8 protocol line"),
                    }
                }
            }
        }
    }
    let _ = events.send(SessionEvent::Closed { epoch });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;
    use crate::protocol::CommandFactory;

    /// Accept one connection and run `serve` over its line stream.
    async fn spawn_server<F, Fut>(serve: F) -> SocketAddr
    where
        F: FnOnce(tokio::io::Lines<BufReader<OwnedReadHalf>>, tokio::net::tcp::OwnedWriteHalf) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            serve(BufReader::new(read_half).lines(), write_half).await;
        });
        addr
    }

    fn device_at(addr: SocketAddr) -> Device {
        Device::manual(&addr.ip().to_string(), addr.port())
    }

    fn request_id(line: &str) -> i64 {
        serde_json::from_str::<Value>(line).unwrap()["id"]
            .as_i64()
            .unwrap()
    }

    fn client() -> (Client, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Client::new(tx), rx)
    }

    #[tokio::test]
    async fn test_results_correlate_by_id_out_of_order() {
        let addr = spawn_server(|mut lines, mut writer| async move {
            let first = request_id(&lines.next_line().await.unwrap().unwrap());
            let second = request_id(&lines.next_line().await.unwrap().unwrap());
            // Reply in reverse order; correlation is by id, not arrival.
            let reply = format!(
                "{}\r\n{}\r\n",
                json!({"id": second, "result": ["second"]}),
                json!({"id": first, "result": ["first"]}),
            );
            writer.write_all(reply.as_bytes()).await.unwrap();
        })
        .await;

        let (client, _notifications) = client();
        client.connect(&device_at(addr)).await.unwrap();

        let factory = CommandFactory::new();
        let (a, b) = tokio::join!(
            client.send(factory.toggle()),
            client.send(factory.bg_toggle())
        );
        assert_eq!(a.unwrap(), vec![Value::from("first")]);
        assert_eq!(b.unwrap(), vec![Value::from("second")]);
    }

    #[tokio::test]
    async fn test_device_error_surfaces_as_typed_failure() {
        let addr = spawn_server(|mut lines, mut writer| async move {
            let id = request_id(&lines.next_line().await.unwrap().unwrap());
            let reply = format!(
                "{}\r\n",
                json!({"id": id, "error": {"code": -1, "message": "method not supported"}})
            );
            writer.write_all(reply.as_bytes()).await.unwrap();
        })
        .await;

        let (client, _notifications) = client();
        client.connect(&device_at(addr)).await.unwrap();

        let err = client
            .send(CommandFactory::new().toggle())
            .await
            .unwrap_err();
        match err {
            ConnectionError::Device(e) => {
                assert_eq!(e.code, -1);
                assert_eq!(e.message, "method not supported");
            }
            other => panic!("expected device error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_id_lines_are_recovered() {
        let addr = spawn_server(|mut lines, mut writer| async move {
            let id = request_id(&lines.next_line().await.unwrap().unwrap());
            let reply = format!(
                "garbage not json\r\n{}\r\n{}\r\n",
                json!({"id": 9999, "result": ["stale"]}),
                json!({"id": id, "result": ["ok"]}),
            );
            writer.write_all(reply.as_bytes()).await.unwrap();
            // Stay connected so the client's liveness can be checked.
            std::future::pending::<()>().await;
        })
        .await;

        let (client, _notifications) = client();
        client.connect(&device_at(addr)).await.unwrap();

        let result = client.send(CommandFactory::new().toggle()).await.unwrap();
        assert_eq!(result, vec![Value::from("ok")]);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded_not_correlated() {
        let addr = spawn_server(|mut lines, mut writer| async move {
            let notification = format!(
                "{}\r\n",
                json!({"method": "props", "params": {"power": "off"}})
            );
            writer.write_all(notification.as_bytes()).await.unwrap();

            let id = request_id(&lines.next_line().await.unwrap().unwrap());
            let reply = format!("{}\r\n", json!({"id": id, "result": ["ok"]}));
            writer.write_all(reply.as_bytes()).await.unwrap();
        })
        .await;

        let (client, mut notifications) = client();
        client.connect(&device_at(addr)).await.unwrap();
        client.send(CommandFactory::new().toggle()).await.unwrap();

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.method, "props");
        assert_eq!(
            notification.params.get("power"),
            Some(&Value::from("off"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let addr = spawn_server(|mut lines, writer| async move {
            // Hold the write half open and swallow the request without
            // replying.
            let _writer = writer;
            let _ = lines.next_line().await;
            std::future::pending::<()>().await;
        })
        .await;

        let (client, _notifications) = client();
        client.connect(&device_at(addr)).await.unwrap();

        let err = client
            .send(CommandFactory::new().toggle())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout));
    }

    #[tokio::test]
    async fn test_disconnect_fails_all_outstanding_requests() {
        let addr = spawn_server(|mut lines, writer| async move {
            let _writer = writer;
            while let Ok(Some(_)) = lines.next_line().await {}
        })
        .await;

        let (client, _notifications) = client();
        client.connect(&device_at(addr)).await.unwrap();

        let factory = CommandFactory::new();
        let mut outstanding = Vec::new();
        for _ in 0..3 {
            let client = client.clone();
            let command = factory.toggle();
            outstanding.push(tokio::spawn(async move { client.send(command).await }));
        }
        // Let the sends reach the session before tearing it down.
        tokio::time::sleep(Duration::from_millis(100)).await;

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        for task in outstanding {
            let result = task.await.unwrap();
            assert!(matches!(result, Err(ConnectionError::ConnectionLost)));
        }
    }

    #[tokio::test]
    async fn test_disconnect_preempts_a_stalled_transport_write() {
        // A peer that accepts the connection but never drains its socket.
        let addr = spawn_server(|_lines, writer| async move {
            let _writer = writer;
            std::future::pending::<()>().await;
        })
        .await;

        let (client, _notifications) = client();
        client.connect(&device_at(addr)).await.unwrap();

        // Large enough to overrun the socket buffers and suspend the write.
        let factory = CommandFactory::new();
        let stalled = {
            let client = client.clone();
            let command = factory.set_name(&"x".repeat(8 * 1024 * 1024));
            tokio::spawn(async move { client.send(command).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(3), client.disconnect())
            .await
            .expect("disconnect must not wait on a stalled write");
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            stalled.await.unwrap(),
            Err(ConnectionError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_requests_reach_the_wire_in_send_order() {
        let seen: Arc<std::sync::Mutex<Vec<i64>>> = Arc::default();
        let server_seen = seen.clone();
        let addr = spawn_server(move |mut lines, mut writer| async move {
            for _ in 0..3 {
                let line = lines.next_line().await.unwrap().unwrap();
                let id = request_id(&line);
                server_seen.lock().unwrap().push(id);
                let reply = format!("{}\r\n", json!({"id": id, "result": ["ok"]}));
                writer.write_all(reply.as_bytes()).await.unwrap();
            }
            std::future::pending::<()>().await;
        })
        .await;

        let (client, _notifications) = client();
        client.connect(&device_at(addr)).await.unwrap();

        let factory = CommandFactory::new();
        let (a, b, c) = (factory.toggle(), factory.bg_toggle(), factory.toggle());
        let issued = vec![a.id, b.id, c.id];
        let (ra, rb, rc) = tokio::join!(client.send(a), client.send(b), client.send(c));
        ra.unwrap();
        rb.unwrap();
        rc.unwrap();

        assert_eq!(*seen.lock().unwrap(), issued);
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let (client, _notifications) = client();
        let err = client
            .send(CommandFactory::new().toggle())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_failure_is_typed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (client, _notifications) = client();
        let err = client.connect(&device_at(addr)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectFailed { .. }));
        assert_eq!(client.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_reconnect_starts_a_clean_session() {
        let first = spawn_server(|mut lines, writer| async move {
            let _writer = writer;
            while let Ok(Some(_)) = lines.next_line().await {}
        })
        .await;
        let second = spawn_server(|mut lines, mut writer| async move {
            let id = request_id(&lines.next_line().await.unwrap().unwrap());
            let reply = format!("{}\r\n", json!({"id": id, "result": ["fresh"]}));
            writer.write_all(reply.as_bytes()).await.unwrap();
        })
        .await;

        let (client, _notifications) = client();
        client.connect(&device_at(first)).await.unwrap();

        let factory = CommandFactory::new();
        let stale = {
            let client = client.clone();
            let command = factory.toggle();
            tokio::spawn(async move { client.send(command).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Reconnect implies disconnect: the stale request fails first.
        client.connect(&device_at(second)).await.unwrap();
        assert!(matches!(
            stale.await.unwrap(),
            Err(ConnectionError::ConnectionLost)
        ));

        let result = client.send(factory.toggle()).await.unwrap();
        assert_eq!(result, vec![Value::from("fresh")]);
    }
}

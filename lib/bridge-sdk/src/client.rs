use crate::dto::{BatteryReading, ChangeMask, DeviceState, RebootTarget, Screenshot};
use crate::error::BridgeError;
use crate::listener::DeviceChangeListener;
use crate::protocol::{read_length_prefixed, read_status, request_ok, send_request};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:5037";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct TrackedListener {
    id: u64,
    listener: Arc<dyn DeviceChangeListener>,
}

/// Client for the debug-bridge's host daemon.
///
/// You should use [`BridgeClient::init`] to spawn (or attach to) the
/// daemon; `connect` alone assumes one is already running.
pub struct BridgeClient {
    adb_path: PathBuf,
    daemon_addr: String,
    process: Mutex<Option<Child>>,
    listeners: Mutex<Vec<TrackedListener>>,
    next_listener_id: AtomicU64,
    tracker_cancel: CancellationToken,
    tracker_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BridgeClient {
    /// Start (or confirm) the bridge daemon. Does not yet dispatch
    /// device-tracking callbacks — call [`BridgeClient::start_tracking`]
    /// after registering listeners, so the first discovery replay is never
    /// dropped on the floor.
    pub async fn init(adb_path: impl Into<PathBuf>) -> Result<Arc<Self>, BridgeError> {
        let adb_path = adb_path.into();

        let status = Command::new(&adb_path)
            .arg("start-server")
            .status()
            .await?;
        if !status.success() {
            return Err(BridgeError::Protocol(
                "adb start-server exited non-zero".into(),
            ));
        }

        Ok(Arc::new(BridgeClient {
            adb_path,
            daemon_addr: DEFAULT_DAEMON_ADDR.to_string(),
            process: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            tracker_cancel: CancellationToken::new(),
            tracker_task: Mutex::new(None),
        }))
    }

    /// Builds a client bound to `daemon_addr` without spawning or probing
    /// an `adb` process — for collaborators (like the Recoverer) that only
    /// need *some* client handle and whose test doubles never reach the
    /// network. Production code should use [`BridgeClient::init`].
    #[doc(hidden)]
    pub fn unconnected(adb_path: impl Into<PathBuf>, daemon_addr: impl Into<String>) -> Arc<Self> {
        Arc::new(BridgeClient {
            adb_path: adb_path.into(),
            daemon_addr: daemon_addr.into(),
            process: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            tracker_cancel: CancellationToken::new(),
            tracker_task: Mutex::new(None),
        })
    }

    /// Begin the device-tracking background loop. Idempotent: a second
    /// call is a no-op.
    pub fn start_tracking(self: &Arc<Self>) {
        let mut task = self.tracker_task.lock();
        if task.is_some() {
            return;
        }
        let task_client = self.clone();
        *task = Some(tokio::spawn(async move {
            task_client.run_device_tracker().await
        }));
    }

    async fn connect(&self) -> Result<TcpStream, BridgeError> {
        TcpStream::connect(&self.daemon_addr)
            .await
            .map_err(BridgeError::from)
    }

    pub fn add_listener(&self, listener: Arc<dyn DeviceChangeListener>) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push(TrackedListener { id, listener });
        ListenerHandle(id)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.lock().retain(|l| l.id != handle.0);
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn DeviceChangeListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|l| l.listener.clone())
            .collect()
    }

    /// Background loop issuing `host:track-devices` and diffing the
    /// reported device table against the previous snapshot, invoking
    /// listener callbacks for each serial that appeared, changed, or
    /// vanished. Reconnects with a short backoff if the daemon connection
    /// drops.
    async fn run_device_tracker(self: Arc<Self>) {
        let mut known: HashMap<String, DeviceState> = HashMap::new();

        loop {
            if self.tracker_cancel.is_cancelled() {
                return;
            }

            let mut stream = match self.connect().await {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(?err, "bridge tracker: connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            if let Err(err) = send_request(&mut stream, "host:track-devices").await {
                tracing::warn!(?err, "bridge tracker: request failed");
                continue;
            }
            if !matches!(read_status(&mut stream).await, Ok(true)) {
                continue;
            }

            loop {
                tokio::select! {
                    _ = self.tracker_cancel.cancelled() => return,
                    body = read_length_prefixed(&mut stream) => {
                        let body = match body {
                            Ok(b) => b,
                            Err(_) => break,
                        };
                        self.reconcile_tracker_snapshot(&body, &mut known).await;
                    }
                }
            }
        }
    }

    async fn reconcile_tracker_snapshot(
        &self,
        body: &str,
        known: &mut HashMap<String, DeviceState>,
    ) {
        let mut current = HashMap::new();
        for line in body.lines() {
            let mut parts = line.split_whitespace();
            let (Some(serial), Some(state_str)) = (parts.next(), parts.next()) else {
                continue;
            };
            let state = parse_device_state(state_str);
            current.insert(serial.to_string(), state);
        }

        let listeners = self.snapshot_listeners();

        for (serial, state) in &current {
            match known.get(serial) {
                None => {
                    for l in &listeners {
                        l.connected(serial).await;
                    }
                }
                Some(prev) if prev != state => {
                    for l in &listeners {
                        l.changed(serial, ChangeMask::STATE).await;
                    }
                }
                _ => {}
            }
        }

        for serial in known.keys() {
            if !current.contains_key(serial) {
                for l in &listeners {
                    l.disconnected(serial).await;
                }
            }
        }

        *known = current;
    }

    pub async fn get_adb_version(&self) -> Result<String, BridgeError> {
        let mut stream = self.connect().await?;
        send_request(&mut stream, "host:version").await?;
        if read_status(&mut stream).await? {
            read_length_prefixed(&mut stream).await
        } else {
            Err(BridgeError::Protocol("version request failed".into()))
        }
    }

    async fn transport(&self, serial: &str) -> Result<TcpStream, BridgeError> {
        let mut stream = self.connect().await?;
        request_ok(&mut stream, &format!("host:transport:{serial}")).await?;
        Ok(stream)
    }

    /// Executes a shell command with a hard timeout, distinguishing
    /// timeout, unresponsive, rejected-while-offline, and I/O failure
    /// as separate error variants rather than collapsing them.
    pub async fn execute_shell(
        &self,
        serial: &str,
        cmd: &str,
        wait: Duration,
    ) -> Result<String, BridgeError> {
        let fut = async {
            let mut stream = self.transport(serial).await?;
            request_ok(&mut stream, &format!("shell:{cmd}")).await?;
            read_length_prefixed(&mut stream).await
        };

        match timeout(wait, fut).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(wait)),
        }
    }

    pub async fn get_state(&self, serial: &str) -> Result<DeviceState, BridgeError> {
        let mut stream = self.connect().await?;
        send_request(&mut stream, &format!("host-serial:{serial}:get-state")).await?;
        if read_status(&mut stream).await? {
            let body = read_length_prefixed(&mut stream).await?;
            Ok(parse_device_state(body.trim()))
        } else {
            Err(BridgeError::NoSuchDevice(serial.to_string()))
        }
    }

    pub async fn get_property(
        &self,
        serial: &str,
        key: &str,
        wait: Duration,
    ) -> Result<String, BridgeError> {
        let output = self
            .execute_shell(serial, &format!("getprop {key}"), wait)
            .await?;
        Ok(output.trim().to_string())
    }

    /// Bounded-wait battery read; absence of a value means the probe
    /// timed out or the device rejected `dumpsys battery`, not that the
    /// connection itself failed.
    pub async fn get_battery(
        &self,
        serial: &str,
        wait: Duration,
    ) -> Result<Option<BatteryReading>, BridgeError> {
        let fut = self.execute_shell(serial, "dumpsys battery", wait);
        match timeout(wait, fut).await {
            Ok(Ok(output)) => Ok(parse_battery_level(&output)
                .map(|level_percent| BatteryReading { level_percent })),
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    pub async fn get_mount_point(
        &self,
        serial: &str,
        name: &str,
        wait: Duration,
    ) -> Result<String, BridgeError> {
        let output = self
            .execute_shell(serial, &format!("echo $EXTERNAL_STORAGE/{name}"), wait)
            .await?;
        Ok(output.trim().to_string())
    }

    pub async fn reboot(&self, serial: &str, target: RebootTarget) -> Result<(), BridgeError> {
        let mut stream = self.transport(serial).await?;
        request_ok(&mut stream, &format!("reboot:{}", target.as_arg())).await
    }

    pub async fn install_package(
        &self,
        serial: &str,
        local_path: &str,
        wait: Duration,
    ) -> Result<(), BridgeError> {
        self.install_packages(serial, std::slice::from_ref(&local_path), wait)
            .await
    }

    pub async fn install_packages(
        &self,
        serial: &str,
        local_paths: &[&str],
        wait: Duration,
    ) -> Result<(), BridgeError> {
        for path in local_paths {
            self.execute_shell(serial, &format!("pm install {path}"), wait)
                .await?;
        }
        Ok(())
    }

    pub async fn sync_package_to_device(
        &self,
        serial: &str,
        local_path: &str,
        remote_path: &str,
    ) -> Result<(), BridgeError> {
        let mut stream = self.transport(serial).await?;
        request_ok(&mut stream, &format!("sync:{local_path}:{remote_path}")).await
    }

    pub async fn remove_remote_package(
        &self,
        serial: &str,
        remote_path: &str,
        wait: Duration,
    ) -> Result<(), BridgeError> {
        self.execute_shell(serial, &format!("rm -f {remote_path}"), wait)
            .await?;
        Ok(())
    }

    pub async fn get_screenshot(
        &self,
        serial: &str,
        wait: Duration,
    ) -> Result<Screenshot, BridgeError> {
        let fut = async {
            let mut stream = self.transport(serial).await?;
            request_ok(&mut stream, "framebuffer:").await?;
            let body = read_length_prefixed(&mut stream).await?;
            Ok(Screenshot {
                width: 0,
                height: 0,
                raw_rgba: body.into_bytes(),
            })
        };
        match timeout(wait, fut).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(wait)),
        }
    }

    /// Disconnects tracking and tears down the daemon connection without
    /// killing the daemon process itself.
    pub async fn disconnect_bridge(&self) {
        self.tracker_cancel.cancel();
        if let Some(handle) = self.tracker_task.lock().take() {
            let _ = handle.await;
        }
    }

    /// Stops device tracking and kills the daemon (`adb kill-server`).
    pub async fn terminate(&self) -> Result<(), BridgeError> {
        self.disconnect_bridge().await;
        Command::new(&self.adb_path)
            .arg("kill-server")
            .status()
            .await?;
        Ok(())
    }
}

fn parse_device_state(s: &str) -> DeviceState {
    match s {
        "device" => DeviceState::Online,
        "offline" => DeviceState::Offline,
        "unauthorized" => DeviceState::Unauthorized,
        "bootloader" | "fastbootd" => DeviceState::Bootloader,
        "recovery" => DeviceState::Recovery,
        "sideload" => DeviceState::Sideload,
        _ => DeviceState::Disconnected,
    }
}

fn parse_battery_level(dumpsys_output: &str) -> Option<u8> {
    for line in dumpsys_output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("level:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

//! In-process emulation of the measurement device.
//!
//! The simulator answers discovery, runs one test per peer address, and
//! streams random readings at the requested rate. It backs the end-to-end
//! tests and the `benchlink-sim` binary.
//!
//! # Example
//!
//! ```no_run
//! use benchlink_core::simulator::{Simulator, SimulatorConfig};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let sim = Simulator::bind("127.0.0.1:0", SimulatorConfig::default()).await?;
//!     let handle = sim.spawn();
//!     println!("device listening on {}", handle.local_addr());
//!     // ...
//!     handle.stop().await
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    self, Frame, MessageKind, DEFAULT_RATE_MS, FIELD_COMMAND, FIELD_DURATION, FIELD_MESSAGE,
    FIELD_MILLIAMPS, FIELD_MILLIVOLTS, FIELD_MODEL, FIELD_RATE, FIELD_RESULT, FIELD_SERIAL,
    FIELD_STATE, FIELD_TIME,
};
use crate::validation;

/// Identity reported by the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    pub model: String,
    pub serial: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            model: "ROCKET".to_string(),
            serial: "888".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerState {
    started: bool,
    /// Bumped on every accepted start so a stale stream can tell it was
    /// superseded.
    run: u64,
}

/// Where a stream stands relative to its peer's latest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Current,
    Stopped,
    Superseded,
}

struct Shared {
    socket: UdpSocket,
    config: SimulatorConfig,
    peers: Mutex<HashMap<SocketAddr, PeerState>>,
}

/// A bound, not yet running, simulated device.
pub struct Simulator {
    shared: Arc<Shared>,
}

impl Simulator {
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: SimulatorConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                config,
                peers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Serve requests until `cancel` fires. Streams in flight end with it.
    pub async fn run(&self, cancel: CancellationToken) -> io::Result<()> {
        let mut buf = vec![0u8; 1024];
        info!(addr = ?self.local_addr().ok(), "simulator listening");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.shared.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, peer)) => self.shared.handle(&buf[..len], peer, &cancel).await,
                Err(error) => warn!(%error, "simulator receive failed"),
            }
        }

        info!("simulator stopped");
        Ok(())
    }

    /// Run on a background task.
    pub fn spawn(self) -> SimulatorHandle {
        let local_addr = self
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let join_handle = tokio::spawn(async move { self.run(token).await });

        SimulatorHandle {
            local_addr,
            cancel_token,
            join_handle,
        }
    }
}

/// Handle for a simulator running on a background task.
pub struct SimulatorHandle {
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    join_handle: JoinHandle<io::Result<()>>,
}

impl SimulatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Stop serving and wait for the task to finish.
    pub async fn stop(self) -> io::Result<()> {
        self.cancel_token.cancel();
        self.join_handle.await.map_err(io::Error::other)?
    }
}

impl Shared {
    async fn handle(self: &Arc<Self>, bytes: &[u8], peer: SocketAddr, cancel: &CancellationToken) {
        let frame = protocol::decode(bytes);
        debug!(%peer, kind = %frame.kind(), "request received");

        match (frame.kind(), frame.field(FIELD_COMMAND)) {
            (MessageKind::Id, _) => self.identify(peer).await,
            (MessageKind::Test, Some("START")) => self.start(&frame, peer, cancel).await,
            (MessageKind::Test, Some("STOP")) => self.stop(peer).await,
            _ => debug!(%peer, raw = %protocol::from_latin1(bytes), "ignoring unknown request"),
        }
    }

    async fn identify(&self, peer: SocketAddr) {
        self.peers.lock().await.entry(peer).or_default().started = false;
        self.reply(
            peer,
            MessageKind::Id,
            &[
                (FIELD_MODEL, self.config.model.as_str()),
                (FIELD_SERIAL, self.config.serial.as_str()),
            ],
        )
        .await;
    }

    async fn start(self: &Arc<Self>, frame: &Frame, peer: SocketAddr, cancel: &CancellationToken) {
        let duration_secs = match frame.field(FIELD_DURATION).map(validation::parse_duration) {
            Some(Ok(duration)) => duration,
            _ => {
                self.reply_error(peer, "Invalid duration").await;
                return;
            }
        };
        let rate_ms = frame
            .field(FIELD_RATE)
            .and_then(|rate| rate.parse::<u32>().ok())
            .filter(|rate| *rate > 0)
            .unwrap_or(DEFAULT_RATE_MS);

        let run = {
            let mut peers = self.peers.lock().await;
            let state = peers.entry(peer).or_default();
            if state.started {
                None
            } else {
                state.started = true;
                state.run += 1;
                Some(state.run)
            }
        };
        let Some(run) = run else {
            self.reply_error(peer, "Test already running").await;
            return;
        };

        info!(%peer, duration_secs, rate_ms, "test started");
        self.reply(peer, MessageKind::Test, &[(FIELD_RESULT, "STARTED")]).await;

        let shared = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shared
                .stream(peer, run, u64::from(duration_secs) * 1000, rate_ms, cancel)
                .await;
        });
    }

    async fn stop(&self, peer: SocketAddr) {
        self.peers.lock().await.entry(peer).or_default().started = false;
        info!(%peer, "test stopped");
        self.reply(peer, MessageKind::Test, &[(FIELD_RESULT, "STOPPED")]).await;
    }

    async fn stream(
        &self,
        peer: SocketAddr,
        run: u64,
        duration_ms: u64,
        rate_ms: u32,
        cancel: CancellationToken,
    ) {
        let mut rng = StdRng::from_entropy();
        let interval = Duration::from_millis(u64::from(rate_ms));
        let mut time_ms = 0u64;

        while time_ms <= duration_ms {
            match self.progress(peer, run).await {
                Progress::Current => {}
                Progress::Stopped => {
                    debug!(%peer, run, "stream stopped");
                    self.send_idle(peer).await;
                    return;
                }
                // A newer run owns the peer and will report its own end.
                Progress::Superseded => {
                    debug!(%peer, run, "stream superseded");
                    return;
                }
            }

            let time = time_ms.to_string();
            let millivolts = rng.gen_range(0..=100u32).to_string();
            let milliamps = rng.gen_range(0..=50u32).to_string();
            self.reply(
                peer,
                MessageKind::Status,
                &[
                    (FIELD_TIME, time.as_str()),
                    (FIELD_MILLIVOLTS, millivolts.as_str()),
                    (FIELD_MILLIAMPS, milliamps.as_str()),
                ],
            )
            .await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            time_ms += u64::from(rate_ms);
        }

        let finished = match self.peers.lock().await.get_mut(&peer) {
            Some(state) if state.run == run => {
                state.started = false;
                true
            }
            _ => false,
        };
        if finished {
            info!(%peer, "test finished");
            self.send_idle(peer).await;
        }
    }

    async fn progress(&self, peer: SocketAddr, run: u64) -> Progress {
        match self.peers.lock().await.get(&peer) {
            Some(state) if state.run != run => Progress::Superseded,
            Some(state) if state.started => Progress::Current,
            _ => Progress::Stopped,
        }
    }

    async fn send_idle(&self, peer: SocketAddr) {
        self.reply(peer, MessageKind::Status, &[(FIELD_STATE, "IDLE")]).await;
    }

    async fn reply_error(&self, peer: SocketAddr, message: &str) {
        warn!(%peer, message, "rejecting request");
        self.reply(
            peer,
            MessageKind::Test,
            &[(FIELD_RESULT, "error"), (FIELD_MESSAGE, message)],
        )
        .await;
    }

    async fn reply(&self, peer: SocketAddr, kind: MessageKind, fields: &[(&str, &str)]) {
        let bytes = match protocol::encode(kind.as_str(), fields) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "cannot encode reply");
                return;
            }
        };
        if let Err(error) = self.socket.send_to(&bytes, peer).await {
            warn!(%peer, %error, "reply failed");
        }
    }
}

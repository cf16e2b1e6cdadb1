//! The health-check socket (spec §1 "Out of scope": "the CLI, health-check
//! socket ... [are] external collaborators referenced only through the
//! interfaces the core consumes"; spec §7, "User-visible behavior": "health
//! socket reports per-thread liveness; a failed thread flips its bit in the
//! reply mask"; spec §6, "Environment variables": `HEALTH_SOCK_PATH_ENV`).
//!
//! The core itself does not define this wire protocol — this module is the
//! ambient daemon scaffolding that exercises it, modeled structurally on
//! `lttng-relayd`'s `health-relayd.cpp`: a fixed-size command read followed
//! by a bitmask reply, one bit per monitored thread, sent over a Unix
//! domain socket.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use relayd_core::RelayCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// One bit per monitored thread in the liveness reply mask. A set bit means
/// that thread is unhealthy (mirrors `health-relayd.cpp`'s
/// `reply.ret_code |= 1ULL << i` for each failed subsystem).
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum Thread {
    IdleSweep = 0,
    DemoWorkload = 1,
}

/// Process-wide liveness mask. Each monitored thread clears its own bit on
/// every successful pass through its loop and sets it if that pass errors;
/// the health socket only ever reads the mask, it never mutates it.
#[derive(Default)]
pub struct Liveness {
    failed_mask: AtomicU64,
}

impl Liveness {
    pub fn mark_ok(&self, thread: Thread) {
        self.failed_mask.fetch_and(!(1 << thread as u32), Ordering::Release);
    }

    pub fn mark_failed(&self, thread: Thread) {
        self.failed_mask.fetch_or(1 << thread as u32, Ordering::Release);
    }

    fn reply_mask(&self) -> u64 {
        self.failed_mask.load(Ordering::Acquire)
    }
}

const HEALTH_CMD_CHECK: u8 = 0;

/// Bind `sock_path` and serve health checks until the process exits. Spawns
/// its own accept loop as a background task; failures to bind are logged
/// and otherwise non-fatal, matching the rest of the daemon's threads each
/// being independently restartable rather than a single point of failure.
pub fn spawn_liveness_reporter(
    _core: Arc<RelayCore>,
    liveness: Arc<Liveness>,
    sock_path: String,
) {
    tokio::spawn(async move {
        if let Err(err) = serve(&sock_path, liveness).await {
            warn!("health socket on {sock_path} stopped: {err}");
        }
    });
}

async fn serve(sock_path: &str, liveness: Arc<Liveness>) -> anyhow::Result<()> {
    let path = Path::new(sock_path);
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let _ = tokio::fs::remove_file(path).await;

    let listener = UnixListener::bind(path)?;
    info!("health socket listening on {sock_path}");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let liveness = Arc::clone(&liveness);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &liveness).await {
                warn!("health connection error: {err}");
            }
        });
    }
}

async fn handle_connection(mut stream: UnixStream, liveness: &Liveness) -> anyhow::Result<()> {
    let mut cmd = [0u8; 1];
    stream.read_exact(&mut cmd).await?;
    if cmd[0] != HEALTH_CMD_CHECK {
        anyhow::bail!("unknown health command {}", cmd[0]);
    }
    let reply = liveness.reply_mask().to_be_bytes();
    stream.write_all(&reply).await?;
    Ok(())
}

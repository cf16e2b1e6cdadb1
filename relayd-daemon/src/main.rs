mod config;
mod demo;
mod health;

use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, write};
use relayd_core::RelayCore;
use tokio::io::unix::AsyncFd;

use crate::config::Config;
use crate::health::{Liveness, Thread};

/// The read half of the wake-up pipe, registered for readability exactly
/// like any other connection's socket (spec §5, "Cancellation"): a
/// dedicated pipe is added to every poll set, and readability on it means
/// "terminate cleanly".
struct ShutdownPipe {
    read_fd: AsyncFd<std::os::fd::OwnedFd>,
    write_fd: std::os::fd::OwnedFd,
}

impl ShutdownPipe {
    fn install() -> anyhow::Result<Self> {
        let (read_fd, write_fd) = pipe().context("failed to create shutdown pipe")?;
        let flags = fcntl(read_fd.as_raw_fd(), FcntlArg::F_GETFL).context("fcntl(F_GETFL)")?;
        fcntl(
            read_fd.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .context("fcntl(F_SETFL, O_NONBLOCK)")?;
        Ok(Self {
            read_fd: AsyncFd::new(read_fd)?,
            write_fd,
        })
    }

    fn trigger(&self) {
        let _ = write(&self.write_fd, &[0u8; 1]);
    }

    async fn wait(&self) {
        loop {
            match self.read_fd.readable().await {
                Ok(mut guard) => {
                    guard.clear_ready();
                    return;
                }
                Err(err) => {
                    warn!("shutdown pipe poll failed: {err}");
                    return;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::load();
    info!(
        "relayd starting: trace_root={} idle_sweep_secs={}",
        config.runtime.trace_root, config.runtime.idle_sweep_secs
    );

    let core = Arc::new(RelayCore::new());
    let shutdown = Arc::new(ShutdownPipe::install()?);

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, signalling shutdown");
                shutdown.trigger();
            }
        });
    }
    #[cfg(unix)]
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(err) => {
                    warn!("failed to install SIGTERM handler: {err}");
                    return;
                }
            };
            sigterm.recv().await;
            info!("SIGTERM received, signalling shutdown");
            shutdown.trigger();
        });
    }

    let liveness = Arc::new(Liveness::default());

    health::spawn_liveness_reporter(
        Arc::clone(&core),
        Arc::clone(&liveness),
        config.health.sock_path.clone(),
    );

    {
        let core = Arc::clone(&core);
        let trace_root = config.runtime.trace_root.clone();
        let liveness = Arc::clone(&liveness);
        tokio::spawn(async move {
            demo::run(core, trace_root, liveness).await;
        });
    }

    let idle_sweep = tokio::time::Duration::from_secs(config.runtime.idle_sweep_secs.max(1));
    let mut ticker = tokio::time::interval(idle_sweep);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                core.sweep_idle_sessions();
                liveness.mark_ok(Thread::IdleSweep);
            }
            _ = shutdown.wait() => {
                break;
            }
        }
    }

    info!("relayd shutting down cleanly");
    Ok(())
}

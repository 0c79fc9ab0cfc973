use anyhow::{anyhow, Context};
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::config::Options;
use crate::server;

/// How often worker liveness is checked.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

// ─── Worker handles ──────────────────────────────────────────────

#[derive(Debug)]
pub struct Worker {
    index: u16,
    pid: Option<u32>,
    child: Child,
}

impl Worker {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Start `count` copies of `program`. Already started children are killed
/// if a later spawn fails.
pub fn spawn_workers(program: &Path, args: &[String], count: u16) -> anyhow::Result<Vec<Worker>> {
    (0..count)
        .map(|index| {
            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to start worker {index} ({})", program.display()))?;
            let pid = child.id();
            tracing::info!(worker = index, pid, "worker started");
            Ok(Worker { index, pid, child })
        })
        .collect()
}

/// Watch the pool until a worker exits or `shutdown` resolves.
///
/// Any exit is fatal, including a clean exit with status 0: a worker never
/// finishes on its own while the supervisor runs, so the pool is kept
/// all-or-nothing and an external process manager restarts it from
/// scratch. Remaining workers are killed before returning either way.
pub async fn monitor<F>(mut workers: Vec<Worker>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested, stopping {} workers", workers.len());
                break Ok(());
            }
            _ = ticker.tick() => {
                if let Some(err) = find_exited(&mut workers) {
                    tracing::error!("{err:#}");
                    break Err(err);
                }
            }
        }
    };

    stop_all(&mut workers).await;
    outcome
}

fn find_exited(workers: &mut [Worker]) -> Option<anyhow::Error> {
    workers.iter_mut().find_map(|worker| match worker.child.try_wait() {
        Ok(Some(status)) => Some(anyhow!(
            "worker {} (pid {:?}) exited with {status}",
            worker.index,
            worker.pid
        )),
        Ok(None) => None,
        Err(e) => Some(anyhow!("worker {} (pid {:?}) cannot be polled: {e}", worker.index, worker.pid)),
    })
}

async fn stop_all(workers: &mut [Worker]) {
    for worker in workers.iter_mut() {
        if let Err(e) = worker.child.start_kill() {
            tracing::debug!(worker = worker.index, "kill: {e}");
        }
        if let Err(e) = worker.child.wait().await {
            tracing::warn!(worker = worker.index, "failed to reap worker: {e}");
        }
    }
}

// ─── Signals ─────────────────────────────────────────────────────

/// Resolves on Ctrl-C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}");
            let _ = ctrl_c.await;
            tracing::info!("Received CTRL+C");
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => { tracing::info!("Received CTRL+C"); }
        _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
    }
}

/// Ask the kernel to deliver SIGTERM when the parent process dies.
#[cfg(target_os = "linux")]
pub fn set_parent_death_signal() -> std::io::Result<()> {
    // SAFETY: PR_SET_PDEATHSIG takes a signal number and touches no memory.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong, 0, 0, 0) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

// ─── Entry point ─────────────────────────────────────────────────

pub fn resolve_listen(listen: &str) -> anyhow::Result<SocketAddr> {
    listen
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve listen address {listen}"))?
        .next()
        .ok_or_else(|| anyhow!("listen address {listen} resolved to nothing"))
}

/// Reserve the listen port, start the pool, and babysit it.
pub async fn run(options: &Options) -> anyhow::Result<()> {
    let addr = resolve_listen(&options.listen)?;
    // Bound but never listening: held only so the port stays ours.
    let socket = server::reserve_port(addr).with_context(|| format!("failed to bind {addr}"))?;
    let addr = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| anyhow!("listener bound to a non-IP address"))?;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let workers = spawn_workers(&exe, &options.worker_args(addr), options.workers)?;
    tracing::info!(%addr, workers = workers.len(), "worker pool running");

    let result = monitor(workers, wait_for_shutdown_signal()).await;
    drop(socket);
    result
}

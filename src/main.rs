use anyhow::Context;
use clap::Parser;
use std::sync::Arc;

use fleet_aggregator::config::Options;
use fleet_aggregator::registry::PluginRegistry;
use fleet_aggregator::{logging, server, supervisor, AppState};

fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    logging::init_logging(&options.log_config());

    if options.worker {
        run_worker(&options)
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(supervisor::run(&options))
    }
}

/// One pool member: serve the aggregation RPCs on the shared port.
fn run_worker(options: &Options) -> anyhow::Result<()> {
    if let Err(e) = supervisor::set_parent_death_signal() {
        tracing::warn!("cannot set parent death signal: {e}");
    }

    let threads = usize::from(options.threads);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .max_blocking_threads(threads)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let addr = supervisor::resolve_listen(&options.listen)?;
        let listener = server::bind_reuse_port_listener(addr).with_context(|| format!("failed to bind {addr}"))?;

        let registry = PluginRegistry::new(&options.plugins_path, options.reload_interval());
        let state = Arc::new(AppState::new(registry));
        let app = server::create_router(state, options.max_message_size);

        tracing::info!(%addr, pid = std::process::id(), threads, "worker listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(supervisor::wait_for_shutdown_signal())
            .await
            .context("server exited with error")
    })
}

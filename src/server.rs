use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::timing;
use crate::AppState;

/// Pending connections queued per listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Builds the `Router` serving the aggregation RPCs.
pub fn create_router(state: Arc<AppState>, max_message_size: usize) -> Router {
    Router::new()
        // ── Aggregation RPCs ────────────────────────────────────
        .route("/ping", get(handlers::health::ping))
        .route("/aggregate/host", post(handlers::aggregate::aggregate_host))
        .route("/aggregate/group", post(handlers::aggregate::aggregate_group))
        // ── Diagnostics ─────────────────────────────────────────
        .route("/stats", get(handlers::stats::get_stats))
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn_with_state(Arc::clone(&state), timing::timing_middleware))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_message_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Listener ────────────────────────────────────────────────────

/// A TCP socket bound to `addr` with `SO_REUSEPORT` but not listening.
///
/// Holding one keeps the port reserved without taking part in the kernel's
/// connection spreading, which only covers listening sockets.
pub fn reserve_port(addr: SocketAddr) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// A listening socket on `addr` that shares the port with every other
/// worker; the kernel spreads new connections across them.
///
/// Must be called from within a tokio runtime.
pub fn bind_reuse_port_listener(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let socket = reserve_port(addr)?;
    socket.listen(LISTEN_BACKLOG)?;
    tokio::net::TcpListener::from_std(socket.into())
}

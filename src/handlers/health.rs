use crate::protocol::{MsgPack, Pong};

// ─── GET /ping ───────────────────────────────────────────────────

/// Liveness probe; always answers while the worker is up.
pub async fn ping() -> MsgPack<Pong> {
    MsgPack(Pong {})
}

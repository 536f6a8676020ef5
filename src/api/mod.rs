// =============================================================================
// HTTP API: REST reads, the selection command and the push WebSocket
// =============================================================================

pub mod rest;
pub mod ws;

pub use rest::router;

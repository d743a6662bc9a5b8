//! Transport adapters
//!
//! The connection handler is generic over any `AsyncRead + AsyncWrite`
//! stream; this module supplies the WebSocket adapter that presents binary
//! frames as a continuous byte stream.

mod websocket;

pub use websocket::WsStream;

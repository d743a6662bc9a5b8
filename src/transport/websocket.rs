//! WebSocket transport
//!
//! Wraps a tokio-tungstenite WebSocket in `AsyncRead`/`AsyncWrite` so MQTT
//! packets can flow over binary frames. One MQTT packet may span several
//! frames and one frame may carry several packets; the read side simply
//! concatenates frame payloads and leaves framing to the MQTT decoder.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// WebSocket stream adapter implementing AsyncRead and AsyncWrite
pub struct WsStream {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    stream: SplitStream<WebSocketStream<TcpStream>>,
    /// Remainder of a frame that did not fit the caller's buffer
    read_buffer: BytesMut,
    /// Write staging buffer, sent as one binary frame per poll_write
    write_buffer: BytesMut,
    /// Frames received but not yet read
    pending_messages: VecDeque<Vec<u8>>,
    closed: bool,
}

impl WsStream {
    pub fn new(ws: WebSocketStream<TcpStream>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            read_buffer: BytesMut::with_capacity(2048),
            write_buffer: BytesMut::with_capacity(2048),
            pending_messages: VecDeque::new(),
            closed: false,
        }
    }

    /// Accept a WebSocket upgrade, validating the request path and
    /// negotiating the `mqtt` subprotocol
    pub async fn accept(stream: TcpStream, expected_path: &str) -> Result<Self, io::Error> {
        let expected_path = expected_path.to_string();

        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, mut response: Response| {
                let request_path = req.uri().path();
                if request_path != expected_path {
                    return Err(ErrorResponse::new(Some(format!(
                        "invalid path: expected '{}', got '{}'",
                        expected_path, request_path
                    ))));
                }

                if let Some(protocols) = req.headers().get("sec-websocket-protocol") {
                    if let Ok(protocols_str) = protocols.to_str() {
                        for protocol in protocols_str.split(',').map(|s| s.trim()) {
                            if protocol == "mqtt" {
                                response
                                    .headers_mut()
                                    .insert("sec-websocket-protocol", protocol.parse().unwrap());
                                break;
                            }
                        }
                    }
                }
                Ok(response)
            },
        )
        .await
        .map_err(io::Error::other)?;

        Ok(Self::new(ws))
    }
}

impl AsyncRead for WsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Leftover bytes from a previous frame come first
        if !self.read_buffer.is_empty() {
            let to_copy = std::cmp::min(buf.remaining(), self.read_buffer.len());
            buf.put_slice(&self.read_buffer[..to_copy]);
            let _ = self.read_buffer.split_to(to_copy);
            return Poll::Ready(Ok(()));
        }

        if let Some(msg) = self.pending_messages.pop_front() {
            let to_copy = std::cmp::min(buf.remaining(), msg.len());
            buf.put_slice(&msg[..to_copy]);
            if to_copy < msg.len() {
                self.read_buffer.extend_from_slice(&msg[to_copy..]);
            }
            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut self.stream).poll_next(cx) {
            Poll::Ready(Some(Ok(message))) => match message {
                Message::Binary(data) => {
                    let to_copy = std::cmp::min(buf.remaining(), data.len());
                    buf.put_slice(&data[..to_copy]);
                    if to_copy < data.len() {
                        self.read_buffer.extend_from_slice(&data[to_copy..]);
                    }
                    Poll::Ready(Ok(()))
                }
                Message::Close(_) => {
                    self.closed = true;
                    Poll::Ready(Ok(()))
                }
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_) => {
                    // Not MQTT traffic; poll again
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            },
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => {
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.write_buffer.extend_from_slice(buf);

        let data = self.write_buffer.split().freeze().to_vec();
        let message = Message::Binary(data);

        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => match Pin::new(&mut self.sink).start_send(message) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => Poll::Ready(Err(io::Error::other(e))),
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.sink).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let _ = Pin::new(&mut self.sink).start_send(Message::Close(None));
                match Pin::new(&mut self.sink).poll_flush(cx) {
                    Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                    Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
                    Poll::Pending => Poll::Pending,
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

//! WebSocket adapter for devices or gateways that bridge a console over
//! a socket. Text and binary frames both feed the line framer.
use crate::record::TraceSource;
use crate::transport::{ReadStatus, Transport, TransportError, READ_POLL};

use std::collections::VecDeque;
use std::io;
use std::net::TcpStream;

use serde::{Deserialize, Serialize};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderName, HeaderValue};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    pub url: String,
    #[serde(default)]
    pub subprotocols: Vec<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

pub struct WsTransport {
    socket: Option<WebSocket<MaybeTlsStream<TcpStream>>>,
    /// Frame bytes not yet handed to the caller's buffer.
    pending: VecDeque<u8>,
    url: String,
}

impl WsTransport {
    pub fn open(config: &WsConfig) -> Result<Self, TransportError> {
        // Validate early for a readable error before the handshake.
        Url::parse(&config.url)
            .map_err(|e| TransportError::WsRequest(format!("{}: {}", config.url, e)))?;

        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::WsRequest(e.to_string()))?;
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::WsRequest(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::WsRequest(format!("header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }
        if !config.subprotocols.is_empty() {
            let protocols = config.subprotocols.join(", ");
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(&protocols)
                    .map_err(|e| TransportError::WsRequest(format!("subprotocols: {}", e)))?,
            );
        }

        let (socket, _response) = tungstenite::connect(request).map_err(Box::new)?;
        // Bound reads so the producer can poll its stop flag.
        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            stream.set_read_timeout(Some(READ_POLL))?;
        }

        Ok(Self {
            socket: Some(socket),
            pending: VecDeque::new(),
            url: config.url.clone(),
        })
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl Transport for WsTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, TransportError> {
        if !self.pending.is_empty() {
            return Ok(ReadStatus::Data(self.drain_pending(buf)));
        }
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Ok(ReadStatus::Closed),
        };
        match socket.read() {
            Ok(Message::Text(text)) => {
                self.pending.extend(text.as_bytes());
                Ok(ReadStatus::Data(self.drain_pending(buf)))
            }
            Ok(Message::Binary(bytes)) => {
                self.pending.extend(bytes.iter());
                Ok(ReadStatus::Data(self.drain_pending(buf)))
            }
            // Control frames carry no trace bytes; pongs are queued by
            // tungstenite itself.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                Ok(ReadStatus::TimedOut)
            }
            Ok(Message::Close(_)) => {
                self.socket = None;
                Ok(ReadStatus::Closed)
            }
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
            {
                Ok(ReadStatus::TimedOut)
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                self.socket = None;
                Ok(ReadStatus::Closed)
            }
            Err(e) => Err(Box::new(e).into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::Closed)?;
        let text = String::from_utf8_lossy(bytes).into_owned();
        socket.send(Message::Text(text)).map_err(Box::new)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
        }
    }

    fn source(&self) -> TraceSource {
        TraceSource::Ws
    }

    fn describe(&self) -> String {
        format!("websocket ({})", self.url)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn malformed_urls_fail_to_open() {
        let err = WsTransport::open(&WsConfig {
            url: "not a url".to_string(),
            subprotocols: vec![],
            headers: vec![],
        })
        .err()
        .unwrap();
        assert!(matches!(err, TransportError::WsRequest(_)));
    }
}

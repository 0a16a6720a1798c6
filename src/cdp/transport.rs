//! CDP transport layer
//!
//! Owns the duplex WebSocket channel to the browser's debugging endpoint.
//! The framing is a hand-rolled RFC 6455 client (masked frames, ping/pong,
//! close) over a tokio TCP stream; the bootstrap call that turns an
//! `host:port` endpoint into a websocket URL is an equally plain HTTP GET
//! against the endpoint's /json/version resource.

use serde_json::Value;
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::cdp::types::VersionInfo;
use crate::error::{Error, Result};
use crate::events::ProtocolEvent;

/// WebSocket opcodes
mod ws {
    pub const OPCODE_TEXT: u8 = 0x1;
    pub const OPCODE_CLOSE: u8 = 0x8;
    pub const OPCODE_PING: u8 = 0x9;
    pub const OPCODE_PONG: u8 = 0xA;
}

/// Write one masked client frame
async fn write_ws_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    opcode: u8,
    data: &[u8],
) -> std::io::Result<()> {
    let len = data.len();
    let mut header: SmallVec<[u8; 14]> = SmallVec::new();

    // FIN + opcode
    header.push(0x80 | opcode);

    // Mask bit set (client must mask), then length
    if len < 126 {
        header.push(0x80 | len as u8);
    } else if len < 65536 {
        header.push(0x80 | 126);
        header.push((len >> 8) as u8);
        header.push(len as u8);
    } else {
        header.push(0x80 | 127);
        for i in (0..8).rev() {
            header.push((len >> (i * 8)) as u8);
        }
    }

    // Random masking key per frame (RFC 6455 compliance)
    let mask: [u8; 4] = rand::random();
    header.extend_from_slice(&mask);

    let mut payload = Vec::with_capacity(len);
    for (i, byte) in data.iter().enumerate() {
        payload.push(byte ^ mask[i % 4]);
    }

    stream.write_all(&header).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame, returns (opcode, payload)
async fn read_ws_frame<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    let opcode = header[0] & 0x0F;
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7F) as usize;

    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await?;
        len = ((ext[0] as usize) << 8) | (ext[1] as usize);
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).await?;
        len = 0;
        for byte in ext.iter() {
            len = (len << 8) | (*byte as usize);
        }
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        stream.read_exact(&mut m).await?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok((opcode, payload))
}

/// One decoded inbound message
#[derive(Debug)]
pub enum InboundMessage {
    /// Reply to a command; `error` carries the remote failure message
    Reply {
        id: u64,
        result: Value,
        error: Option<String>,
    },
    /// Spontaneous event
    Event(ProtocolEvent),
}

/// Decode one text frame into a reply or an event.
///
/// Frames that are neither (no id, no method) decode to None and are
/// skipped by the reader.
pub fn decode_message(text: &str) -> Option<InboundMessage> {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("unparseable frame: {} - {}", e, text);
            return None;
        }
    };

    if let Some(id) = msg.get("id").and_then(Value::as_u64) {
        let error = msg
            .get("error")
            .map(|e| {
                e.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string()
            });
        let result = msg
            .get("result")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        return Some(InboundMessage::Reply { id, result, error });
    }

    if let Some(method) = msg.get("method").and_then(Value::as_str) {
        return Some(InboundMessage::Event(ProtocolEvent {
            method: method.to_string(),
            params: msg.get("params").cloned().unwrap_or_else(|| Value::Object(Default::default())),
            session_id: msg
                .get("sessionId")
                .and_then(Value::as_str)
                .map(String::from),
        }));
    }

    None
}

/// Strip a scheme prefix and path, leaving host:port
fn host_port_of(endpoint: &str) -> &str {
    let stripped = endpoint
        .trim_start_matches("http://")
        .trim_start_matches("ws://");
    stripped.split('/').next().unwrap_or(stripped)
}

/// Slice the body out of a raw HTTP/1.1 response
fn http_body(raw: &str) -> Result<&str> {
    let (head, body) = raw
        .split_once("\r\n\r\n")
        .ok_or_else(|| Error::transport("malformed HTTP response from endpoint"))?;
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.contains("200") {
        return Err(Error::transport(format!(
            "endpoint version request failed: {}",
            status_line
        )));
    }
    Ok(body)
}

/// Fetch /json/version from the debugging endpoint.
///
/// Accepts `host:port` or an `http://` URL. The browser supplies the
/// websocket URL in the reply; a `ws://` endpoint skips this call
/// entirely (see [`resolve_endpoint`]).
pub async fn fetch_version(endpoint: &str) -> Result<VersionInfo> {
    let host_port = host_port_of(endpoint);
    let mut stream = TcpStream::connect(host_port)
        .await
        .map_err(|e| Error::transport_io("failed to reach debugging endpoint", e))?;

    let request = format!(
        "GET /json/version HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: close\r\n\
         \r\n",
        host_port
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::transport_io("version request write failed", e))?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .map_err(|e| Error::transport_io("version request read failed", e))?;
    let raw = String::from_utf8_lossy(&raw);

    let body = http_body(&raw)?;
    let info: VersionInfo = serde_json::from_str(body.trim())?;
    tracing::debug!("endpoint reports {} ({})", info.browser, info.protocol_version);
    Ok(info)
}

/// Resolve a caller-supplied endpoint into a websocket URL
pub async fn resolve_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.starts_with("ws://") {
        return Ok(endpoint.to_string());
    }
    let info = fetch_version(endpoint).await?;
    if info.web_socket_debugger_url.is_empty() {
        return Err(Error::transport(
            "endpoint did not advertise a webSocketDebuggerUrl",
        ));
    }
    Ok(info.web_socket_debugger_url)
}

/// Write side of the duplex channel
pub struct Transport {
    writer: Mutex<OwnedWriteHalf>,
}

/// Read side; owned by the connection's single reader task
pub struct TransportReader {
    reader: OwnedReadHalf,
    transport: std::sync::Arc<Transport>,
}

impl Transport {
    /// Connect to a `ws://` URL and perform the upgrade handshake
    pub async fn connect(ws_url: &str) -> Result<(std::sync::Arc<Self>, TransportReader)> {
        let url = ws_url
            .strip_prefix("ws://")
            .ok_or_else(|| Error::transport(format!("unsupported websocket URL: {}", ws_url)))?;
        let (host_port, path) = match url.split_once('/') {
            Some((hp, p)) => (hp, format!("/{}", p)),
            None => (url, "/".to_string()),
        };

        let mut stream = TcpStream::connect(host_port)
            .await
            .map_err(|e| Error::transport_io("failed to connect to browser", e))?;

        let key = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            rand::random::<[u8; 16]>(),
        );
        let handshake = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            path, host_port, key
        );
        stream
            .write_all(handshake.as_bytes())
            .await
            .map_err(|e| Error::transport_io("handshake write failed", e))?;

        // Read the upgrade response byte-wise up to the header terminator
        // so no websocket frame bytes are swallowed.
        let mut response = Vec::with_capacity(256);
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() > 8192 {
                return Err(Error::transport("oversized handshake response"));
            }
            let byte = stream
                .read_u8()
                .await
                .map_err(|e| Error::transport_io("handshake read failed", e))?;
            response.push(byte);
        }
        let response = String::from_utf8_lossy(&response);
        if !response.contains("101") {
            return Err(Error::transport(format!(
                "websocket handshake refused: {}",
                response.lines().next().unwrap_or("")
            )));
        }

        tracing::debug!("websocket connected to {}", ws_url);

        let (read_half, write_half) = stream.into_split();
        let transport = std::sync::Arc::new(Self {
            writer: Mutex::new(write_half),
        });
        let reader = TransportReader {
            reader: read_half,
            transport: std::sync::Arc::clone(&transport),
        };
        Ok((transport, reader))
    }

    /// Write one text frame; an error here means the channel is dead
    pub async fn send_text(&self, data: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_ws_frame(&mut *writer, ws::OPCODE_TEXT, data.as_bytes())
            .await
            .map_err(|e| Error::transport_io("websocket write failed", e))
    }

    async fn send_pong(&self, payload: &[u8]) {
        let mut writer = self.writer.lock().await;
        let _ = write_ws_frame(&mut *writer, ws::OPCODE_PONG, payload).await;
    }

    /// Best-effort close frame; the peer tears the TCP stream down
    pub async fn send_close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = write_ws_frame(&mut *writer, ws::OPCODE_CLOSE, &[]).await;
        let _ = writer.shutdown().await;
    }
}

impl TransportReader {
    /// Next decoded message; None once the channel is closed.
    ///
    /// Control frames are handled inline: pings answered, close ends the
    /// stream. Binary and continuation frames are not part of the CDP
    /// wire format and are skipped.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        loop {
            let (opcode, payload) = match read_ws_frame(&mut self.reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("websocket read ended: {}", e);
                    return None;
                }
            };

            match opcode {
                ws::OPCODE_TEXT => {
                    let text = match String::from_utf8(payload) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    if let Some(msg) = decode_message(&text) {
                        return Some(msg);
                    }
                }
                ws::OPCODE_PING => {
                    self.transport.send_pong(&payload).await;
                }
                ws::OPCODE_CLOSE => {
                    tracing::debug!("websocket closed by peer");
                    return None;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_short() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_ws_frame(&mut a, ws::OPCODE_TEXT, b"hello").await.unwrap();
        let (opcode, payload) = read_ws_frame(&mut b).await.unwrap();
        assert_eq!(opcode, ws::OPCODE_TEXT);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn frame_roundtrip_extended_16bit_length() {
        let data = vec![b'x'; 300];
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_ws_frame(&mut a, ws::OPCODE_TEXT, &data).await.unwrap();
        let (_, payload) = read_ws_frame(&mut b).await.unwrap();
        assert_eq!(payload, data);
    }

    #[tokio::test]
    async fn frame_roundtrip_extended_64bit_length() {
        let data = vec![b'y'; 70_000];
        let (mut a, mut b) = tokio::io::duplex(256 * 1024);
        let writer = tokio::spawn(async move {
            write_ws_frame(&mut a, ws::OPCODE_TEXT, &data).await.unwrap();
            data
        });
        let (_, payload) = read_ws_frame(&mut b).await.unwrap();
        assert_eq!(payload, writer.await.unwrap());
    }

    #[test]
    fn decode_reply_with_result() {
        let msg = decode_message(r#"{"id": 7, "result": {"ok": true}}"#).unwrap();
        match msg {
            InboundMessage::Reply { id, result, error } => {
                assert_eq!(id, 7);
                assert!(error.is_none());
                assert_eq!(result["ok"], true);
            }
            _ => panic!("expected reply"),
        }
    }

    #[test]
    fn decode_reply_with_error() {
        let msg =
            decode_message(r#"{"id": 9, "error": {"code": -32000, "message": "no target"}}"#)
                .unwrap();
        match msg {
            InboundMessage::Reply { id, error, .. } => {
                assert_eq!(id, 9);
                assert_eq!(error.as_deref(), Some("no target"));
            }
            _ => panic!("expected reply"),
        }
    }

    #[test]
    fn decode_event_with_session() {
        let msg = decode_message(
            r#"{"method": "Page.frameNavigated", "params": {"frame": {}}, "sessionId": "s-1"}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::Event(ev) => {
                assert_eq!(ev.method, "Page.frameNavigated");
                assert_eq!(ev.session_id.as_deref(), Some("s-1"));
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn decode_skips_garbage() {
        assert!(decode_message("not json").is_none());
        assert!(decode_message(r#"{"neither": "id nor method"}"#).is_none());
    }

    #[test]
    fn host_port_strips_schemes_and_paths() {
        assert_eq!(host_port_of("127.0.0.1:9222"), "127.0.0.1:9222");
        assert_eq!(host_port_of("http://127.0.0.1:9222"), "127.0.0.1:9222");
        assert_eq!(
            host_port_of("ws://127.0.0.1:9222/devtools/browser/abc"),
            "127.0.0.1:9222"
        );
    }

    #[test]
    fn http_body_rejects_non_200() {
        let raw = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        assert!(http_body(raw).is_err());
        let raw = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"Browser\":\"x\"}";
        assert_eq!(http_body(raw).unwrap(), "{\"Browser\":\"x\"}");
    }
}

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{body::Incoming, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::events::EventBus;

/// Check if request is a WebSocket upgrade request
#[inline]
pub fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("websocket"))
        .unwrap_or(false);

    let connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    upgrade && connection
}

/// Completes the WebSocket handshake and streams proxy events to the peer
/// until it goes away. Fan-out is best-effort: a subscriber that lags behind
/// the broadcast buffer loses messages.
pub fn handle_upgrade(
    req: Request<Incoming>,
    events: EventBus,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(key) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(empty_body())
            .unwrap();
    };

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(
            "Sec-WebSocket-Accept",
            HeaderValue::from_str(&accept_key(&key)).expect("accept key is ascii"),
        )
        .body(empty_body())
        .unwrap();

    let upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let stream = TokioIo::new(upgraded);
                serve_events(stream, events).await;
            }
            Err(e) => {
                error!("WebSocket upgrade failed: {}", e);
            }
        }
    });

    response
}

async fn serve_events<S>(mut stream: S, events: EventBus)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rx = events.subscribe();
    let mut scratch = [0u8; 512];

    debug!("WebSocket subscriber attached");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let payload = event.to_message().to_string();
                    let frame = text_frame(payload.as_bytes());
                    if stream.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket subscriber lagged, {} event(s) dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            read = stream.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    // Only the close opcode matters; everything else from the
                    // peer is ignored.
                    if scratch[0] & 0x0f == 0x8 {
                        break;
                    }
                }
            }
        }
    }

    debug!("WebSocket subscriber detached");
}

/// Compute Sec-WebSocket-Accept value
fn accept_key(key: &str) -> String {
    const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64.encode(hasher.digest().bytes())
}

/// Encodes one unmasked server-to-client text frame.
fn text_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(0x81); // FIN + text opcode

    match payload.len() {
        len if len < 126 => frame.push(len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(126);
            frame.extend((len as u16).to_be_bytes());
        }
        len => {
            frame.push(127);
            frame.extend((len as u64).to_be_bytes());
        }
    }

    frame.extend_from_slice(payload);
    frame
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_vector() {
        // RFC 6455 §1.3 sample handshake.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_short_frame() {
        let frame = text_frame(b"hi");
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 2);
        assert_eq!(&frame[2..], b"hi");
    }

    #[test]
    fn test_medium_frame_uses_extended_length() {
        let payload = vec![b'x'; 300];
        let frame = text_frame(&payload);
        assert_eq!(frame[1], 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 300);
        assert_eq!(frame.len(), 4 + 300);
    }

    #[test]
    fn test_large_frame_uses_u64_length() {
        let payload = vec![b'x'; 70_000];
        let frame = text_frame(&payload);
        assert_eq!(frame[1], 127);
        assert_eq!(
            u64::from_be_bytes([
                frame[2], frame[3], frame[4], frame[5], frame[6], frame[7], frame[8], frame[9]
            ]),
            70_000
        );
        assert_eq!(frame.len(), 10 + 70_000);
    }

    #[tokio::test]
    async fn test_serve_events_writes_frames() {
        let (mut client, server) = tokio::io::duplex(4096);
        let events = EventBus::new();
        let bus = events.clone();

        let task = tokio::spawn(serve_events(server, events));

        bus.publish(crate::events::ProxyEvent::ServerDeleted(
            crate::events::ServerDeleted {
                id: "abc".to_string(),
            },
        ));

        let mut header = [0u8; 2];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x81);
        let len = header[1] as usize;
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        let msg: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(msg["id"], 1012);
        assert_eq!(msg["data"]["id"], "abc");

        // A close frame from the peer ends the session.
        client.write_all(&[0x88, 0x00]).await.unwrap();
        task.await.unwrap();
    }
}

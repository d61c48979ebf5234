use aws_lc_rs::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::AsyncWriteExt;

use crate::async_stream::AsyncStream;

use super::WebsocketStream;

/// The upgrade-relevant parts of an already-parsed HTTP request.
pub struct HandshakeRequest<'a> {
    pub key: &'a str,
    /// Echoed back verbatim when present; early-data clients refuse the
    /// upgrade when the subprotocol they offered is not confirmed.
    pub subprotocol: Option<&'a str>,
}

/// Writes the `101 Switching Protocols` response and wraps the stream in the
/// frame layer. `unparsed_data` carries bytes the client sent after the
/// request head, before the handshake completed.
pub async fn accept_websocket<S: AsyncStream>(
    mut stream: S,
    request: HandshakeRequest<'_>,
    unparsed_data: &[u8],
) -> std::io::Result<WebsocketStream<S>> {
    let key_response = create_websocket_key_response(request.key);

    let subprotocol_header = match request.subprotocol {
        Some(p) => format!("Sec-WebSocket-Protocol: {p}\r\n"),
        None => String::new(),
    };

    let http_response = format!(
        concat!(
            "HTTP/1.1 101 Switching Protocols\r\n",
            "Upgrade: websocket\r\n",
            "Connection: Upgrade\r\n",
            "Sec-WebSocket-Accept: {}\r\n",
            "{}",
            "\r\n"
        ),
        key_response, subprotocol_header,
    );

    stream.write_all(http_response.as_bytes()).await?;
    stream.flush().await?;

    Ok(WebsocketStream::new(stream, unparsed_data))
}

fn create_websocket_key_response(key: &str) -> String {
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut input = key.as_bytes().to_vec();
    input.extend_from_slice(WS_GUID);
    let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, &input);
    BASE64.encode(hash.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_key_response_rfc_example() {
        // The worked example from RFC 6455 section 1.3.
        assert_eq!(
            create_websocket_key_response("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn test_accept_writes_101_and_echoes_subprotocol() {
        let (mut remote, local) = tokio::io::duplex(4096);

        let _ws = accept_websocket(
            local,
            HandshakeRequest {
                key: "dGhlIHNhbXBsZSBub25jZQ==",
                subprotocol: Some("AAAA"),
            },
            &[],
        )
        .await
        .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = remote.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("Sec-WebSocket-Protocol: AAAA\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }
}

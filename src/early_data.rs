use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// Decode the early-data payload a client smuggles through the
/// `sec-websocket-protocol` header. The value is URL-safe base64; some
/// clients send the standard alphabet with padding instead, so `+`, `/` and
/// `=` are translated away before decoding. The decoded bytes are treated as
/// the first inbound message.
pub fn decode_early_data(header_value: Option<&str>) -> std::io::Result<Option<Vec<u8>>> {
    let value = match header_value {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };

    let normalized: String = value
        .chars()
        .filter_map(|c| match c {
            '+' => Some('-'),
            '/' => Some('_'),
            '=' => None,
            c => Some(c),
        })
        .collect();

    match URL_SAFE_NO_PAD.decode(normalized.as_bytes()) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid early data: {e}"),
        )),
    }
}

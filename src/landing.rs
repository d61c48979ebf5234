use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::config::ServerConfig;

/// Splits a Host header into hostname and port, assuming 443 when the
/// header carries no port (TLS is terminated in front of this server).
fn split_host(host_header: &str) -> (&str, u16) {
    if let Some(stripped) = host_header.strip_prefix('[') {
        // bracketed IPv6, possibly with a port after the bracket
        if let Some(end) = stripped.find(']') {
            let host = &host_header[..end + 2];
            let port = stripped[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(443);
            return (host, port);
        }
    }
    match host_header.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (host_header, 443),
        },
        None => (host_header, 443),
    }
}

pub fn vless_url(config: &ServerConfig, host_header: &str) -> String {
    let (host, port) = split_host(host_header);
    format!(
        "vless://{uuid}@{host}:{port}?encryption=none&security=tls&sni={host}&fp=chrome&type=ws&host={host}&path=%2F%3Fed%3D2048#{credit}",
        uuid = config.uuid_string,
        host = host,
        port = port,
        credit = config.credit,
    )
}

fn clash_proxy(config: &ServerConfig, host: &str, port: u16) -> String {
    format!(
        concat!(
            "- name: {credit}\n",
            "  type: vless\n",
            "  server: {host}\n",
            "  port: {port}\n",
            "  uuid: {uuid}\n",
            "  udp: true\n",
            "  tls: true\n",
            "  network: ws\n",
            "  servername: {host}\n",
            "  client-fingerprint: chrome\n",
            "  ws-opts:\n",
            "    path: \"/?ed=2048\"\n",
            "    headers:\n",
            "      Host: {host}\n",
        ),
        credit = config.credit,
        host = host,
        port = port,
        uuid = config.uuid_string,
    )
}

fn sing_box_outbound(config: &ServerConfig, host: &str, port: u16) -> String {
    let outbound = json!({
        "type": "vless",
        "tag": config.credit,
        "server": host,
        "server_port": port,
        "uuid": config.uuid_string,
        "tls": {
            "enabled": true,
            "server_name": host,
            "utls": {
                "enabled": true,
                "fingerprint": "chrome"
            }
        },
        "transport": {
            "type": "ws",
            "path": "/",
            "headers": {
                "Host": host
            },
            "early_data_header_name": "Sec-WebSocket-Protocol",
            "max_early_data": 2048
        }
    });
    serde_json::to_string_pretty(&outbound).expect("static outbound must serialize")
}

pub fn landing_page() -> String {
    concat!(
        "<!DOCTYPE html>\n",
        "<html>\n",
        "<head><title>wless</title></head>\n",
        "<body>\n",
        "<h1>wless</h1>\n",
        "<p>VLESS-over-WebSocket relay is running.</p>\n",
        "</body>\n",
        "</html>\n",
    )
    .to_string()
}

pub fn config_page(config: &ServerConfig, host_header: &str) -> String {
    let (host, port) = split_host(host_header);
    format!(
        concat!(
            "<!DOCTYPE html>\n",
            "<html>\n",
            "<head><title>wless config</title></head>\n",
            "<body>\n",
            "<h1>Client configuration</h1>\n",
            "<h2>VLESS URL</h2>\n",
            "<pre>{url}</pre>\n",
            "<h2>Clash proxy</h2>\n",
            "<pre>{clash}</pre>\n",
            "<h2>Sing-Box outbound</h2>\n",
            "<pre>{sing_box}</pre>\n",
            "</body>\n",
            "</html>\n",
        ),
        url = vless_url(config, host_header),
        clash = clash_proxy(config, host, port),
        sing_box = sing_box_outbound(config, host, port),
    )
}

pub fn status_json(config: &ServerConfig) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    json!({
        "status": "ok",
        "uuid": config.uuid_string,
        "timestamp": timestamp,
    })
    .to_string()
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::async_stream::AsyncStream;
use crate::config::ServerConfig;
use crate::conn_tag::ConnTag;
use crate::dialer::{Dialer, NativeDialer};
use crate::doh::{DnsOverHttps, HyperDohClient};
use crate::early_data::decode_early_data;
use crate::error::CLOSE_PROTOCOL_ERROR;
use crate::landing;
use crate::relay::run_connection;
use crate::stream_reader::StreamReader;
use crate::websocket::{accept_websocket, HandshakeRequest};

// Bound on the pre-relay phase: request head, handshake, nothing more.
const SETUP_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_REQUEST_LINE_LEN: usize = 4096;
const MAX_REQUEST_LINES: usize = 40;

pub struct Server {
    config: Arc<ServerConfig>,
    dialer: Arc<dyn Dialer>,
    doh: Arc<dyn DnsOverHttps>,
}

impl Server {
    pub fn new(config: Arc<ServerConfig>) -> std::io::Result<Arc<Self>> {
        let doh: Arc<dyn DnsOverHttps> = Arc::new(HyperDohClient::new(&config.doh_url)?);
        Ok(Arc::new(Self {
            config,
            dialer: Arc::new(NativeDialer),
            doh,
        }))
    }

    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!(
            "Listening on {} (user id {})",
            listener.local_addr()?,
            self.config.uuid_string
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    error!("Accept failed: {e}");
                    continue;
                }
            };

            if let Err(e) = set_tcp_keepalive(
                &stream,
                Duration::from_secs(300),
                Duration::from_secs(60),
            ) {
                warn!("Failed to set TCP keepalive: {e}");
            }
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP nodelay: {e}");
            }

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.process_stream(stream, peer).await {
                    debug!("{}:{} finished with error: {e}", peer.ip(), peer.port());
                } else {
                    debug!("{}:{} finished", peer.ip(), peer.port());
                }
            });
        }
    }

    async fn process_stream(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> std::io::Result<()> {
        let request = match timeout(SETUP_TIMEOUT, ParsedHttpRequest::parse(&mut stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "request head timed out",
                ));
            }
        };

        let is_upgrade = request
            .headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);

        if is_upgrade {
            // Any upgrade request becomes a tunnel, regardless of path.
            self.serve_websocket(stream, request, peer).await
        } else {
            self.serve_page(&mut stream, &request).await
        }
    }

    async fn serve_websocket(
        &self,
        mut stream: TcpStream,
        request: ParsedHttpRequest,
        peer: SocketAddr,
    ) -> std::io::Result<()> {
        let key = match request.headers.get("sec-websocket-key") {
            Some(key) => key.as_str(),
            None => {
                return write_response(
                    &mut stream,
                    "400 Bad Request",
                    "text/plain",
                    "missing websocket key",
                )
                .await;
            }
        };

        // Decode before dialing anything; a bad value still completes the
        // handshake so the failure can be reported as a proper close frame.
        let subprotocol = request.headers.get("sec-websocket-protocol").cloned();
        let early_data = decode_early_data(subprotocol.as_deref());

        let handshake = HandshakeRequest {
            key,
            subprotocol: subprotocol.as_deref(),
        };
        let mut ws = timeout(
            SETUP_TIMEOUT,
            accept_websocket(stream, handshake, request.reader.unparsed_data()),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "websocket handshake timed out")
        })??;

        let mut tag = ConnTag::new(peer);

        let early_data = match early_data {
            Ok(early_data) => early_data,
            Err(e) => {
                warn!("[{tag}] rejecting connection: {e}");
                let _ = ws.send_close(CLOSE_PROTOCOL_ERROR).await;
                let _ = ws.shutdown().await;
                return Ok(());
            }
        };

        let result = run_connection(
            &mut ws,
            early_data,
            &self.config,
            self.dialer.as_ref(),
            &self.doh,
            &mut tag,
        )
        .await;

        match result {
            Ok(()) => {
                debug!("[{tag}] relay finished");
            }
            Err(ref e) if e.is_client_close() => {
                debug!("[{tag}] client went away: {e}");
            }
            Err(e) => {
                warn!("[{tag}] relay failed: {e}");
                let _ = ws.send_close(e.close_code()).await;
            }
        }
        // Shutdown emits a normal-closure frame when no close was sent yet.
        let _ = ws.shutdown().await;
        Ok(())
    }

    async fn serve_page(
        &self,
        stream: &mut TcpStream,
        request: &ParsedHttpRequest,
    ) -> std::io::Result<()> {
        if request.method != "GET" {
            return write_response(stream, "404 Not Found", "text/plain", "Not found").await;
        }

        let path = request.path.split('?').next().unwrap_or("");
        let uuid_path = format!("/{}", self.config.uuid_string);

        match path {
            "/" => {
                write_response(stream, "200 OK", "text/html", &landing::landing_page()).await
            }
            "/config" => {
                let host = request
                    .headers
                    .get("host")
                    .map(String::as_str)
                    .unwrap_or("localhost");
                let body = landing::config_page(&self.config, host);
                write_response(stream, "200 OK", "text/html", &body).await
            }
            "/status" | "/api/status" => {
                let body = landing::status_json(&self.config);
                write_response(stream, "200 OK", "application/json", &body).await
            }
            p if p == uuid_path => {
                let host = request
                    .headers
                    .get("host")
                    .map(String::as_str)
                    .unwrap_or("localhost");
                let body = landing::config_page(&self.config, host);
                write_response(stream, "200 OK", "text/html", &body).await
            }
            _ => write_response(stream, "404 Not Found", "text/plain", "Not found").await,
        }
    }
}

fn set_tcp_keepalive(
    stream: &TcpStream,
    time: Duration,
    interval: Duration,
) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(time).with_interval(interval);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

async fn write_response<S: AsyncStream>(
    stream: &mut S,
    status: &str,
    content_type: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        concat!(
            "HTTP/1.1 {}\r\n",
            "Content-Type: {}\r\n",
            "Content-Length: {}\r\n",
            "Connection: close\r\n",
            "\r\n",
            "{}"
        ),
        status,
        content_type,
        body.len(),
        body,
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

struct ParsedHttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    reader: StreamReader,
}

impl ParsedHttpRequest {
    async fn parse<S: AsyncStream>(stream: &mut S) -> std::io::Result<Self> {
        let mut reader = StreamReader::new();
        let mut first_line: Option<String> = None;
        let mut headers: HashMap<String, String> = HashMap::new();

        let mut line_count = 0;
        loop {
            let line = reader.read_line(stream).await?;
            if line.is_empty() {
                break;
            }

            if line.len() >= MAX_REQUEST_LINE_LEN {
                return Err(std::io::Error::other("http request line is too long"));
            }

            if first_line.is_none() {
                first_line = Some(line);
            } else {
                let tokens: Vec<&str> = line.splitn(2, ':').collect();
                if tokens.len() != 2 {
                    return Err(std::io::Error::other(format!(
                        "invalid http request line: {line}"
                    )));
                }
                let header_key = tokens[0].trim().to_lowercase();
                let header_value = tokens[1].trim().to_string();
                headers.insert(header_key, header_value);
            }

            line_count += 1;
            if line_count >= MAX_REQUEST_LINES {
                return Err(std::io::Error::other("http request is too long"));
            }
        }

        let first_line =
            first_line.ok_or_else(|| std::io::Error::other("empty http request"))?;

        if !first_line.ends_with(" HTTP/1.0") && !first_line.ends_with(" HTTP/1.1") {
            return Err(std::io::Error::other(format!(
                "invalid http request version: {first_line}"
            )));
        }

        let mut tokens = first_line.split(' ');
        let method = tokens
            .next()
            .ok_or_else(|| std::io::Error::other("missing http method"))?
            .to_string();
        let path = tokens
            .next()
            .ok_or_else(|| std::io::Error::other("missing http path"))?
            .to_string();

        Ok(Self {
            method,
            path,
            headers,
            reader,
        })
    }
}

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::async_stream::AsyncStream;
use crate::config::ServerConfig;
use crate::conn_tag::ConnTag;
use crate::copy_bidirectional::copy_bidirectional;
use crate::dialer::Dialer;
use crate::doh::DnsOverHttps;
use crate::error::RelayError;
use crate::udp_framer::{encode_datagram, UdpFramer};
use crate::util::allocate_vec;
use crate::vless::{response_header, Command, HeaderError, HeaderParser};

const READ_BUF_SIZE: usize = 16384;

// version + uuid + addons (up to 255) + command + port + address type +
// domain (up to 256). Anything bigger without a complete header is abuse.
const MAX_HEADER_BUFFER: usize = 1024;

const DOH_MAX_IN_FLIGHT: usize = 8;

/// Drives one accepted tunnel: gate on the request header, then branch into
/// the TCP pipe or the DNS datagram loop. The caller owns the client stream
/// and turns the returned error (or success) into the close handshake.
pub async fn run_connection<S: AsyncStream>(
    client: &mut S,
    early_data: Option<Vec<u8>>,
    config: &ServerConfig,
    dialer: &dyn Dialer,
    doh: &Arc<dyn DnsOverHttps>,
    tag: &mut ConnTag,
) -> Result<(), RelayError> {
    // Early data counts as the head of the inbound stream, so the parse
    // buffer starts out seeded with it.
    let mut header_buf = early_data.unwrap_or_default();
    let mut parser = HeaderParser::new(config.user_uuid);

    let request = loop {
        match parser.parse(&header_buf) {
            Ok(Some(request)) => break request,
            Ok(None) => {}
            Err(HeaderError::InvalidUser) => return Err(RelayError::Auth),
            Err(e) => return Err(RelayError::Protocol(e.to_string())),
        }

        if header_buf.len() > MAX_HEADER_BUFFER {
            return Err(RelayError::Protocol("request header too large".to_string()));
        }

        let mut chunk = [0u8; 1024];
        let n = client.read(&mut chunk).await.map_err(classify_client_error)?;
        if n == 0 {
            return Err(RelayError::Protocol(
                "stream ended before header completed".to_string(),
            ));
        }
        header_buf.extend_from_slice(&chunk[..n]);
    };

    let residual = &header_buf[request.payload_offset..];

    match request.command {
        Command::Tcp => {
            tag.set_transport("tcp");
            debug!("[{tag}] tcp connect to {}", request.destination);
            run_tcp(
                client,
                request.version,
                &request.destination,
                residual,
                config,
                dialer,
                tag,
            )
            .await
        }
        Command::Udp => {
            tag.set_transport("dns");
            debug!("[{tag}] dns session for {}", request.destination);
            run_dns(client, request.version, residual, doh, tag).await
        }
    }
}

async fn run_tcp<S: AsyncStream>(
    client: &mut S,
    version: u8,
    destination: &crate::address::NetLocation,
    residual: &[u8],
    config: &ServerConfig,
    dialer: &dyn Dialer,
    tag: &ConnTag,
) -> Result<(), RelayError> {
    let mut upstream = dialer.dial(destination).await.map_err(RelayError::Upstream)?;

    if !residual.is_empty() {
        upstream
            .write_all(residual)
            .await
            .map_err(RelayError::Upstream)?;
        upstream.flush().await.map_err(RelayError::Upstream)?;
    }

    // Until the first upstream byte arrives the connection is still
    // retryable: a clean upstream close with nothing received redials the
    // configured fallback, once. Client bytes keep flowing upstream in the
    // meantime, but only the post-header payload is replayed on the retry.
    let mut upstream_buf = allocate_vec::<u8>(READ_BUF_SIZE);
    let mut client_buf = allocate_vec::<u8>(READ_BUF_SIZE);
    let mut retried = false;

    loop {
        tokio::select! {
            result = upstream.read(&mut upstream_buf) => match result {
                Ok(0) => {
                    let fallback = config.fallback.as_ref().filter(|_| !retried);
                    match fallback {
                        Some(fallback) => {
                            let location = fallback.to_location(destination.port());
                            debug!(
                                "[{tag}] upstream closed with no data, retrying via {location}"
                            );
                            retried = true;
                            upstream = dialer
                                .dial(&location)
                                .await
                                .map_err(RelayError::Upstream)?;
                            if !residual.is_empty() {
                                upstream
                                    .write_all(residual)
                                    .await
                                    .map_err(RelayError::Upstream)?;
                                upstream.flush().await.map_err(RelayError::Upstream)?;
                            }
                        }
                        None => {
                            debug!("[{tag}] upstream closed without sending data");
                            return Ok(());
                        }
                    }
                }
                Ok(n) => {
                    // One write, so the one-shot response header cannot be
                    // separated from (or reordered with) the first batch.
                    let mut first = Vec::with_capacity(2 + n);
                    first.extend_from_slice(&response_header(version));
                    first.extend_from_slice(&upstream_buf[..n]);
                    client.write_all(&first).await.map_err(RelayError::Client)?;
                    client.flush().await.map_err(RelayError::Client)?;
                    break;
                }
                Err(e) => return Err(RelayError::Upstream(e)),
            },
            result = client.read(&mut client_buf) => match result {
                Ok(0) => {
                    debug!("[{tag}] client closed before upstream answered");
                    let _ = upstream.shutdown().await;
                    return Ok(());
                }
                Ok(n) => {
                    upstream
                        .write_all(&client_buf[..n])
                        .await
                        .map_err(RelayError::Upstream)?;
                    upstream.flush().await.map_err(RelayError::Upstream)?;
                }
                Err(e) => {
                    let _ = upstream.shutdown().await;
                    return Err(classify_client_error(e));
                }
            },
        }
    }

    let result = copy_bidirectional(client, upstream.as_mut()).await;
    let _ = upstream.shutdown().await;

    match result {
        Ok((from_client, from_upstream)) => {
            debug!("[{tag}] finished: {from_client} bytes up, {from_upstream} bytes down");
            Ok(())
        }
        Err(e) => Err(classify_pipe_error(e)),
    }
}

// The frame layer reports malformed client framing (a text frame, a bogus
// length) as InvalidData; everything else on the client stream is the peer
// going away.
fn classify_client_error(e: std::io::Error) -> RelayError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        RelayError::Protocol(e.to_string())
    } else {
        RelayError::Client(e)
    }
}

// A bidirectional pipe error does not say which side failed; peers hanging
// up mid-transfer is the common case and counts as a client-side ending.
fn classify_pipe_error(e: std::io::Error) -> RelayError {
    match e.kind() {
        std::io::ErrorKind::InvalidData => RelayError::Protocol(e.to_string()),
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => RelayError::Client(e),
        _ => RelayError::Upstream(e),
    }
}

async fn run_dns<S: AsyncStream>(
    client: &mut S,
    version: u8,
    residual: &[u8],
    doh: &Arc<dyn DnsOverHttps>,
    tag: &ConnTag,
) -> Result<(), RelayError> {
    let mut framer = UdpFramer::new();
    framer.push(residual);

    let semaphore = Arc::new(Semaphore::new(DOH_MAX_IN_FLIGHT));
    let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(DOH_MAX_IN_FLIGHT);
    // Workers are aborted when this set drops, which is what cancels
    // in-flight resolver calls when the client goes away.
    let mut workers: JoinSet<()> = JoinSet::new();

    spawn_queries(&mut framer, doh, &semaphore, &reply_tx, &mut workers, tag)
        .map_err(|e| RelayError::Protocol(e.to_string()))?;

    let mut response_pending = true;
    let mut read_buf = allocate_vec::<u8>(4096);

    loop {
        tokio::select! {
            result = client.read(&mut read_buf) => match result {
                Ok(0) => {
                    framer
                        .finish()
                        .map_err(|e| RelayError::Protocol(e.to_string()))?;
                    debug!("[{tag}] client closed dns session");
                    return Ok(());
                }
                Ok(n) => {
                    framer.push(&read_buf[..n]);
                    spawn_queries(&mut framer, doh, &semaphore, &reply_tx, &mut workers, tag)
                        .map_err(|e| RelayError::Protocol(e.to_string()))?;
                }
                Err(e) => return Err(classify_client_error(e)),
            },
            maybe_reply = reply_rx.recv() => {
                // The channel cannot be closed while reply_tx is alive here.
                let reply = maybe_reply
                    .ok_or_else(|| RelayError::Internal("reply channel closed".to_string()))?;
                let framed = encode_datagram(&reply)
                    .map_err(|e| RelayError::Internal(e.to_string()))?;
                let mut out = Vec::with_capacity(2 + framed.len());
                if response_pending {
                    out.extend_from_slice(&response_header(version));
                    response_pending = false;
                }
                out.extend_from_slice(&framed);
                client.write_all(&out).await.map_err(RelayError::Client)?;
                client.flush().await.map_err(RelayError::Client)?;
            },
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        return Err(RelayError::Internal(format!("dns worker panicked: {e}")));
                    }
                }
            },
        }
    }
}

/// Drains complete datagrams out of the framer, one resolver call each. The
/// semaphore keeps at most `DOH_MAX_IN_FLIGHT` calls active; later datagrams
/// queue on it inside their worker without stalling the read loop. Failed
/// lookups are logged and produce no reply, which DNS clients already
/// handle by retrying.
fn spawn_queries(
    framer: &mut UdpFramer,
    doh: &Arc<dyn DnsOverHttps>,
    semaphore: &Arc<Semaphore>,
    reply_tx: &mpsc::Sender<Bytes>,
    workers: &mut JoinSet<()>,
    tag: &ConnTag,
) -> std::io::Result<()> {
    while let Some(datagram) = framer.next_datagram()? {
        let doh = doh.clone();
        let semaphore = semaphore.clone();
        let reply_tx = reply_tx.clone();
        let tag = tag.to_string();
        workers.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match doh.query(&datagram).await {
                // A send error means the session ended; the reply is moot.
                Ok(reply) => {
                    let _ = reply_tx.send(reply).await;
                }
                Err(e) => warn!("[{tag}] dns query failed: {e}"),
            }
        });
    }
    Ok(())
}

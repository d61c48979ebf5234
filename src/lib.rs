//! wless - a VLESS-over-WebSocket relay.
//!
//! Clients upgrade an HTTP/1.1 connection to a WebSocket, embed VLESS
//! framing in binary messages, and have this server open TCP connections on
//! their behalf; UDP is supported for DNS only, emulated over DNS-over-HTTPS.
//! TLS is expected to be terminated by the hosting platform in front of the
//! server.

pub mod address;
pub mod async_stream;
pub mod config;
pub mod conn_tag;
pub mod copy_bidirectional;
pub mod dialer;
pub mod doh;
pub mod early_data;
pub mod error;
pub mod http_server;
pub mod landing;
pub mod relay;
pub mod stream_reader;
pub mod udp_framer;
pub mod util;
pub mod uuid_util;
pub mod vless;
pub mod websocket;

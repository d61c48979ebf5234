mod handshake;
mod stream;

pub use handshake::{accept_websocket, HandshakeRequest};
pub use stream::WebsocketStream;

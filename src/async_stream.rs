use tokio::io::{AsyncRead, AsyncWrite};

/// Marker for the byte streams that flow through the relay: the framed
/// WebSocket stream on the client side, TCP sockets and test doubles on the
/// upstream side.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> AsyncStream for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

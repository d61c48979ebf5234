use std::net::SocketAddr;

/// Correlation tag prefixed to every log line a connection emits: client
/// address, transport branch, and a random nonce so interleaved lines from
/// connections sharing a source address stay distinguishable.
#[derive(Debug, Clone)]
pub struct ConnTag {
    peer: SocketAddr,
    transport: &'static str,
    nonce: u32,
}

impl ConnTag {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            transport: "ws",
            nonce: rand::random(),
        }
    }

    /// Called once the VLESS header is parsed and the branch is known.
    pub fn set_transport(&mut self, transport: &'static str) {
        self.transport = transport;
    }
}

impl std::fmt::Display for ConnTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}/{:08x}",
            self.peer.ip(),
            self.peer.port(),
            self.transport,
            self.nonce
        )
    }
}

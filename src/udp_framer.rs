/// Length-delimited datagram framing for the DNS sub-channel. Inbound bytes
/// carry a big-endian u16 length ahead of each datagram; outbound datagrams
/// get the same prefix re-attached.
///
/// The decoder consumes a contiguous byte stream: push whatever arrived,
/// then drain complete datagrams. Several datagrams may share one push, and
/// a datagram split across pushes is reassembled. A zero-length record is a
/// framing error, and `finish` reports truncation when the client closed
/// mid-datagram.
pub struct UdpFramer {
    buf: Vec<u8>,
}

impl UdpFramer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete datagram, or `None` when more bytes are
    /// needed.
    pub fn next_datagram(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let length = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if length == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "zero-length datagram",
            ));
        }
        let total = 2 + length;
        if self.buf.len() < total {
            return Ok(None);
        }
        let datagram = self.buf[2..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(datagram))
    }

    /// Called at end of stream: leftover bytes mean the peer closed in the
    /// middle of a record.
    pub fn finish(&self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended mid-datagram ({} bytes left)", self.buf.len()),
            ))
        }
    }
}

/// Prefix an outbound datagram with its big-endian u16 length.
pub fn encode_datagram(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "datagram too large",
        ));
    }
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

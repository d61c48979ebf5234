use tokio::io::{AsyncRead, AsyncReadExt};

/// Buffered reader used to parse the HTTP request head without losing bytes
/// that arrive after it. Whatever is left over after parsing belongs to the
/// next protocol layer and is handed off through `unparsed_data`.
pub struct StreamReader {
    buf: Vec<u8>,
    start_offset: usize,
    end_offset: usize,
}

const DEFAULT_BUFFER_SIZE: usize = 8192;

impl StreamReader {
    pub fn new() -> Self {
        Self::new_with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn new_with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buf: vec![0u8; buffer_size],
            start_offset: 0,
            end_offset: 0,
        }
    }

    fn buffered_len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    fn compact(&mut self) {
        if self.start_offset > 0 {
            self.buf.copy_within(self.start_offset..self.end_offset, 0);
            self.end_offset -= self.start_offset;
            self.start_offset = 0;
        }
    }

    async fn fill<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> std::io::Result<()> {
        if self.end_offset == self.buf.len() {
            self.compact();
            if self.end_offset == self.buf.len() {
                return Err(std::io::Error::other("stream reader buffer exhausted"));
            }
        }
        let n = stream.read(&mut self.buf[self.end_offset..]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected eof while reading stream",
            ));
        }
        self.end_offset += n;
        Ok(())
    }

    /// Reads a single CRLF- or LF-terminated line, without the terminator.
    pub async fn read_line<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> std::io::Result<String> {
        loop {
            let buffered = &self.buf[self.start_offset..self.end_offset];
            if let Some(pos) = buffered.iter().position(|&b| b == b'\n') {
                let mut line_bytes = &buffered[..pos];
                if line_bytes.ends_with(b"\r") {
                    line_bytes = &line_bytes[..line_bytes.len() - 1];
                }
                let line = std::str::from_utf8(line_bytes)
                    .map_err(|e| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("invalid utf8 in line: {e}"),
                        )
                    })?
                    .to_string();
                self.start_offset += pos + 1;
                if self.start_offset == self.end_offset {
                    self.start_offset = 0;
                    self.end_offset = 0;
                }
                return Ok(line);
            }
            self.fill(stream).await?;
        }
    }

    pub async fn read_u8<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> std::io::Result<u8> {
        while self.buffered_len() < 1 {
            self.fill(stream).await?;
        }
        let b = self.buf[self.start_offset];
        self.start_offset += 1;
        if self.start_offset == self.end_offset {
            self.start_offset = 0;
            self.end_offset = 0;
        }
        Ok(b)
    }

    /// Bytes that were read off the stream but not consumed by the parser.
    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf[self.start_offset..self.end_offset]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_line_crlf() {
        let mut stream = Cursor::new(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nrest".to_vec());
        let mut reader = StreamReader::new();
        assert_eq!(reader.read_line(&mut stream).await.unwrap(), "GET / HTTP/1.1");
        assert_eq!(reader.read_line(&mut stream).await.unwrap(), "Host: x");
        assert_eq!(reader.read_line(&mut stream).await.unwrap(), "");
        assert_eq!(reader.unparsed_data(), b"rest");
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let mut stream = Cursor::new(b"no terminator".to_vec());
        let mut reader = StreamReader::new();
        assert!(reader.read_line(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_read_u8() {
        let mut stream = Cursor::new(vec![7u8, 8u8]);
        let mut reader = StreamReader::new();
        assert_eq!(reader.read_u8(&mut stream).await.unwrap(), 7);
        assert_eq!(reader.read_u8(&mut stream).await.unwrap(), 8);
    }
}

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use log::warn;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::async_stream::AsyncStream;
use crate::util::allocate_vec;

const UNPROCESSED_BUF_SIZE: usize = 16384;
const WRITE_FRAME_BUF_SIZE: usize = 32768;
// RFC 6455: control frame payloads are at most 125 bytes.
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Server side of a WebSocket connection, surfaced as a plain byte stream.
///
/// Reads deframe binary messages (masked or not - some clients send unmasked
/// frames despite the RFC), answer pings with pongs, and turn an incoming
/// close frame into EOF. A text frame is an error: this endpoint only ever
/// carries a binary tunnel. Writes are packed into unmasked binary frames;
/// `send_close` emits a status-coded close frame, and a plain shutdown sends
/// a normal-closure close frame first if none has been sent.
pub struct WebsocketStream<S> {
    stream: S,
    pending_initial_data: bool,

    read_state: ReadState,
    read_frame_masked: bool,
    read_frame_opcode: OpCode,
    read_frame_length: u64,
    read_frame_mask: [u8; 4],
    read_frame_mask_offset: usize,
    close_received: bool,

    unprocessed_buf: Box<[u8]>,
    unprocessed_start_offset: usize,
    unprocessed_end_offset: usize,

    write_frame: Box<[u8]>,
    write_frame_start_offset: usize,
    write_frame_end_offset: usize,
    close_sent: bool,

    ping_data: Box<[u8]>,
    ping_data_size: usize,
    pending_write_pong: bool,
}

#[derive(Debug, PartialEq)]
enum ReadState {
    Init,
    ReadLength { length_bytes_len: usize },
    ReadMask,
    ReadBinaryContent,
    ReadPingContent,
    SkipContent,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Unknown(u8),
}

impl OpCode {
    fn from(code: u8) -> Self {
        match code {
            0 => OpCode::Continue,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            _ => OpCode::Unknown(code),
        }
    }
}

impl<S: AsyncStream> WebsocketStream<S> {
    /// `unprocessed_data` carries bytes that arrived together with the HTTP
    /// upgrade request and already belong to the framed stream.
    pub fn new(stream: S, unprocessed_data: &[u8]) -> Self {
        let mut unprocessed_buf = allocate_vec(UNPROCESSED_BUF_SIZE).into_boxed_slice();
        let mut unprocessed_end_offset = 0;
        let write_frame = allocate_vec(WRITE_FRAME_BUF_SIZE).into_boxed_slice();
        let ping_data = allocate_vec(MAX_CONTROL_PAYLOAD).into_boxed_slice();

        let pending_initial_data = if !unprocessed_data.is_empty() {
            unprocessed_buf[0..unprocessed_data.len()].copy_from_slice(unprocessed_data);
            unprocessed_end_offset = unprocessed_data.len();
            true
        } else {
            false
        };

        Self {
            stream,
            pending_initial_data,
            read_state: ReadState::Init,
            read_frame_masked: false,
            read_frame_opcode: OpCode::Unknown(99),
            read_frame_length: 0,
            read_frame_mask: [0u8; 4],
            read_frame_mask_offset: 0,
            close_received: false,
            unprocessed_buf,
            unprocessed_start_offset: 0,
            unprocessed_end_offset,
            write_frame,
            write_frame_start_offset: 0,
            write_frame_end_offset: 0,
            close_sent: false,
            ping_data,
            ping_data_size: 0,
            pending_write_pong: false,
        }
    }

    /// Sends a close frame carrying `code` and flushes it. Safe to call more
    /// than once; only the first call emits a frame.
    pub async fn send_close(&mut self, code: u16) -> std::io::Result<()> {
        if self.close_sent {
            return Ok(());
        }
        self.flush().await?;
        self.close_sent = true;
        let written = pack_frame(
            0x08,
            &code.to_be_bytes(),
            &mut self.write_frame[self.write_frame_end_offset..],
        );
        self.write_frame_end_offset += written;
        self.flush().await
    }

    fn step_init(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> std::io::Result<()> {
        let unprocessed_len = self.unprocessed_end_offset - self.unprocessed_start_offset;
        if unprocessed_len < 2 {
            return Ok(());
        }

        let first = self.unprocessed_buf[self.unprocessed_start_offset];
        let second = self.unprocessed_buf[self.unprocessed_start_offset + 1];
        self.unprocessed_start_offset += 2;
        if self.unprocessed_start_offset == self.unprocessed_end_offset {
            self.unprocessed_start_offset = 0;
            self.unprocessed_end_offset = 0;
        }

        let read_frame_final = first & 0x80 != 0;

        // Clients are required to mask, but some (shadowrocket) send
        // unmasked frames at times, so accept both.
        self.read_frame_masked = second & 0x80 != 0;

        self.read_frame_opcode = OpCode::from(first & 0x0f);

        if self.read_frame_opcode == OpCode::Text {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "text frame on binary tunnel",
            ));
        }

        if !read_frame_final
            && self.read_frame_opcode != OpCode::Binary
            && self.read_frame_opcode != OpCode::Continue
        {
            return Err(std::io::Error::other(format!(
                "cannot handle non-final frames of type {:?}",
                self.read_frame_opcode
            )));
        }

        let length = second & 0x7f;

        if length == 126 {
            self.read_state = ReadState::ReadLength {
                length_bytes_len: 2,
            };
            self.step_read_length(cx, buf, 2)
        } else if length == 127 {
            self.read_state = ReadState::ReadLength {
                length_bytes_len: 8,
            };
            self.step_read_length(cx, buf, 8)
        } else {
            self.read_frame_length = length as u64;
            if self.read_frame_masked {
                self.read_state = ReadState::ReadMask;
                self.step_read_mask(cx, buf)
            } else {
                self.step_check_content(cx, buf)
            }
        }
    }

    fn step_read_length(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
        length_bytes_len: usize,
    ) -> std::io::Result<()> {
        let unprocessed_len = self.unprocessed_end_offset - self.unprocessed_start_offset;
        if unprocessed_len < length_bytes_len {
            return Ok(());
        }

        let length_bytes = &self.unprocessed_buf
            [self.unprocessed_start_offset..self.unprocessed_start_offset + length_bytes_len];
        self.unprocessed_start_offset += length_bytes_len;
        if self.unprocessed_start_offset == self.unprocessed_end_offset {
            self.unprocessed_start_offset = 0;
            self.unprocessed_end_offset = 0;
        }

        let mut length = 0u64;
        for b in length_bytes {
            length = (length << 8) | (*b as u64);
        }
        self.read_frame_length = length;

        if self.read_frame_length > 0x7fffffffffffffffu64 {
            return Err(std::io::Error::other(format!(
                "invalid frame length ({})",
                self.read_frame_length
            )));
        }

        if self.read_frame_masked {
            self.read_state = ReadState::ReadMask;
            self.step_read_mask(cx, buf)
        } else {
            self.step_check_content(cx, buf)
        }
    }

    fn step_read_mask(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::io::Result<()> {
        let unprocessed_len = self.unprocessed_end_offset - self.unprocessed_start_offset;
        if unprocessed_len < 4 {
            return Ok(());
        }

        let mask_bytes =
            &self.unprocessed_buf[self.unprocessed_start_offset..self.unprocessed_start_offset + 4];
        self.read_frame_mask.copy_from_slice(mask_bytes);

        self.unprocessed_start_offset += 4;
        if self.unprocessed_start_offset == self.unprocessed_end_offset {
            self.unprocessed_start_offset = 0;
            self.unprocessed_end_offset = 0;
        }

        self.step_check_content(cx, buf)
    }

    fn step_check_content(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::io::Result<()> {
        match self.read_frame_opcode {
            OpCode::Binary | OpCode::Continue => {
                if self.read_frame_length == 0 {
                    self.read_state = ReadState::Init;
                    self.step_init(cx, buf)
                } else {
                    self.read_state = ReadState::ReadBinaryContent;
                    self.step_read_binary_content(cx, buf)
                }
            }
            OpCode::Close => {
                // The peer is done. Whatever payload the close frame carries
                // is irrelevant; reads turn into EOF from here on.
                self.close_received = true;
                Ok(())
            }
            OpCode::Ping => {
                self.ping_data_size = 0;

                if self.read_frame_length == 0 {
                    self.read_state = ReadState::Init;
                    self.pending_write_pong = true;
                    self.step_init(cx, buf)
                } else {
                    if self.read_frame_length as usize > self.ping_data.len() {
                        return Err(std::io::Error::other(format!(
                            "cannot handle ping data length ({})",
                            self.read_frame_length
                        )));
                    }

                    // Make sure we aren't writing pongs while reading new ping data.
                    self.pending_write_pong = false;
                    self.read_state = ReadState::ReadPingContent;
                    self.step_read_ping_content(cx, buf)
                }
            }
            OpCode::Pong => {
                // We never send pings, but don't punish a peer for being
                // chatty - skip any payload.
                if self.read_frame_length == 0 {
                    self.read_state = ReadState::Init;
                    self.step_init(cx, buf)
                } else {
                    self.read_state = ReadState::SkipContent;
                    self.step_skip_content(cx, buf)
                }
            }
            _ => {
                warn!("Ignoring unknown frame type: {:?}", self.read_frame_opcode);
                if self.read_frame_length == 0 {
                    self.read_state = ReadState::Init;
                    self.step_init(cx, buf)
                } else {
                    self.read_state = ReadState::SkipContent;
                    self.step_skip_content(cx, buf)
                }
            }
        }
    }

    fn step_skip_content(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::io::Result<()> {
        if self.read_frame_length > 0 {
            let unprocessed_len = self.unprocessed_end_offset - self.unprocessed_start_offset;
            let skip_amount = std::cmp::min(unprocessed_len as u64, self.read_frame_length);
            self.unprocessed_start_offset += skip_amount as usize;
            if self.unprocessed_start_offset == self.unprocessed_end_offset {
                self.unprocessed_start_offset = 0;
                self.unprocessed_end_offset = 0;
            }
            self.read_frame_length -= skip_amount;
            if self.read_frame_length > 0 {
                return Ok(());
            }
        }

        self.read_state = ReadState::Init;
        self.step_init(cx, buf)
    }

    fn step_read_ping_content(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::io::Result<()> {
        let unprocessed_len = self.unprocessed_end_offset - self.unprocessed_start_offset;
        let read_amount = std::cmp::min(unprocessed_len, self.read_frame_length as usize);
        if read_amount == 0 {
            return Ok(());
        }

        let content_bytes = &mut self.unprocessed_buf
            [self.unprocessed_start_offset..self.unprocessed_start_offset + read_amount];
        if self.read_frame_masked {
            let iter = content_bytes.iter_mut().zip(
                self.read_frame_mask
                    .iter()
                    .cycle()
                    .skip(self.read_frame_mask_offset),
            );
            for (byte, &key) in iter {
                *byte ^= key
            }
            self.read_frame_mask_offset = (self.read_frame_mask_offset + read_amount) % 4;
        }

        self.ping_data[self.ping_data_size..self.ping_data_size + read_amount]
            .copy_from_slice(content_bytes);
        self.ping_data_size += read_amount;
        self.read_frame_length -= read_amount as u64;

        self.unprocessed_start_offset += read_amount;
        if self.unprocessed_start_offset == self.unprocessed_end_offset {
            self.unprocessed_start_offset = 0;
            self.unprocessed_end_offset = 0;
        }

        if self.read_frame_length == 0 {
            self.read_frame_mask_offset = 0;
            self.read_state = ReadState::Init;
            // The pong is only packed once poll_write runs; there's nothing
            // to flush it against until then anyway.
            self.pending_write_pong = true;
            return self.step_init(cx, buf);
        }

        Ok(())
    }

    fn step_read_binary_content(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::io::Result<()> {
        let unprocessed_len = self.unprocessed_end_offset - self.unprocessed_start_offset;

        let available_space = buf.remaining();
        if available_space == 0 {
            // it's possible to loop through all the steps and end up reading
            // content with no output space left.
            return Ok(());
        }

        let read_amount = std::cmp::min(
            std::cmp::min(unprocessed_len, self.read_frame_length as usize),
            available_space,
        );

        if read_amount == 0 {
            return Ok(());
        }

        let content_bytes = &mut self.unprocessed_buf
            [self.unprocessed_start_offset..self.unprocessed_start_offset + read_amount];
        if self.read_frame_masked {
            let iter = content_bytes.iter_mut().zip(
                self.read_frame_mask
                    .iter()
                    .cycle()
                    .skip(self.read_frame_mask_offset),
            );
            for (byte, &key) in iter {
                *byte ^= key
            }
            self.read_frame_mask_offset = (self.read_frame_mask_offset + read_amount) % 4;
        }

        buf.put_slice(content_bytes);

        self.unprocessed_start_offset += read_amount;
        if self.unprocessed_start_offset == self.unprocessed_end_offset {
            self.unprocessed_start_offset = 0;
            self.unprocessed_end_offset = 0;
        }

        self.read_frame_length -= read_amount as u64;
        if self.read_frame_length == 0 {
            self.read_frame_mask_offset = 0;
            self.read_state = ReadState::Init;
            // Keep draining: the buffer may hold further complete frames,
            // and nothing would wake us for them once we return.
            return self.step_init(cx, buf);
        }

        Ok(())
    }

    fn pack_write_pong_frame(&mut self) -> bool {
        let available_space = self.write_frame.len() - self.write_frame_end_offset;

        // up to 10 bytes of frame header
        if available_space < self.ping_data_size + 10 {
            return false;
        }

        let written = pack_frame(
            0x0a,
            &self.ping_data[0..self.ping_data_size],
            &mut self.write_frame[self.write_frame_end_offset..],
        );
        self.write_frame_end_offset += written;

        true
    }

    fn pack_write_frame(&mut self, input: &[u8]) -> usize {
        let available_space = self.write_frame.len() - self.write_frame_end_offset;

        if available_space < 40 {
            return 0;
        }

        let pack_amount = std::cmp::min(input.len(), available_space - 10);

        // 0x02 is binary
        let written = pack_frame(
            0x02,
            &input[0..pack_amount],
            &mut self.write_frame[self.write_frame_end_offset..],
        );
        self.write_frame_end_offset += written;

        pack_amount
    }

    fn do_write_frame(&mut self, cx: &mut Context<'_>) -> std::io::Result<()> {
        loop {
            let remaining_data =
                &self.write_frame[self.write_frame_start_offset..self.write_frame_end_offset];

            match Pin::new(&mut self.stream).poll_write(cx, remaining_data) {
                Poll::Ready(Ok(written)) => {
                    if written == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "write frame eof",
                        ));
                    }
                    self.write_frame_start_offset += written;
                    if self.write_frame_start_offset == self.write_frame_end_offset {
                        self.write_frame_start_offset = 0;
                        self.write_frame_end_offset = 0;
                        break;
                    }
                }
                Poll::Ready(Err(e)) => {
                    return Err(e);
                }
                Poll::Pending => {
                    break;
                }
            }
        }

        Ok(())
    }

    fn reset_unprocessed_buf_offset(&mut self) {
        assert!(
            self.unprocessed_start_offset > 0
                && self.unprocessed_end_offset > self.unprocessed_start_offset
        );

        self.unprocessed_buf.copy_within(
            self.unprocessed_start_offset..self.unprocessed_end_offset,
            0,
        );
        self.unprocessed_end_offset -= self.unprocessed_start_offset;
        self.unprocessed_start_offset = 0;
    }
}

impl<S: AsyncStream> AsyncRead for WebsocketStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.close_received {
            return Poll::Ready(Ok(()));
        }

        // If there is unprocessed data and we are reading content, the
        // previous `buf` ran out of space mid-frame.
        if this.unprocessed_end_offset > 0 && this.read_state == ReadState::ReadBinaryContent {
            let read_result = this.step_read_binary_content(cx, buf);
            if read_result.is_err() {
                return Poll::Ready(read_result);
            }
            if this.close_received || !buf.filled().is_empty() {
                return Poll::Ready(Ok(()));
            }
        }

        loop {
            // Reset the offset if we have less than half the buffer left to use.
            if this.unprocessed_start_offset * 2 > this.unprocessed_buf.len() {
                this.reset_unprocessed_buf_offset();
            }

            // We need to go through the read_state cycle once if we have
            // initial data, even if poll_read returns pending.
            if !this.pending_initial_data {
                assert!(this.unprocessed_end_offset < this.unprocessed_buf.len());

                let mut read_buf =
                    ReadBuf::new(&mut this.unprocessed_buf[this.unprocessed_end_offset..]);

                match Pin::new(&mut this.stream).poll_read(cx, &mut read_buf) {
                    Poll::Ready(res) => {
                        res?;
                        let len = read_buf.filled().len();
                        if len == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        this.unprocessed_end_offset += len;
                    }
                    Poll::Pending => {
                        return Poll::Pending;
                    }
                }
            } else {
                this.pending_initial_data = false;
            }

            let read_result = match this.read_state {
                ReadState::Init => this.step_init(cx, buf),
                ReadState::ReadLength { length_bytes_len } => {
                    this.step_read_length(cx, buf, length_bytes_len)
                }
                ReadState::ReadMask => this.step_read_mask(cx, buf),
                ReadState::SkipContent => this.step_skip_content(cx, buf),
                ReadState::ReadBinaryContent => this.step_read_binary_content(cx, buf),
                ReadState::ReadPingContent => this.step_read_ping_content(cx, buf),
            };

            if read_result.is_err() {
                return Poll::Ready(read_result);
            }

            if this.close_received || !buf.filled().is_empty() {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl<S: AsyncStream> AsyncWrite for WebsocketStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.pending_write_pong {
            if this.pack_write_pong_frame() {
                this.pending_write_pong = false;
            } else {
                // Write and try to make space in the write frame, then try again.
                if let Err(e) = this.do_write_frame(cx) {
                    return Poll::Ready(Err(e));
                }
                if this.pack_write_pong_frame() {
                    this.pending_write_pong = false;
                } else {
                    return Poll::Pending;
                }
            }
        }

        let mut written = 0;
        loop {
            let input = &buf[written..];
            if input.is_empty() {
                break;
            }

            written += this.pack_write_frame(input);

            if let Err(e) = this.do_write_frame(cx) {
                return Poll::Ready(Err(e));
            }

            if this.write_frame_end_offset > 0 {
                // Not everything could be written.
                break;
            }
        }

        if written > 0 {
            Poll::Ready(Ok(written))
        } else {
            Poll::Pending
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.write_frame_end_offset == 0 {
            return Pin::new(&mut this.stream).poll_flush(cx);
        }

        while this.write_frame_end_offset > 0 {
            match this.do_write_frame(cx) {
                Ok(()) => {
                    if this.write_frame_end_offset > 0 {
                        return Poll::Pending;
                    }
                }
                Err(e) => {
                    return Poll::Ready(Err(e));
                }
            }
            ready!(Pin::new(&mut this.stream).poll_flush(cx))?;
        }

        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();

        // A tunnel that ends without an error gets a normal-closure frame.
        if !this.close_sent {
            let available_space = this.write_frame.len() - this.write_frame_end_offset;
            if available_space < 10 {
                if let Err(e) = this.do_write_frame(cx) {
                    return Poll::Ready(Err(e));
                }
                if this.write_frame.len() - this.write_frame_end_offset < 10 {
                    return Poll::Pending;
                }
            }
            this.close_sent = true;
            let written = pack_frame(
                0x08,
                &1000u16.to_be_bytes(),
                &mut this.write_frame[this.write_frame_end_offset..],
            );
            this.write_frame_end_offset += written;
        }

        while this.write_frame_end_offset > 0 {
            if let Err(e) = this.do_write_frame(cx) {
                return Poll::Ready(Err(e));
            }
            if this.write_frame_end_offset > 0 {
                return Poll::Pending;
            }
        }

        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

#[inline]
fn pack_frame(opcode: u8, input: &[u8], output: &mut [u8]) -> usize {
    let input_len = input.len();

    // 0x80 is final. Server frames are never masked.
    output[0] = opcode | 0x80;

    let offset = if input_len < 126 {
        output[1] = input_len as u8;
        2
    } else if input_len <= 65535 {
        output[1] = 0x7e;
        let size_bytes = (input_len as u16).to_be_bytes();
        output[2..4].copy_from_slice(&size_bytes);
        4
    } else {
        output[1] = 0x7f;
        let size_bytes = (input_len as u64).to_be_bytes();
        output[2..10].copy_from_slice(&size_bytes);
        10
    };

    if input_len > 0 {
        output[offset..offset + input_len].copy_from_slice(input);
    }

    offset + input_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn client_frame(opcode: u8, mask: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![opcode | 0x80];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            frame.push(0x80 | 0x7e);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(
            payload
                .iter()
                .zip(mask.iter().cycle())
                .map(|(b, m)| b ^ m),
        );
        frame
    }

    #[tokio::test]
    async fn test_read_masked_binary_frame() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        remote
            .write_all(&client_frame(0x02, [1, 2, 3, 4], b"hello"))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = ws.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_unmasked_binary_frame() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        remote.write_all(&[0x82, 3, 9, 8, 7]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = ws.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[9, 8, 7]);
    }

    #[tokio::test]
    async fn test_initial_data_is_deframed() {
        let (_remote, local) = tokio::io::duplex(4096);
        let frame = client_frame(0x02, [9, 9, 9, 9], b"early");
        let mut ws = WebsocketStream::new(local, &frame);

        let mut buf = [0u8; 16];
        let n = ws.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"early");
    }

    #[tokio::test]
    async fn test_text_frame_is_an_error() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        remote
            .write_all(&client_frame(0x01, [1, 2, 3, 4], b"nope"))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert!(ws.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_close_frame_reads_as_eof() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        remote
            .write_all(&client_frame(0x08, [1, 2, 3, 4], &1000u16.to_be_bytes()))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(ws.read(&mut buf).await.unwrap(), 0);
        // EOF is sticky
        assert_eq!(ws.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_packs_unmasked_binary_frame() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        ws.write_all(b"abc").await.unwrap();
        ws.flush().await.unwrap();

        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x82, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        let mut bytes = client_frame(0x09, [5, 6, 7, 8], b"pingpayload");
        bytes.extend_from_slice(&client_frame(0x02, [1, 1, 1, 1], b"data"));
        remote.write_all(&bytes).await.unwrap();

        let mut buf = [0u8; 16];
        let n = ws.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");

        // The pong goes out with the next write.
        ws.write_all(b"x").await.unwrap();
        ws.flush().await.unwrap();

        let mut out = [0u8; 32];
        let n = remote.read(&mut out).await.unwrap();
        let mut expected = vec![0x8a, 11];
        expected.extend_from_slice(b"pingpayload");
        expected.extend_from_slice(&[0x82, 1, b'x']);
        assert_eq!(&out[..n], expected.as_slice());
    }

    #[tokio::test]
    async fn test_send_close_emits_status_code() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        ws.send_close(1008).await.unwrap();
        // Second call is a no-op.
        ws.send_close(1000).await.unwrap();

        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x88, 2, 0x03, 0xf0]);
    }

    #[tokio::test]
    async fn test_shutdown_sends_normal_close() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        ws.shutdown().await.unwrap();

        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x88, 2, 0x03, 0xe8]);
    }

    #[tokio::test]
    async fn test_two_frames_in_one_segment_drain_without_more_data() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        let mut bytes = client_frame(0x02, [1, 2, 3, 4], b"one");
        bytes.extend_from_slice(&client_frame(0x02, [5, 6, 7, 8], b"two"));
        remote.write_all(&bytes).await.unwrap();

        // Both frames must surface even though the peer sends nothing more.
        let mut collected = Vec::new();
        while collected.len() < 6 {
            let mut buf = [0u8; 4];
            let n = ws.read(&mut buf).await.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"onetwo");
    }

    #[tokio::test]
    async fn test_fragmented_binary_message() {
        let (mut remote, local) = tokio::io::duplex(4096);
        let mut ws = WebsocketStream::new(local, &[]);

        // Non-final binary frame followed by a final continuation.
        let mut first = client_frame(0x02, [1, 2, 3, 4], b"par");
        first[0] &= 0x7f; // clear FIN
        let second = client_frame(0x00, [4, 3, 2, 1], b"tial");
        remote.write_all(&first).await.unwrap();
        remote.write_all(&second).await.unwrap();

        let mut collected = Vec::new();
        while collected.len() < 7 {
            let mut buf = [0u8; 16];
            let n = ws.read(&mut buf).await.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"partial");
    }
}

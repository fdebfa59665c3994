//! Decoder for `aws-chunked` request bodies.
//!
//! SDKs that sign streaming uploads frame the body as
//!
//! ```text
//! <hex-size>;chunk-signature=<sig>\r\n<data>\r\n ... 0;chunk-signature=<sig>\r\n[trailers]\r\n
//! ```
//!
//! The decoder strips the framing and yields only the payload.  Chunk
//! signatures are not checked.

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use std::io;

use crate::storage::backend::ByteStream;

/// Longest chunk header line accepted before giving up.
const MAX_HEADER_LINE: usize = 4096;

enum Phase {
    Header,
    Data(u64),
    DataEnd,
    Done,
}

struct Decoder {
    inner: ByteStream,
    buf: BytesMut,
    phase: Phase,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("aws-chunked: {msg}"))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

impl Decoder {
    async fn next_payload(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.phase {
                Phase::Done => return Ok(None),
                Phase::Header => {
                    if let Some(pos) = find_crlf(&self.buf) {
                        let line = self.buf.split_to(pos + 2);
                        let header = std::str::from_utf8(&line[..pos])
                            .map_err(|_| invalid("non-ascii chunk header"))?;
                        let size_hex = header.split(';').next().unwrap_or("").trim();
                        let size = u64::from_str_radix(size_hex, 16)
                            .map_err(|_| invalid("bad chunk size"))?;
                        // Trailers after the final chunk are ignored.
                        self.phase = if size == 0 { Phase::Done } else { Phase::Data(size) };
                        continue;
                    }
                    if self.buf.len() > MAX_HEADER_LINE {
                        return Err(invalid("chunk header too long"));
                    }
                }
                Phase::Data(remaining) => {
                    if !self.buf.is_empty() {
                        let take = remaining.min(self.buf.len() as u64) as usize;
                        let payload = self.buf.split_to(take).freeze();
                        let left = remaining - take as u64;
                        self.phase = if left == 0 { Phase::DataEnd } else { Phase::Data(left) };
                        return Ok(Some(payload));
                    }
                }
                Phase::DataEnd => {
                    if self.buf.len() >= 2 {
                        if &self.buf[..2] != b"\r\n" {
                            return Err(invalid("missing CRLF after chunk data"));
                        }
                        self.buf.advance(2);
                        self.phase = Phase::Header;
                        continue;
                    }
                }
            }

            match self.inner.next().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk?),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "aws-chunked: body ended before the final chunk",
                    ))
                }
            }
        }
    }
}

/// Wrap an `aws-chunked` framed stream so it yields the decoded payload.
pub fn decode(inner: ByteStream) -> ByteStream {
    let decoder = Decoder {
        inner,
        buf: BytesMut::new(),
        phase: Phase::Header,
    };
    Box::pin(futures::stream::try_unfold(decoder, |mut decoder| async move {
        Ok(decoder.next_payload().await?.map(|payload| (payload, decoder)))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::collect_stream;

    fn split_stream(raw: &'static [u8], piece: usize) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = raw
            .chunks(piece)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(futures::stream::iter(chunks))
    }

    const FRAMED: &[u8] = b"5;chunk-signature=aaaa\r\nHello\r\nd;chunk-signature=bbbb\r\n from Python!\r\n0;chunk-signature=cccc\r\n\r\n";

    #[tokio::test]
    async fn test_decode_whole() {
        let body = collect_stream(decode(split_stream(FRAMED, FRAMED.len()))).await.unwrap();
        assert_eq!(&body[..], b"Hello from Python!");
    }

    #[tokio::test]
    async fn test_decode_across_arbitrary_splits() {
        for piece in [1, 2, 3, 7, 16] {
            let body = collect_stream(decode(split_stream(FRAMED, piece))).await.unwrap();
            assert_eq!(&body[..], b"Hello from Python!", "piece size {piece}");
        }
    }

    #[tokio::test]
    async fn test_decode_with_trailers() {
        const RAW: &[u8] = b"3\r\nabc\r\n0\r\nx-amz-checksum-crc32:AAAAAA==\r\n\r\n";
        let body = collect_stream(decode(split_stream(RAW, 4))).await.unwrap();
        assert_eq!(&body[..], b"abc");
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        const RAW: &[u8] = b"a;chunk-signature=x\r\nshort";
        let err = collect_stream(decode(split_stream(RAW, RAW.len()))).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_bad_framing_is_an_error() {
        const RAW: &[u8] = b"zz\r\nabc\r\n0\r\n\r\n";
        let err = collect_stream(decode(split_stream(RAW, RAW.len()))).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        const NO_CRLF: &[u8] = b"3\r\nabcXX0\r\n\r\n";
        let err = collect_stream(decode(split_stream(NO_CRLF, 5))).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

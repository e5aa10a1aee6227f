//! Verbatim request body forwarding.
//!
//! The body is streamed to the origin as received, framing included; chunked
//! bodies are walked only to find where they end.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::request::BodyFraming;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE_BYTES: u64 = 8 * 1024;

/// Copy the request body described by `framing` from `reader` to `writer`.
///
/// Returns the number of bytes written, framing bytes included.
pub async fn forward_body<R, W>(framing: BodyFraming, reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(0),
        BodyFraming::Length(length) => copy_exact(reader, writer, length).await,
        BodyFraming::Chunked => forward_chunked(reader, writer).await,
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, length: u64) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy_buf(&mut (&mut *reader).take(length), writer).await?;
    if copied < length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("request body ended after {copied} of {length} bytes"),
        ));
    }
    Ok(copied)
}

async fn forward_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0;
    let mut line = Vec::new();

    loop {
        read_line(reader, &mut line).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;

        let size = chunk_size(&line)?;
        if size == 0 {
            break;
        }

        total += copy_exact(reader, writer, size).await?;

        read_line(reader, &mut line).await?;
        if line != b"\r\n" && line != b"\n" {
            return Err(invalid_data("chunk data not followed by CRLF"));
        }
        writer.write_all(&line).await?;
        total += line.len() as u64;
    }

    // Trailer section, ended by an empty line.
    loop {
        read_line(reader, &mut line).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;
        if line == b"\r\n" || line == b"\n" {
            return Ok(total);
        }
    }
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    (&mut *reader).take(MAX_LINE_BYTES).read_until(b'\n', line).await?;
    if line.last() != Some(&b'\n') {
        return Err(if line.len() as u64 >= MAX_LINE_BYTES {
            invalid_data("chunk line too long")
        } else {
            io::Error::new(io::ErrorKind::UnexpectedEof, "chunked body truncated")
        });
    }
    Ok(())
}

/// Parse the hex size at the start of a chunk-size line, ignoring extensions.
fn chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| invalid_data("chunk size is not ASCII"))?;
    let digits = text.split(';').next().unwrap_or("").trim();
    // `from_str_radix` takes a leading `+`.
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid_data("invalid chunk size"));
    }
    u64::from_str_radix(digits, 16).map_err(|_| invalid_data("invalid chunk size"))
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn forward(framing: BodyFraming, input: &[u8]) -> io::Result<(Vec<u8>, Vec<u8>)> {
        let mut reader = BufReader::new(input);
        let mut out = Vec::new();
        let n = forward_body(framing, &mut reader, &mut out).await?;
        assert_eq!(n as usize, out.len());

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await?;
        Ok((out, rest))
    }

    #[tokio::test]
    async fn fixed_length_stops_at_boundary() {
        let (out, rest) = forward(BodyFraming::Length(5), b"helloEXTRA").await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(rest, b"EXTRA");
    }

    #[tokio::test]
    async fn fixed_length_short_body_fails() {
        let err = forward(BodyFraming::Length(10), b"hi").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn no_body_reads_nothing() {
        let (out, rest) = forward(BodyFraming::None, b"next").await.unwrap();
        assert!(out.is_empty());
        assert_eq!(rest, b"next");
    }

    #[tokio::test]
    async fn chunked_body_forwarded_verbatim() {
        let body = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut input = body.to_vec();
        input.extend_from_slice(b"AFTER");

        let (out, rest) = forward(BodyFraming::Chunked, &input).await.unwrap();
        assert_eq!(out, body.to_vec());
        assert_eq!(rest, b"AFTER");
    }

    #[tokio::test]
    async fn chunked_errors() {
        let err = forward(BodyFraming::Chunked, b"zz\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = forward(BodyFraming::Chunked, b"+5\r\nhello\r\n0\r\n\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = forward(BodyFraming::Chunked, b"3\r\nabcX\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = forward(BodyFraming::Chunked, b"3\r\nab").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}

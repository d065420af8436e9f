//! Streaming JSON envelope framing for TCP transport
//!
//! Envelopes are not length-prefixed. The writer emits one JSON object per
//! message followed by a newline; the reader buffers incoming bytes and
//! incrementally parses whole JSON values out of the buffer, so message
//! boundaries come from the JSON structure itself.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::constants::MAX_MESSAGE_SIZE;
use crate::protocol::{Envelope, Message};
use crate::{Error, Result};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Incremental decoder of JSON envelopes from an async byte stream.
///
/// Bytes read past the end of one envelope stay buffered for the next call,
/// so the reader can be handed from the connection classifier to the
/// session read task without losing data.
pub struct EnvelopeReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read the next envelope.
    ///
    /// Returns `Ok(None)` on a clean end of stream between envelopes. A
    /// syntax error leaves the stream unrecoverable and is returned as
    /// `Error::Serialization`.
    pub async fn next(&mut self) -> Result<Option<Envelope>> {
        loop {
            if let Some(envelope) = self.try_parse()? {
                return Ok(Some(envelope));
            }

            if self.buf.len() > MAX_MESSAGE_SIZE {
                return Err(Error::InvalidMessage(format!(
                    "message too large: more than {} bytes buffered",
                    MAX_MESSAGE_SIZE
                )));
            }

            self.buf.reserve(READ_BUF_SIZE);
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Network(
                    "connection closed mid-message".to_string(),
                ));
            }
        }
    }

    fn try_parse(&mut self) -> Result<Option<Envelope>> {
        let start = self.buf.iter().position(|b| !b.is_ascii_whitespace());
        match start {
            None => {
                self.buf.clear();
                return Ok(None);
            }
            Some(n) if n > 0 => {
                self.buf.drain(..n);
            }
            Some(_) => {}
        }

        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Envelope>();
        match stream.next() {
            Some(Ok(envelope)) => {
                let used = stream.byte_offset();
                self.buf.drain(..used);
                Ok(Some(envelope))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(Error::Serialization(e)),
            None => Ok(None),
        }
    }

    /// Number of bytes read from the socket but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Write one message as a newline-terminated JSON envelope and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let mut bytes = message.to_bytes()?;
    bytes.push(b'\n');

    writer.write_all(&bytes).await
        .map_err(|e| Error::Network(e.to_string()))?;

    writer.flush().await
        .map_err(|e| Error::Network(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClipboardData, FileChunkData, MessageType};
    use std::io::Cursor;

    fn clipboard(text: &str) -> Message {
        Message::Clipboard(ClipboardData {
            from_ip: "10.0.0.1".to_string(),
            content: text.to_string(),
            timestamp: 1,
        })
    }

    #[tokio::test]
    async fn test_back_to_back_envelopes() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &clipboard("one")).await.unwrap();
        write_message(&mut buffer, &Message::HeartbeatAck).await.unwrap();
        write_message(&mut buffer, &clipboard("two")).await.unwrap();

        let mut reader = EnvelopeReader::new(Cursor::new(buffer));
        let first = reader.next().await.unwrap().unwrap().into_message().unwrap();
        let second = reader.next().await.unwrap().unwrap();
        let third = reader.next().await.unwrap().unwrap().into_message().unwrap();

        assert_eq!(first, clipboard("one"));
        assert_eq!(second.kind, MessageType::HeartbeatAck.as_str());
        assert_eq!(third, clipboard("two"));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_envelopes_without_separator() {
        let input = br#"{"type":"heartbeat_ack"}{"type":"shutdown"}"#.to_vec();
        let mut reader = EnvelopeReader::new(Cursor::new(input));

        assert_eq!(reader.next().await.unwrap().unwrap().kind, "heartbeat_ack");
        assert_eq!(reader.next().await.unwrap().unwrap().kind, "shutdown");
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_envelope_split_across_reads() {
        let msg = Message::FileChunkData(FileChunkData {
            file_id: "abc".to_string(),
            chunk_index: 0,
            data: vec![7u8; 200_000],
        });
        let mut bytes = msg.to_bytes().unwrap();
        bytes.push(b'\n');
        let (head, tail) = bytes.split_at(1000);

        let mock = tokio_test::io::Builder::new()
            .read(head)
            .read(tail)
            .build();

        let mut reader = EnvelopeReader::new(mock);
        let decoded = reader.next().await.unwrap().unwrap().into_message().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_does_not_break_stream() {
        let input = br#"{"type":"future_thing","data":{"x":1}}
{"type":"heartbeat_ack"}"#
            .to_vec();
        let mut reader = EnvelopeReader::new(Cursor::new(input));

        let unknown = reader.next().await.unwrap().unwrap();
        assert!(matches!(unknown.into_message(), Err(Error::UnknownMessageType(_))));
        let ack = reader.next().await.unwrap().unwrap().into_message().unwrap();
        assert_eq!(ack, Message::HeartbeatAck);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let input = br#"{"type":"clipboard","data":{"#.to_vec();
        let mut reader = EnvelopeReader::new(Cursor::new(input));
        assert!(reader.next().await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_is_a_decode_error() {
        let input = b"hello there\n".to_vec();
        let mut reader = EnvelopeReader::new(Cursor::new(input));
        assert!(matches!(reader.next().await, Err(Error::Serialization(_))));
    }
}

//! Newline-delimited message framing codec.
//!
//! Messages are framed as one line of UTF-8 text terminated by `\n`. The read
//! buffer carries unterminated bytes across reads, so frames may arrive split
//! at arbitrary points.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_LINE_LENGTH;
use crate::error::{P2pError, P2pResult};
use crate::protocol::Message;

/// Codec for line-framed messages.
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Bytes at the front of the buffer already searched for a terminator.
    scanned: usize,
}

impl MessageCodec {
    /// Create a new message codec.
    pub fn new() -> Self {
        Self { scanned: 0 }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Self::Item>> {
        loop {
            let start = self.scanned.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(P2pError::LineTooLong {
                        size: src.len(),
                        max: MAX_LINE_LENGTH,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let line_end = start + offset;
            if line_end > MAX_LINE_LENGTH {
                return Err(P2pError::LineTooLong {
                    size: line_end,
                    max: MAX_LINE_LENGTH,
                });
            }

            // Consume the line together with its terminator.
            let frame = src.split_to(line_end + 1);
            self.scanned = 0;

            let line = String::from_utf8_lossy(&frame[..line_end]);
            if line.trim().is_empty() {
                continue;
            }

            // Garbled lines are dropped; the stream stays usable.
            match line.parse::<Message>() {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unparseable line");
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> P2pResult<Option<Self::Item>> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }
        if !buf.is_empty() {
            tracing::debug!(pending = buf.len(), "Discarding unterminated bytes at end of stream");
            buf.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = P2pError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> P2pResult<()> {
        let line = message.to_line();

        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandshakeMessage, HandshakeResponseMessage, PeerAddress};

    /// Feed `chunks` one at a time, collecting every message decoded so far.
    fn decode_chunks(chunks: &[&[u8]]) -> Vec<Message> {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();

        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn test_roundtrip_every_kind() {
        let mut codec = MessageCodec::new();
        let messages = vec![
            Message::Handshake(HandshakeMessage {
                version: "V01".into(),
                self_addr: ":5001".into(),
            }),
            Message::HandshakeResponse(HandshakeResponseMessage {
                version: "V01".into(),
                from_addr: ":5000".into(),
                to_addr: "127.0.0.1:51000".into(),
            }),
            Message::Ping("Ping_127.0.0.1:5000_1".into()),
            Message::PingResponse("Resp_to_x".into()),
            Message::PeerGossip(PeerAddress::new("10.1.1.1", 5003)),
        ];

        let mut buf = BytesMut::new();
        for msg in &messages {
            codec.encode(msg.clone(), &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(msg) = codec.decode(&mut buf).unwrap() {
            decoded.push(msg);
        }
        assert_eq!(decoded, messages);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_appends_terminator() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::Ping("foo".into()), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PING foo\n");
    }

    #[test]
    fn test_split_delivery() {
        let split = decode_chunks(&[b"HAND", b"SH V01 x\nPING f", b"oo\n"]);
        let whole = decode_chunks(&[b"HANDSH V01 x\nPING foo\n"]);

        assert_eq!(split, whole);
        assert_eq!(
            whole,
            vec![
                Message::Handshake(HandshakeMessage {
                    version: "V01".into(),
                    self_addr: "x".into(),
                }),
                Message::Ping("foo".into()),
            ]
        );
    }

    #[test]
    fn test_every_two_way_split() {
        let stream: &[u8] = b"HANDSH V01 :5001\nPING a\nPINGRESP b\nPEER h 7\n";
        let whole = decode_chunks(&[stream]);
        assert_eq!(whole.len(), 4);

        for at in 0..=stream.len() {
            let (head, tail) = stream.split_at(at);
            assert_eq!(decode_chunks(&[head, tail]), whole, "split at {at}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let stream: &[u8] = b"PING one\nPING two\n";
        let chunks: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(
            decode_chunks(&chunks),
            vec![Message::Ping("one".into()), Message::Ping("two".into())]
        );
    }

    #[test]
    fn test_partial_line_waits() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"PING incompl"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn test_garbage_line_is_skipped() {
        let decoded = decode_chunks(&[b"NONSENSE 1 2\n\nPING\nPING ok\n"]);
        assert_eq!(decoded, vec![Message::Ping("ok".into())]);
    }

    #[test]
    fn test_crlf_terminated_line() {
        let decoded = decode_chunks(&[b"PINGRESP ok\r\n"]);
        assert_eq!(decoded, vec![Message::PingResponse("ok".into())]);
    }

    #[test]
    fn test_line_too_long() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&vec![b'a'; MAX_LINE_LENGTH + 1][..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(P2pError::LineTooLong { .. })));
    }

    #[test]
    fn test_eof_discards_unterminated_tail() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"PING done\nPING cut"[..]);

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Message::Ping("done".into())));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }
}

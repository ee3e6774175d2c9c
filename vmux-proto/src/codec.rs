//! Length-prefixed frame codec over any reliable byte stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`. Decoding is
//! available both as a blocking read ([`decode`]) and incrementally over an
//! accumulation buffer ([`decode_partial`]), so one transport read may yield
//! zero, one, or many messages.

use std::io::{self, Read, Write};

use crate::Message;

/// Maximum allowed frame payload (1 MiB).
///
/// Frames carry at most one endpoint read chunk, never bulk transfers, so a
/// peer declaring more than this is malformed or hostile.
pub const MAX_FRAME: u32 = 1024 * 1024;

/// Framing and serialization failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// The underlying stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A frame declared a length beyond [`MAX_FRAME`].
    #[error("frame of {len} bytes exceeds the {MAX_FRAME} byte limit")]
    Oversize {
        /// Declared payload length.
        len: u32,
    },

    /// The frame payload did not deserialize to a [`Message`].
    #[error("malformed frame: {0}")]
    Malformed(#[from] postcard::Error),
}

/// Encodes `msg` as a length-prefixed frame into a fresh buffer.
pub fn encode_to_vec(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    let payload = postcard::to_allocvec(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or(ProtoError::Oversize {
            len: payload.len().try_into().unwrap_or(u32::MAX),
        })?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Encodes `msg` as a length-prefixed frame and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &Message) -> Result<(), ProtoError> {
    let frame = encode_to_vec(msg)?;
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame from `r` and decodes it.
pub fn decode<R: Read>(r: &mut R) -> Result<Message, ProtoError> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME {
        return Err(ProtoError::Oversize { len });
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(postcard::from_bytes(&payload)?)
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` while `buf` holds an incomplete frame; on success
/// returns the message together with the number of bytes consumed, which the
/// caller discards from the front of its buffer before trying again.
pub fn decode_partial(buf: &[u8]) -> Result<Option<(Message, usize)>, ProtoError> {
    let Some(header) = buf.first_chunk::<4>() else {
        return Ok(None);
    };
    let len = u32::from_be_bytes(*header);
    if len > MAX_FRAME {
        return Err(ProtoError::Oversize { len });
    }
    let total = 4 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let msg = postcard::from_bytes(&buf[4..total])?;
    Ok(Some((msg, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EndpointKind;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Open {
                handle: 7,
                endpoint: EndpointKind::Socket,
                cookie: "/run/vmux/app.sock".into(),
            },
            Message::Data {
                handle: 7,
                payload: b"ping".to_vec(),
            },
            Message::Data {
                handle: 9,
                payload: Vec::new(),
            },
            Message::Close { handle: 7 },
            Message::Error {
                handle: 3,
                code: libc_epipe(),
            },
            Message::FdTransfer {
                handle: 12,
                endpoint: EndpointKind::PipeWriter,
                token: 0xdead_beef,
            },
        ]
    }

    // Avoids a libc dev-dependency just for one constant.
    const fn libc_epipe() -> i32 {
        32
    }

    #[test]
    fn roundtrip_all_variants() {
        for msg in sample_messages() {
            let frame = encode_to_vec(&msg).unwrap();
            let (decoded, consumed) = decode_partial(&frame).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(consumed, frame.len());
        }
    }

    #[test]
    fn roundtrip_via_reader() {
        let msg = Message::Data {
            handle: 1,
            payload: vec![0u8; 4096],
        };
        let mut buf = Vec::new();
        encode(&mut buf, &msg).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        assert_eq!(decode(&mut cursor).unwrap(), msg);
    }

    #[test]
    fn incremental_decode_byte_at_a_time() {
        let messages = sample_messages();
        let mut wire = Vec::new();
        for msg in &messages {
            wire.extend_from_slice(&encode_to_vec(msg).unwrap());
        }

        let mut buf = Vec::new();
        let mut decoded = Vec::new();
        for byte in wire {
            buf.push(byte);
            while let Some((msg, consumed)) = decode_partial(&buf).unwrap() {
                decoded.push(msg);
                buf.drain(..consumed);
            }
        }

        assert!(buf.is_empty());
        assert_eq!(decoded, messages);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut frame = (MAX_FRAME + 1).to_be_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            decode_partial(&frame),
            Err(ProtoError::Oversize { .. })
        ));

        let mut cursor = io::Cursor::new(&frame);
        assert!(matches!(
            decode(&mut cursor),
            Err(ProtoError::Oversize { .. })
        ));
    }

    #[test]
    fn rejects_refused_oversize_encode() {
        let msg = Message::Data {
            handle: 1,
            payload: vec![0u8; MAX_FRAME as usize + 1],
        };
        assert!(matches!(
            encode_to_vec(&msg),
            Err(ProtoError::Oversize { .. })
        ));
    }

    #[test]
    fn short_header_is_not_an_error() {
        assert!(decode_partial(&[0, 0]).unwrap().is_none());
        assert!(decode_partial(&[]).unwrap().is_none());
    }

    #[test]
    fn rejects_garbage_payload() {
        // Valid header, payload that is no postcard Message.
        let mut frame = 4u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_partial(&frame),
            Err(ProtoError::Malformed(_))
        ));
    }
}

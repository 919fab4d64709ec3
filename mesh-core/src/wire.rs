//! Framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Parse the length prefix of a frame. Used by stream readers before reading the body.
pub fn frame_body_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame body (without the length prefix).
pub fn decode_body(body: &[u8]) -> Result<Message, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes
/// consumed. A partial buffer gives `NeedMore`; call again once more data has arrived.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_body_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactId, ArtifactSummary};
    use crate::peer::{PeerId, Role};
    use crate::protocol::PROTOCOL_VERSION;
    use crate::session::SessionId;

    fn sample_beacon() -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            peer_id: PeerId::new("hub-001"),
            display_name: "Classroom tablet".into(),
            role: Role::Hub,
            listen_port: 45681,
            artifacts: vec![ArtifactSummary {
                id: ArtifactId::new("pdf-001").unwrap(),
                title: "Fractions for 4th Grade".into(),
                size_bytes: 125_000,
            }],
        }
    }

    #[test]
    fn beacon_survives_framing() {
        let msg = sample_beacon();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_beacon()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = sample_beacon();
        let b = Message::Done {
            session_id: SessionId::new(),
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Message::Beacon { .. }));
        assert_eq!(m2, b);
    }

    #[test]
    fn oversized_prefix_rejected() {
        let prefix = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(
            frame_body_len(prefix),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn garbage_body_is_decode_error() {
        let mut frame = 3u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Decode(_))
        ));
    }
}

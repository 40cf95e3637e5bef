//! Multipart envelope and its TCP framing.
//!
//! Logical frame order: `create_time` (packed f64) | `msg_id` (opaque bytes)
//! | `request_timeout` (packed f64) | `service_flag` (one byte) | one or more
//! payload frames. An empty payload list is carried as a single empty frame.
//!
//! On TCP a message is `u32 frame count` followed by `u32 length + bytes`
//! per frame, all big-endian. The transport-assigned client prefix never
//! appears on the TCP wire; the router attaches it in-process for reply
//! routing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const MAX_FRAMES: u32 = 128;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is missing frames (got {0})")]
    TooFewFrames(usize),
    #[error("frame {0} has the wrong size")]
    BadFrame(&'static str),
    #[error("message exceeds frame limits")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded envelope plus the in-process routing prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Multipart {
    pub prefix: Vec<Bytes>,
    pub create_time: f64,
    pub msg_id: Bytes,
    pub request_timeout: f64,
    pub service_msg: bool,
    pub data: Vec<Bytes>,
}

impl Multipart {
    pub fn new(
        create_time: f64,
        msg_id: Bytes,
        request_timeout: f64,
        service_msg: bool,
        data: Vec<Bytes>,
    ) -> Self {
        Self {
            prefix: Vec::new(),
            create_time,
            msg_id,
            request_timeout,
            service_msg,
            data,
        }
    }

    pub fn from_frames(frames: Vec<Bytes>) -> Result<Self, EnvelopeError> {
        if frames.len() < 5 {
            return Err(EnvelopeError::TooFewFrames(frames.len()));
        }
        let mut frames = frames.into_iter();
        let create_time = unpack_ts(&frames.next().unwrap_or_default(), "create_time")?;
        let msg_id = frames.next().unwrap_or_default();
        if msg_id.is_empty() {
            return Err(EnvelopeError::BadFrame("msg_id"));
        }
        let request_timeout = unpack_ts(&frames.next().unwrap_or_default(), "request_timeout")?;
        let service_msg = unpack_flag(&frames.next().unwrap_or_default())?;
        Ok(Self {
            prefix: Vec::new(),
            create_time,
            msg_id,
            request_timeout,
            service_msg,
            data: frames.collect(),
        })
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(4 + self.data.len().max(1));
        frames.push(pack_ts(self.create_time));
        frames.push(self.msg_id);
        frames.push(pack_ts(self.request_timeout));
        frames.push(pack_flag(self.service_msg));
        if self.data.is_empty() {
            frames.push(Bytes::new());
        } else {
            frames.extend(self.data);
        }
        frames
    }

    /// Response envelope: the original metadata and prefix with new payload
    /// frames.
    pub fn reply(&self, data: Vec<Bytes>) -> Multipart {
        Multipart {
            prefix: self.prefix.clone(),
            create_time: self.create_time,
            msg_id: self.msg_id.clone(),
            request_timeout: self.request_timeout,
            service_msg: self.service_msg,
            data,
        }
    }
}

fn pack_ts(ts: f64) -> Bytes {
    Bytes::copy_from_slice(&ts.to_be_bytes())
}

fn unpack_ts(frame: &Bytes, name: &'static str) -> Result<f64, EnvelopeError> {
    let bytes: [u8; 8] = frame
        .as_ref()
        .try_into()
        .map_err(|_| EnvelopeError::BadFrame(name))?;
    Ok(f64::from_be_bytes(bytes))
}

fn pack_flag(flag: bool) -> Bytes {
    Bytes::copy_from_slice(&[u8::from(flag)])
}

fn unpack_flag(frame: &Bytes) -> Result<bool, EnvelopeError> {
    match frame.as_ref() {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(EnvelopeError::BadFrame("service_flag")),
    }
}

/// Frame-list codec: `u32 count | (u32 len | bytes)*`.
#[derive(Debug, Default)]
pub struct MultipartCodec;

impl Decoder for MultipartCodec {
    type Item = Vec<Bytes>;
    type Error = EnvelopeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let count = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if count > MAX_FRAMES {
            return Err(EnvelopeError::TooLarge);
        }

        // First pass: make sure the whole message has arrived.
        let mut offset = 4usize;
        for _ in 0..count {
            let Some(header) = src.get(offset..offset + 4) else {
                return Ok(None);
            };
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            if len > MAX_FRAME_LEN {
                return Err(EnvelopeError::TooLarge);
            }
            offset += 4 + len as usize;
            if src.len() < offset {
                return Ok(None);
            }
        }

        src.advance(4);
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = src.get_u32() as usize;
            frames.push(src.split_to(len).freeze());
        }
        Ok(Some(frames))
    }
}

impl Encoder<Vec<Bytes>> for MultipartCodec {
    type Error = EnvelopeError;

    fn encode(&mut self, frames: Vec<Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frames.len() as u32 > MAX_FRAMES {
            return Err(EnvelopeError::TooLarge);
        }
        let total: usize = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
        dst.reserve(total);
        dst.put_u32(frames.len() as u32);
        for frame in frames {
            if frame.len() as u32 > MAX_FRAME_LEN {
                return Err(EnvelopeError::TooLarge);
            }
            dst.put_u32(frame.len() as u32);
            dst.put_slice(&frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Multipart {
        Multipart::new(
            1000.5,
            Bytes::from_static(b"msg-1"),
            1010.0,
            false,
            vec![Bytes::from_static(b"payload-a"), Bytes::from_static(b"payload-b")],
        )
    }

    #[test]
    fn envelope_round_trips_through_frames() {
        let multipart = sample();
        let back = Multipart::from_frames(multipart.clone().into_frames()).unwrap();
        assert_eq!(back, multipart);
    }

    #[test]
    fn empty_payload_is_one_empty_frame() {
        let multipart = Multipart::new(1.0, Bytes::from_static(b"id"), 2.0, true, Vec::new());
        let frames = multipart.into_frames();
        assert_eq!(frames.len(), 5);
        assert!(frames[4].is_empty());
        let back = Multipart::from_frames(frames).unwrap();
        assert_eq!(back.data, vec![Bytes::new()]);
        assert!(back.service_msg);
    }

    #[test]
    fn damaged_envelopes_are_rejected() {
        assert!(matches!(
            Multipart::from_frames(vec![Bytes::from_static(b"x")]),
            Err(EnvelopeError::TooFewFrames(1))
        ));

        let mut frames = sample().into_frames();
        frames[0] = Bytes::from_static(b"short");
        assert!(matches!(
            Multipart::from_frames(frames),
            Err(EnvelopeError::BadFrame("create_time"))
        ));

        let mut frames = sample().into_frames();
        frames[3] = Bytes::from_static(b"\x07");
        assert!(matches!(
            Multipart::from_frames(frames),
            Err(EnvelopeError::BadFrame("service_flag"))
        ));
    }

    #[test]
    fn codec_handles_partial_reads() {
        let mut codec = MultipartCodec;
        let mut wire = BytesMut::new();
        codec.encode(sample().into_frames(), &mut wire).unwrap();

        let mut partial = BytesMut::from(&wire[..wire.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut full = BytesMut::from(&wire[..]);
        let frames = codec.decode(&mut full).unwrap().unwrap();
        let back = Multipart::from_frames(frames).unwrap();
        assert_eq!(back, sample());
        assert!(full.is_empty());
    }

    #[test]
    fn two_messages_in_one_buffer_decode_separately() {
        let mut codec = MultipartCodec;
        let mut wire = BytesMut::new();
        codec.encode(sample().into_frames(), &mut wire).unwrap();
        codec
            .encode(
                Multipart::new(3.0, Bytes::from_static(b"id2"), 4.0, false, Vec::new())
                    .into_frames(),
                &mut wire,
            )
            .unwrap();

        let first = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(
            Multipart::from_frames(first).unwrap().msg_id,
            Bytes::from_static(b"msg-1")
        );
        let second = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(
            Multipart::from_frames(second).unwrap().msg_id,
            Bytes::from_static(b"id2")
        );
    }
}

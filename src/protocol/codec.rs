use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, MAX_MESSAGE_SIZE};

/// Length-prefixed framing for stream transports
///
/// Frames are opaque: message validation happens in the mesh so a malformed
/// payload is dropped without tearing down the stream.
#[derive(Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Need more data to read frame length
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                length, MAX_MESSAGE_SIZE
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_MESSAGE_SIZE {
            return Err(Error::protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                item.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    #[test]
    fn test_codec_partial_frames() {
        let mut codec = FrameCodec::new();
        let mut bytes = BytesMut::new();

        let frame = Message::ping(42.0).encode().unwrap();
        codec.encode(frame.clone(), &mut bytes).unwrap();
        codec.encode(frame.clone(), &mut bytes).unwrap();

        // Feed the first frame in two pieces
        let mut partial = bytes.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(bytes.split_to(4 + frame.len() - 6));
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);

        let second = codec.decode(&mut bytes).unwrap().unwrap();
        assert!(matches!(Message::decode(&second).unwrap(), Message::Ping(_)));
        assert!(codec.decode(&mut bytes).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_length() {
        let mut codec = FrameCodec::new();
        let mut bytes = BytesMut::new();
        bytes.put_u32(MAX_MESSAGE_SIZE as u32 + 1);
        assert!(codec.decode(&mut bytes).is_err());
    }
}

//! Frame-level wire format shared by [`crate::transport`] and [`crate::channel`].
//!
//! A frame is `<data_type:u8><buffer_id:u8><seq:u8><total_len:u32 LE>`
//! followed by `payload`, where `total_len` includes the 7-byte header.
//! A single UDP datagram may coalesce several frames back to back; each
//! is self-delimiting via `total_len`.

use std::fmt;

/// Header size in bytes: `data_type` + `buffer_id` + `seq` + `total_len`.
pub const HEADER_LEN: usize = 7;

/// Buffer reserved for inbound pings.
pub const PING_BUFFER: u8 = 0;
/// Buffer reserved for outbound pongs.
pub const PONG_BUFFER: u8 = 1;

/// Maps a data buffer to its dedicated acknowledgement buffer.
pub fn ack_buffer_of(data_buffer: u8) -> u8 {
    data_buffer.wrapping_add(128)
}

/// One of the four frame kinds defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Ack,
    Data,
    DataLowLatency,
    DataWithAck,
}

impl DataType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Ack),
            2 => Some(Self::Data),
            3 => Some(Self::DataLowLatency),
            4 => Some(Self::DataWithAck),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Ack => 1,
            Self::Data => 2,
            Self::DataLowLatency => 3,
            Self::DataWithAck => 4,
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(WireError::UnknownDataType(value))
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        value.to_u8()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ack => "ack",
            Self::Data => "data",
            Self::DataLowLatency => "data_low_latency",
            Self::DataWithAck => "data_with_ack",
        };
        f.write_str(s)
    }
}

/// A single transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub data_type: DataType,
    pub buffer_id: u8,
    pub seq: u8,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Appends this frame's wire encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let total_len = (self.payload.len() + HEADER_LEN) as u32;

        out.push(self.data_type.into());
        out.push(self.buffer_id);
        out.push(self.seq);
        out.extend_from_slice(&total_len.to_le_bytes());
        out.extend_from_slice(self.payload);
    }

    /// Convenience: encode a standalone frame into a freshly allocated buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_into(&mut out);
        out
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short for a frame header: {0} bytes remaining")]
    TruncatedHeader(usize),
    #[error("frame declares total_len {declared} but only {available} bytes remain")]
    TruncatedPayload { declared: u32, available: usize },
    #[error("frame declares total_len {0} smaller than the 7-byte header")]
    LengthBelowHeader(u32),
    #[error("unknown data_type byte {0}")]
    UnknownDataType(u8),
}

/// Parses one frame from the start of `bytes`.
///
/// Returns the frame plus the number of bytes consumed (`total_len`), so a
/// caller can slice `&bytes[consumed..]` to keep walking a coalesced
/// datagram.
pub fn decode_one(bytes: &[u8]) -> Result<(Frame<'_>, usize), WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::TruncatedHeader(bytes.len()));
    }

    let data_type = DataType::try_from(bytes[0])?;
    let buffer_id = bytes[1];
    let seq = bytes[2];
    let total_len = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);

    if (total_len as usize) < HEADER_LEN {
        return Err(WireError::LengthBelowHeader(total_len));
    }

    if bytes.len() < total_len as usize {
        return Err(WireError::TruncatedPayload {
            declared: total_len,
            available: bytes.len(),
        });
    }

    let payload = &bytes[HEADER_LEN..total_len as usize];

    Ok((
        Frame {
            data_type,
            buffer_id,
            seq,
            payload,
        },
        total_len as usize,
    ))
}

/// Walks a (possibly multi-frame) datagram, calling `f` for each frame.
///
/// Stops at the first decode error and returns it; frames already
/// delivered to `f` are not rolled back (the transport's read loop logs
/// and drops the remainder of the datagram on error, per spec).
pub fn for_each_frame<'a>(
    mut bytes: &'a [u8],
    mut f: impl FnMut(Frame<'a>),
) -> Result<(), WireError> {
    while !bytes.is_empty() {
        let (frame, consumed) = decode_one(bytes)?;
        f(frame);
        bytes = &bytes[consumed..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_single_frame() {
        let frame = Frame {
            data_type: DataType::DataWithAck,
            buffer_id: 11,
            seq: 7,
            payload: b"hello",
        };

        let bytes = frame.encode();
        let (decoded, consumed) = decode_one(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn walks_coalesced_datagram() {
        let a = Frame {
            data_type: DataType::Data,
            buffer_id: 126,
            seq: 1,
            payload: b"aa",
        };
        let b = Frame {
            data_type: DataType::Ack,
            buffer_id: 138,
            seq: 2,
            payload: b"b",
        };

        let mut bytes = a.encode();
        bytes.extend(b.encode());

        let mut seen = Vec::new();
        for_each_frame(&bytes, |f| seen.push((f.buffer_id, f.seq))).unwrap();

        assert_eq!(seen, vec![(126, 1), (138, 2)]);
    }

    #[test]
    fn rejects_unknown_data_type() {
        let mut bytes = vec![99, 0, 0];
        bytes.extend_from_slice(&7u32.to_le_bytes());

        assert_eq!(decode_one(&bytes), Err(WireError::UnknownDataType(99)));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut bytes = vec![2, 0, 0];
        bytes.extend_from_slice(&20u32.to_le_bytes());
        bytes.extend_from_slice(b"short");

        assert!(matches!(
            decode_one(&bytes),
            Err(WireError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn ack_buffer_offset() {
        assert_eq!(ack_buffer_of(10), 138);
        assert_eq!(ack_buffer_of(11), 139);
    }
}

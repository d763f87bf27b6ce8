#![forbid(unsafe_code)]

// The frame only says "the shared blob changed". The payload itself never
// travels over the socket; the receiver copies it out of shared memory.
//
// Wire layout, little-endian, fixed 8 bytes:
//
//   0       4       6       8
//   ┌───────┬───────┬───────┐
//   │ size  │ type  │ rsvd  │
//   │ u32   │ u16   │ u16   │
//   └───────┴───────┴───────┘

/// Encoded length of every notification frame.
pub const FRAME_SIZE: usize = 8;

/// Message tags. Only one is defined; the rest of the space is reserved and
/// must be rejected by receivers.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgType {
    ConfigChanged = 1,
}

impl TryFrom<u16> for MsgType {
    type Error = FrameError;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(MsgType::ConfigChanged),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("short frame: {received} bytes, header needs {FRAME_SIZE}")]
    ShortFrame { received: usize },

    #[error("frame declares {declared} bytes but {received} arrived")]
    SizeMismatch { declared: u32, received: usize },

    #[error("unknown frame type {0}")]
    UnknownType(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotificationFrame {
    /// Total frame length including this field.
    pub size: u32,
    pub msg_type: MsgType,
}

impl NotificationFrame {
    pub fn config_changed() -> Self {
        Self {
            size: FRAME_SIZE as u32,
            msg_type: MsgType::ConfigChanged,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..6].copy_from_slice(&(self.msg_type as u16).to_le_bytes());
        out
    }

    /// Decodes exactly the bytes one receive returned.
    ///
    /// Checks run in wire order: enough bytes for a header, then the declared
    /// size against what arrived, then the type tag.
    pub fn decode(received: &[u8]) -> Result<Self, FrameError> {
        if received.len() < FRAME_SIZE {
            return Err(FrameError::ShortFrame {
                received: received.len(),
            });
        }

        let size = u32::from_le_bytes([received[0], received[1], received[2], received[3]]);
        if size as usize != received.len() {
            return Err(FrameError::SizeMismatch {
                declared: size,
                received: received.len(),
            });
        }

        let raw_type = u16::from_le_bytes([received[4], received[5]]);
        let msg_type = MsgType::try_from(raw_type)?;

        Ok(Self { size, msg_type })
    }
}

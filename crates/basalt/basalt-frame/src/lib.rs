pub mod notification;
pub use notification::{FRAME_SIZE, FrameError, MsgType, NotificationFrame};

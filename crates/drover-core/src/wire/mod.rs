//! Wire protocol between the coordinator and worker agents.

mod codec;
mod message;

pub use codec::{FrameStream, MAX_FRAME_LEN, WireError};
pub use message::{
    ACK, Assignment, CWD_MISMATCH, CWD_OK, CapturePaths, IdleReply, WorkerStatus, status_from_wire,
    status_to_wire,
};

//! Multi-packet receive queues
//!
//! The NIC stripes many packets across the strides of one posted buffer and
//! reports each with a compact completion record. [`MpCompletionQueue`]
//! decodes those records; [`CyclicBufferRing`] folds them into zero-copy
//! completions over the cyclic buffer.

pub mod cqe;
pub mod cyclic;
pub mod layout;

pub use cqe::{
    Cqe64, Cqe64Builder, CqeMemory, CqeOpcode, CqeSource, MpCompletionQueue, MpFlags, MpPacket,
    MpPoll, CQE_SIZE,
};
pub use cyclic::{
    Completion, CompletionMask, CyclicBufferRing, HwClock, KhzClock, ReadMode, ReadRequest,
    ReceiveQueue,
};
pub use layout::{CyclicLayout, MpRqCaps, MAX_MP_WQES, MIN_MP_WQES};

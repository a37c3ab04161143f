pub mod descriptor;
pub mod list;
pub mod queue;

pub use descriptor::{
    BoundBuffer, BufferBinding, BufferState, CropRect, Direction, EntitySpec, EntityState, Frame,
    FrameType, NodeGroupInfo, PixelFormat, StageId, NODE_BAYER, NODE_CAPTURE, NODE_MAIN,
};
pub use list::FrameList;
pub use queue::{FrameQueue, PopResult};

//! Frame descriptor and per-stage state machine
//!
//! A `Frame` is the unit-of-work descriptor for one sensor capture instant.
//! It tracks, per pipeline stage, two independent state axes:
//!
//! - buffer state (`NoRequest → Requested → Complete`, any → `Error`):
//!   readiness of the data buffer bound to that slot;
//! - entity state (`Ready → Processing → Complete`, `Complete → Rework`):
//!   progress of the stage itself.
//!
//! Frames are shared as `Arc<Frame>`: the owning frame list holds the
//! canonical strong reference, queues hold transient references during
//! transit, and stage workers borrow. A frame is destroyed automatically when
//! the last reference drops after list removal, which makes the
//! delete-while-enqueued class of bugs unrepresentable.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::error::{PipelineError, Result};

/// One hardware-processing step in the image pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageId {
    /// Sensor capture (FLITE).
    Sensor,
    /// 3A statistics.
    ThreeA,
    /// Image signal processor.
    Isp,
    /// Preview/record scaler (MCSC).
    Scaler,
    /// Distortion correction.
    Gdc,
    /// Colour-space conversion / extra scale pass (GSC).
    Csc,
    /// Still JPEG encode.
    Jpeg,
}

/// Buffer flow direction relative to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Src,
    Dst,
}

/// Destination node index for the main output of a stage.
pub const NODE_MAIN: usize = 0;
/// Destination node index for the optional full-resolution capture output.
pub const NODE_CAPTURE: usize = 1;
/// Destination node index for the optional raw-bayer output of the sensor.
pub const NODE_BAYER: usize = 1;

/// Pixel formats the pipeline routes between attachment points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,
    Yuyv,
    Rgb24,
    Bayer10,
    Jpeg,
}

/// Operating-mode tag a frame was created under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Preview,
    Reprocessing,
    Vision,
    Internal,
}

/// Whether a buffer slot has been asked for, filled by hardware, or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    NoRequest,
    Requested,
    Complete,
    Error,
}

/// Stage-level progress, independent of buffer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityState {
    Ready,
    Processing,
    Complete,
    /// A previously-completed entity forcibly re-requested for an additional
    /// capture output (dynamic capture boost).
    Rework,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Node-group metadata carried for downstream scalers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeGroupInfo {
    pub bayer_crop: CropRect,
}

/// One buffer slot of an entity: lifecycle state plus the bound handle.
/// `state == Requested` with no buffer means "asked for, not yet bound".
#[derive(Debug, Clone)]
pub struct BufferBinding {
    pub state: BufferState,
    pub buffer: Option<Buffer>,
}

impl BufferBinding {
    fn unrequested() -> Self {
        Self {
            state: BufferState::NoRequest,
            buffer: None,
        }
    }

    fn requested() -> Self {
        Self {
            state: BufferState::Requested,
            buffer: None,
        }
    }
}

/// Per-stage slice of a frame.
#[derive(Debug)]
struct StageEntity {
    entity_state: EntityState,
    src: BufferBinding,
    dst: Vec<BufferBinding>,
    src_crop: CropRect,
    dst_crop: CropRect,
    node_group: NodeGroupInfo,
}

/// Creation-time description of one entity: which directions need buffers.
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub stage: StageId,
    pub request_src: bool,
    /// One flag per destination node index.
    pub request_dst: Vec<bool>,
}

impl EntitySpec {
    pub fn new(stage: StageId, request_src: bool, request_dst: Vec<bool>) -> Self {
        Self {
            stage,
            request_src,
            request_dst,
        }
    }
}

/// A buffer removed from a frame at retirement, with enough context to route
/// it back to the right pool (or hand it off).
#[derive(Debug)]
pub struct BoundBuffer {
    pub stage: StageId,
    pub direction: Direction,
    pub node: usize,
    pub buffer: Buffer,
    pub state: BufferState,
}

struct FrameInner {
    entities: Vec<(StageId, StageEntity)>,
    request_capture: bool,
    request_bayer: bool,
}

/// Reference-counted descriptor of one unit of pipeline work.
pub struct Frame {
    frame_count: u32,
    frame_type: FrameType,
    inner: Mutex<FrameInner>,
}

impl Frame {
    pub fn new(
        frame_count: u32,
        frame_type: FrameType,
        specs: Vec<EntitySpec>,
        request_capture: bool,
        request_bayer: bool,
    ) -> Self {
        let entities = specs
            .into_iter()
            .map(|spec| {
                let entity = StageEntity {
                    entity_state: EntityState::Ready,
                    src: if spec.request_src {
                        BufferBinding::requested()
                    } else {
                        BufferBinding::unrequested()
                    },
                    dst: spec
                        .request_dst
                        .iter()
                        .map(|&req| {
                            if req {
                                BufferBinding::requested()
                            } else {
                                BufferBinding::unrequested()
                            }
                        })
                        .collect(),
                    src_crop: CropRect::default(),
                    dst_crop: CropRect::default(),
                    node_group: NodeGroupInfo::default(),
                };
                (spec.stage, entity)
            })
            .collect();

        Self {
            frame_count,
            frame_type,
            inner: Mutex::new(FrameInner {
                entities,
                request_capture,
                request_bayer,
            }),
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn requests_capture(&self) -> bool {
        self.lock().request_capture
    }

    pub fn requests_bayer(&self) -> bool {
        self.lock().request_bayer
    }

    pub fn set_request_capture(&self, value: bool) {
        self.lock().request_capture = value;
    }

    pub fn entity_stages(&self) -> Vec<StageId> {
        self.lock().entities.iter().map(|(id, _)| *id).collect()
    }

    pub fn has_entity(&self, stage: StageId) -> bool {
        self.lock().entities.iter().any(|(id, _)| *id == stage)
    }

    pub fn entity_state(&self, stage: StageId) -> Result<EntityState> {
        let inner = self.lock();
        self.entity(&inner, stage).map(|e| e.entity_state)
    }

    /// Entity transitions are permissive except for the completion guard: a
    /// `Complete` entity can only move to `Rework` (dynamic capture boost).
    pub fn set_entity_state(&self, stage: StageId, state: EntityState) -> Result<()> {
        let mut inner = self.lock();
        let frame_count = self.frame_count;
        let entity = self.entity_mut(&mut inner, stage)?;
        if entity.entity_state == EntityState::Complete && state != EntityState::Rework {
            return Err(PipelineError::InvalidTransition {
                frame_count,
                stage,
                detail: "completed entity can only be reworked",
            });
        }
        entity.entity_state = state;
        Ok(())
    }

    /// Bind a source buffer; the slot becomes (or stays) `Requested` until the
    /// hardware completes. Rebinding over a held buffer is rejected, since
    /// that would leak the previous one.
    pub fn set_src_buffer(&self, stage: StageId, buffer: Buffer) -> Result<()> {
        let mut inner = self.lock();
        let frame_count = self.frame_count;
        let entity = self.entity_mut(&mut inner, stage)?;
        Self::bind(&mut entity.src, buffer, frame_count, stage)
    }

    pub fn set_dst_buffer(&self, stage: StageId, node: usize, buffer: Buffer) -> Result<()> {
        let mut inner = self.lock();
        let frame_count = self.frame_count;
        let entity = self.entity_mut(&mut inner, stage)?;
        let binding = entity
            .dst
            .get_mut(node)
            .ok_or(PipelineError::MissingEntity { frame_count, stage })?;
        Self::bind(binding, buffer, frame_count, stage)
    }

    fn bind(
        binding: &mut BufferBinding,
        buffer: Buffer,
        frame_count: u32,
        stage: StageId,
    ) -> Result<()> {
        if binding.buffer.is_some() {
            return Err(PipelineError::InvalidTransition {
                frame_count,
                stage,
                detail: "buffer already bound",
            });
        }
        binding.buffer = Some(buffer);
        binding.state = BufferState::Requested;
        Ok(())
    }

    pub fn src_buffer(&self, stage: StageId) -> Result<Option<Buffer>> {
        let inner = self.lock();
        self.entity(&inner, stage).map(|e| e.src.buffer.clone())
    }

    pub fn dst_buffer(&self, stage: StageId, node: usize) -> Result<Option<Buffer>> {
        let inner = self.lock();
        self.entity(&inner, stage)
            .map(|e| e.dst.get(node).and_then(|b| b.buffer.clone()))
    }

    pub fn src_buffer_state(&self, stage: StageId) -> Result<BufferState> {
        let inner = self.lock();
        self.entity(&inner, stage).map(|e| e.src.state)
    }

    pub fn dst_buffer_state(&self, stage: StageId, node: usize) -> Result<BufferState> {
        let inner = self.lock();
        self.entity(&inner, stage).map(|e| {
            e.dst
                .get(node)
                .map(|b| b.state)
                .unwrap_or(BufferState::NoRequest)
        })
    }

    pub fn set_src_buffer_state(&self, stage: StageId, state: BufferState) -> Result<()> {
        let mut inner = self.lock();
        self.entity_mut(&mut inner, stage)?.src.state = state;
        Ok(())
    }

    pub fn set_dst_buffer_state(&self, stage: StageId, node: usize, state: BufferState) -> Result<()> {
        let mut inner = self.lock();
        let frame_count = self.frame_count;
        let entity = self.entity_mut(&mut inner, stage)?;
        let binding = entity
            .dst
            .get_mut(node)
            .ok_or(PipelineError::MissingEntity { frame_count, stage })?;
        binding.state = state;
        Ok(())
    }

    /// Number of destination node slots this stage carries.
    pub fn dst_node_count(&self, stage: StageId) -> Result<usize> {
        let inner = self.lock();
        self.entity(&inner, stage).map(|e| e.dst.len())
    }

    /// True when any direction of the entity was asked for a buffer.
    /// Skipped stages (zoom-with-CSC bypass) stay all-`NoRequest`.
    pub fn entity_has_request(&self, stage: StageId) -> bool {
        let inner = self.lock();
        match self.entity(&inner, stage) {
            Ok(e) => {
                e.src.state != BufferState::NoRequest
                    || e.dst.iter().any(|b| b.state != BufferState::NoRequest)
            }
            Err(_) => false,
        }
    }

    /// Mark every in-play binding of the entity. Used by stage workers to
    /// record hardware completion (`Complete`) or failure (`Error`) before the
    /// frame is forwarded.
    pub fn mark_entity_buffers(&self, stage: StageId, state: BufferState) -> Result<()> {
        let mut inner = self.lock();
        let entity = self.entity_mut(&mut inner, stage)?;
        let touch = |binding: &mut BufferBinding| {
            if binding.state == BufferState::Requested
                || (state == BufferState::Error && binding.state == BufferState::Complete)
            {
                binding.state = state;
            }
        };
        touch(&mut entity.src);
        entity.dst.iter_mut().for_each(touch);
        Ok(())
    }

    /// A frame is complete when every entity has finished (or been skipped,
    /// which records `Complete` with nothing requested).
    pub fn check_complete(&self) -> bool {
        self.lock()
            .entities
            .iter()
            .all(|(_, e)| e.entity_state == EntityState::Complete)
    }

    /// Detach every bound buffer for release at retirement. Binding states
    /// are left in place so capture selection can still match on them.
    pub fn take_bound_buffers(&self) -> Vec<BoundBuffer> {
        let mut inner = self.lock();
        let mut out = Vec::new();
        for (stage, entity) in inner.entities.iter_mut() {
            if let Some(buffer) = entity.src.buffer.take() {
                out.push(BoundBuffer {
                    stage: *stage,
                    direction: Direction::Src,
                    node: NODE_MAIN,
                    buffer,
                    state: entity.src.state,
                });
            }
            for (node, binding) in entity.dst.iter_mut().enumerate() {
                if let Some(buffer) = binding.buffer.take() {
                    out.push(BoundBuffer {
                        stage: *stage,
                        direction: Direction::Dst,
                        node,
                        buffer,
                        state: binding.state,
                    });
                }
            }
        }
        out
    }

    pub fn set_src_crop(&self, stage: StageId, crop: CropRect) -> Result<()> {
        let mut inner = self.lock();
        self.entity_mut(&mut inner, stage)?.src_crop = crop;
        Ok(())
    }

    pub fn set_dst_crop(&self, stage: StageId, crop: CropRect) -> Result<()> {
        let mut inner = self.lock();
        self.entity_mut(&mut inner, stage)?.dst_crop = crop;
        Ok(())
    }

    pub fn src_crop(&self, stage: StageId) -> Result<CropRect> {
        let inner = self.lock();
        self.entity(&inner, stage).map(|e| e.src_crop)
    }

    pub fn dst_crop(&self, stage: StageId) -> Result<CropRect> {
        let inner = self.lock();
        self.entity(&inner, stage).map(|e| e.dst_crop)
    }

    pub fn set_node_group_info(&self, stage: StageId, info: NodeGroupInfo) -> Result<()> {
        let mut inner = self.lock();
        self.entity_mut(&mut inner, stage)?.node_group = info;
        Ok(())
    }

    pub fn node_group_info(&self, stage: StageId) -> Result<NodeGroupInfo> {
        let inner = self.lock();
        self.entity(&inner, stage).map(|e| e.node_group)
    }

    fn entity<'a>(
        &self,
        inner: &'a std::sync::MutexGuard<'_, FrameInner>,
        stage: StageId,
    ) -> Result<&'a StageEntity> {
        inner
            .entities
            .iter()
            .find(|(id, _)| *id == stage)
            .map(|(_, e)| e)
            .ok_or(PipelineError::MissingEntity {
                frame_count: self.frame_count,
                stage,
            })
    }

    fn entity_mut<'a>(
        &self,
        inner: &'a mut std::sync::MutexGuard<'_, FrameInner>,
        stage: StageId,
    ) -> Result<&'a mut StageEntity> {
        let frame_count = self.frame_count;
        inner
            .entities
            .iter_mut()
            .find(|(id, _)| *id == stage)
            .map(|(_, e)| e)
            .ok_or(PipelineError::MissingEntity { frame_count, stage })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FrameInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_count", &self.frame_count)
            .field("frame_type", &self.frame_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_buffer(index: usize) -> Buffer {
        Buffer {
            index,
            plane_sizes: vec![1024],
            meta_plane: None,
        }
    }

    fn preview_frame(count: u32) -> Frame {
        Frame::new(
            count,
            FrameType::Preview,
            vec![
                EntitySpec::new(StageId::Sensor, false, vec![true]),
                EntitySpec::new(StageId::Isp, true, vec![true, false]),
            ],
            false,
            false,
        )
    }

    #[test]
    fn binding_transitions_follow_the_happy_path() {
        let frame = preview_frame(1);
        assert_eq!(
            frame.dst_buffer_state(StageId::Sensor, NODE_MAIN).unwrap(),
            BufferState::Requested
        );

        frame
            .set_dst_buffer(StageId::Sensor, NODE_MAIN, test_buffer(0))
            .unwrap();
        assert_eq!(
            frame.dst_buffer_state(StageId::Sensor, NODE_MAIN).unwrap(),
            BufferState::Requested
        );

        frame
            .mark_entity_buffers(StageId::Sensor, BufferState::Complete)
            .unwrap();
        assert_eq!(
            frame.dst_buffer_state(StageId::Sensor, NODE_MAIN).unwrap(),
            BufferState::Complete
        );
    }

    #[test]
    fn rebinding_a_held_slot_is_rejected() {
        let frame = preview_frame(2);
        frame
            .set_dst_buffer(StageId::Sensor, NODE_MAIN, test_buffer(0))
            .unwrap();
        assert!(frame
            .set_dst_buffer(StageId::Sensor, NODE_MAIN, test_buffer(1))
            .is_err());
    }

    #[test]
    fn completed_entity_only_accepts_rework() {
        let frame = preview_frame(3);
        frame
            .set_entity_state(StageId::Isp, EntityState::Processing)
            .unwrap();
        frame
            .set_entity_state(StageId::Isp, EntityState::Complete)
            .unwrap();
        assert!(frame
            .set_entity_state(StageId::Isp, EntityState::Processing)
            .is_err());
        frame
            .set_entity_state(StageId::Isp, EntityState::Rework)
            .unwrap();
        frame
            .set_entity_state(StageId::Isp, EntityState::Processing)
            .unwrap();
    }

    #[test]
    fn error_marking_covers_completed_bindings() {
        let frame = preview_frame(4);
        frame
            .set_src_buffer(StageId::Isp, test_buffer(0))
            .unwrap();
        frame
            .mark_entity_buffers(StageId::Isp, BufferState::Complete)
            .unwrap();
        frame
            .mark_entity_buffers(StageId::Isp, BufferState::Error)
            .unwrap();
        assert_eq!(
            frame.src_buffer_state(StageId::Isp).unwrap(),
            BufferState::Error
        );
        // Unrequested capture node is left alone.
        assert_eq!(
            frame.dst_buffer_state(StageId::Isp, NODE_CAPTURE).unwrap(),
            BufferState::NoRequest
        );
    }

    #[test]
    fn take_bound_buffers_detaches_but_keeps_states() {
        let frame = preview_frame(5);
        frame
            .set_dst_buffer(StageId::Sensor, NODE_MAIN, test_buffer(0))
            .unwrap();
        frame.set_src_buffer(StageId::Isp, test_buffer(1)).unwrap();
        frame
            .mark_entity_buffers(StageId::Sensor, BufferState::Complete)
            .unwrap();

        let taken = frame.take_bound_buffers();
        assert_eq!(taken.len(), 2);
        assert!(frame.src_buffer(StageId::Isp).unwrap().is_none());
        assert_eq!(
            frame.dst_buffer_state(StageId::Sensor, NODE_MAIN).unwrap(),
            BufferState::Complete
        );
        // A second take finds nothing: release happens exactly once.
        assert!(frame.take_bound_buffers().is_empty());
    }

    #[test]
    fn complete_requires_every_entity() {
        let frame = preview_frame(6);
        assert!(!frame.check_complete());
        frame
            .set_entity_state(StageId::Sensor, EntityState::Complete)
            .unwrap();
        assert!(!frame.check_complete());
        frame
            .set_entity_state(StageId::Isp, EntityState::Complete)
            .unwrap();
        assert!(frame.check_complete());
    }
}

//! Frame factories: fixed stage topologies per operating mode
//!
//! A factory assembles the stages for one operating mode (preview,
//! reprocessing, vision) and builds frames whose entity table matches that
//! topology. The factory never routes between stages itself; the orchestrator
//! wires output queues and seeds the first stage.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::info;

use crate::error::{PipelineError, Result};
use crate::frame::{
    EntitySpec, Frame, FrameQueue, FrameType, StageId, NODE_BAYER, NODE_CAPTURE, NODE_MAIN,
};
use crate::pipeline::stage::{Stage, StageRunner};
use crate::PipelineConfig;

/// Fixed assembly of stages for one operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FactoryMode {
    Preview,
    Reprocessing,
    Vision,
}

const PREVIEW_TOPOLOGY: &[StageId] = &[
    StageId::Sensor,
    StageId::ThreeA,
    StageId::Isp,
    StageId::Scaler,
    StageId::Gdc,
    StageId::Csc,
];

const REPROCESSING_TOPOLOGY: &[StageId] = &[StageId::ThreeA, StageId::Isp, StageId::Jpeg];

const VISION_TOPOLOGY: &[StageId] = &[StageId::Sensor];

impl FactoryMode {
    pub fn topology(&self) -> &'static [StageId] {
        match self {
            FactoryMode::Preview => PREVIEW_TOPOLOGY,
            FactoryMode::Reprocessing => REPROCESSING_TOPOLOGY,
            FactoryMode::Vision => VISION_TOPOLOGY,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            FactoryMode::Preview => FrameType::Preview,
            FactoryMode::Reprocessing => FrameType::Reprocessing,
            FactoryMode::Vision => FrameType::Vision,
        }
    }
}

/// Per-frame optional high-cost outputs (dynamic capture): full-resolution
/// capture plane and raw bayer. Enabled on demand rather than every frame to
/// save bandwidth and memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRequest {
    pub capture: bool,
    pub bayer: bool,
}

/// Fixed topology of stage runners for one operating mode.
pub struct Factory {
    mode: FactoryMode,
    /// In topology order.
    runners: Vec<Arc<StageRunner>>,
    sensor_otf: bool,
}

impl Factory {
    /// Assemble the mode's topology from caller-provided stages. Stage order
    /// and identity must match the topology exactly.
    pub fn assemble(
        mode: FactoryMode,
        stages: Vec<Arc<dyn Stage>>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let topology = mode.topology();
        if stages.len() != topology.len() {
            return Err(PipelineError::Config(format!(
                "{:?} factory expects {} stages, got {}",
                mode,
                topology.len(),
                stages.len()
            )));
        }
        for (stage, &expected) in stages.iter().zip(topology) {
            if stage.stage_id() != expected {
                return Err(PipelineError::Config(format!(
                    "{:?} factory expects stage {:?}, got {:?}",
                    mode,
                    expected,
                    stage.stage_id()
                )));
            }
        }

        let runners = stages
            .into_iter()
            .map(|stage| {
                let timeout = config.timeouts.stage_wait(stage.stage_id());
                Arc::new(StageRunner::new(stage, timeout))
            })
            .collect();

        info!(?mode, stages = topology.len(), "factory assembled");
        Ok(Self {
            mode,
            runners,
            sensor_otf: config.sensor_otf,
        })
    }

    /// Topology populated with passthrough pipes. Synthetic pipelines for
    /// tests, and software simulation of bypassed hardware.
    pub fn with_passthrough_stages(mode: FactoryMode, config: &PipelineConfig) -> Self {
        let stages = mode
            .topology()
            .iter()
            .map(|&id| Arc::new(crate::pipeline::stage::PassthroughStage::new(id)) as Arc<dyn Stage>)
            .collect();
        Self::assemble(mode, stages, config).expect("passthrough topology always matches")
    }

    pub fn mode(&self) -> FactoryMode {
        self.mode
    }

    pub fn topology(&self) -> &'static [StageId] {
        self.mode.topology()
    }

    pub fn first_stage(&self) -> StageId {
        self.mode.topology()[0]
    }

    /// Build a frame whose entity table matches this topology, with the
    /// optional high-cost outputs requested per `request`.
    pub fn create_frame(&self, frame_count: u32, request: FrameRequest) -> Arc<Frame> {
        let specs = self
            .topology()
            .iter()
            .map(|&stage| self.entity_spec(stage, request))
            .collect();
        Arc::new(Frame::new(
            frame_count,
            self.mode.frame_type(),
            specs,
            request.capture,
            request.bayer,
        ))
    }

    fn entity_spec(&self, stage: StageId, request: FrameRequest) -> EntitySpec {
        debug_assert_eq!(NODE_MAIN, 0);
        match stage {
            // Sensor consumes a raw hardware buffer and produces the main
            // output, plus raw bayer when dynamically requested.
            StageId::Sensor => EntitySpec::new(stage, true, vec![true, request.bayer]),
            // With the sensor->3A on-the-fly link, 3A needs no source buffer.
            StageId::ThreeA => EntitySpec::new(stage, !self.sensor_otf, vec![true]),
            // ISP carries the optional full-resolution capture node.
            StageId::Isp => {
                debug_assert_eq!(NODE_CAPTURE, 1);
                debug_assert_eq!(NODE_BAYER, 1);
                EntitySpec::new(stage, true, vec![true, request.capture])
            }
            // Scaler and GDC are fed on-the-fly from the previous block.
            StageId::Scaler => EntitySpec::new(stage, false, vec![true]),
            StageId::Gdc => EntitySpec::new(stage, false, vec![true]),
            // CSC may be skipped per frame by routing; when it runs it
            // produces the display-bound plane.
            StageId::Csc => EntitySpec::new(stage, false, vec![true]),
            StageId::Jpeg => EntitySpec::new(stage, true, vec![true]),
        }
    }

    pub fn runner(&self, stage: StageId) -> Result<&Arc<StageRunner>> {
        self.runners
            .iter()
            .find(|r| r.stage_id() == stage)
            .ok_or_else(|| {
                PipelineError::Config(format!("{:?} factory has no stage {:?}", self.mode, stage))
            })
    }

    pub fn input_queue(&self, stage: StageId) -> Result<Arc<FrameQueue<Arc<Frame>>>> {
        self.runner(stage).map(|r| r.input_queue())
    }

    pub fn set_output_queue(
        &self,
        stage: StageId,
        queue: Arc<FrameQueue<Arc<Frame>>>,
    ) -> Result<()> {
        self.runner(stage)?.set_output_queue(queue);
        Ok(())
    }

    /// Give every stage the retirement queue as its last-resort destination
    /// for frames whose output queue is not wired.
    pub fn set_fallback_queues(&self, queue: Arc<FrameQueue<Arc<Frame>>>) {
        for runner in &self.runners {
            runner.set_fallback_queue(queue.clone());
        }
    }

    pub fn push_frame(&self, stage: StageId, frame: Arc<Frame>) -> Result<()> {
        self.runner(stage)?.push_frame(frame);
        Ok(())
    }

    pub fn start_thread(&self, stage: StageId, stop_flag: Arc<AtomicBool>) -> Result<()> {
        self.runner(stage)?.start(stop_flag);
        Ok(())
    }

    pub fn start_threads(&self, stop_flag: &Arc<AtomicBool>) {
        for runner in &self.runners {
            runner.start(stop_flag.clone());
        }
    }

    pub fn is_thread_running(&self, stage: StageId) -> bool {
        self.runner(stage).map(|r| r.is_running()).unwrap_or(false)
    }

    /// Stop every stage queue and join the worker threads. Queued frames stay
    /// drainable afterwards.
    pub fn stop_threads(&self) {
        for runner in &self.runners {
            runner.stop_and_join();
        }
    }

    /// Drain all stage input queues, in topology order.
    pub fn drain_queues(&self) -> Vec<Arc<Frame>> {
        self.runners
            .iter()
            .flat_map(|r| r.input_queue().drain())
            .collect()
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("mode", &self.mode)
            .field("stages", &self.topology())
            .finish()
    }
}

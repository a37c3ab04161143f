//! Stage workers
//!
//! A [`Stage`] is the opaque hardware-facing pipe: it accepts a frame whose
//! buffers are already bound and performs the device-specific processing. The
//! [`StageRunner`] owns the stage's input queue and worker thread, and
//! enforces the fail-forward contract: every frame popped from the input is
//! pushed to the configured output exactly once, marked `Error` on failure,
//! so downstream consumers see one frame per sensor tick no matter what.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::Result;
use crate::frame::{BufferState, EntityState, Frame, FrameQueue, PopResult, StageId};

/// One hardware-processing step. Implementations talk to V4L2 nodes or
/// equivalent; this crate never inspects their internals.
pub trait Stage: Send + Sync + 'static {
    fn stage_id(&self) -> StageId;

    /// Process one frame. Buffers for this stage are bound before the frame
    /// arrives; success means the hardware filled the destination buffers.
    fn process(&self, frame: &Arc<Frame>) -> Result<()>;
}

/// No-op pipe: completes every frame untouched. Used for synthetic pipelines
/// in tests and for software-bypassed hardware blocks.
pub struct PassthroughStage {
    id: StageId,
}

impl PassthroughStage {
    pub fn new(id: StageId) -> Self {
        Self { id }
    }
}

impl Stage for PassthroughStage {
    fn stage_id(&self) -> StageId {
        self.id
    }

    fn process(&self, _frame: &Arc<Frame>) -> Result<()> {
        Ok(())
    }
}

type SharedQueue = Arc<FrameQueue<Arc<Frame>>>;

/// Thread + queue plumbing around one [`Stage`].
pub struct StageRunner {
    stage: Arc<dyn Stage>,
    input: SharedQueue,
    output: Arc<Mutex<Option<SharedQueue>>>,
    /// Retirement queue used when no output is wired, so a frame (and its
    /// bound buffers) can never be stranded by incomplete wiring.
    fallback: Arc<Mutex<Option<SharedQueue>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StageRunner {
    pub fn new(stage: Arc<dyn Stage>, wait_timeout: Duration) -> Self {
        let name = format!("{:?}-in", stage.stage_id());
        Self {
            stage,
            input: Arc::new(FrameQueue::new(name, wait_timeout)),
            output: Arc::new(Mutex::new(None)),
            fallback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn stage_id(&self) -> StageId {
        self.stage.stage_id()
    }

    pub fn input_queue(&self) -> SharedQueue {
        self.input.clone()
    }

    pub fn set_output_queue(&self, queue: SharedQueue) {
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = Some(queue);
    }

    pub fn set_fallback_queue(&self, queue: SharedQueue) {
        *self.fallback.lock().unwrap_or_else(|e| e.into_inner()) = Some(queue);
    }

    pub fn push_frame(&self, frame: Arc<Frame>) {
        self.input.push(frame);
    }

    /// Spawn the worker thread. The stage suspends only inside its input
    /// queue's timed pop; `stop_flag` plus `input.stop()` is the coarse
    /// cancellation mechanism.
    pub fn start(&self, stop_flag: Arc<AtomicBool>) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            debug!(stage = ?self.stage_id(), "stage thread already running");
            return;
        }

        self.running.store(true, Ordering::Release);
        let stage = self.stage.clone();
        let input = self.input.clone();
        let output = self.output.clone();
        let fallback = self.fallback.clone();
        let running = self.running.clone();

        let joiner = std::thread::Builder::new()
            .name(format!("{:?}-pipe", self.stage_id()))
            .spawn(move || {
                loop {
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    match input.wait_and_pop() {
                        PopResult::Popped(frame) => {
                            Self::process_one(&stage, frame, &output, &fallback)
                        }
                        // Timeout is liveness, not failure: loop to re-check stop.
                        PopResult::TimedOut => continue,
                        PopResult::Stopped => break,
                    }
                }
                running.store(false, Ordering::Release);
                debug!(stage = ?stage.stage_id(), "stage thread exiting");
            })
            .expect("spawn stage thread");
        *handle = Some(joiner);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wake the worker out of its blocking pop and join it. Queued frames
    /// stay drainable for teardown buffer release.
    pub fn stop_and_join(&self) {
        self.input.stop();
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            if handle.join().is_err() {
                error!(stage = ?self.stage_id(), "stage thread panicked");
            }
        }
        self.running.store(false, Ordering::Release);
    }

    fn process_one(
        stage: &Arc<dyn Stage>,
        frame: Arc<Frame>,
        output: &Mutex<Option<SharedQueue>>,
        fallback: &Mutex<Option<SharedQueue>>,
    ) {
        let id = stage.stage_id();
        let frame_count = frame.frame_count();

        // Routing skipped this stage for this frame (e.g. zoom-with-CSC
        // bypass): forward untouched, cadence intact.
        if matches!(frame.entity_state(id), Ok(EntityState::Complete)) {
            Self::forward(id, frame, output, fallback);
            return;
        }

        if let Err(e) = frame.set_entity_state(id, EntityState::Processing) {
            warn!(frame_count, stage = ?id, error = %e, "entity refused processing state");
        }

        match stage.process(&frame) {
            Ok(()) => {
                let _ = frame.mark_entity_buffers(id, BufferState::Complete);
            }
            Err(e) => {
                // Fail forward: mark the bindings, keep the frame moving.
                warn!(
                    frame_count,
                    stage = ?id,
                    error = %e,
                    "stage processing failed, forwarding errored frame"
                );
                let _ = frame.mark_entity_buffers(id, BufferState::Error);
            }
        }

        if let Err(e) = frame.set_entity_state(id, EntityState::Complete) {
            warn!(frame_count, stage = ?id, error = %e, "entity completion rejected");
        }

        Self::forward(id, frame, output, fallback);
    }

    fn forward(
        id: StageId,
        frame: Arc<Frame>,
        output: &Mutex<Option<SharedQueue>>,
        fallback: &Mutex<Option<SharedQueue>>,
    ) {
        if let Some(queue) = output.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            queue.push(frame);
            return;
        }
        // No output wired. Dropping the frame would leak its bound buffers,
        // so divert it to the retirement queue instead.
        match fallback.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(queue) => {
                warn!(
                    frame_count = frame.frame_count(),
                    stage = ?id,
                    "no output queue configured, diverting frame to retirement"
                );
                queue.push(frame);
            }
            None => {
                error!(
                    frame_count = frame.frame_count(),
                    stage = ?id,
                    "no output or fallback queue configured, frame stranded"
                );
            }
        }
    }
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("stage", &self.stage_id())
            .field("running", &self.is_running())
            .finish()
    }
}

/// A stage that fails every frame; exercises the fail-forward path in tests.
#[cfg(test)]
pub struct FailingStage {
    pub id: StageId,
}

#[cfg(test)]
impl Stage for FailingStage {
    fn stage_id(&self) -> StageId {
        self.id
    }

    fn process(&self, _frame: &Arc<Frame>) -> Result<()> {
        Err(crate::error::PipelineError::Invariant("synthetic failure"))
    }
}

//! Orchestrator: frame generation, buffer binding, routing, retirement
//!
//! For each unit of sensor work the orchestrator finds or creates the frame,
//! binds the buffers the next stage needs, and seeds the first stage queue.
//! Between stages, per-stage setup threads pop frames from the previous
//! stage's output, bind the next stage's buffers, apply the routing branch
//! policies (early frame return, zoom-with-CSC bypass, dual-compositing
//! ownership hand-off), and push onward. A final done thread retires
//! completed frames and returns their buffers to the owning pools.
//!
//! Locking discipline: every shared structure (each buffer pool, each frame
//! list, the frame-generation state) has exactly one mutex, and no call path
//! holds two of them at once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::buffer::{Buffer, BufferManager};
use crate::error::{PipelineError, Result};
use crate::frame::{
    BoundBuffer, BufferState, Direction, EntityState, Frame, FrameList, FrameQueue, NodeGroupInfo,
    PopResult, StageId, NODE_BAYER, NODE_CAPTURE, NODE_MAIN,
};
use crate::pipeline::factory::{Factory, FrameRequest};
use crate::pipeline::selector::{CaptureSelector, KeptBuffer, SelectorEntry};
use crate::{PipelineConfig, Scenario};

/// Frame-generation bookkeeping, all under the single creation mutex so at
/// most one frame object ever exists per frame count.
struct FrameGen {
    next_count: u32,
    /// How many generated frames requested the full-resolution capture
    /// output; feeds pool-sizing decisions without a separate message bus.
    dynamic_capture: u64,
    /// Same, for the raw-bayer output.
    dynamic_bayer: u64,
}

type SharedQueue = Arc<FrameQueue<Arc<Frame>>>;

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    factory: Arc<Factory>,
    managers: Mutex<BTreeMap<(StageId, Direction), Arc<BufferManager>>>,
    process_list: FrameList,
    postprocess_list: FrameList,
    selector: Arc<CaptureSelector>,
    done_queue: SharedQueue,
    gen: Mutex<FrameGen>,
    stop_flag: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    setup_queues: Mutex<Vec<SharedQueue>>,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: Arc<PipelineConfig>, factory: Arc<Factory>) -> Arc<Self> {
        let done_timeout = config.timeouts.done_wait();
        let selector = Arc::new(CaptureSelector::new(config.selector_window));
        Arc::new(Self {
            config,
            factory,
            managers: Mutex::new(BTreeMap::new()),
            process_list: FrameList::new("process"),
            postprocess_list: FrameList::new("postprocess"),
            selector,
            done_queue: Arc::new(FrameQueue::new("done", done_timeout)),
            gen: Mutex::new(FrameGen {
                next_count: 0,
                dynamic_capture: 0,
                dynamic_bayer: 0,
            }),
            stop_flag: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            setup_queues: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn register_manager(
        &self,
        stage: StageId,
        direction: Direction,
        manager: Arc<BufferManager>,
    ) {
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((stage, direction), manager);
    }

    fn manager(&self, stage: StageId, direction: Direction) -> Result<Arc<BufferManager>> {
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(stage, direction))
            .cloned()
            .ok_or(PipelineError::BufferBind { stage, direction })
    }

    pub fn selector(&self) -> &Arc<CaptureSelector> {
        &self.selector
    }

    pub fn process_len(&self) -> usize {
        self.process_list.len()
    }

    pub fn find_frame(&self, frame_count: u32) -> Option<Arc<Frame>> {
        self.process_list.find(frame_count)
    }

    /// (dynamic capture, dynamic bayer) request totals since start.
    pub fn dynamic_request_counts(&self) -> (u64, u64) {
        let gen = self.lock_gen();
        (gen.dynamic_capture, gen.dynamic_bayer)
    }

    /// Wire stage outputs through per-stage setup threads, start the stage
    /// workers and the completion thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::Invariant("orchestrator already started"));
        }

        let topology = self.factory.topology();
        for pair in topology.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            let queue: SharedQueue = Arc::new(FrameQueue::new(
                format!("{:?}-setup", to),
                self.config.timeouts.stage_wait(to),
            ));
            self.factory.set_output_queue(from, queue.clone())?;
            self.setup_queues
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(queue.clone());
            self.spawn_setup_thread(to, queue);
        }
        self.factory
            .set_output_queue(*topology.last().expect("non-empty topology"), self.done_queue.clone())?;
        // A frame must always reach retirement even if an output queue was
        // left unwired.
        self.factory.set_fallback_queues(self.done_queue.clone());

        self.factory.start_threads(&self.stop_flag);
        self.spawn_done_thread();

        info!(mode = ?self.factory.mode(), "pipeline started");
        Ok(())
    }

    fn spawn_setup_thread(self: &Arc<Self>, stage: StageId, queue: SharedQueue) {
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{:?}-setup", stage))
            .spawn(move || {
                loop {
                    if this.stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    match queue.wait_and_pop() {
                        PopResult::Popped(frame) => this.advance_frame(stage, frame),
                        PopResult::TimedOut => continue,
                        PopResult::Stopped => break,
                    }
                }
                debug!(stage = ?stage, "setup thread exiting");
            })
            .expect("spawn setup thread");
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn spawn_done_thread(self: &Arc<Self>) {
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("frame-done".into())
            .spawn(move || {
                loop {
                    if this.stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    match this.done_queue.wait_and_pop() {
                        PopResult::Popped(frame) => this.handle_done_frame(frame),
                        PopResult::TimedOut => continue,
                        PopResult::Stopped => break,
                    }
                }
                debug!("done thread exiting");
            })
            .expect("spawn done thread");
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Find the in-flight frame for `lookup`, or build a new one through the
    /// active factory. The whole operation runs under the single creation
    /// mutex: two concurrent calls for the same count get the same object.
    pub fn generate_frame(
        &self,
        lookup: Option<u32>,
        request: FrameRequest,
    ) -> Result<Arc<Frame>> {
        let mut gen = self.lock_gen();

        if let Some(count) = lookup {
            if let Some(frame) = self.process_list.find(count) {
                return Ok(frame);
            }
        }

        let count = match lookup {
            Some(count) => count,
            None => gen.next_count,
        };
        gen.next_count = gen.next_count.max(count.wrapping_add(1));

        let frame = self.factory.create_frame(count, request);
        if request.capture {
            gen.dynamic_capture += 1;
        }
        if request.bayer {
            gen.dynamic_bayer += 1;
        }
        self.process_list.insert(frame.clone());
        debug!(
            frame_count = count,
            capture = request.capture,
            bayer = request.bayer,
            "frame generated"
        );
        Ok(frame)
    }

    /// Entry point for the sensor-cadence thread: one raw hardware buffer in,
    /// one frame seeded into the first stage.
    pub fn on_sensor_frame(
        &self,
        request: FrameRequest,
        raw: Option<Buffer>,
    ) -> Result<Arc<Frame>> {
        if self.stop_flag.load(Ordering::Acquire) {
            return Err(PipelineError::Stopped);
        }
        let frame = self.generate_frame(None, request)?;
        let first = self.factory.first_stage();
        if let Err(e) = self.prepare_stage(first, &frame, raw, None) {
            self.abandon_frame(&frame);
            return Err(e);
        }
        self.factory.push_frame(first, frame.clone())?;
        Ok(frame)
    }

    /// Setup-thread body: bind the next stage's buffers, apply branch
    /// policies, push the frame onward. Per-frame failures never drop the
    /// frame; cadence is preserved by forwarding errored bindings.
    fn advance_frame(&self, stage: StageId, frame: Arc<Frame>) {
        match self.prepare_stage(stage, &frame, None, None) {
            Ok(()) => {}
            Err(e @ PipelineError::BufferBind { .. }) => {
                // No pool wired for a stage that needs one: fatal for this
                // frame only. Retire it so its buffers go home.
                error!(
                    frame_count = frame.frame_count(),
                    stage = ?stage,
                    error = %e,
                    "cannot bind buffers, abandoning frame"
                );
                self.abandon_frame(&frame);
                return;
            }
            Err(e) => {
                warn!(
                    frame_count = frame.frame_count(),
                    stage = ?stage,
                    error = %e,
                    "stage setup degraded, forwarding anyway"
                );
            }
        }
        if let Err(e) = self.factory.push_frame(stage, frame) {
            error!(stage = ?stage, error = %e, "failed to push frame to stage");
        }
    }

    /// Bind buffers and apply routing policy for one stage of one frame.
    pub fn prepare_stage(
        &self,
        stage: StageId,
        frame: &Arc<Frame>,
        src: Option<Buffer>,
        dst: Option<Buffer>,
    ) -> Result<()> {
        // Zoom-with-CSC bypass: if the post-crop scaler output already
        // matches the display target, the extra conversion pass is skipped
        // for this frame. Data-dependent, decided per frame.
        if stage == StageId::Csc && !self.zoom_preview_with_csc_enabled(frame) {
            debug!(
                frame_count = frame.frame_count(),
                "scaler output matches display target, skipping CSC pass"
            );
            frame.set_entity_state(StageId::Csc, EntityState::Complete)?;
            return Ok(());
        }

        self.setup_entity(stage, frame, src, dst)?;

        // Early frame return: hand the frame to the completion queue as soon
        // as its 3A buffer is bound; downstream bindings are still NoRequest
        // and the done handler tolerates the partial frame.
        if stage == StageId::ThreeA && self.config.early_frame_return {
            self.done_queue.push(frame.clone());
        }

        Ok(())
    }

    /// For each direction of the entity still waiting in `Requested` with no
    /// buffer, bind the supplied buffer or acquire one from the responsible
    /// pool. Pool exhaustion marks the binding `Error` and keeps going (fail
    /// forward); a missing pool is `BufferBind`, fatal for the frame.
    pub fn setup_entity(
        &self,
        stage: StageId,
        frame: &Arc<Frame>,
        src: Option<Buffer>,
        dst: Option<Buffer>,
    ) -> Result<()> {
        if frame.src_buffer_state(stage)? == BufferState::Requested
            && frame.src_buffer(stage)?.is_none()
        {
            match src {
                Some(buffer) => frame.set_src_buffer(stage, buffer)?,
                None => self.bind_from_pool(stage, Direction::Src, NODE_MAIN, frame)?,
            }
        }

        let mut dst = dst;
        for node in 0..frame.dst_node_count(stage)? {
            if frame.dst_buffer_state(stage, node)? != BufferState::Requested
                || frame.dst_buffer(stage, node)?.is_some()
            {
                continue;
            }
            let supplied = if node == NODE_MAIN { dst.take() } else { None };
            match supplied {
                Some(buffer) => frame.set_dst_buffer(stage, node, buffer)?,
                None => self.bind_from_pool(stage, Direction::Dst, node, frame)?,
            }
        }

        frame.set_entity_state(stage, EntityState::Processing)?;
        Ok(())
    }

    /// Acquire a slot from the (stage, direction) pool and bind it. On a
    /// failed bind the slot goes straight back, so acquisition and release
    /// stay paired on every exit path.
    fn bind_from_pool(
        &self,
        stage: StageId,
        direction: Direction,
        node: usize,
        frame: &Arc<Frame>,
    ) -> Result<()> {
        let manager = self.manager(stage, direction)?;

        let acquired = match manager.acquire() {
            Ok(pair) => Ok(pair),
            Err(PipelineError::Exhausted { .. }) if stage == StageId::Isp => {
                // ISP buffers recycle on a fixed cadence; wait bounded for
                // one to come home before declaring this frame's binding bad.
                // The wait observes the stop flag so teardown is not held up.
                manager
                    .wait_for_available_until(self.config.timeouts.buffer_wait(), &self.stop_flag)
                    .and_then(|_| manager.acquire())
            }
            Err(e) => Err(e),
        };

        let (index, buffer) = match acquired {
            Ok(pair) => pair,
            Err(e @ PipelineError::Exhausted { .. }) => {
                // Fail forward: the frame still advances so the downstream
                // consumer sees a placeholder instead of a cadence gap.
                warn!(
                    frame_count = frame.frame_count(),
                    stage = ?stage,
                    ?direction,
                    error = %e,
                    "pool exhausted, marking binding errored"
                );
                match direction {
                    Direction::Src => frame.set_src_buffer_state(stage, BufferState::Error)?,
                    Direction::Dst => {
                        frame.set_dst_buffer_state(stage, node, BufferState::Error)?
                    }
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let bound = match direction {
            Direction::Src => frame.set_src_buffer(stage, buffer),
            Direction::Dst => frame.set_dst_buffer(stage, node, buffer),
        };
        if let Err(e) = bound {
            let _ = manager.release(index, false);
            return Err(e);
        }
        Ok(())
    }

    /// Per-frame topology decision for the preview CSC pass: required only
    /// when the post-crop scaler output differs from the display target.
    pub fn zoom_preview_with_csc_enabled(&self, frame: &Arc<Frame>) -> bool {
        let crop = match frame.dst_crop(StageId::Scaler) {
            Ok(crop) => crop,
            Err(_) => return false,
        };
        if crop.width == 0 || crop.height == 0 {
            // Geometry never set: the scaler produced the negotiated preview
            // size, nothing to convert.
            return false;
        }
        self.config.zoom_csc_required(crop, self.config.preview.format)
    }

    /// Dynamic capture boost: re-request the full-resolution capture output
    /// on an already-dispatched frame and re-enqueue it at the ISP stage.
    pub fn boost_dynamic_capture(
        &self,
        frame: &Arc<Frame>,
        node_group: NodeGroupInfo,
    ) -> Result<()> {
        frame.set_node_group_info(StageId::Isp, node_group)?;
        frame.set_entity_state(StageId::Isp, EntityState::Rework)?;
        frame.set_request_capture(true);
        frame.set_dst_buffer_state(StageId::Isp, NODE_CAPTURE, BufferState::Requested)?;
        {
            let mut gen = self.lock_gen();
            gen.dynamic_capture += 1;
        }
        self.bind_from_pool(StageId::Isp, Direction::Dst, NODE_CAPTURE, frame)?;
        info!(
            frame_count = frame.frame_count(),
            "dynamic capture boost, re-queueing at ISP"
        );
        self.factory.push_frame(StageId::Isp, frame.clone())
    }

    /// Move a frame to the post-process list (HDR / long-exposure branches).
    /// A frame lives in exactly one list at any instant.
    pub fn move_to_postprocess(&self, frame: &Arc<Frame>) -> Result<()> {
        self.process_list.remove(frame)?;
        self.postprocess_list.insert(frame.clone());
        Ok(())
    }

    pub fn move_to_process(&self, frame: &Arc<Frame>) -> Result<()> {
        self.postprocess_list.remove(frame)?;
        self.process_list.insert(frame.clone());
        Ok(())
    }

    /// Completion bookkeeping for frames arriving on the done queue.
    fn handle_done_frame(&self, frame: Arc<Frame>) {
        if !frame.check_complete() {
            // Early-return frames arrive here before their chain finishes;
            // they stay registered until the final arrival.
            debug!(
                frame_count = frame.frame_count(),
                "frame not yet complete, leaving in flight"
            );
            return;
        }

        let registered = self.process_list.remove(&frame).is_ok()
            || self.postprocess_list.remove(&frame).is_ok();
        if !registered {
            // Second arrival of an already-retired frame (early return or
            // rework): anything still bound goes home, nothing else to do.
            for bound in frame.take_bound_buffers() {
                self.return_buffer(&frame, bound);
            }
            return;
        }

        self.retire_frame(frame);
    }

    /// Release every buffer the frame holds, keeping the designated capture
    /// buffers out of the normal return path for the selector.
    fn retire_frame(&self, frame: Arc<Frame>) {
        let mut kept = Vec::new();
        for bound in frame.take_bound_buffers() {
            if self.keep_for_selector(&frame, &bound) {
                match self.manager(bound.stage, bound.direction) {
                    Ok(manager) => kept.push(KeptBuffer {
                        stage: bound.stage,
                        direction: bound.direction,
                        node: bound.node,
                        manager,
                        buffer: bound.buffer,
                    }),
                    Err(e) => {
                        error!(
                            frame_count = frame.frame_count(),
                            stage = ?bound.stage,
                            error = %e,
                            "kept buffer has no pool, dropping hand-off"
                        );
                    }
                }
            } else {
                self.return_buffer(&frame, bound);
            }
        }

        debug!(frame_count = frame.frame_count(), kept = kept.len(), "frame retired");
        if !kept.is_empty() {
            self.selector.offer(SelectorEntry { frame, kept });
        }
    }

    /// Ownership hand-off policy. The dual-compositing branch must keep the
    /// ISPC output away from the pool on the normal path: the compositor
    /// still reads it, and an early return is a hardware-level use-after-free.
    fn keep_for_selector(&self, frame: &Arc<Frame>, bound: &BoundBuffer) -> bool {
        if bound.direction != Direction::Dst {
            return false;
        }
        let dual_handoff = match self.config.scenario {
            Scenario::Dual { fusion_camera_id } => {
                fusion_camera_id == self.config.camera_id
                    && bound.stage == StageId::Isp
                    && bound.node == NODE_CAPTURE
            }
            _ => false,
        };
        if dual_handoff {
            return true;
        }
        if bound.state != BufferState::Complete {
            return false;
        }
        (frame.requests_capture() && bound.stage == StageId::Isp && bound.node == NODE_CAPTURE)
            || (frame.requests_bayer()
                && bound.stage == StageId::Sensor
                && bound.node == NODE_BAYER)
    }

    /// Single return funnel. Preview-window (scaler output) buffers that
    /// errored use the cancel path because their ownership is visible to the
    /// display compositor; everything else is a plain put.
    fn return_buffer(&self, frame: &Arc<Frame>, bound: BoundBuffer) {
        let manager = match self.manager(bound.stage, bound.direction) {
            Ok(manager) => manager,
            Err(_) => {
                // Degraded operation: skip this one return rather than tear
                // down unrelated streams.
                error!(
                    frame_count = frame.frame_count(),
                    stage = ?bound.stage,
                    direction = ?bound.direction,
                    "no pool registered for bound buffer"
                );
                debug_assert!(false, "bound buffer without a pool");
                return;
            }
        };
        let cancel = bound.state == BufferState::Error
            && bound.stage == StageId::Scaler
            && bound.direction == Direction::Dst;
        if let Err(e) = manager.release(bound.buffer.index, cancel) {
            warn!(
                frame_count = frame.frame_count(),
                stage = ?bound.stage,
                index = bound.buffer.index,
                error = %e,
                "buffer return rejected"
            );
        }
    }

    /// Drop a frame that cannot advance: deregister it and send every bound
    /// buffer home. The frame object itself dies when the last transient
    /// reference drops.
    fn abandon_frame(&self, frame: &Arc<Frame>) {
        let _ = self
            .process_list
            .remove(frame)
            .or_else(|_| self.postprocess_list.remove(frame));
        for bound in frame.take_bound_buffers() {
            self.return_buffer(frame, bound);
        }
        warn!(frame_count = frame.frame_count(), "frame abandoned");
    }

    /// Coarse cancellation: stop every queue, join every thread, then drain
    /// all in-flight frames and return their buffers.
    pub fn shutdown(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        info!("pipeline shutting down");
        self.stop_flag.store(true, Ordering::Release);

        self.factory.stop_threads();
        for queue in self
            .setup_queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            queue.stop();
        }
        self.done_queue.stop();

        let handles: Vec<_> = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            if handle.join().is_err() {
                error!("pipeline thread panicked during shutdown");
            }
        }

        // Every frame still sitting in a queue gets its buffers back.
        let mut stranded = self.factory.drain_queues();
        for queue in self
            .setup_queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            stranded.extend(queue.drain());
        }
        stranded.extend(self.done_queue.drain());
        for frame in stranded {
            for bound in frame.take_bound_buffers() {
                self.return_buffer(&frame, bound);
            }
        }

        for frame in self
            .process_list
            .clear()
            .into_iter()
            .chain(self.postprocess_list.clear())
        {
            for bound in frame.take_bound_buffers() {
                self.return_buffer(&frame, bound);
            }
        }

        self.selector.clear();
        info!("pipeline drained");
    }

    fn lock_gen(&self) -> std::sync::MutexGuard<'_, FrameGen> {
        self.gen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("mode", &self.factory.mode())
            .field("in_flight", &self.process_list.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolConfig;
    use crate::pipeline::factory::FactoryMode;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.timeouts.buffer_wait_ms = 50;
        config
    }

    fn pool(name: &str, count: usize) -> Arc<BufferManager> {
        let mgr = BufferManager::new(name);
        mgr.configure(PoolConfig {
            plane_count: 1,
            plane_sizes: vec![256],
            min_count: count,
            max_count: count,
            ..PoolConfig::default()
        })
        .unwrap();
        mgr.allocate().unwrap();
        Arc::new(mgr)
    }

    fn vision_orchestrator() -> Arc<Orchestrator> {
        let config = Arc::new(test_config());
        let factory = Arc::new(Factory::with_passthrough_stages(
            FactoryMode::Vision,
            &config,
        ));
        let orchestrator = Orchestrator::new(config, factory);
        orchestrator.register_manager(StageId::Sensor, Direction::Src, pool("sensor-src", 4));
        orchestrator.register_manager(StageId::Sensor, Direction::Dst, pool("sensor-dst", 4));
        orchestrator
    }

    #[test]
    fn generate_frame_reuses_in_flight_frames() {
        let orchestrator = vision_orchestrator();
        let a = orchestrator
            .generate_frame(Some(7), FrameRequest::default())
            .unwrap();
        let b = orchestrator
            .generate_frame(Some(7), FrameRequest::default())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(orchestrator.process_len(), 1);
    }

    #[test]
    fn generate_frame_is_unique_per_count_under_contention() {
        let orchestrator = vision_orchestrator();
        let mut joins = Vec::new();
        for _ in 0..8 {
            let orchestrator = orchestrator.clone();
            joins.push(std::thread::spawn(move || {
                orchestrator
                    .generate_frame(Some(42), FrameRequest::default())
                    .unwrap()
            }));
        }
        let frames: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();
        for frame in &frames[1..] {
            assert!(Arc::ptr_eq(&frames[0], frame));
        }
        assert_eq!(orchestrator.process_len(), 1);
    }

    #[test]
    fn dynamic_counters_track_requests() {
        let orchestrator = vision_orchestrator();
        orchestrator
            .generate_frame(
                None,
                FrameRequest {
                    capture: true,
                    bayer: false,
                },
            )
            .unwrap();
        orchestrator
            .generate_frame(
                None,
                FrameRequest {
                    capture: true,
                    bayer: true,
                },
            )
            .unwrap();
        assert_eq!(orchestrator.dynamic_request_counts(), (2, 1));
    }

    #[test]
    fn setup_entity_without_pool_is_a_bind_error() {
        let config = Arc::new(test_config());
        let factory = Arc::new(Factory::with_passthrough_stages(
            FactoryMode::Vision,
            &config,
        ));
        let orchestrator = Orchestrator::new(config, factory);
        let frame = orchestrator
            .generate_frame(None, FrameRequest::default())
            .unwrap();
        let err = orchestrator
            .setup_entity(StageId::Sensor, &frame, None, None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::BufferBind { .. }));
    }

    #[test]
    fn exhausted_pool_marks_binding_errored_but_succeeds() {
        let orchestrator = vision_orchestrator();
        // Drain the destination pool.
        let dst = orchestrator.manager(StageId::Sensor, Direction::Dst).unwrap();
        let mut held = Vec::new();
        while let Ok(pair) = dst.acquire() {
            held.push(pair);
        }

        let frame = orchestrator
            .generate_frame(None, FrameRequest::default())
            .unwrap();
        orchestrator
            .setup_entity(StageId::Sensor, &frame, None, None)
            .unwrap();
        assert_eq!(
            frame.dst_buffer_state(StageId::Sensor, NODE_MAIN).unwrap(),
            BufferState::Error
        );
        // Source still bound fine.
        assert!(frame.src_buffer(StageId::Sensor).unwrap().is_some());
    }

    #[test]
    fn move_between_lists_is_exclusive() {
        let orchestrator = vision_orchestrator();
        let frame = orchestrator
            .generate_frame(None, FrameRequest::default())
            .unwrap();
        orchestrator.move_to_postprocess(&frame).unwrap();
        assert!(orchestrator.find_frame(frame.frame_count()).is_none());
        // A second move out of the process list fails: it lives in exactly one.
        assert!(orchestrator.move_to_postprocess(&frame).is_err());
        orchestrator.move_to_process(&frame).unwrap();
        assert!(orchestrator.find_frame(frame.frame_count()).is_some());
    }
}

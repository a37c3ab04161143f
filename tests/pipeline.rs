//! End-to-end pipeline behaviour through synthetic passthrough stages: buffer
//! accounting, cadence under failure, capture hand-off, and teardown drain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use framepipe::buffer::{BufferManager, PoolConfig};
use framepipe::error::Result;
use framepipe::frame::{
    BufferState, CropRect, Direction, EntityState, Frame, NodeGroupInfo, StageId, NODE_CAPTURE,
    NODE_MAIN,
};
use framepipe::pipeline::{
    Factory, FactoryMode, FrameRequest, Orchestrator, PassthroughStage, Stage, SELECT_RETRY_NORMAL,
};
use framepipe::{PipelineConfig, Scenario};

const POOL_SIZE: usize = 4;

fn test_config() -> PipelineConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let mut config = PipelineConfig::default();
    config.timeouts.buffer_wait_ms = 100;
    config
}

fn make_pool(name: &str, count: usize) -> Arc<BufferManager> {
    let pool = BufferManager::new(name);
    pool.configure(PoolConfig {
        plane_count: 1,
        plane_sizes: vec![4096],
        min_count: count,
        max_count: count,
        ..PoolConfig::default()
    })
    .unwrap();
    pool.allocate().unwrap();
    Arc::new(pool)
}

/// Register a pool for every attachment point the preview topology requests
/// (with the sensor->3A on-the-fly link active). Returns them for leak checks.
fn preview_pools(orchestrator: &Orchestrator, count: usize) -> Vec<Arc<BufferManager>> {
    let points = [
        (StageId::Sensor, Direction::Src, "sensor-src"),
        (StageId::Sensor, Direction::Dst, "sensor-dst"),
        (StageId::ThreeA, Direction::Dst, "3a-dst"),
        (StageId::Isp, Direction::Src, "isp-src"),
        (StageId::Isp, Direction::Dst, "isp-dst"),
        (StageId::Scaler, Direction::Dst, "scaler-dst"),
        (StageId::Gdc, Direction::Dst, "gdc-dst"),
        (StageId::Csc, Direction::Dst, "csc-dst"),
    ];
    let mut pools = Vec::new();
    for (stage, direction, name) in points {
        let pool = make_pool(name, count);
        orchestrator.register_manager(stage, direction, pool.clone());
        pools.push(pool);
    }
    pools
}

fn wait_until(budget: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < budget {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// A stage whose hardware always reports failure.
struct BrokenStage {
    id: StageId,
}

impl Stage for BrokenStage {
    fn stage_id(&self) -> StageId {
        self.id
    }

    fn process(&self, _frame: &Arc<Frame>) -> Result<()> {
        Err(framepipe::error::PipelineError::Invariant(
            "synthetic hardware failure",
        ))
    }
}

/// Preview topology with one broken stage, passthrough everywhere else.
fn preview_factory_with_broken(broken: StageId, config: &PipelineConfig) -> Factory {
    let stages: Vec<Arc<dyn Stage>> = FactoryMode::Preview
        .topology()
        .iter()
        .map(|&id| {
            if id == broken {
                Arc::new(BrokenStage { id }) as Arc<dyn Stage>
            } else {
                Arc::new(PassthroughStage::new(id)) as Arc<dyn Stage>
            }
        })
        .collect();
    Factory::assemble(FactoryMode::Preview, stages, config).unwrap()
}

/// A scaler that reports a zoomed output crop differing from the display
/// target, forcing the conversion pass downstream.
struct ZoomingScaler {
    crop: CropRect,
}

impl Stage for ZoomingScaler {
    fn stage_id(&self) -> StageId {
        StageId::Scaler
    }

    fn process(&self, frame: &Arc<Frame>) -> Result<()> {
        frame.set_dst_crop(StageId::Scaler, self.crop)
    }
}

#[test]
fn preview_stream_returns_every_buffer() {
    let config = Arc::new(test_config());
    let factory = Arc::new(Factory::with_passthrough_stages(
        FactoryMode::Preview,
        &config,
    ));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    orchestrator.start().unwrap();

    for _ in 0..6 {
        orchestrator
            .on_sensor_frame(FrameRequest::default(), None)
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || orchestrator.process_len() == 0),
        "frames did not all retire"
    );
    orchestrator.shutdown();

    for pool in &pools {
        assert_eq!(
            pool.available_count(),
            POOL_SIZE,
            "pool '{}' leaked buffers",
            pool.name()
        );
        assert_eq!(pool.in_flight_count(), 0);
    }
}

#[test]
fn capture_request_hands_the_buffer_to_the_selector() {
    let config = Arc::new(test_config());
    let factory = Arc::new(Factory::with_passthrough_stages(
        FactoryMode::Preview,
        &config,
    ));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    let isp_dst = pools[4].clone();

    orchestrator.start().unwrap();
    let frame = orchestrator
        .on_sensor_frame(
            FrameRequest {
                capture: true,
                bayer: false,
            },
            None,
        )
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || orchestrator
            .selector()
            .window_len()
            == 1),
        "capture candidate never reached the selector"
    );
    // The capture plane stays out of the pool while the selector holds it.
    assert_eq!(isp_dst.available_count(), POOL_SIZE - 1);

    let entry = orchestrator
        .selector()
        .select_frame(
            StageId::Isp,
            Direction::Dst,
            NODE_CAPTURE,
            SELECT_RETRY_NORMAL,
        )
        .unwrap();
    assert_eq!(entry.frame.frame_count(), frame.frame_count());
    entry.release_kept();
    assert_eq!(isp_dst.available_count(), POOL_SIZE);

    orchestrator.shutdown();
}

#[test]
fn zoomed_scaler_output_runs_the_csc_pass() {
    let config = Arc::new(test_config());
    let stages: Vec<Arc<dyn Stage>> = FactoryMode::Preview
        .topology()
        .iter()
        .map(|&id| {
            if id == StageId::Scaler {
                Arc::new(ZoomingScaler {
                    crop: CropRect::new(0, 0, 960, 540),
                }) as Arc<dyn Stage>
            } else {
                Arc::new(PassthroughStage::new(id)) as Arc<dyn Stage>
            }
        })
        .collect();
    let factory = Arc::new(Factory::assemble(FactoryMode::Preview, stages, &config).unwrap());
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    let csc_dst = pools[7].clone();
    orchestrator.start().unwrap();

    let frame = orchestrator
        .on_sensor_frame(FrameRequest::default(), None)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || orchestrator
        .process_len()
        == 0));

    // The conversion pass ran: its output plane was bound from the pool and
    // completed, not skipped. (A skipped pass stays NoRequest; an exhausted
    // bind would read Error.)
    assert_eq!(
        frame.dst_buffer_state(StageId::Csc, NODE_MAIN).unwrap(),
        BufferState::Complete
    );
    orchestrator.shutdown();
    assert_eq!(csc_dst.available_count(), POOL_SIZE);
    assert_eq!(csc_dst.in_flight_count(), 0);
}

#[test]
fn dynamic_capture_boost_reworks_an_in_flight_frame() {
    let config = Arc::new(test_config());
    let factory = Arc::new(Factory::with_passthrough_stages(
        FactoryMode::Preview,
        &config,
    ));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    let isp_dst = pools[4].clone();
    orchestrator.start().unwrap();

    // A frame that already cleared the front of the chain without any
    // capture output requested.
    let frame = orchestrator
        .generate_frame(None, FrameRequest::default())
        .unwrap();
    assert!(!frame.requests_capture());
    for stage in [StageId::Sensor, StageId::ThreeA, StageId::Isp] {
        frame.set_entity_state(stage, EntityState::Complete).unwrap();
    }

    let crop = CropRect::new(0, 0, 4032, 3024);
    orchestrator
        .boost_dynamic_capture(&frame, NodeGroupInfo { bayer_crop: crop })
        .unwrap();

    assert!(frame.requests_capture());
    assert_eq!(frame.node_group_info(StageId::Isp).unwrap().bayer_crop, crop);
    assert_eq!(orchestrator.dynamic_request_counts(), (1, 0));

    // The reworked frame re-runs ISP and the late capture plane ends up in
    // the selector window at retirement.
    assert!(
        wait_until(Duration::from_secs(5), || orchestrator
            .selector()
            .window_len()
            == 1),
        "boosted capture never reached the selector"
    );
    assert_eq!(isp_dst.available_count(), POOL_SIZE - 1);

    let entry = orchestrator
        .selector()
        .select_frame(
            StageId::Isp,
            Direction::Dst,
            NODE_CAPTURE,
            SELECT_RETRY_NORMAL,
        )
        .unwrap();
    assert!(Arc::ptr_eq(&entry.frame, &frame));
    entry.release_kept();
    assert_eq!(isp_dst.available_count(), POOL_SIZE);
    orchestrator.shutdown();
}

#[test]
fn broken_stage_preserves_cadence_and_buffer_accounting() {
    let config = Arc::new(test_config());
    let factory = Arc::new(preview_factory_with_broken(StageId::Isp, &config));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    orchestrator.start().unwrap();

    for _ in 0..4 {
        orchestrator
            .on_sensor_frame(FrameRequest::default(), None)
            .unwrap();
    }

    // Every frame still retires: failure marks bindings, it never stalls.
    assert!(
        wait_until(Duration::from_secs(5), || orchestrator.process_len() == 0),
        "errored frames did not retire"
    );
    orchestrator.shutdown();
    for pool in &pools {
        assert_eq!(pool.available_count(), POOL_SIZE, "pool '{}'", pool.name());
    }
}

#[test]
fn errored_capture_is_not_offered_under_normal_scenario() {
    let config = Arc::new(test_config());
    let factory = Arc::new(preview_factory_with_broken(StageId::Isp, &config));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    orchestrator.start().unwrap();

    orchestrator
        .on_sensor_frame(
            FrameRequest {
                capture: true,
                bayer: false,
            },
            None,
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || orchestrator
        .process_len()
        == 0));
    // The errored capture plane went home instead of into the window.
    assert_eq!(orchestrator.selector().window_len(), 0);
    orchestrator.shutdown();
    for pool in &pools {
        assert_eq!(pool.available_count(), POOL_SIZE, "pool '{}'", pool.name());
    }
}

#[test]
fn dual_fusion_keeps_the_capture_buffer_even_on_error() {
    let mut config = test_config();
    config.camera_id = 0;
    config.scenario = Scenario::Dual { fusion_camera_id: 0 };
    let config = Arc::new(config);

    let factory = Arc::new(preview_factory_with_broken(StageId::Isp, &config));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    let isp_dst = pools[4].clone();
    orchestrator.start().unwrap();

    orchestrator
        .on_sensor_frame(
            FrameRequest {
                capture: true,
                bayer: false,
            },
            None,
        )
        .unwrap();

    // The fusion consumer still reads the plane, so the errored capture
    // buffer is withheld from the pool rather than returned early.
    assert!(
        wait_until(Duration::from_secs(5), || orchestrator
            .selector()
            .window_len()
            == 1),
        "fusion hand-off never reached the selector"
    );
    assert_eq!(isp_dst.available_count(), POOL_SIZE - 1);

    // Shutdown clears the window and returns the withheld buffer.
    orchestrator.shutdown();
    assert_eq!(isp_dst.available_count(), POOL_SIZE);
}

#[test]
fn early_frame_return_still_retires_cleanly() {
    let mut config = test_config();
    config.early_frame_return = true;
    let config = Arc::new(config);

    let factory = Arc::new(Factory::with_passthrough_stages(
        FactoryMode::Preview,
        &config,
    ));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    orchestrator.start().unwrap();

    for _ in 0..4 {
        orchestrator
            .on_sensor_frame(FrameRequest::default(), None)
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || orchestrator.process_len() == 0),
        "early-returned frames did not retire"
    );
    orchestrator.shutdown();
    for pool in &pools {
        assert_eq!(pool.available_count(), POOL_SIZE, "pool '{}'", pool.name());
    }
}

#[test]
fn contended_pool_never_loses_buffers() {
    let config = Arc::new(test_config());
    let factory = Arc::new(Factory::with_passthrough_stages(
        FactoryMode::Preview,
        &config,
    ));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    // Starve the scaler output: several in-flight frames contend for one slot.
    let scaler_dst = make_pool("scaler-tiny", 1);
    orchestrator.register_manager(StageId::Scaler, Direction::Dst, scaler_dst.clone());
    orchestrator.start().unwrap();

    for _ in 0..3 {
        orchestrator
            .on_sensor_frame(FrameRequest::default(), None)
            .unwrap();
    }

    // Some frames may carry an errored scaler binding; all of them retire and
    // the slot is back regardless.
    assert!(wait_until(Duration::from_secs(5), || orchestrator
        .process_len()
        == 0));
    orchestrator.shutdown();
    assert_eq!(scaler_dst.available_count(), 1);
    for pool in &pools[..5] {
        assert_eq!(pool.available_count(), POOL_SIZE, "pool '{}'", pool.name());
    }
}

#[test]
fn shutdown_mid_stream_drains_every_buffer() {
    let config = Arc::new(test_config());
    let factory = Arc::new(Factory::with_passthrough_stages(
        FactoryMode::Preview,
        &config,
    ));
    let orchestrator = Orchestrator::new(config, factory);
    let pools = preview_pools(&orchestrator, POOL_SIZE);
    orchestrator.start().unwrap();

    for _ in 0..8 {
        let _ = orchestrator.on_sensor_frame(FrameRequest::default(), None);
    }
    // No settling: tear down with frames at arbitrary points in the chain.
    orchestrator.shutdown();

    assert_eq!(orchestrator.process_len(), 0);
    for pool in &pools {
        assert_eq!(
            pool.available_count(),
            POOL_SIZE,
            "pool '{}' lost buffers in teardown",
            pool.name()
        );
        assert_eq!(pool.in_flight_count(), 0);
    }
}

//! Capture selection: choosing the frame for a still shot
//!
//! The selector holds a bounded window of recently retired frames together
//! with the buffers the orchestrator kept out of the normal release path
//! (capture planes, raw bayer, dual-compositing hand-offs). A still-capture
//! request scans the window for a frame whose designated stage buffer is
//! complete, retrying on a fixed quantum until its budget runs out. HDR
//! bracketing needs more frames in flight, so its budget is larger.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer::{Buffer, BufferManager};
use crate::error::{PipelineError, Result};
use crate::frame::{BufferState, Direction, Frame, StageId};

/// Retry budget for a normal still capture.
pub const SELECT_RETRY_NORMAL: u32 = 3;
/// Retry budget for HDR capture: multi-exposure compositing needs more
/// frames in flight before a matching bracket is available.
pub const SELECT_RETRY_HDR: u32 = 15;
/// Fixed blocking quantum between selection retries.
pub const SELECT_RETRY_QUANTUM: Duration = Duration::from_millis(30);

/// A buffer whose ownership moved to the selector instead of returning to its
/// pool at frame retirement.
pub struct KeptBuffer {
    pub stage: StageId,
    pub direction: Direction,
    pub node: usize,
    pub manager: Arc<BufferManager>,
    pub buffer: Buffer,
}

impl std::fmt::Debug for KeptBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeptBuffer")
            .field("stage", &self.stage)
            .field("node", &self.node)
            .field("index", &self.buffer.index)
            .finish()
    }
}

/// One retired frame plus the buffers it still owns.
#[derive(Debug)]
pub struct SelectorEntry {
    pub frame: Arc<Frame>,
    pub kept: Vec<KeptBuffer>,
}

impl SelectorEntry {
    /// Return every kept buffer to its pool. Used when the entry is evicted
    /// or discarded rather than consumed by the capture path.
    pub fn release_kept(self) {
        for kept in self.kept {
            if let Err(e) = kept.manager.release(kept.buffer.index, false) {
                warn!(
                    frame_count = self.frame.frame_count(),
                    stage = ?kept.stage,
                    error = %e,
                    "failed to return kept buffer"
                );
            }
        }
    }
}

/// Bounded window of capture candidates.
pub struct CaptureSelector {
    window: Mutex<VecDeque<SelectorEntry>>,
    capacity: usize,
    retry_quantum: Duration,
}

impl CaptureSelector {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            retry_quantum: SELECT_RETRY_QUANTUM,
        }
    }

    pub fn with_retry_quantum(capacity: usize, retry_quantum: Duration) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            retry_quantum,
        }
    }

    /// Admit a retired frame. The oldest entry beyond capacity is evicted and
    /// its kept buffers go back to their pools.
    pub fn offer(&self, entry: SelectorEntry) {
        let evicted = {
            let mut window = self.lock();
            window.push_back(entry);
            if window.len() > self.capacity {
                window.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            debug!(
                frame_count = old.frame.frame_count(),
                "evicting capture candidate"
            );
            old.release_kept();
        }
    }

    /// Select `count` frames whose designated stage buffer completed, newest
    /// first. Retries up to `retry_count` times, blocking a fixed quantum per
    /// retry, before giving up.
    pub fn select_frames(
        &self,
        count: usize,
        stage: StageId,
        direction: Direction,
        node: usize,
        retry_count: u32,
    ) -> Result<Vec<SelectorEntry>> {
        let mut picked = Vec::with_capacity(count);
        let mut attempt = 0;
        loop {
            while picked.len() < count {
                match self.take_match(stage, direction, node) {
                    Some(entry) => picked.push(entry),
                    None => break,
                }
            }
            if picked.len() >= count {
                return Ok(picked);
            }
            if attempt >= retry_count {
                // Give picked candidates back; a partial bracket is useless.
                for entry in picked {
                    self.offer(entry);
                }
                return Err(PipelineError::SelectExhausted {
                    retries: retry_count,
                });
            }
            attempt += 1;
            std::thread::sleep(self.retry_quantum);
        }
    }

    /// Single-frame convenience over [`CaptureSelector::select_frames`].
    pub fn select_frame(
        &self,
        stage: StageId,
        direction: Direction,
        node: usize,
        retry_count: u32,
    ) -> Result<SelectorEntry> {
        self.select_frames(1, stage, direction, node, retry_count)
            .map(|mut entries| entries.remove(0))
    }

    fn take_match(&self, stage: StageId, direction: Direction, node: usize) -> Option<SelectorEntry> {
        let mut window = self.lock();
        let pos = window.iter().rposition(|entry| {
            let state = match direction {
                Direction::Src => entry.frame.src_buffer_state(stage).ok(),
                Direction::Dst => entry.frame.dst_buffer_state(stage, node).ok(),
            };
            state == Some(BufferState::Complete)
                && entry
                    .kept
                    .iter()
                    .any(|k| k.stage == stage && k.direction == direction && k.node == node)
        })?;
        window.remove(pos)
    }

    pub fn window_len(&self) -> usize {
        self.lock().len()
    }

    /// Drop every candidate, returning kept buffers to their pools.
    pub fn clear(&self) {
        let drained: Vec<_> = self.lock().drain(..).collect();
        for entry in drained {
            entry.release_kept();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<SelectorEntry>> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CaptureSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSelector")
            .field("window", &self.window_len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

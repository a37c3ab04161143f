//! Locked registry of in-flight frames
//!
//! One mutex per list instance; lock scope is always a single call. A frame
//! lives in at most one list at a time (process vs. post-process), and
//! remove-then-drop-last-reference is the only sanctioned destruction path.

use std::sync::{Arc, Mutex};

use crate::error::{PipelineError, Result};
use crate::frame::Frame;

pub struct FrameList {
    name: &'static str,
    frames: Mutex<Vec<Arc<Frame>>>,
}

impl FrameList {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn insert(&self, frame: Arc<Frame>) {
        self.lock().push(frame);
    }

    /// Find by frame count. An empty list is not an error; the caller gets
    /// `None` either way.
    pub fn find(&self, frame_count: u32) -> Option<Arc<Frame>> {
        self.lock()
            .iter()
            .find(|f| f.frame_count() == frame_count)
            .cloned()
    }

    /// Remove by identity (pointer equality), not by frame count, so two
    /// lookups of the same frame cannot race into removing different entries.
    pub fn remove(&self, frame: &Arc<Frame>) -> Result<()> {
        let mut frames = self.lock();
        match frames.iter().position(|f| Arc::ptr_eq(f, frame)) {
            Some(pos) => {
                frames.remove(pos);
                Ok(())
            }
            None => Err(PipelineError::FrameNotFound(frame.frame_count())),
        }
    }

    /// Drain every frame, handing ownership to the caller. Teardown path:
    /// the caller is responsible for releasing bound buffers.
    pub fn clear(&self) -> Vec<Arc<Frame>> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Frame>>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for FrameList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameList")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::media::Frame;

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Raw-frame buffer an encoder reads its input from in push mode.
///
/// Created by the encoder; written by a source through a [`SurfaceHandle`].
/// Holds at most `capacity` frames and drops the oldest on overflow, like a
/// graphics surface that only keeps the latest images.
#[derive(Debug, Clone)]
pub struct Surface {
    id: u64,
    frames: Arc<Mutex<VecDeque<Frame>>>,
    capacity: usize,
}

impl Surface {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
            frames: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a raw frame. Returns `false` when an older frame was evicted.
    pub fn push(&self, frame: Frame) -> bool {
        let mut frames = self.frames.lock();
        let evicted = if frames.len() >= self.capacity {
            frames.pop_front();
            true
        } else {
            false
        };
        frames.push_back(frame);
        !evicted
    }

    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl PartialEq for Surface {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Result of a source writing into its encoder surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Delivered,
    /// The slot is bound but frames are not flowing to the encoder yet.
    Paused,
    /// The handle was invalidated by a rebind or revoke; the frame was dropped.
    Stale,
}

#[derive(Debug, Default)]
struct Binding {
    generation: u64,
    surface: Option<Surface>,
    flowing: bool,
}

/// Single-owner binding between a video source and its encoder surface.
///
/// Every [`bind`](Self::bind) or [`revoke`](Self::revoke) bumps a generation
/// counter under the slot lock. Handles carry the generation they were issued
/// with, so a frame written through an old handle after a camera switch or an
/// encoder reset is detected and dropped instead of reaching a stale surface.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSlot {
    binding: Arc<Mutex<Binding>>,
}

impl SurfaceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand ownership of the slot to `surface`, invalidating earlier handles.
    /// The new binding starts paused.
    pub fn bind(&self, surface: Surface) -> SurfaceHandle {
        let mut binding = self.binding.lock();
        binding.generation += 1;
        binding.surface = Some(surface);
        binding.flowing = false;
        SurfaceHandle {
            binding: Arc::clone(&self.binding),
            generation: binding.generation,
        }
    }

    /// Unbind the current surface; every outstanding handle becomes stale.
    pub fn revoke(&self) {
        let mut binding = self.binding.lock();
        binding.generation += 1;
        binding.surface = None;
        binding.flowing = false;
    }

    /// Open or close the capture-to-encoder flow without changing ownership.
    pub fn set_flowing(&self, flowing: bool) {
        let mut binding = self.binding.lock();
        binding.flowing = flowing;
        if flowing {
            // Frames captured before the encoder started carry pre-roll timestamps.
            if let Some(surface) = &binding.surface {
                surface.clear();
            }
        }
    }

    pub fn is_flowing(&self) -> bool {
        self.binding.lock().flowing
    }

    pub fn current(&self) -> Option<Surface> {
        self.binding.lock().surface.clone()
    }

    pub fn generation(&self) -> u64 {
        self.binding.lock().generation
    }
}

/// A source's write access to the encoder surface, valid for one binding.
#[derive(Debug, Clone)]
pub struct SurfaceHandle {
    binding: Arc<Mutex<Binding>>,
    generation: u64,
}

impl SurfaceHandle {
    /// Deliver a raw frame to the bound surface.
    ///
    /// The generation check and the write happen under the slot lock, so a
    /// concurrent rebind either sees the frame delivered to the old surface
    /// before the switch or rejects it.
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        let binding = self.binding.lock();
        if binding.generation != self.generation {
            log::trace!("dropping frame for stale surface generation {}", self.generation);
            return SubmitOutcome::Stale;
        }
        match (&binding.surface, binding.flowing) {
            (Some(surface), true) => {
                surface.push(frame);
                SubmitOutcome::Delivered
            }
            (Some(_), false) => SubmitOutcome::Paused,
            (None, _) => SubmitOutcome::Stale,
        }
    }

    pub fn is_current(&self) -> bool {
        self.binding.lock().generation == self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

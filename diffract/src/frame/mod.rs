//! Frame stacks: the caller-provided [`FrameSource`] seam, datasets, the
//! scoped [`OpenDataset`] guard and synchronous / read-ahead iteration.

mod iter;

#[cfg(test)]
mod tests;

pub use iter::{FrameIter, IterationMode};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::geometry::InstrumentGeometry;
use crate::{Error, Result};

// ============================================================================
// Frame
// ============================================================================

/// One detector image. Row-major `u32` counts, immutable and cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    index: usize,
    rows: usize,
    cols: usize,
    data: Arc<[u32]>,
}

impl Frame {
    pub fn new(index: usize, rows: usize, cols: usize, data: Vec<u32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::Source(format!(
                "frame {index}: {} values for a {rows}x{cols} image",
                data.len()
            )));
        }
        Ok(Self {
            index,
            rows,
            cols,
            data: data.into(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u32 {
        self.data[y * self.cols + x]
    }

    pub fn to_f64(&self) -> Vec<f64> {
        self.data.iter().map(|&v| v as f64).collect()
    }

    pub fn total(&self) -> u64 {
        self.data.iter().map(|&v| v as u64).sum()
    }
}

// ============================================================================
// Frame source
// ============================================================================

/// Reader for one detector stack, implemented by file-format readers outside
/// this crate.
///
/// `open`/`close` bracket a reading session and are driven by
/// [`Dataset::open`]; `read_frame` is only called between them and may be
/// called concurrently from the read-ahead worker.
pub trait FrameSource: Send + Sync {
    /// `(rows, cols)` of every frame.
    fn shape(&self) -> (usize, usize);

    fn frame_count(&self) -> usize;

    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    /// Row-major counts of frame `index`; `index < frame_count()`.
    fn read_frame(&self, index: usize) -> Result<Vec<u32>>;
}

/// Frame source over frames already decoded in memory.
pub struct MemoryFrameSource {
    rows: usize,
    cols: usize,
    frames: Vec<Vec<u32>>,
    open_sessions: AtomicUsize,
    reads: AtomicUsize,
}

impl MemoryFrameSource {
    pub fn new(rows: usize, cols: usize, frames: Vec<Vec<u32>>) -> Self {
        Self {
            rows,
            cols,
            frames,
            open_sessions: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Number of currently open sessions.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Total `read_frame` calls served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemoryFrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFrameSource")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl FrameSource for MemoryFrameSource {
    fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn open(&self) -> Result<()> {
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    fn read_frame(&self, index: usize) -> Result<Vec<u32>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.frames
            .get(index)
            .cloned()
            .ok_or(Error::FrameIndex {
                index,
                count: self.frames.len(),
            })
    }
}

// ============================================================================
// Dataset
// ============================================================================

/// Process-unique dataset identity, used to tie peaks to their dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub u64);

static NEXT_DATASET_ID: AtomicU64 = AtomicU64::new(1);

/// Frames kept by an open dataset for random access.
pub const DEFAULT_CACHE_CAPACITY: usize = 16;

/// An ordered frame stack plus the instrument geometry valid for it.
#[derive(Clone)]
pub struct Dataset {
    id: DatasetId,
    name: String,
    source: Arc<dyn FrameSource>,
    geometry: Option<Arc<dyn InstrumentGeometry>>,
    cache_capacity: usize,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shape", &self.source.shape())
            .field("frames", &self.source.frame_count())
            .field("has_geometry", &self.geometry.is_some())
            .finish()
    }
}

impl Dataset {
    pub fn new(name: impl Into<String>, source: Arc<dyn FrameSource>) -> Self {
        Self {
            id: DatasetId(NEXT_DATASET_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            source,
            geometry: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    /// Number of randomly accessed frames an open session keeps. Streamed
    /// frames are never cached.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_geometry(mut self, geometry: Arc<dyn InstrumentGeometry>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> Option<&Arc<dyn InstrumentGeometry>> {
        self.geometry.as_ref()
    }

    pub fn frame_count(&self) -> usize {
        self.source.frame_count()
    }

    /// `(rows, cols)` of every frame.
    pub fn shape(&self) -> (usize, usize) {
        self.source.shape()
    }

    /// Start a reading session. The source is closed when the returned guard
    /// is dropped.
    pub fn open(&self) -> Result<OpenDataset> {
        self.source.open()?;
        tracing::debug!(dataset = %self.name, frames = self.frame_count(), "Dataset opened");
        Ok(OpenDataset {
            dataset: self.clone(),
            shared: Arc::new(SharedFrames {
                source: Arc::clone(&self.source),
                shape: self.source.shape(),
                count: self.source.frame_count(),
                cache: RwLock::new(FrameCache::new(self.cache_capacity)),
            }),
        })
    }
}

// ============================================================================
// Open dataset
// ============================================================================

/// Bounded frame cache, evicting the oldest insertion first.
struct FrameCache {
    frames: HashMap<usize, Frame>,
    order: VecDeque<usize>,
    capacity: usize,
}

impl FrameCache {
    fn new(capacity: usize) -> Self {
        Self {
            frames: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(&index)
    }

    /// Insert `frame` unless already present, returning the cached copy.
    fn insert(&mut self, frame: Frame) -> Frame {
        let index = frame.index();
        if let Some(existing) = self.frames.get(&index) {
            return existing.clone();
        }
        if self.capacity == 0 {
            return frame;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.frames.remove(&oldest);
            }
        }
        self.order.push_back(index);
        self.frames.insert(index, frame.clone());
        frame
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.order.clear();
    }
}

/// State shared between an open dataset and its read-ahead workers.
pub(crate) struct SharedFrames {
    source: Arc<dyn FrameSource>,
    shape: (usize, usize),
    count: usize,
    cache: RwLock<FrameCache>,
}

impl SharedFrames {
    /// Random access; the frame is kept in the bounded cache.
    pub(crate) fn frame(&self, index: usize) -> Result<Frame> {
        if let Some(frame) = self.cache.read().get(index) {
            return Ok(frame.clone());
        }
        let frame = self.load(index)?;
        // A concurrent reader may have inserted the same frame; keep the first.
        Ok(self.cache.write().insert(frame))
    }

    /// Sequential access; a cached frame is reused but a loaded one is not
    /// kept.
    pub(crate) fn stream(&self, index: usize) -> Result<Frame> {
        if let Some(frame) = self.cache.read().get(index) {
            return Ok(frame.clone());
        }
        self.load(index)
    }

    fn load(&self, index: usize) -> Result<Frame> {
        if index >= self.count {
            return Err(Error::FrameIndex {
                index,
                count: self.count,
            });
        }
        let data = self.source.read_frame(index)?;
        let (rows, cols) = self.shape;
        if data.len() != rows * cols {
            let actual = if cols > 0 && data.len() % cols == 0 {
                (data.len() / cols, cols)
            } else {
                (1, data.len())
            };
            return Err(Error::FrameShape {
                expected: self.shape,
                actual,
            });
        }
        Frame::new(index, rows, cols, data)
    }
}

/// A dataset inside an open reading session.
///
/// Frames fetched with [`frame`](Self::frame) are kept in a bounded cache
/// shared read-only between readers; frames streamed by [`frames`](Self::frames)
/// are not retained. Dropping the guard closes the underlying source.
pub struct OpenDataset {
    dataset: Dataset,
    shared: Arc<SharedFrames>,
}

impl fmt::Debug for OpenDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenDataset")
            .field("dataset", &self.dataset)
            .field("cached", &self.cached_frames())
            .finish()
    }
}

impl OpenDataset {
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn frame_count(&self) -> usize {
        self.shared.count
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shared.shape
    }

    /// Random access to frame `index`. Recently accessed frames are cached.
    pub fn frame(&self, index: usize) -> Result<Frame> {
        self.shared.frame(index)
    }

    /// Iterate frames in `range` (clamped to the dataset) using `mode`.
    pub fn frames(&self, mode: IterationMode, range: Range<usize>) -> FrameIter<'_> {
        let end = range.end.min(self.frame_count());
        let start = range.start.min(end);
        FrameIter::new(self, Arc::clone(&self.shared), start..end, mode)
    }

    pub fn cached_frames(&self) -> usize {
        self.shared.cache.read().len()
    }

    /// Drop all cached frames.
    pub fn clear_cache(&self) {
        self.shared.cache.write().clear();
    }
}

impl Drop for OpenDataset {
    fn drop(&mut self) {
        self.shared.source.close();
        tracing::debug!(dataset = %self.dataset.name, "Dataset closed");
    }
}

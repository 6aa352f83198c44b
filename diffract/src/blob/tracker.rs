use std::collections::HashMap;

use super::{label_components, Blob, Connectivity};
use crate::frame::Frame;

const NO_OWNER: u32 = u32::MAX;

/// A blob that has stopped growing.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedBlob {
    pub blob: Blob,
    pub first_frame: usize,
    pub last_frame: usize,
    /// Creation order; finalized blobs are reported in this order.
    pub(crate) seq: u64,
}

impl TrackedBlob {
    /// Number of frames between first and last appearance, inclusive.
    pub fn frame_span(&self) -> usize {
        self.last_frame - self.first_frame + 1
    }

    /// Absorb `other`, keeping the earlier creation order.
    pub(crate) fn absorb(&mut self, other: TrackedBlob) {
        self.blob.merge(&other.blob);
        self.first_frame = self.first_frame.min(other.first_frame);
        self.last_frame = self.last_frame.max(other.last_frame);
        self.seq = self.seq.min(other.seq);
    }
}

#[derive(Debug)]
struct OpenBlob {
    tracked: TrackedBlob,
    grew: bool,
}

/// Per-component accumulation for the current frame.
struct Component {
    blob: Blob,
    overlaps: Vec<usize>,
}

/// Sequential state machine building 3D blobs from consecutive frames.
///
/// Each frame is thresholded and labeled; a component overlapping open blobs
/// from the previous frame extends them (merging them if it touches several),
/// otherwise it seeds a new blob. Open blobs that do not grow in a frame are
/// finalized. Open blobs live in an arena whose slots are recycled through a
/// free list.
pub struct BlobTracker {
    rows: usize,
    cols: usize,
    connectivity: Connectivity,
    arena: Vec<Option<OpenBlob>>,
    free: Vec<usize>,
    /// Open-blob id owning each pixel of the previous frame.
    owners: Vec<u32>,
    finished: Vec<TrackedBlob>,
    next_seq: u64,
    last_frame: Option<usize>,
}

impl BlobTracker {
    pub fn new(rows: usize, cols: usize, connectivity: Connectivity) -> Self {
        Self {
            rows,
            cols,
            connectivity,
            arena: Vec::new(),
            free: Vec::new(),
            owners: vec![NO_OWNER; rows * cols],
            finished: Vec::new(),
            next_seq: 0,
            last_frame: None,
        }
    }

    /// Number of blobs currently growing.
    pub fn open_count(&self) -> usize {
        self.arena.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    /// Arena slots allocated so far, open or free.
    pub(crate) fn arena_slots(&self) -> usize {
        self.arena.len()
    }

    /// Add one frame. Pixels whose filtered value is `>= threshold` are
    /// foreground; each foreground pixel contributes its raw count from
    /// `frame` as weight.
    pub fn push_frame(&mut self, frame: &Frame, filtered: &[f64], threshold: f64) {
        debug_assert_eq!(frame.shape(), (self.rows, self.cols));
        debug_assert_eq!(filtered.len(), self.rows * self.cols);

        let z = frame.index();
        // A gap in the frame sequence ends every open blob.
        if self.last_frame.is_some_and(|last| last + 1 != z) {
            self.finalize_where(|_| true);
            self.owners.fill(NO_OWNER);
        }
        self.last_frame = Some(z);

        let mask: Vec<bool> = filtered.iter().map(|&v| v >= threshold).collect();
        let (labels, count) = label_components(&mask, self.rows, self.cols, self.connectivity);

        let mut components: Vec<Component> = (0..count)
            .map(|_| Component {
                blob: Blob::new(),
                overlaps: Vec::new(),
            })
            .collect();

        let neighbourhood = self.connectivity.neighbourhood();
        for y in 0..self.rows {
            for x in 0..self.cols {
                let label = labels[y * self.cols + x];
                if label == 0 {
                    continue;
                }
                let component = &mut components[label as usize - 1];
                component
                    .blob
                    .add_point(x as f64, y as f64, z as f64, frame.get(x, y) as f64);

                for &(dx, dy) in neighbourhood {
                    let (nx, ny) = (x as isize + dx, y as isize + dy);
                    if nx < 0 || ny < 0 || nx >= self.cols as isize || ny >= self.rows as isize {
                        continue;
                    }
                    let owner = self.owners[ny as usize * self.cols + nx as usize];
                    if owner != NO_OWNER && !component.overlaps.contains(&(owner as usize)) {
                        component.overlaps.push(owner as usize);
                    }
                }
            }
        }

        // Ids merged away this frame, and where they went.
        let mut alias: HashMap<usize, usize> = HashMap::new();
        let mut retired: Vec<usize> = Vec::new();
        let mut component_ids = Vec::with_capacity(count);

        for component in components {
            let mut targets: Vec<usize> = component
                .overlaps
                .iter()
                .map(|&id| resolve(&alias, id))
                .collect();
            targets.sort_unstable();
            targets.dedup();

            let id = match targets.as_slice() {
                [] => self.open(component.blob, z),
                _ => {
                    let target = *targets
                        .iter()
                        .min_by_key(|&&id| self.seq_of(id))
                        .unwrap_or(&targets[0]);
                    for &other in targets.iter().filter(|&&id| id != target) {
                        if let Some(absorbed) = self.arena[other].take() {
                            if let Some(open) = self.arena[target].as_mut() {
                                open.tracked.absorb(absorbed.tracked);
                            }
                        }
                        alias.insert(other, target);
                        retired.push(other);
                    }
                    if let Some(open) = self.arena[target].as_mut() {
                        open.tracked.blob.merge(&component.blob);
                        open.tracked.last_frame = z;
                        open.grew = true;
                    }
                    target
                }
            };
            component_ids.push(id);
        }

        for (owner, &label) in self.owners.iter_mut().zip(labels.iter()) {
            *owner = if label == 0 {
                NO_OWNER
            } else {
                resolve(&alias, component_ids[label as usize - 1]) as u32
            };
        }

        self.finalize_where(|open| !open.grew);
        for slot in self.arena.iter_mut().flatten() {
            slot.grew = false;
        }
        self.free.extend(retired);
    }

    /// Finalize every open blob and return all blobs in creation order.
    pub fn finish(mut self) -> Vec<TrackedBlob> {
        self.finalize_where(|_| true);
        let mut finished = self.finished;
        finished.sort_by_key(|b| b.seq);
        finished
    }

    fn open(&mut self, blob: Blob, frame: usize) -> usize {
        let tracked = TrackedBlob {
            blob,
            first_frame: frame,
            last_frame: frame,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let open = Some(OpenBlob { tracked, grew: true });
        match self.free.pop() {
            Some(id) => {
                self.arena[id] = open;
                id
            }
            None => {
                self.arena.push(open);
                self.arena.len() - 1
            }
        }
    }

    fn seq_of(&self, id: usize) -> u64 {
        self.arena[id]
            .as_ref()
            .map_or(u64::MAX, |open| open.tracked.seq)
    }

    fn finalize_where(&mut self, predicate: impl Fn(&OpenBlob) -> bool) {
        for (id, slot) in self.arena.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(&predicate) {
                if let Some(open) = slot.take() {
                    self.finished.push(open.tracked);
                    self.free.push(id);
                }
            }
        }
    }
}

fn resolve(alias: &HashMap<usize, usize>, mut id: usize) -> usize {
    while let Some(&next) = alias.get(&id) {
        id = next;
    }
    id
}

//! Connected component labeling of a thresholded frame.
//!
//! Foreground pixels are collected into horizontal runs; runs in adjacent
//! rows that touch are joined with a union-find.

use serde::{Deserialize, Serialize};

/// Pixel adjacency used for in-frame labeling and cross-frame overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Connectivity {
    /// Horizontal and vertical neighbours; across frames, the same pixel.
    Four,
    /// All eight neighbours; across frames, the 3x3 neighbourhood.
    #[default]
    Eight,
}

impl Connectivity {
    /// Pixel offsets considered adjacent to `(0, 0)`, including itself.
    pub(crate) fn neighbourhood(self) -> &'static [(isize, isize)] {
        match self {
            Connectivity::Four => &[(0, 0)],
            Connectivity::Eight => &[
                (-1, -1),
                (0, -1),
                (1, -1),
                (-1, 0),
                (0, 0),
                (1, 0),
                (-1, 1),
                (0, 1),
                (1, 1),
            ],
        }
    }
}

/// A horizontal run of foreground pixels.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: usize, // inclusive
    end: usize,   // exclusive
    label: u32,
}

#[inline]
fn runs_connected(prev: &Run, curr: &Run, connectivity: Connectivity) -> bool {
    match connectivity {
        Connectivity::Four => prev.start < curr.end && prev.end > curr.start,
        Connectivity::Eight => prev.start < curr.end + 1 && prev.end + 1 > curr.start,
    }
}

fn extract_runs(mask_row: &[bool], runs: &mut Vec<Run>) {
    runs.clear();
    let mut start = None;
    for (x, &on) in mask_row.iter().enumerate() {
        match (on, start) {
            (true, None) => start = Some(x),
            (false, Some(s)) => {
                runs.push(Run { start: s, end: x, label: 0 });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(Run {
            start: s,
            end: mask_row.len(),
            label: 0,
        });
    }
}

struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new() -> Self {
        Self { parent: Vec::new() }
    }

    fn make_set(&mut self) -> u32 {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        id
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grandparent = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grandparent;
            x = grandparent;
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower label wins so final labels follow raster order.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi as usize] = lo;
        }
    }
}

/// Label foreground pixels of a row-major mask.
///
/// Returns per-pixel labels (`0` = background, components numbered from 1 in
/// raster order of their first pixel) and the number of components.
pub(crate) fn label_components(
    mask: &[bool],
    rows: usize,
    cols: usize,
    connectivity: Connectivity,
) -> (Vec<u32>, usize) {
    debug_assert_eq!(mask.len(), rows * cols);

    let mut uf = UnionFind::new();
    let mut all_runs: Vec<(usize, Run)> = Vec::new();
    let mut prev_runs: Vec<Run> = Vec::new();
    let mut curr_runs: Vec<Run> = Vec::new();

    for y in 0..rows {
        extract_runs(&mask[y * cols..(y + 1) * cols], &mut curr_runs);
        for run in curr_runs.iter_mut() {
            let mut label = None;
            for prev in prev_runs.iter().filter(|p| runs_connected(p, run, connectivity)) {
                match label {
                    None => label = Some(prev.label),
                    Some(l) => uf.union(l, prev.label),
                }
            }
            run.label = label.unwrap_or_else(|| uf.make_set());
            all_runs.push((y, *run));
        }
        std::mem::swap(&mut prev_runs, &mut curr_runs);
    }

    // Compact roots to 1..=count in raster order.
    let mut compact = vec![0u32; uf.parent.len()];
    let mut count = 0usize;
    let mut labels = vec![0u32; rows * cols];
    for (y, run) in &all_runs {
        let root = uf.find(run.label) as usize;
        if compact[root] == 0 {
            count += 1;
            compact[root] = count as u32;
        }
        let label = compact[root];
        labels[y * cols + run.start..y * cols + run.end].fill(label);
    }

    (labels, count)
}

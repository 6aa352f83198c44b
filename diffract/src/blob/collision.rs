use super::TrackedBlob;
use crate::geometry::Aabb3;

/// Merge finalized blobs whose `scale`-sigma bounding boxes intersect,
/// repeating until no pair collides. Blobs without a valid ellipsoid never
/// collide. Creation order is preserved.
pub fn merge_colliding(mut blobs: Vec<TrackedBlob>, scale: f64) -> Vec<TrackedBlob> {
    let bounding_box = |b: &TrackedBlob| -> Option<Aabb3> {
        b.blob.to_ellipsoid(scale).ok().map(|e| e.aabb())
    };

    let mut boxes: Vec<Option<Aabb3>> = blobs.iter().map(bounding_box).collect();
    let mut merges = 0usize;

    'scan: loop {
        for i in 0..blobs.len() {
            let Some(a) = boxes[i] else { continue };
            for j in (i + 1)..blobs.len() {
                let Some(b) = boxes[j] else { continue };
                if a.intersects(&b) {
                    let absorbed = blobs.remove(j);
                    boxes.remove(j);
                    blobs[i].absorb(absorbed);
                    boxes[i] = bounding_box(&blobs[i]);
                    merges += 1;
                    continue 'scan;
                }
            }
        }
        break;
    }

    if merges > 0 {
        tracing::debug!(merges, remaining = blobs.len(), "Merged colliding blobs");
    }
    blobs.sort_by_key(|b| b.seq);
    blobs
}

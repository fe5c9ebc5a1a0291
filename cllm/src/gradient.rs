//! A flat gradient vector partitioned into disjoint per-worker segments.

/// The half-open index range `[start, end)` one worker owns inside a [`GradientBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Inclusive start index.
    pub start: usize,
    /// Exclusive end index.
    pub end: usize,
}

impl Segment {
    /// Number of parameters covered by this segment.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the segment covers no parameters.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Computes the `N` disjoint segments covering `[0, p)`, worker `i` owning
/// `[floor(i*P/N), floor((i+1)*P/N))`.
pub fn partition_segments(total_params: usize, num_workers: usize) -> Vec<Segment> {
    assert!(num_workers > 0, "need at least one worker to partition a gradient buffer");
    (0..num_workers)
        .map(|i| {
            let start = i * total_params / num_workers;
            let end = (i + 1) * total_params / num_workers;
            Segment { start, end }
        })
        .collect()
}

/// A contiguous array of `P` gradient floats, sliced into disjoint worker segments.
///
/// Invariants: during a batch, worker `i` writes only inside segment `i`;
/// between a drain barrier and the next dispatch, only the coordinator touches the
/// buffer; after reduction the full buffer is one logical gradient vector.
pub struct GradientBuffer {
    data: Vec<f32>,
    segments: Vec<Segment>,
}

impl GradientBuffer {
    /// Allocates a zeroed buffer of `total_params` floats split into `num_workers`
    /// segments.
    pub fn new(total_params: usize, num_workers: usize) -> Self {
        Self {
            data: vec![0.0; total_params],
            segments: partition_segments(total_params, num_workers),
        }
    }

    /// Total parameter count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The segment bounds assigned to worker `index`.
    pub fn segment(&self, index: usize) -> Segment {
        self.segments[index]
    }

    /// All segment bounds, in worker order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Mutable view of worker `index`'s segment. Only that worker's thread should ever
    /// call this during a batch.
    pub fn segment_mut(&mut self, index: usize) -> &mut [f32] {
        let seg = self.segments[index];
        &mut self.data[seg.start..seg.end]
    }

    /// Read-only view of worker `index`'s segment.
    pub fn segment_slice(&self, index: usize) -> &[f32] {
        let seg = self.segments[index];
        &self.data[seg.start..seg.end]
    }

    /// Zeros the entire buffer. Idempotent.
    pub fn zero(&mut self) {
        self.data.iter_mut().for_each(|g| *g = 0.0);
    }

    /// The full buffer as a single logical gradient vector (only valid between a drain
    /// barrier and the next dispatch).
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the full buffer, for coordinator-side reduction.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_cover_range_exactly_once() {
        for n in [1usize, 2, 3, 5, 7, 16, 128] {
            let p = 1000;
            let segs = partition_segments(p, n);
            assert_eq!(segs.len(), n);
            assert_eq!(segs[0].start, 0);
            assert_eq!(segs[n - 1].end, p);
            for window in segs.windows(2) {
                assert_eq!(window[0].end, window[1].start);
            }
        }
    }

    #[test]
    fn disjointness_holds_for_odd_sizes_too() {
        // P not evenly divisible by N exercises the floor-division boundary.
        let segs = partition_segments(17, 5);
        let total: usize = segs.iter().map(|s| s.len()).sum();
        assert_eq!(total, 17);
    }

    #[test]
    fn writes_stay_inside_owning_segment() {
        let mut buf = GradientBuffer::new(10, 3);
        {
            let seg0 = buf.segment_mut(0);
            seg0.iter_mut().for_each(|g| *g = 1.0);
        }
        {
            let seg1 = buf.segment_mut(1);
            seg1.iter_mut().for_each(|g| *g = 2.0);
        }
        let seg0_bounds = buf.segment(0);
        let seg1_bounds = buf.segment(1);
        assert!(buf.as_slice()[seg0_bounds.start..seg0_bounds.end].iter().all(|&g| g == 1.0));
        assert!(buf.as_slice()[seg1_bounds.start..seg1_bounds.end].iter().all(|&g| g == 2.0));
    }

    #[test]
    fn zero_is_idempotent() {
        let mut buf = GradientBuffer::new(4, 2);
        buf.segment_mut(0)[0] = 5.0;
        buf.zero();
        buf.zero();
        assert!(buf.as_slice().iter().all(|&g| g == 0.0));
    }
}

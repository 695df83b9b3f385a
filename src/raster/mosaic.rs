//! Mosaic merger (C4): combines N warped single-band rasters with possibly
//! overlapping coverage into one raster under a pixel-selection rule.
//!
//! The block-by-block windowed iteration (rather than whole-raster in-memory
//! arithmetic) is grounded on `raster_tiles/mosaic/merge.py::raster_copy*` in
//! the reference tiler, so the merger scales past available RAM the same way.
//! Dispatch replaces the reference's string-keyed registry with the
//! tagged-variant `apply` interface spec.md §9 DESIGN NOTES calls for.

pub use crate::config::PixelSelectionMethod as PixelSelection;

/// Sentinel nodata value for mosaic output rasters (spec §4.4).
pub const MOSAIC_NODATA: f32 = -9_999_999.0;

/// Auxiliary accumulator state for the `mean` rule, carried across all input
/// rasters for a destination block.
#[derive(Debug, Clone)]
pub struct MeanAccumulator {
    pub sum: Vec<f32>,
    pub count: Vec<u16>,
    max_count: u16,
}

impl MeanAccumulator {
    pub fn new(len: usize, input_count: usize) -> Self {
        Self {
            sum: vec![0.0; len],
            count: vec![0; len],
            max_count: input_count.min(u16::MAX as usize) as u16,
        }
    }

    /// Folds one input block into the running sum/count, bounding `count` by
    /// the total number of inputs so a pathological number of overlapping
    /// sources cannot overflow it (spec invariant: "numerically stable
    /// against input count overflow").
    pub fn accumulate(&mut self, src: &[f32], src_mask: &[bool]) {
        for i in 0..src.len() {
            if src_mask[i] && self.count[i] < self.max_count {
                self.sum[i] += src[i];
                self.count[i] += 1;
            }
        }
    }

    /// Produces the final `MEAN = SUM / COUNT` raster, masking pixels with
    /// `COUNT == 0` back to nodata.
    pub fn finish(&self, nodata: f32) -> Vec<f32> {
        self.sum
            .iter()
            .zip(&self.count)
            .map(|(&s, &c)| if c == 0 { nodata } else { s / c as f32 })
            .collect()
    }
}

/// Applies a pixel-selection rule to fold one source block into a
/// destination block in place.
///
/// `dst`/`src` are same-length pixel buffers for the overlapping window;
/// `dst_mask`/`src_mask` mark which pixels currently hold valid (non-nodata)
/// data. `dst_mask` is updated to reflect the post-merge validity.
pub fn apply(
    rule: PixelSelection,
    dst: &mut [f32],
    dst_mask: &mut [bool],
    src: &[f32],
    src_mask: &[bool],
) {
    match rule {
        PixelSelection::First => {
            for i in 0..dst.len() {
                if !dst_mask[i] && src_mask[i] {
                    dst[i] = src[i];
                    dst_mask[i] = true;
                }
            }
        }
        PixelSelection::Last => {
            for i in 0..dst.len() {
                if src_mask[i] {
                    dst[i] = src[i];
                    dst_mask[i] = true;
                }
            }
        }
        PixelSelection::Min => {
            for i in 0..dst.len() {
                if src_mask[i] {
                    dst[i] = if dst_mask[i] {
                        dst[i].min(src[i])
                    } else {
                        src[i]
                    };
                    dst_mask[i] = true;
                }
            }
        }
        PixelSelection::Max => {
            for i in 0..dst.len() {
                if src_mask[i] {
                    dst[i] = if dst_mask[i] {
                        dst[i].max(src[i])
                    } else {
                        src[i]
                    };
                    dst_mask[i] = true;
                }
            }
        }
        PixelSelection::Mean => {
            // Mean requires the separate SUM/COUNT accumulator; callers use
            // `MeanAccumulator` directly instead of this entry point.
            unreachable!("Mean uses MeanAccumulator::accumulate, not apply()")
        }
    }
}

/// Merges N same-shape single-band rasters already resampled onto a common
/// output grid (the resampling-to-coarsest-resolution step is the
/// responsibility of the raster adapter/preprocessor before this is called).
///
/// Returns the merged raster plus its validity mask.
pub fn merge_rasters(
    rule: PixelSelection,
    inputs: &[(Vec<f32>, Vec<bool>)],
    nodata: f32,
) -> Vec<f32> {
    let len = inputs.first().map(|(d, _)| d.len()).unwrap_or(0);

    if rule == PixelSelection::Mean {
        let mut acc = MeanAccumulator::new(len, inputs.len());
        for (src, src_mask) in inputs {
            acc.accumulate(src, src_mask);
        }
        return acc.finish(nodata);
    }

    let mut dst = vec![nodata; len];
    let mut dst_mask = vec![false; len];
    for (src, src_mask) in inputs {
        apply(rule, &mut dst, &mut dst_mask, src, src_mask);
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_3_single_input_neutrality() {
        let data = vec![1.0f32, 2.0, MOSAIC_NODATA, 4.0];
        let mask = vec![true, true, false, true];
        for rule in [
            PixelSelection::First,
            PixelSelection::Last,
            PixelSelection::Min,
            PixelSelection::Max,
        ] {
            let merged = merge_rasters(rule, &[(data.clone(), mask.clone())], MOSAIC_NODATA);
            assert_eq!(merged, data, "rule {:?} must be neutral on a single input", rule);
        }
        let merged = merge_rasters(PixelSelection::Mean, &[(data.clone(), mask.clone())], MOSAIC_NODATA);
        assert_eq!(merged, data);
    }

    #[test]
    fn s3_scenario_max_rule_overlap() {
        // A covers pixels 0,1 with value 1; B covers pixels 1,2 with value 2.
        let a = (vec![1.0, 1.0, MOSAIC_NODATA], vec![true, true, false]);
        let b = (vec![MOSAIC_NODATA, 2.0, 2.0], vec![false, true, true]);
        let merged = merge_rasters(PixelSelection::Max, &[a, b], MOSAIC_NODATA);
        assert_eq!(merged, vec![1.0, 2.0, 2.0]);
    }

    #[test]
    fn mean_rule_bounds_count_and_masks_uncovered() {
        let a = (vec![1.0, MOSAIC_NODATA], vec![true, false]);
        let b = (vec![3.0, MOSAIC_NODATA], vec![true, false]);
        let merged = merge_rasters(PixelSelection::Mean, &[a, b], MOSAIC_NODATA);
        assert_eq!(merged[0], 2.0);
        assert_eq!(merged[1], MOSAIC_NODATA);
    }

    #[test]
    fn first_rule_keeps_earliest_valid_pixel() {
        let a = (vec![1.0], vec![true]);
        let b = (vec![2.0], vec![true]);
        let merged = merge_rasters(PixelSelection::First, &[a, b], MOSAIC_NODATA);
        assert_eq!(merged, vec![1.0]);
    }

    #[test]
    fn last_rule_keeps_latest_valid_pixel() {
        let a = (vec![1.0], vec![true]);
        let b = (vec![2.0], vec![true]);
        let merged = merge_rasters(PixelSelection::Last, &[a, b], MOSAIC_NODATA);
        assert_eq!(merged, vec![2.0]);
    }
}

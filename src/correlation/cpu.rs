use crate::{
    config::{ErrorMetric, FilterMode, normalize},
    panorama::Panorama,
};

use super::{Block, BlockScorer, ScoreError, mean};

/// Host implementation of the matching program.
pub struct CpuScorer<'a> {
    source: &'a Panorama,
    target: &'a Panorama,
    metric: ErrorMetric,
    filter_mode: FilterMode,
    subpixel: i64,
}

impl<'a> CpuScorer<'a> {
    pub fn new(source: &'a Panorama, target: &'a Panorama, metric: ErrorMetric) -> CpuScorer<'a> {
        CpuScorer {
            source,
            target,
            metric,
            filter_mode: FilterMode::default(),
            subpixel: 1,
        }
    }

    /// Offsets are counted in `1 / subpixel` rows; fractional rows are resolved by `filter_mode`.
    pub fn with_sampling(self, filter_mode: FilterMode, subpixel: u32) -> CpuScorer<'a> {
        CpuScorer {
            filter_mode,
            subpixel: subpixel.max(1) as i64,
            ..self
        }
    }

    /// Target color at column `x`, `offset / subpixel` rows below row `y`.
    fn target_color(&self, x: usize, y: usize, offset: i32) -> [f32; 3] {
        let s = self.subpixel;
        let n = y as i64 * s + offset as i64;
        let sample = |row: i64| normalize(self.target.sample(x as isize, row as isize));
        match self.filter_mode {
            FilterMode::Nearest => sample((2 * n + s).div_euclid(2 * s)),
            FilterMode::Linear => {
                let row = n.div_euclid(s);
                let weight = n.rem_euclid(s) as f32 / s as f32;
                let a = sample(row);
                if weight == 0.0 {
                    return a;
                }
                let b = sample(row + 1);
                [
                    a[0] + (b[0] - a[0]) * weight,
                    a[1] + (b[1] - a[1]) * weight,
                    a[2] + (b[2] - a[2]) * weight,
                ]
            }
        }
    }

    fn block_error(&self, block: &Block, offset: i32) -> f32 {
        let mut sum = 0.0f64;
        for y in block.y..block.y + block.height {
            for x in block.x..block.x + block.width {
                let a = normalize(self.source.pixel(x, y));
                let b = self.target_color(x, y, offset);
                sum += self.metric.color_error(a, b) as f64;
            }
        }
        mean(sum, block.width * block.height)
    }
}

impl BlockScorer for CpuScorer<'_> {
    fn score(&mut self, block: &Block, offset: i32) -> Result<f32, ScoreError> {
        Ok(self.block_error(block, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::BlockLayout;

    fn gradient(width: usize, height: usize) -> Panorama {
        let bytes = (0..width * height)
            .flat_map(|i| {
                let (x, y) = (i % width, i / width);
                [(y * 20) as u8, (x * 10) as u8, 0, 255]
            })
            .collect();
        Panorama::from_rgba(width, height, bytes).unwrap()
    }

    #[test]
    fn identical_images_score_zero_at_zero_offset() {
        let img = gradient(8, 8);
        let mut scorer = CpuScorer::new(&img, &img, ErrorMetric::Sad);
        let block = BlockLayout::new(8, 8, 4).block(3);
        assert_eq!(scorer.score(&block, 0).unwrap(), 0.0);
        assert!(scorer.score(&block, 1).unwrap() > 0.0);
    }

    #[test]
    fn vertical_samples_clamp_to_edge_rows() {
        let img = gradient(4, 4);
        let mut scorer = CpuScorer::new(&img, &img, ErrorMetric::Sad);
        let block = BlockLayout::new(4, 4, 4).block(0);
        // Every row but the last one differs by one row step.
        let expected = (3.0 * 20.0 / 255.0 * 4.0) / 16.0;
        let score = scorer.score(&block, 1).unwrap();
        assert!((score - expected).abs() < 1e-6);
        assert_eq!(
            scorer.score(&block, 100).unwrap(),
            scorer.score(&block, 3).unwrap()
        );
    }

    #[test]
    fn ssd_squares_channel_differences() {
        let white = Panorama::from_rgba(2, 2, vec![255; 16]).unwrap();
        let black = Panorama::from_rgba(2, 2, [0, 0, 0, 255].repeat(4)).unwrap();
        let block = BlockLayout::new(2, 2, 2).block(0);
        let mut sad = CpuScorer::new(&white, &black, ErrorMetric::Sad);
        let mut ssd = CpuScorer::new(&white, &black, ErrorMetric::Ssd);
        assert_eq!(sad.score(&block, 0).unwrap(), 3.0);
        assert_eq!(ssd.score(&block, 0).unwrap(), 3.0);
    }

    #[test]
    fn filter_mode_resolves_half_rows() {
        let img = gradient(4, 4);
        let block = BlockLayout::new(4, 4, 4).block(0);
        let mut nearest =
            CpuScorer::new(&img, &img, ErrorMetric::Sad).with_sampling(FilterMode::Nearest, 2);
        let mut linear =
            CpuScorer::new(&img, &img, ErrorMetric::Sad).with_sampling(FilterMode::Linear, 2);
        let mut whole = CpuScorer::new(&img, &img, ErrorMetric::Sad);

        // Half a row rounds to the next row.
        let nearest_score = nearest.score(&block, 1).unwrap();
        assert_eq!(nearest_score, whole.score(&block, 1).unwrap());
        // Blending two rows halves the difference of the three unclamped rows.
        let linear_score = linear.score(&block, 1).unwrap();
        let expected = (3.0 * 10.0 / 255.0 * 4.0) / 16.0;
        assert!((linear_score - expected).abs() < 1e-6);
        assert!(linear_score < nearest_score);

        // Whole rows do not depend on the filter.
        assert_eq!(
            nearest.score(&block, 2).unwrap(),
            linear.score(&block, 2).unwrap()
        );
        assert_eq!(
            linear.score(&block, -2).unwrap(),
            whole.score(&block, -1).unwrap()
        );
    }
}

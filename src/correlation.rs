use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Calibration, CandidateRange, ConfigurationError, SearchConfig};

pub mod cpu;
pub mod gpu;

pub trait ProgressListener
where
    Self: Sync + Sized,
{
    fn report_status(&self, pos: f32);
}

/// Which panorama is the reference (source) for a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDirection {
    /// Bottom panorama is the source, top is the target.
    BottomToTop,
    /// Top panorama is the source, bottom is the target; offsets are mirrored.
    TopToBottom,
}

impl fmt::Display for SearchDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SearchDirection::BottomToTop => f.write_str("bottom-to-top"),
            SearchDirection::TopToBottom => f.write_str("top-to-bottom"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCoord {
    pub bx: usize,
    pub by: usize,
}

impl fmt::Display for BlockCoord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.bx, self.by)
    }
}

/// A block tile clamped to the image bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub coord: BlockCoord,
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    width: usize,
    height: usize,
    block_size: usize,
}

impl BlockLayout {
    pub fn new(width: usize, height: usize, block_size: usize) -> BlockLayout {
        BlockLayout {
            width,
            height,
            block_size: block_size.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks_x(&self) -> usize {
        self.width.div_ceil(self.block_size)
    }

    pub fn blocks_y(&self) -> usize {
        self.height.div_ceil(self.block_size)
    }

    pub fn len(&self) -> usize {
        self.blocks_x() * self.blocks_y()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block at raster index `i`.
    pub fn block(&self, i: usize) -> Block {
        let blocks_x = self.blocks_x().max(1);
        let (bx, by) = (i % blocks_x, i / blocks_x);
        let (x, y) = (bx * self.block_size, by * self.block_size);
        Block {
            coord: BlockCoord { bx, by },
            x,
            y,
            width: self.block_size.min(self.width.saturating_sub(x)),
            height: self.block_size.min(self.height.saturating_sub(y)),
        }
    }

    pub fn blocks(&self) -> impl ExactSizeIterator<Item = Block> + '_ {
        (0..self.len()).map(|i| self.block(i))
    }
}

/// Per-pixel errors of one rendered candidate, `size × size`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBuffer {
    size: usize,
    values: Vec<f32>,
}

impl ScoreBuffer {
    pub fn new(size: usize, values: Vec<f32>) -> Option<ScoreBuffer> {
        if values.len() != size * size {
            return None;
        }
        Some(ScoreBuffer { size, values })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Mean over the top-left `width × height` region, accumulated in row-major order.
    pub fn mean_over(&self, width: usize, height: usize) -> f32 {
        let width = width.min(self.size);
        let height = height.min(self.size);
        let sum = (0..height)
            .flat_map(|y| &self.values[y * self.size..y * self.size + width])
            .fold(0.0f64, |acc, &v| acc + v as f64);
        mean(sum, width * height)
    }
}

pub(crate) fn mean(sum: f64, count: usize) -> f32 {
    if count == 0 {
        return f32::INFINITY;
    }
    (sum / count as f64) as f32
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("render failed: {0}")]
    Render(String),
    #[error("readback failed: {0}")]
    Readback(String),
    #[error(transparent)]
    Surface(#[from] gpu::SurfaceError),
    #[error("scorer returned {actual} scores for {expected} candidates")]
    CandidateCount { expected: usize, actual: usize },
}

/// A scoring failure with the candidates that were in flight.
#[derive(Debug, Error)]
#[error("candidates {first}..={last}: {source}")]
pub struct CandidateError {
    pub first: i32,
    pub last: i32,
    #[source]
    pub source: ScoreError,
}

#[derive(Debug, Error)]
#[error("{direction} search failed at block {block} (candidates {first}..={last}): {source}")]
pub struct MatchError {
    pub direction: SearchDirection,
    pub block: BlockCoord,
    pub first: i32,
    pub last: i32,
    #[source]
    pub source: ScoreError,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("search was cancelled")]
    Cancelled,
}

/// Scores a source block against the target shifted by a vertical offset.
pub trait BlockScorer {
    fn score(&mut self, block: &Block, offset: i32) -> Result<f32, ScoreError>;

    fn score_candidates(
        &mut self,
        block: &Block,
        offsets: &[i32],
    ) -> Result<Vec<f32>, CandidateError> {
        offsets
            .iter()
            .map(|&offset| {
                self.score(block, offset).map_err(|source| CandidateError {
                    first: offset,
                    last: offset,
                    source,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockMatch {
    pub block: Block,
    /// Winning offset in `1 / subpixel` rows.
    pub offset: i32,
    pub score: f32,
    pub depth: f32,
}

#[derive(Debug, Clone)]
pub struct BlockResults {
    pub layout: BlockLayout,
    pub direction: SearchDirection,
    /// One match per block, in raster order.
    pub matches: Vec<BlockMatch>,
}

/// Picks the lowest score; ties go to the smaller `|offset|`, then to the earliest candidate.
/// NaN scores never win against a finite score.
pub fn select_best(offsets: &[i32], scores: &[f32]) -> Option<(i32, f32)> {
    let mut best: Option<(i32, f32)> = None;
    for (&offset, &score) in offsets.iter().zip(scores) {
        let score = if score.is_nan() { f32::INFINITY } else { score };
        best = match best {
            Some((best_offset, best_score))
                if score > best_score
                    || (score == best_score
                        && offset.unsigned_abs() >= best_offset.unsigned_abs()) =>
            {
                Some((best_offset, best_score))
            }
            _ => Some((offset, score)),
        };
    }
    best
}

pub struct DisparitySearch {
    layout: BlockLayout,
    direction: SearchDirection,
    range: CandidateRange,
    offsets: Vec<i32>,
    calibration: Calibration,
    cancel: CancellationToken,
    state: SearchState,
}

struct SearchStep<'a, PL: ProgressListener> {
    layout: &'a BlockLayout,
    direction: SearchDirection,
    range: &'a CandidateRange,
    offsets: &'a [i32],
    calibration: &'a Calibration,
    cancel: &'a CancellationToken,
    progress_listener: Option<&'a PL>,
    counter: AtomicUsize,
    abort: AtomicBool,
}

impl DisparitySearch {
    pub fn new(
        config: &SearchConfig,
        dimensions: (usize, usize),
        direction: SearchDirection,
        cancel: CancellationToken,
    ) -> Result<DisparitySearch, ConfigurationError> {
        config.validate()?;
        let offsets = match direction {
            SearchDirection::BottomToTop => config.candidate_range.offsets(),
            SearchDirection::TopToBottom => config.candidate_range.mirrored_offsets(),
        };
        Ok(DisparitySearch {
            layout: BlockLayout::new(dimensions.0, dimensions.1, config.block_size),
            direction,
            range: config.candidate_range,
            offsets,
            calibration: config.calibration.clone(),
            cancel,
            state: SearchState::Idle,
        })
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn offsets(&self) -> &[i32] {
        &self.offsets
    }

    pub fn run<S: BlockScorer, PL: ProgressListener>(
        &mut self,
        scorer: &mut S,
        progress_listener: Option<&PL>,
    ) -> Result<BlockResults, SearchError> {
        self.begin(1);
        let blocks = self.layout.blocks().collect::<Vec<_>>();
        let result = self
            .step(progress_listener)
            .match_blocks(scorer, &blocks);
        self.finish(result)
    }

    /// Splits blocks into contiguous ranges, one range per scorer.
    pub fn run_parallel<S: BlockScorer + Send, PL: ProgressListener>(
        &mut self,
        scorers: &mut [S],
        progress_listener: Option<&PL>,
    ) -> Result<BlockResults, SearchError> {
        if scorers.is_empty() {
            self.state = SearchState::Failed;
            return Err(ConfigurationError::NoScorers.into());
        }
        self.begin(scorers.len());
        let blocks = self.layout.blocks().collect::<Vec<_>>();
        let chunk_len = blocks.len().div_ceil(scorers.len()).max(1);
        let result = {
            let step = self.step(progress_listener);
            let chunks = scorers
                .par_iter_mut()
                .zip(blocks.par_chunks(chunk_len))
                .map(|(scorer, blocks)| step.match_blocks(scorer, blocks))
                .collect::<Vec<_>>();
            step.merge(chunks)
        };
        self.finish(result)
    }

    fn begin(&mut self, workers: usize) {
        self.state = SearchState::Running;
        info!(
            direction = %self.direction,
            blocks = self.layout.len(),
            candidates = self.offsets.len(),
            workers,
            "Starting disparity search"
        );
    }

    fn step<'a, PL: ProgressListener>(
        &'a self,
        progress_listener: Option<&'a PL>,
    ) -> SearchStep<'a, PL> {
        SearchStep {
            layout: &self.layout,
            direction: self.direction,
            range: &self.range,
            offsets: &self.offsets,
            calibration: &self.calibration,
            cancel: &self.cancel,
            progress_listener,
            counter: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
        }
    }

    fn finish(
        &mut self,
        result: Result<Option<Vec<BlockMatch>>, SearchError>,
    ) -> Result<BlockResults, SearchError> {
        match result {
            Ok(Some(matches)) => {
                self.state = SearchState::Completed;
                info!(direction = %self.direction, "Completed disparity search");
                Ok(BlockResults {
                    layout: self.layout,
                    direction: self.direction,
                    matches,
                })
            }
            Ok(None) => {
                self.state = SearchState::Failed;
                Err(SearchError::Cancelled)
            }
            Err(err) => {
                self.state = SearchState::Failed;
                Err(err)
            }
        }
    }
}

impl<PL: ProgressListener> SearchStep<'_, PL> {
    /// Returns `None` if another worker failed first.
    fn match_blocks<S: BlockScorer>(
        &self,
        scorer: &mut S,
        blocks: &[Block],
    ) -> Result<Option<Vec<BlockMatch>>, SearchError> {
        let total = self.layout.len().max(1) as f32;
        let mut matches = Vec::with_capacity(blocks.len());
        for block in blocks {
            if self.cancel.is_cancelled() {
                self.abort.store(true, Ordering::Relaxed);
                return Err(SearchError::Cancelled);
            }
            if self.abort.load(Ordering::Relaxed) {
                return Ok(None);
            }
            match self.match_block(scorer, block) {
                Ok(block_match) => matches.push(block_match),
                Err(err) => {
                    self.abort.store(true, Ordering::Relaxed);
                    return Err(err.into());
                }
            }
            if let Some(pl) = self.progress_listener {
                let value = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                pl.report_status(value as f32 / total);
            }
        }
        Ok(Some(matches))
    }

    fn match_block<S: BlockScorer>(
        &self,
        scorer: &mut S,
        block: &Block,
    ) -> Result<BlockMatch, MatchError> {
        let (first, last) = (
            self.offsets.first().copied().unwrap_or_default(),
            self.offsets.last().copied().unwrap_or_default(),
        );
        let match_error = |first, last, source| MatchError {
            direction: self.direction,
            block: block.coord,
            first,
            last,
            source,
        };
        let scores = scorer
            .score_candidates(block, self.offsets)
            .map_err(|err| match_error(err.first, err.last, err.source))?;
        let best = if scores.len() == self.offsets.len() {
            select_best(self.offsets, &scores)
        } else {
            None
        };
        let Some((offset, score)) = best else {
            let source = ScoreError::CandidateCount {
                expected: self.offsets.len(),
                actual: scores.len(),
            };
            return Err(match_error(first, last, source));
        };
        let depth = self.calibration.depth(self.range.disparity(offset));
        debug!(
            direction = %self.direction,
            block = %block.coord,
            offset,
            score,
            depth,
            "Matched block"
        );
        Ok(BlockMatch {
            block: *block,
            offset,
            score,
            depth,
        })
    }

    /// Joins per-worker results in block order; the first real error wins over aborts.
    fn merge(
        &self,
        chunks: Vec<Result<Option<Vec<BlockMatch>>, SearchError>>,
    ) -> Result<Option<Vec<BlockMatch>>, SearchError> {
        let mut matches = Vec::with_capacity(self.layout.len());
        let mut cancelled = false;
        let mut aborted = false;
        for chunk in chunks {
            match chunk {
                Ok(Some(chunk)) => matches.extend(chunk),
                Ok(None) => aborted = true,
                Err(SearchError::Cancelled) => cancelled = true,
                Err(err) => return Err(err),
            }
        }
        if cancelled || aborted {
            return Ok(None);
        }
        Ok(Some(matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CandidateRange;

    struct NoProgress;

    impl ProgressListener for NoProgress {
        fn report_status(&self, _pos: f32) {}
    }

    /// Scores `|offset - best|`, failing at `fail_at` if set.
    struct FakeScorer {
        best: i32,
        fail_at: Option<BlockCoord>,
        calls: usize,
    }

    impl BlockScorer for FakeScorer {
        fn score(&mut self, block: &Block, offset: i32) -> Result<f32, ScoreError> {
            self.calls += 1;
            if Some(block.coord) == self.fail_at {
                return Err(ScoreError::Render("device lost".to_string()));
            }
            Ok((offset - self.best).abs() as f32)
        }
    }

    fn fake(best: i32) -> FakeScorer {
        FakeScorer {
            best,
            fail_at: None,
            calls: 0,
        }
    }

    fn config(block_size: usize, min: i32, max: i32) -> SearchConfig {
        SearchConfig {
            block_size,
            candidate_range: CandidateRange::new(min, max, 1),
            ..Default::default()
        }
    }

    #[test]
    fn layout_clamps_edge_blocks() {
        let layout = BlockLayout::new(10, 7, 4);
        assert_eq!((layout.blocks_x(), layout.blocks_y()), (3, 2));
        let last = layout.block(layout.len() - 1);
        assert_eq!(last.coord, BlockCoord { bx: 2, by: 1 });
        assert_eq!((last.x, last.y, last.width, last.height), (8, 4, 2, 3));
        let covered: usize = layout.blocks().map(|b| b.width * b.height).sum();
        assert_eq!(covered, 70);
    }

    #[test]
    fn ties_prefer_smaller_magnitude_then_earliest() {
        assert_eq!(select_best(&[-2, -1, 0, 1, 2], &[1.0; 5]), Some((0, 1.0)));
        assert_eq!(select_best(&[-2, -1, 1, 2], &[1.0; 4]), Some((-1, 1.0)));
        assert_eq!(
            select_best(&[-2, -1, 1, 2], &[0.5, 1.0, 1.0, 0.5]),
            Some((-2, 0.5))
        );
        assert_eq!(
            select_best(&[-1, 0, 1], &[f32::NAN, 3.0, f32::NAN]),
            Some((0, 3.0))
        );
        assert_eq!(select_best(&[], &[]), None);
    }

    #[test]
    fn search_selects_minimum_and_completes() {
        let mut search = DisparitySearch::new(
            &config(4, -3, 3),
            (8, 8),
            SearchDirection::BottomToTop,
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(search.state(), SearchState::Idle);
        let mut scorer = fake(2);
        let results = search.run(&mut scorer, None::<&NoProgress>).unwrap();
        assert_eq!(search.state(), SearchState::Completed);
        assert_eq!(results.matches.len(), 4);
        assert!(results.matches.iter().all(|m| m.offset == 2 && m.score == 0.0));
        assert_eq!(results.matches[0].depth, 0.5);
        assert_eq!(scorer.calls, 4 * 7);
    }

    #[test]
    fn subpixel_offsets_convert_to_row_disparity() {
        let cfg = SearchConfig {
            block_size: 4,
            candidate_range: CandidateRange::new(-4, 4, 1).with_subpixel(2),
            ..Default::default()
        };
        let mut search = DisparitySearch::new(
            &cfg,
            (8, 4),
            SearchDirection::BottomToTop,
            CancellationToken::new(),
        )
        .unwrap();
        let results = search.run(&mut fake(3), None::<&NoProgress>).unwrap();
        // Three half rows are a disparity of 1.5 rows.
        assert!(results.matches.iter().all(|m| m.offset == 3));
        assert_eq!(results.matches[0].depth, 1.0 / 1.5);
    }

    #[test]
    fn top_direction_uses_mirrored_offsets() {
        let cfg = SearchConfig {
            candidate_range: CandidateRange::new(-1, 5, 2),
            ..Default::default()
        };
        let search = DisparitySearch::new(
            &cfg,
            (8, 8),
            SearchDirection::TopToBottom,
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(search.offsets(), &[-5, -3, -1, 1]);
    }

    #[test]
    fn unmirrorable_range_is_a_configuration_error() {
        let cfg = SearchConfig {
            candidate_range: CandidateRange::new(i32::MIN, 0, 1 << 30),
            ..Default::default()
        };
        for direction in [SearchDirection::BottomToTop, SearchDirection::TopToBottom] {
            let result = DisparitySearch::new(&cfg, (8, 8), direction, CancellationToken::new());
            assert!(matches!(
                result,
                Err(ConfigurationError::CandidateOverflow(i32::MIN))
            ));
        }
    }

    #[test]
    fn scoring_failure_names_block_and_fails() {
        let mut search = DisparitySearch::new(
            &config(4, -1, 1),
            (8, 8),
            SearchDirection::BottomToTop,
            CancellationToken::new(),
        )
        .unwrap();
        let mut scorer = FakeScorer {
            fail_at: Some(BlockCoord { bx: 1, by: 0 }),
            ..fake(0)
        };
        let err = search.run(&mut scorer, None::<&NoProgress>).unwrap_err();
        assert_eq!(search.state(), SearchState::Failed);
        match err {
            SearchError::Match(err) => {
                assert_eq!(err.block, BlockCoord { bx: 1, by: 0 });
                assert_eq!((err.first, err.last), (-1, -1));
                assert!(matches!(err.source, ScoreError::Render(_)));
            }
            err => panic!("unexpected error {err}"),
        }
    }

    #[test]
    fn cancelled_search_produces_no_results() {
        let cancel = CancellationToken::new();
        let mut search = DisparitySearch::new(
            &config(4, -1, 1),
            (8, 8),
            SearchDirection::BottomToTop,
            cancel.clone(),
        )
        .unwrap();
        cancel.cancel();
        let mut scorer = fake(0);
        let err = search.run(&mut scorer, None::<&NoProgress>).unwrap_err();
        assert!(matches!(err, SearchError::Cancelled));
        assert_eq!(search.state(), SearchState::Failed);
        assert_eq!(scorer.calls, 0);
    }

    #[test]
    fn parallel_run_matches_sequential() {
        let cfg = config(3, -4, 4);
        let mut sequential = DisparitySearch::new(
            &cfg,
            (20, 11),
            SearchDirection::BottomToTop,
            CancellationToken::new(),
        )
        .unwrap();
        let expected = sequential
            .run(&mut fake(-1), None::<&NoProgress>)
            .unwrap();

        let mut parallel = DisparitySearch::new(
            &cfg,
            (20, 11),
            SearchDirection::BottomToTop,
            CancellationToken::new(),
        )
        .unwrap();
        let mut scorers = (0..4).map(|_| fake(-1)).collect::<Vec<_>>();
        let actual = parallel
            .run_parallel(&mut scorers, None::<&NoProgress>)
            .unwrap();
        assert_eq!(actual.matches, expected.matches);
        assert_eq!(scorers.iter().map(|s| s.calls).sum::<usize>(), 28 * 9);
    }

    #[test]
    fn parallel_failure_reports_failing_block() {
        let mut search = DisparitySearch::new(
            &config(2, 0, 1),
            (8, 8),
            SearchDirection::BottomToTop,
            CancellationToken::new(),
        )
        .unwrap();
        let mut scorers = (0..3)
            .map(|_| FakeScorer {
                fail_at: Some(BlockCoord { bx: 3, by: 3 }),
                ..fake(0)
            })
            .collect::<Vec<_>>();
        let err = search
            .run_parallel(&mut scorers, None::<&NoProgress>)
            .unwrap_err();
        assert!(
            matches!(err, SearchError::Match(ref err) if err.block == BlockCoord { bx: 3, by: 3 })
        );
        assert_eq!(search.state(), SearchState::Failed);
    }

    #[test]
    fn score_buffer_mean_ignores_padding() {
        let mut values = vec![100.0; 9];
        values[0] = 1.0;
        values[1] = 2.0;
        values[3] = 3.0;
        values[4] = 6.0;
        let buffer = ScoreBuffer::new(3, values).unwrap();
        assert_eq!(buffer.mean_over(2, 2), 3.0);
        assert_eq!(buffer.mean_over(0, 2), f32::INFINITY);
        assert!(ScoreBuffer::new(3, vec![0.0; 8]).is_none());
    }
}

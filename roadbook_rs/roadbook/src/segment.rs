//! Folding classified points into blocks, and merging the residue.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::Classification;

/// Contiguous stretch of track sharing one classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub classification: Classification,
    pub start_km: f64,
    pub end_km: f64,
}

impl Block {
    fn open(classification: Classification, at_km: f64) -> Self {
        Self {
            classification,
            start_km: at_km,
            end_km: at_km,
        }
    }

    pub fn length_km(&self) -> f64 {
        self.end_km - self.start_km
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BuilderState {
    Empty,
    /// The last entry of `blocks` is the block being extended.
    Open,
}

/// Streaming fold of `(distance_km, classification)` pairs into blocks.
///
/// When the classification changes, the block being closed is discarded if
/// it is shorter than the minimum length, unless it is one of the first
/// `exempt_leading` blocks. The final block is never discarded.
#[derive(Clone, Debug)]
pub struct BlockBuilder {
    min_length_km: f64,
    exempt_leading: usize,
    blocks: Vec<Block>,
    state: BuilderState,
    last_km: f64,
    discarded: usize,
}

impl BlockBuilder {
    pub fn new(min_length_m: f64, exempt_leading: usize) -> Self {
        Self {
            min_length_km: min_length_m / 1000.0,
            exempt_leading,
            blocks: Vec::new(),
            state: BuilderState::Empty,
            last_km: 0.0,
            discarded: 0,
        }
    }

    pub fn push(&mut self, distance_km: f64, classification: Classification) {
        debug_assert!(
            self.state == BuilderState::Empty || distance_km >= self.last_km,
            "points must arrive in along-track order"
        );
        self.last_km = distance_km;

        match self.state {
            BuilderState::Empty => {
                self.blocks.push(Block::open(classification, distance_km));
                self.state = BuilderState::Open;
            }
            BuilderState::Open => {
                if let Some(current) = self.blocks.last_mut() {
                    if current.classification == classification {
                        current.end_km = distance_km;
                        return;
                    }
                }
                self.close_current();
                self.blocks.push(Block::open(classification, distance_km));
            }
        }
    }

    fn close_current(&mut self) {
        let Some(idx) = self.blocks.len().checked_sub(1) else {
            return;
        };
        let block = &self.blocks[idx];
        if block.length_km() < self.min_length_km && idx >= self.exempt_leading {
            debug!(
                road = %block.classification.road,
                start_km = block.start_km,
                length_m = block.length_km() * 1000.0,
                "discarding short block"
            );
            self.blocks.truncate(idx);
            self.discarded += 1;
        }
    }

    /// Blocks dropped so far by the minimum-length filter.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Finalise the stream. The open block is kept whatever its length.
    pub fn finish(self) -> Vec<Block> {
        self.blocks
    }
}

/// Coalesce adjacent equal-classification blocks and make the partition
/// contiguous: every block starts where the previous one ends.
pub fn merge_blocks(blocks: &[Block]) -> Vec<Block> {
    let mut merged: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks {
        match merged.last_mut() {
            Some(prev) if prev.classification == block.classification => {
                prev.end_km = block.end_km;
            }
            Some(prev) => {
                let start_km = prev.end_km;
                merged.push(Block {
                    start_km,
                    ..block.clone()
                });
            }
            None => merged.push(block.clone()),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn class(road: &str) -> Classification {
        Classification {
            road: road.to_string(),
            road_class: String::new(),
            municipality: "Springfield".to_string(),
            sub_locality: String::new(),
        }
    }

    fn build(points: &[(f64, &str)], exempt_leading: usize) -> Vec<Block> {
        let mut builder = BlockBuilder::new(50.0, exempt_leading);
        for (metres, road) in points {
            builder.push(metres / 1000.0, class(road));
        }
        builder.finish()
    }

    #[test]
    fn constant_classification_is_one_block() {
        let blocks = build(
            &[
                (0.0, "Main St"),
                (10.0, "Main St"),
                (30.0, "Main St"),
                (60.0, "Main St"),
                (100.0, "Main St"),
            ],
            1,
        );
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_km, 0.0);
        assert_eq!(blocks[0].end_km, 0.1);
        assert_eq!(blocks[0].classification, class("Main St"));
    }

    #[test]
    fn short_detour_is_discarded_and_merged_away() {
        let points = [
            (0.0, "A"),
            (10.0, "A"),
            (20.0, "B"),
            (25.0, "B"),
            (30.0, "A"),
            (120.0, "A"),
            (200.0, "A"),
        ];
        let blocks = build(&points, 1);
        assert_eq!(blocks.len(), 2, "B should have been popped");
        let merged = merge_blocks(&blocks);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].classification, class("A"));
        assert_eq!(merged[0].start_km, 0.0);
        assert_eq!(merged[0].end_km, 0.2);
    }

    #[test]
    fn leading_exemption_is_configurable() {
        // With two exempt blocks the short B survives as block #2.
        let points = [(0.0, "A"), (10.0, "A"), (20.0, "B"), (25.0, "B"), (30.0, "A"), (200.0, "A")];
        let merged = merge_blocks(&build(&points, 2));
        let roads: Vec<_> = merged.iter().map(|b| b.classification.road.as_str()).collect();
        assert_eq!(roads, ["A", "B", "A"]);
    }

    #[test]
    fn first_block_is_never_discarded() {
        let blocks = build(&[(0.0, "A"), (5.0, "B"), (500.0, "B")], 1);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].classification.road, "A");
    }

    #[test]
    fn trailing_short_block_is_kept() {
        let blocks = build(&[(0.0, "A"), (400.0, "A"), (410.0, "B"), (420.0, "B")], 1);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].classification.road, "B");
        assert!(blocks[1].length_km() < 0.05);
    }

    #[test]
    fn counts_discards() {
        let mut builder = BlockBuilder::new(50.0, 1);
        for (m, road) in [(0.0, "A"), (100.0, "A"), (110.0, "B"), (120.0, "C"), (500.0, "C")] {
            builder.push(m / 1000.0, class(road));
        }
        assert_eq!(builder.discarded(), 1);
        let blocks = builder.finish();
        let roads: Vec<_> = blocks.iter().map(|b| b.classification.road.as_str()).collect();
        assert_eq!(roads, ["A", "C"]);
    }

    #[test]
    fn merge_closes_gaps_left_by_discards() {
        let blocks = build(
            &[(0.0, "A"), (100.0, "A"), (110.0, "B"), (120.0, "C"), (300.0, "C")],
            1,
        );
        let merged = merge_blocks(&blocks);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].end_km, 0.1);
        assert_eq!(merged[1].start_km, 0.1);
        assert_eq!(merged[1].end_km, 0.3);
    }

    #[test]
    fn empty_input() {
        assert!(build(&[], 1).is_empty());
        assert!(merge_blocks(&[]).is_empty());
    }

    const ROADS: [&str; 4] = ["A", "B", "C", "Unknown"];

    /// `(step to the next point in metres, road index)` pairs.
    fn noisy_stream() -> impl Strategy<Value = Vec<(u32, usize)>> {
        prop::collection::vec((0u32..80, 0..ROADS.len()), 1..200)
    }

    fn build_stream(stream: &[(u32, usize)]) -> Vec<Block> {
        let mut builder = BlockBuilder::new(50.0, 1);
        let mut metres = 0.0;
        for &(step, road) in stream {
            builder.push(metres / 1000.0, class(ROADS[road]));
            metres += step as f64;
        }
        builder.finish()
    }

    proptest! {
        #[test]
        fn merged_blocks_are_contiguous_deduplicated_and_stable(ref stream in noisy_stream()) {
            let blocks = build_stream(stream);
            for b in &blocks {
                prop_assert!(b.start_km <= b.end_km);
            }
            let merged = merge_blocks(&blocks);
            prop_assert_eq!(merged[0].start_km, 0.0);
            for w in merged.windows(2) {
                prop_assert_eq!(w[0].end_km, w[1].start_km);
                prop_assert_ne!(&w[0].classification, &w[1].classification);
            }
            prop_assert_eq!(merge_blocks(&merged), merged);
        }
    }
}

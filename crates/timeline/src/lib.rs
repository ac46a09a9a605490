use serde::{Deserialize, Serialize};
use thiserror::Error;

mod block;
pub use block::*;
mod rational;
pub use rational::Rational;
mod track;
pub use track::*;
mod transition;
pub use transition::*;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),
    #[error("index {index} out of range for track of {len} blocks")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("block length must be positive, got {0}")]
    InvalidLength(Rational),
    #[error("rational with zero denominator")]
    ZeroDenominator,
    #[error("rational arithmetic overflowed 64 bits")]
    Overflow,
    #[error("blocks {0} and {1} are not adjacent")]
    NotAdjacent(BlockId, BlockId),
    #[error("block {0} is not a transition")]
    NotATransition(BlockId),
    #[error("transition overlap {requested} exceeds neighbor length {available}")]
    TransitionOverlap {
        requested: Rational,
        available: Rational,
    },
}

/// Integer frame index; negative values are valid offsets.
pub type Frame = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fps {
    pub num: u32,
    pub den: u32,
}

impl Fps {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Duration of a single frame.
    pub fn frame_duration(&self) -> Rational {
        Rational::from_frames(1, *self)
    }
}

impl Default for Fps {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

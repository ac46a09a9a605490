use serde::{Deserialize, Serialize};

use crate::{BlockId, InputType, NodeInput, Rational, TimelineError, Translator};

pub const OUT_BLOCK_INPUT: &str = "out_block_in";
pub const IN_BLOCK_INPUT: &str = "in_block_in";

fn default_out_input() -> NodeInput {
    NodeInput::new(OUT_BLOCK_INPUT, InputType::Block)
}

fn default_in_input() -> NodeInput {
    NodeInput::new(IN_BLOCK_INPUT, InputType::Block)
}

/// Blend between the tail of one block and the head of the next.
///
/// The span is `out_offset + in_offset`: the first `out_offset` of it is
/// media consumed past the end of the outgoing block, the rest is media
/// consumed before the start of the incoming block. Neighbor references are
/// arena handles owned by the track and rebound by it after every edit; a side
/// with no neighbor evaluates as transparent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionBlock {
    out_offset: Rational,
    in_offset: Rational,
    #[serde(skip)]
    name: String,
    #[serde(skip, default = "default_out_input")]
    out_block_input: NodeInput,
    #[serde(skip, default = "default_in_input")]
    in_block_input: NodeInput,
}

impl TransitionBlock {
    pub fn new(out_offset: Rational, in_offset: Rational) -> Result<Self, TimelineError> {
        if out_offset.is_negative() {
            return Err(TimelineError::InvalidLength(out_offset));
        }
        if in_offset.is_negative() {
            return Err(TimelineError::InvalidLength(in_offset));
        }
        if (out_offset + in_offset).is_zero() {
            return Err(TimelineError::InvalidLength(Rational::ZERO));
        }
        Ok(Self {
            out_offset,
            in_offset,
            name: String::new(),
            out_block_input: default_out_input(),
            in_block_input: default_in_input(),
        })
    }

    pub fn out_block_input(&self) -> &NodeInput {
        &self.out_block_input
    }

    pub fn in_block_input(&self) -> &NodeInput {
        &self.in_block_input
    }

    /// Duration consumed from the incoming block's head.
    pub fn in_offset(&self) -> Rational {
        self.in_offset
    }

    /// Duration consumed from the outgoing block's tail.
    pub fn out_offset(&self) -> Rational {
        self.out_offset
    }

    pub fn length(&self) -> Rational {
        self.out_offset + self.in_offset
    }

    pub fn connected_out_block(&self) -> Option<BlockId> {
        self.out_block_input.connection()
    }

    pub fn connected_in_block(&self) -> Option<BlockId> {
        self.in_block_input.connection()
    }

    /// No neighbor on either side: evaluates to the transparent default.
    pub fn is_passthrough(&self) -> bool {
        self.connected_out_block().is_none() && self.connected_in_block().is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retranslate(&mut self, translator: &dyn Translator) {
        self.name = translator.tr("Transition");
        self.out_block_input.set_name(translator.tr("From"));
        self.in_block_input.set_name(translator.tr("To"));
    }

    pub(crate) fn set_connected_out_block(&mut self, block: Option<BlockId>) {
        self.out_block_input.set_connection(block);
    }

    pub(crate) fn set_connected_in_block(&mut self, block: Option<BlockId>) {
        self.in_block_input.set_connection(block);
    }

    pub(crate) fn set_offsets(&mut self, out_offset: Rational, in_offset: Rational) {
        self.out_offset = out_offset;
        self.in_offset = in_offset;
    }

    /// Position within the span as a fraction in `[0, 1]`.
    pub fn progress_at(&self, local_time: Rational) -> Rational {
        let length = self.length();
        if length.is_zero() {
            return Rational::ZERO;
        }
        (local_time / length).clamp(Rational::ZERO, Rational::ONE)
    }

    /// Cross-dissolve premultiplied RGBA samples.
    ///
    /// A missing side contributes transparent black, so a dangling transition
    /// fades to or from nothing and a passthrough yields all zeros. The output
    /// has the length of whichever input is present.
    pub fn blend_rgba(outgoing: Option<&[f32]>, incoming: Option<&[f32]>, progress: f64) -> Vec<f32> {
        let t = progress.clamp(0.0, 1.0) as f32;
        let len = outgoing
            .map(<[f32]>::len)
            .max(incoming.map(<[f32]>::len))
            .unwrap_or(0);
        let sample = |side: Option<&[f32]>, i: usize| side.and_then(|s| s.get(i)).copied().unwrap_or(0.0);
        (0..len)
            .map(|i| sample(outgoing, i) * (1.0 - t) + sample(incoming, i) * t)
            .collect()
    }
}

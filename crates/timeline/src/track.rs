use serde::{Deserialize, Serialize};

use crate::{Block, BlockId, Rational, TimelineError, TransitionBlock, Translator};

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    block: Option<Block>,
}

/// Media sampled from one side of a transition.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct NeighborSample {
    pub block: BlockId,
    pub source_time: Rational,
}

/// What the graph-evaluation engine must produce at a track position.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evaluation {
    Clip {
        block: BlockId,
        source_time: Rational,
    },
    Gap {
        block: BlockId,
    },
    Transition {
        block: BlockId,
        progress: Rational,
        outgoing: Option<NeighborSample>,
        incoming: Option<NeighborSample>,
    },
}

/// Ordered sequence of blocks backed by a generational arena.
///
/// Block start positions are derived by summing lengths, so every edit keeps
/// the layout exact. Transitions hold handles to their neighbors; after each
/// structural edit the track drops any handle whose block is gone or no longer
/// adjacent and hands the trimmed media back to a block that is still alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "TrackRepr", into = "TrackRepr")]
pub struct Track {
    name: String,
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: Vec<BlockId>,
}

impl Track {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ids(&self) -> &[BlockId] {
        &self.order
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.block.as_ref())
    }

    fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.block.as_mut())
    }

    fn block(&self, id: BlockId) -> Result<&Block, TimelineError> {
        self.get(id).ok_or(TimelineError::BlockNotFound(id))
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut Block, TimelineError> {
        self.get_mut(id).ok_or(TimelineError::BlockNotFound(id))
    }

    fn transition_mut(&mut self, id: BlockId) -> Result<&mut TransitionBlock, TimelineError> {
        self.block_mut(id)?
            .as_transition_mut()
            .ok_or(TimelineError::NotATransition(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &Block)> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.get(*id).map(|block| (*id, block)))
    }

    pub fn index_of(&self, id: BlockId) -> Option<usize> {
        self.order.iter().position(|other| *other == id)
    }

    fn position(&self, id: BlockId) -> Result<usize, TimelineError> {
        self.index_of(id).ok_or(TimelineError::BlockNotFound(id))
    }

    pub fn duration(&self) -> Rational {
        self.iter()
            .fold(Rational::ZERO, |acc, (_, block)| acc + block.length())
    }

    pub fn block_start(&self, id: BlockId) -> Result<Rational, TimelineError> {
        let pos = self.position(id)?;
        Ok(self.order[..pos]
            .iter()
            .filter_map(|other| self.get(*other))
            .fold(Rational::ZERO, |acc, block| acc + block.length()))
    }

    /// `(start, end)` of a block on the track, end exclusive.
    pub fn block_range(&self, id: BlockId) -> Result<(Rational, Rational), TimelineError> {
        let start = self.block_start(id)?;
        Ok((start, start + self.block(id)?.length()))
    }

    fn alloc(&mut self, block: Block) -> BlockId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.block = Some(block);
            BlockId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                block: Some(block),
            });
            BlockId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn release(&mut self, id: BlockId) -> Option<Block> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let block = slot.block.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(block)
    }

    pub fn append_block(&mut self, block: Block) -> Result<BlockId, TimelineError> {
        self.insert_block(self.order.len(), block)
    }

    /// Transitions can only enter a track through [`Track::add_transition`].
    pub fn insert_block(&mut self, index: usize, block: Block) -> Result<BlockId, TimelineError> {
        if block.is_transition() {
            return Err(TimelineError::InvalidOp(
                "transitions are created with add_transition".into(),
            ));
        }
        if index > self.order.len() {
            return Err(TimelineError::IndexOutOfRange {
                index,
                len: self.order.len(),
            });
        }
        let id = self.alloc(block);
        self.order.insert(index, id);
        self.relink_transitions();
        Ok(id)
    }

    pub fn remove_block(&mut self, id: BlockId) -> Result<Block, TimelineError> {
        if self.block(id)?.is_transition() {
            return self.remove_transition(id);
        }
        let pos = self.position(id)?;
        self.order.remove(pos);
        let block = self.release(id).ok_or(TimelineError::BlockNotFound(id))?;
        self.relink_transitions();
        Ok(block)
    }

    pub fn resize_block(&mut self, id: BlockId, length: Rational) -> Result<(), TimelineError> {
        if length <= Rational::ZERO {
            return Err(TimelineError::InvalidLength(length));
        }
        let block = self.block_mut(id)?;
        if block.is_transition() {
            return Err(TimelineError::InvalidOp(
                "resize a transition with set_transition_offsets".into(),
            ));
        }
        block.set_length_unchecked(length);
        self.relink_transitions();
        Ok(())
    }

    /// Moves a block so it ends up at `index` in the sequence.
    pub fn move_block(&mut self, id: BlockId, index: usize) -> Result<(), TimelineError> {
        let pos = self.position(id)?;
        if index >= self.order.len() {
            return Err(TimelineError::IndexOutOfRange {
                index,
                len: self.order.len(),
            });
        }
        self.order.remove(pos);
        self.order.insert(index, id);
        self.relink_transitions();
        Ok(())
    }

    pub fn set_label(&mut self, id: BlockId, label: Option<String>) -> Result<(), TimelineError> {
        self.block_mut(id)?.label = label;
        Ok(())
    }

    pub fn retranslate(&mut self, translator: &dyn Translator) {
        for slot in &mut self.slots {
            if let Some(block) = slot.block.as_mut() {
                block.retranslate(translator);
            }
        }
    }

    /// Inserts a transition bridging `out_block` (tail) and `in_block` (head).
    ///
    /// Either side may be omitted for a fade to/from transparency, in which
    /// case its offset must be zero. The outgoing block loses `out_offset`
    /// from its tail and the incoming block `in_offset` from its head, so the
    /// overall track duration is unchanged. Each neighbor must keep some of
    /// its own length.
    pub fn add_transition(
        &mut self,
        out_block: Option<BlockId>,
        in_block: Option<BlockId>,
        out_offset: Rational,
        in_offset: Rational,
    ) -> Result<BlockId, TimelineError> {
        let transition = TransitionBlock::new(out_offset, in_offset)?;

        let index = match (out_block, in_block) {
            (Some(a), Some(b)) => {
                let ia = self.position(a)?;
                if self.position(b)? != ia + 1 {
                    return Err(TimelineError::NotAdjacent(a, b));
                }
                ia + 1
            }
            (Some(a), None) => {
                if !in_offset.is_zero() {
                    return Err(TimelineError::InvalidOp(
                        "in_offset requires an incoming block".into(),
                    ));
                }
                let ia = self.position(a)?;
                if let Some(next) = self.order.get(ia + 1) {
                    if self.block(*next)?.is_transition() {
                        return Err(TimelineError::InvalidOp(format!(
                            "block {a} already has an outgoing transition"
                        )));
                    }
                }
                ia + 1
            }
            (None, Some(b)) => {
                if !out_offset.is_zero() {
                    return Err(TimelineError::InvalidOp(
                        "out_offset requires an outgoing block".into(),
                    ));
                }
                let ib = self.position(b)?;
                if ib > 0 && self.block(self.order[ib - 1])?.is_transition() {
                    return Err(TimelineError::InvalidOp(format!(
                        "block {b} already has an incoming transition"
                    )));
                }
                ib
            }
            (None, None) => {
                return Err(TimelineError::InvalidOp(
                    "a transition needs at least one neighbor".into(),
                ))
            }
        };

        if let Some(a) = out_block {
            let block = self.block(a)?;
            if block.as_clip().is_none() {
                return Err(TimelineError::InvalidOp(format!("block {a} is not a clip")));
            }
            if out_offset >= block.length() {
                return Err(TimelineError::TransitionOverlap {
                    requested: out_offset,
                    available: block.length(),
                });
            }
        }
        if let Some(b) = in_block {
            let block = self.block(b)?;
            if block.as_clip().is_none() {
                return Err(TimelineError::InvalidOp(format!("block {b} is not a clip")));
            }
            if in_offset >= block.length() {
                return Err(TimelineError::TransitionOverlap {
                    requested: in_offset,
                    available: block.length(),
                });
            }
        }

        if let Some(a) = out_block {
            let block = self.block_mut(a)?;
            let length = block.length() - out_offset;
            block.set_length_unchecked(length);
        }
        if let Some(b) = in_block {
            trim_head(self.block_mut(b)?, in_offset);
        }

        let id = self.alloc(Block::transition(transition));
        self.order.insert(index, id);
        let t = self.transition_mut(id)?;
        t.set_connected_out_block(out_block);
        t.set_connected_in_block(in_block);
        self.relink_transitions();
        Ok(id)
    }

    /// Changes a transition's span, moving the trim points of the connected
    /// neighbors by the same amounts.
    pub fn set_transition_offsets(
        &mut self,
        id: BlockId,
        out_offset: Rational,
        in_offset: Rational,
    ) -> Result<(), TimelineError> {
        TransitionBlock::new(out_offset, in_offset)?;
        let t = self
            .block(id)?
            .as_transition()
            .ok_or(TimelineError::NotATransition(id))?;
        let (old_out, old_in) = (t.out_offset(), t.in_offset());
        let (out_block, in_block) = (t.connected_out_block(), t.connected_in_block());
        if (out_block.is_none() && !out_offset.is_zero())
            || (in_block.is_none() && !in_offset.is_zero())
        {
            return Err(TimelineError::InvalidOp(format!(
                "transition {id} has no neighbor for a non-zero offset"
            )));
        }

        if let Some(a) = out_block {
            let available = self.block(a)?.length() + old_out;
            if out_offset >= available {
                return Err(TimelineError::TransitionOverlap {
                    requested: out_offset,
                    available,
                });
            }
        }
        if let Some(b) = in_block {
            let available = self.block(b)?.length() + old_in;
            if in_offset >= available {
                return Err(TimelineError::TransitionOverlap {
                    requested: in_offset,
                    available,
                });
            }
        }

        if let Some(a) = out_block {
            let block = self.block_mut(a)?;
            let length = block.length() + old_out - out_offset;
            block.set_length_unchecked(length);
        }
        if let Some(b) = in_block {
            trim_head(self.block_mut(b)?, in_offset - old_in);
        }
        self.transition_mut(id)?.set_offsets(out_offset, in_offset);
        Ok(())
    }

    /// Removes a transition and gives the trimmed media back to its neighbors.
    pub fn remove_transition(&mut self, id: BlockId) -> Result<Block, TimelineError> {
        let t = self
            .block(id)?
            .as_transition()
            .ok_or(TimelineError::NotATransition(id))?;
        let (out_offset, in_offset) = (t.out_offset(), t.in_offset());
        let (out_block, in_block) = (t.connected_out_block(), t.connected_in_block());
        self.restore_out_trim(out_block, out_offset);
        self.restore_in_trim(in_block, in_offset);

        let pos = self.position(id)?;
        self.order.remove(pos);
        let block = self.release(id).ok_or(TimelineError::BlockNotFound(id))?;
        self.relink_transitions();
        Ok(block)
    }

    fn restore_out_trim(&mut self, block: Option<BlockId>, out_offset: Rational) {
        if let Some(block) = block.and_then(|id| self.get_mut(id)) {
            let length = block.length() + out_offset;
            block.set_length_unchecked(length);
        }
    }

    fn restore_in_trim(&mut self, block: Option<BlockId>, in_offset: Rational) {
        if let Some(block) = block.and_then(|id| self.get_mut(id)) {
            trim_head(block, -in_offset);
        }
    }

    /// Drops neighbor handles that no longer point at a live adjacent block.
    ///
    /// The trim a dropped side held goes back to its block and the side's
    /// offset becomes zero, so no media is counted twice.
    fn relink_transitions(&mut self) {
        for pos in 0..self.order.len() {
            let id = self.order[pos];
            let Some(t) = self.get(id).and_then(Block::as_transition) else {
                continue;
            };
            let (out_offset, in_offset) = (t.out_offset(), t.in_offset());
            let (out_block, in_block) = (t.connected_out_block(), t.connected_in_block());
            let prev = pos.checked_sub(1).map(|p| self.order[p]);
            let next = self.order.get(pos + 1).copied();

            let drop_out = out_block.is_some() && prev != out_block;
            let drop_in = in_block.is_some() && next != in_block;
            if !drop_out && !drop_in {
                continue;
            }
            if drop_out {
                self.restore_out_trim(out_block, out_offset);
            }
            if drop_in {
                self.restore_in_trim(in_block, in_offset);
            }
            if let Ok(t) = self.transition_mut(id) {
                if drop_out {
                    t.set_connected_out_block(None);
                }
                if drop_in {
                    t.set_connected_in_block(None);
                }
                let out_offset = if drop_out { Rational::ZERO } else { out_offset };
                let in_offset = if drop_in { Rational::ZERO } else { in_offset };
                t.set_offsets(out_offset, in_offset);
            }
        }
    }

    /// Resolves what is visible at `time`; `None` outside the track.
    ///
    /// Inside a transition the outgoing side is only sampled over the tail it
    /// handed over (the first `out_offset`) and the incoming side over the
    /// head it handed over (the rest). Outside those ranges the side is
    /// `None` and blends as transparent.
    pub fn evaluate_at(&self, time: Rational) -> Option<Evaluation> {
        if time.is_negative() {
            return None;
        }
        let mut start = Rational::ZERO;
        for (id, block) in self.iter() {
            let end = start + block.length();
            if time >= start && time < end {
                let local = time - start;
                return Some(match &block.kind {
                    crate::BlockKind::Clip(clip) => Evaluation::Clip {
                        block: id,
                        source_time: clip.media_in + local,
                    },
                    crate::BlockKind::Gap => Evaluation::Gap { block: id },
                    crate::BlockKind::Transition(t) => Evaluation::Transition {
                        block: id,
                        progress: t.progress_at(local),
                        outgoing: t
                            .connected_out_block()
                            .filter(|_| local < t.out_offset())
                            .and_then(|a| {
                                let out = self.get(a)?;
                                let clip = out.as_clip()?;
                                Some(NeighborSample {
                                    block: a,
                                    source_time: clip.media_in + out.length() + local,
                                })
                            }),
                        incoming: t
                            .connected_in_block()
                            .filter(|_| local >= t.out_offset())
                            .and_then(|b| {
                                let clip = self.get(b)?.as_clip()?;
                                Some(NeighborSample {
                                    block: b,
                                    source_time: clip.media_in - t.length() + local,
                                })
                            }),
                    },
                });
            }
            start = end;
        }
        None
    }
}

fn trim_head(block: &mut Block, amount: Rational) {
    let length = block.length() - amount;
    block.set_length_unchecked(length);
    if let Some(clip) = block.as_clip_mut() {
        clip.media_in += amount;
    }
}

#[derive(Serialize, Deserialize)]
struct TrackRepr {
    name: String,
    blocks: Vec<StoredBlock>,
}

#[derive(Serialize, Deserialize)]
struct StoredBlock {
    block: Block,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    linked_out: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    linked_in: bool,
}

impl From<Track> for TrackRepr {
    fn from(track: Track) -> Self {
        let blocks = track
            .iter()
            .map(|(_, block)| {
                let (linked_out, linked_in) = block
                    .as_transition()
                    .map(|t| {
                        (
                            t.connected_out_block().is_some(),
                            t.connected_in_block().is_some(),
                        )
                    })
                    .unwrap_or((false, false));
                StoredBlock {
                    block: block.clone(),
                    linked_out,
                    linked_in,
                }
            })
            .collect();
        Self {
            name: track.name,
            blocks,
        }
    }
}

impl TryFrom<TrackRepr> for Track {
    type Error = TimelineError;

    fn try_from(repr: TrackRepr) -> Result<Self, Self::Error> {
        let mut track = Track::new(repr.name);
        let mut links = Vec::new();
        for (pos, stored) in repr.blocks.iter().enumerate() {
            check_stored(pos, stored)?;
        }
        for stored in repr.blocks {
            let id = track.alloc(stored.block);
            track.order.push(id);
            links.push((id, stored.linked_out, stored.linked_in));
        }
        for (pos, (id, linked_out, linked_in)) in links.into_iter().enumerate() {
            if !linked_out && !linked_in {
                continue;
            }
            let prev = pos.checked_sub(1).map(|p| track.order[p]);
            let next = track.order.get(pos + 1).copied();
            let neighbor = |side: Option<BlockId>| -> Result<Option<BlockId>, TimelineError> {
                match side {
                    Some(n) if track.get(n).and_then(Block::as_clip).is_some() => Ok(Some(n)),
                    _ => Err(TimelineError::InvalidOp(format!(
                        "transition at position {pos} is linked to a missing clip"
                    ))),
                }
            };
            let out_block = if linked_out { neighbor(prev)? } else { None };
            let in_block = if linked_in { neighbor(next)? } else { None };
            let t = track.transition_mut(id)?;
            t.set_connected_out_block(out_block);
            t.set_connected_in_block(in_block);
        }
        track.retranslate(&crate::DefaultTranslator);
        Ok(track)
    }
}

/// Re-applies the checks the edit operations enforce on a loaded block.
///
/// Neighbor lengths are stored already trimmed, so requiring them to stay
/// positive also bounds every linked offset by its neighbor.
fn check_stored(pos: usize, stored: &StoredBlock) -> Result<(), TimelineError> {
    let Some(t) = stored.block.as_transition() else {
        if stored.block.length() <= Rational::ZERO {
            return Err(TimelineError::InvalidLength(stored.block.length()));
        }
        if stored.linked_out || stored.linked_in {
            return Err(TimelineError::InvalidOp(format!(
                "block at position {pos} is not a transition but carries links"
            )));
        }
        return Ok(());
    };
    let (out_offset, in_offset) = (t.out_offset(), t.in_offset());
    if (!stored.linked_out && !out_offset.is_zero()) || (!stored.linked_in && !in_offset.is_zero())
    {
        return Err(TimelineError::InvalidOp(format!(
            "transition at position {pos} has a non-zero offset on an unlinked side"
        )));
    }
    if stored.linked_out || stored.linked_in {
        TransitionBlock::new(out_offset, in_offset)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: i64) -> Rational {
        Rational::from_integer(n)
    }

    fn clip(source: &str, length: i64) -> Block {
        Block::clip(source, Rational::ZERO, secs(length)).unwrap()
    }

    /// A(0..10) B(10..20) C(20..30)
    fn three_clips() -> (Track, BlockId, BlockId, BlockId) {
        let mut track = Track::new("V1");
        let a = track.append_block(clip("a.mov", 10)).unwrap();
        let b = track.append_block(clip("b.mov", 10)).unwrap();
        let c = track.append_block(clip("c.mov", 10)).unwrap();
        (track, a, b, c)
    }

    #[test]
    fn starts_are_derived_exactly() {
        let mut track = Track::new("V1");
        let fps = crate::Fps::new(30000, 1001);
        let mut ids = Vec::new();
        for _ in 0..1000 {
            let block = Block::gap(fps.frame_duration()).unwrap();
            ids.push(track.append_block(block).unwrap());
        }
        assert_eq!(
            track.block_start(ids[999]).unwrap(),
            Rational::from_frames(999, fps)
        );
        assert_eq!(track.duration(), Rational::from_frames(1000, fps));
    }

    #[test]
    fn add_transition_trims_neighbors_and_keeps_duration() {
        let (mut track, a, b, _) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(1), secs(2))
            .unwrap();

        assert_eq!(track.duration(), secs(30));
        assert_eq!(track.block_range(a).unwrap(), (secs(0), secs(9)));
        assert_eq!(track.block_range(t).unwrap(), (secs(9), secs(12)));
        assert_eq!(track.block_range(b).unwrap(), (secs(12), secs(20)));
        assert_eq!(track.get(b).unwrap().as_clip().unwrap().media_in, secs(2));

        let tb = track.get(t).unwrap().as_transition().unwrap();
        assert_eq!(tb.connected_out_block(), Some(a));
        assert_eq!(tb.connected_in_block(), Some(b));
        assert_eq!(tb.out_block_input().connection(), Some(a));
        assert_eq!(tb.in_offset() + tb.out_offset(), secs(3));
    }

    #[test]
    fn transition_cannot_exceed_neighbor_lengths() {
        let (mut track, a, b, c) = three_clips();
        assert!(matches!(
            track.add_transition(Some(a), Some(b), secs(11), secs(1)),
            Err(TimelineError::TransitionOverlap { .. })
        ));
        assert!(matches!(
            track.add_transition(Some(a), Some(c), secs(1), secs(1)),
            Err(TimelineError::NotAdjacent(..))
        ));
        assert!(track.add_transition(None, None, secs(1), secs(1)).is_err());
        assert_eq!(track.duration(), secs(30));
    }

    #[test]
    fn removing_a_neighbor_leaves_transition_dangling() {
        let (mut track, a, b, _) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(1), secs(1))
            .unwrap();
        track.remove_block(b).unwrap();

        let tb = track.get(t).unwrap().as_transition().unwrap();
        assert_eq!(tb.connected_out_block(), Some(a));
        assert_eq!(tb.connected_in_block(), None);
        assert!(!tb.in_block_input().is_connected());
        assert!(!track.contains(b));

        track.remove_block(a).unwrap();
        let tb = track.get(t).unwrap().as_transition().unwrap();
        assert!(tb.is_passthrough());
    }

    #[test]
    fn stale_handles_do_not_resolve_after_slot_reuse() {
        let (mut track, a, _, _) = three_clips();
        track.remove_block(a).unwrap();
        let d = track.append_block(clip("d.mov", 5)).unwrap();
        assert_eq!(d.index, a.index);
        assert!(track.get(a).is_none());
        assert!(track.get(d).is_some());
    }

    #[test]
    fn moving_a_neighbor_away_restores_its_trim() {
        let (mut track, a, b, c) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(2), secs(2))
            .unwrap();
        track.move_block(b, 3).unwrap();

        assert_eq!(track.ids(), &[a, t, c, b]);
        assert_eq!(track.get(b).unwrap().length(), secs(10));
        assert_eq!(track.get(b).unwrap().as_clip().unwrap().media_in, secs(0));
        let tb = track.get(t).unwrap().as_transition().unwrap();
        assert_eq!(tb.connected_in_block(), None);
        assert_eq!(tb.connected_out_block(), Some(a));
        assert_eq!(tb.in_offset(), Rational::ZERO);
        assert_eq!(tb.out_offset(), secs(2));
    }

    #[test]
    fn moving_a_neighbor_keeps_duration() {
        let (mut track, a, b, _) = three_clips();
        track
            .add_transition(Some(a), Some(b), secs(2), secs(2))
            .unwrap();
        assert_eq!(track.duration(), secs(30));
        track.move_block(b, 3).unwrap();
        assert_eq!(track.duration(), secs(30));
        track.move_block(a, 2).unwrap();
        assert_eq!(track.duration(), secs(30));
    }

    #[test]
    fn removing_both_neighbors_leaves_an_empty_passthrough() {
        let (mut track, a, b, c) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(2), secs(2))
            .unwrap();
        track.remove_block(a).unwrap();
        assert_eq!(track.duration(), secs(20));
        track.remove_block(b).unwrap();
        assert_eq!(track.duration(), secs(10));

        let tb = track.get(t).unwrap().as_transition().unwrap();
        assert!(tb.is_passthrough());
        assert_eq!(tb.length(), Rational::ZERO);
        assert!(track
            .set_transition_offsets(t, secs(1), Rational::ZERO)
            .is_err());
        assert_eq!(
            track.evaluate_at(Rational::ZERO),
            Some(Evaluation::Clip {
                block: c,
                source_time: Rational::ZERO
            })
        );

        let json = serde_json::to_string(&track).unwrap();
        let back: Track = serde_json::from_str(&json).unwrap();
        assert_eq!(back.duration(), secs(10));
    }

    #[test]
    fn remove_transition_restores_both_neighbors() {
        let (mut track, a, b, _) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(1), secs(3))
            .unwrap();
        track.remove_block(t).unwrap();
        assert_eq!(track.get(a).unwrap().length(), secs(10));
        assert_eq!(track.get(b).unwrap().length(), secs(10));
        assert_eq!(track.get(b).unwrap().as_clip().unwrap().media_in, secs(0));
        assert_eq!(track.duration(), secs(30));
    }

    #[test]
    fn resizing_a_neighbor_keeps_connection() {
        let (mut track, a, b, _) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(1), secs(1))
            .unwrap();
        track.resize_block(a, secs(4)).unwrap();
        let tb = track.get(t).unwrap().as_transition().unwrap();
        assert_eq!(tb.connected_out_block(), Some(a));
        assert_eq!(track.block_start(t).unwrap(), secs(4));
        assert!(track.resize_block(t, secs(1)).is_err());
        assert!(track.resize_block(a, Rational::ZERO).is_err());
    }

    #[test]
    fn set_transition_offsets_moves_trim_points() {
        let (mut track, a, b, _) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(1), secs(1))
            .unwrap();
        track.set_transition_offsets(t, secs(3), secs(2)).unwrap();
        assert_eq!(track.get(a).unwrap().length(), secs(7));
        assert_eq!(track.get(b).unwrap().length(), secs(8));
        assert_eq!(track.get(b).unwrap().as_clip().unwrap().media_in, secs(2));
        assert_eq!(track.duration(), secs(30));
        assert!(track.set_transition_offsets(t, secs(11), secs(1)).is_err());
    }

    #[test]
    fn evaluate_resolves_clips_and_transition_sides() {
        let (mut track, a, b, _) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(2), secs(2))
            .unwrap();

        assert_eq!(
            track.evaluate_at(secs(3)),
            Some(Evaluation::Clip {
                block: a,
                source_time: secs(3)
            })
        );
        // Transition spans 8..12, cut point at 10.
        match track.evaluate_at(secs(9)).unwrap() {
            Evaluation::Transition {
                block,
                progress,
                outgoing,
                incoming,
            } => {
                assert_eq!(block, t);
                assert_eq!(progress, Rational::new(1, 4));
                assert_eq!(outgoing.unwrap().source_time, secs(9));
                assert_eq!(incoming, None);
            }
            other => panic!("unexpected evaluation {other:?}"),
        }
        match track.evaluate_at(secs(11)).unwrap() {
            Evaluation::Transition {
                outgoing, incoming, ..
            } => {
                assert_eq!(outgoing, None);
                assert_eq!(
                    incoming,
                    Some(NeighborSample {
                        block: b,
                        source_time: secs(1)
                    })
                );
            }
            other => panic!("unexpected evaluation {other:?}"),
        }
        assert_eq!(
            track.evaluate_at(secs(12)),
            Some(Evaluation::Clip {
                block: b,
                source_time: secs(2)
            })
        );
        assert_eq!(track.evaluate_at(secs(30)), None);
        assert_eq!(track.evaluate_at(secs(-1)), None);
    }

    #[test]
    fn transition_never_samples_before_media_start() {
        let mut track = Track::new("V1");
        let a = track.append_block(clip("a.mov", 2)).unwrap();
        let b = track.append_block(clip("b.mov", 2)).unwrap();
        let t = track
            .add_transition(Some(a), Some(b), secs(1), secs(1))
            .unwrap();
        let (start, end) = track.block_range(t).unwrap();
        let step = Rational::new(1, 4);
        let mut time = start;
        while time < end {
            let Some(Evaluation::Transition {
                outgoing, incoming, ..
            }) = track.evaluate_at(time)
            else {
                panic!("expected the transition at {time}");
            };
            for sample in outgoing.iter().chain(incoming.iter()) {
                assert!(!sample.source_time.is_negative(), "{time}: {sample:?}");
            }
            // Outgoing media ends at 2s, the length of a.mov.
            if let Some(out) = outgoing {
                assert!(out.source_time < secs(2));
            }
            time += step;
        }
        match track.evaluate_at(start).unwrap() {
            Evaluation::Transition { incoming, .. } => assert_eq!(incoming, None),
            other => panic!("unexpected evaluation {other:?}"),
        }
    }

    #[test]
    fn dangling_transition_evaluates_with_missing_side() {
        let (mut track, a, b, _) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), secs(1), secs(1))
            .unwrap();
        track.remove_block(a).unwrap();
        let (start, _) = track.block_range(t).unwrap();
        match track.evaluate_at(start).unwrap() {
            Evaluation::Transition {
                outgoing, incoming, ..
            } => {
                assert!(outgoing.is_none());
                assert!(incoming.is_some());
            }
            other => panic!("unexpected evaluation {other:?}"),
        }
    }

    #[test]
    fn serde_round_trip_preserves_layout_and_links() {
        let (mut track, a, b, _) = three_clips();
        let t = track
            .add_transition(Some(a), Some(b), Rational::new(1001, 30000), Rational::new(1, 3))
            .unwrap();
        let before_range = track.block_range(t).unwrap();

        let json = serde_json::to_string(&track).unwrap();
        let back: Track = serde_json::from_str(&json).unwrap();

        assert_eq!(back.duration(), track.duration());
        let (tid, tb) = back
            .iter()
            .find(|(_, block)| block.is_transition())
            .map(|(id, block)| (id, block.as_transition().unwrap()))
            .unwrap();
        assert_eq!(back.block_range(tid).unwrap(), before_range);
        assert_eq!(tb.out_offset(), Rational::new(1001, 30000));
        assert_eq!(tb.in_offset(), Rational::new(1, 3));
        assert!(tb.connected_out_block().is_some());
        assert!(tb.connected_in_block().is_some());
        assert_eq!(tb.out_block_input().name(), "From");
    }

    fn load(json: serde_json::Value) -> Result<Track, serde_json::Error> {
        serde_json::from_value(json)
    }

    fn stored_clip(length: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "block": {
                "length": length,
                "kind": { "type": "clip", "source": "a.mov", "media_in": { "num": 0, "den": 1 } }
            }
        })
    }

    fn stored_transition(out_offset: i64, in_offset: i64, linked: bool) -> serde_json::Value {
        serde_json::json!({
            "block": {
                "kind": {
                    "type": "transition",
                    "out_offset": { "num": out_offset, "den": 1 },
                    "in_offset": { "num": in_offset, "den": 1 }
                }
            },
            "linked_out": linked,
            "linked_in": linked
        })
    }

    fn two_second_clip() -> serde_json::Value {
        stored_clip(serde_json::json!({ "num": 2, "den": 1 }))
    }

    #[test]
    fn loading_accepts_a_well_formed_track() {
        let track = load(serde_json::json!({
            "name": "V1",
            "blocks": [two_second_clip(), stored_transition(1, 1, true), two_second_clip()]
        }))
        .unwrap();
        assert_eq!(track.duration(), secs(6));
    }

    #[test]
    fn loading_rejects_negative_or_empty_offsets() {
        let negative = load(serde_json::json!({
            "name": "V1",
            "blocks": [two_second_clip(), stored_transition(-3, 1, true), two_second_clip()]
        }));
        assert!(negative.is_err());

        let empty = load(serde_json::json!({
            "name": "V1",
            "blocks": [two_second_clip(), stored_transition(0, 0, true), two_second_clip()]
        }));
        assert!(empty.is_err());
    }

    #[test]
    fn loading_rejects_offsets_on_unlinked_sides() {
        let dangling = load(serde_json::json!({
            "name": "V1",
            "blocks": [two_second_clip(), stored_transition(1, 1, false), two_second_clip()]
        }));
        assert!(dangling.is_err());
    }

    #[test]
    fn loading_rejects_clips_without_positive_length() {
        let missing = serde_json::json!({
            "block": {
                "kind": { "type": "clip", "source": "b.mov", "media_in": { "num": 0, "den": 1 } }
            }
        });
        assert!(load(serde_json::json!({ "name": "V1", "blocks": [two_second_clip(), missing] })).is_err());

        let negative = stored_clip(serde_json::json!({ "num": -2, "den": 1 }));
        assert!(load(serde_json::json!({ "name": "V1", "blocks": [negative] })).is_err());
    }

    #[test]
    fn transition_must_leave_neighbors_some_length() {
        let (mut track, a, b, _) = three_clips();
        assert!(matches!(
            track.add_transition(Some(a), Some(b), secs(10), secs(1)),
            Err(TimelineError::TransitionOverlap { .. })
        ));
        let t = track
            .add_transition(Some(a), Some(b), secs(1), secs(1))
            .unwrap();
        assert!(matches!(
            track.set_transition_offsets(t, secs(1), secs(10)),
            Err(TimelineError::TransitionOverlap { .. })
        ));
        assert_eq!(track.duration(), secs(30));
    }

    #[test]
    fn fade_out_has_only_outgoing_side() {
        let (mut track, _, _, c) = three_clips();
        let t = track.add_transition(Some(c), None, secs(2), Rational::ZERO).unwrap();
        assert_eq!(track.block_range(t).unwrap(), (secs(28), secs(30)));
        assert!(track
            .add_transition(Some(c), None, secs(1), Rational::ZERO)
            .is_err());
        let tb = track.get(t).unwrap().as_transition().unwrap();
        assert_eq!(tb.in_offset(), Rational::ZERO);
        assert_eq!(tb.connected_in_block(), None);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{Rational, TimelineError, TransitionBlock};

/// Generational handle into a [`crate::Track`]'s block arena.
///
/// A handle whose slot has been freed or reused never resolves again, so a
/// stale back-reference reads as "missing" instead of aliasing a new block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Block,
    Rational,
    Text,
}

/// Connection point exposed to the graph-evaluation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInput {
    id: &'static str,
    name: String,
    data_type: InputType,
    connection: Option<BlockId>,
}

impl NodeInput {
    pub fn new(id: &'static str, data_type: InputType) -> Self {
        Self {
            id,
            name: id.to_string(),
            data_type,
            connection: None,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn data_type(&self) -> InputType {
        self.data_type
    }

    pub fn connection(&self) -> Option<BlockId> {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn set_connection(&mut self, connection: Option<BlockId>) {
        self.connection = connection;
    }
}

/// Source of user-facing strings. Keys are the English text.
pub trait Translator {
    fn tr(&self, key: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTranslator;

impl Translator for DefaultTranslator {
    fn tr(&self, key: &str) -> String {
        key.to_string()
    }
}

/// Lookup table translator; keys without an entry fall back to English.
#[derive(Debug, Default, Clone)]
pub struct TableTranslator {
    pub entries: HashMap<String, String>,
}

impl TableTranslator {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Translator for TableTranslator {
    fn tr(&self, key: &str) -> String {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClipBlock {
    /// Media identifier resolved by the decoder layer.
    pub source: String,
    /// Trim offset into the source media.
    #[serde(default)]
    pub media_in: Rational,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Clip(ClipBlock),
    Gap,
    Transition(TransitionBlock),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(skip)]
    name: String,
    /// Ignored for transitions, whose span is `out_offset + in_offset`.
    #[serde(default)]
    length: Rational,
    pub kind: BlockKind,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Block {
    pub fn clip(
        source: impl Into<String>,
        media_in: Rational,
        length: Rational,
    ) -> Result<Self, TimelineError> {
        Self::with_kind(
            BlockKind::Clip(ClipBlock {
                source: source.into(),
                media_in,
            }),
            length,
        )
    }

    pub fn gap(length: Rational) -> Result<Self, TimelineError> {
        Self::with_kind(BlockKind::Gap, length)
    }

    pub(crate) fn transition(transition: TransitionBlock) -> Self {
        let mut block = Self {
            label: None,
            name: String::new(),
            length: Rational::ZERO,
            kind: BlockKind::Transition(transition),
            metadata: serde_json::Value::Null,
        };
        block.retranslate(&DefaultTranslator);
        block
    }

    fn with_kind(kind: BlockKind, length: Rational) -> Result<Self, TimelineError> {
        if length <= Rational::ZERO {
            return Err(TimelineError::InvalidLength(length));
        }
        let mut block = Self {
            label: None,
            name: String::new(),
            length,
            kind,
            metadata: serde_json::Value::Null,
        };
        block.retranslate(&DefaultTranslator);
        Ok(block)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn length(&self) -> Rational {
        match &self.kind {
            BlockKind::Transition(t) => t.length(),
            _ => self.length,
        }
    }

    pub(crate) fn set_length_unchecked(&mut self, length: Rational) {
        self.length = length;
    }

    /// Translated type name ("Clip", "Gap", "Transition").
    pub fn name(&self) -> &str {
        &self.name
    }

    /// User label if set, otherwise the type name.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    pub fn is_transition(&self) -> bool {
        matches!(self.kind, BlockKind::Transition(_))
    }

    pub fn as_clip(&self) -> Option<&ClipBlock> {
        match &self.kind {
            BlockKind::Clip(clip) => Some(clip),
            _ => None,
        }
    }

    pub(crate) fn as_clip_mut(&mut self) -> Option<&mut ClipBlock> {
        match &mut self.kind {
            BlockKind::Clip(clip) => Some(clip),
            _ => None,
        }
    }

    pub fn as_transition(&self) -> Option<&TransitionBlock> {
        match &self.kind {
            BlockKind::Transition(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn as_transition_mut(&mut self) -> Option<&mut TransitionBlock> {
        match &mut self.kind {
            BlockKind::Transition(t) => Some(t),
            _ => None,
        }
    }

    pub fn inputs(&self) -> Vec<&NodeInput> {
        match &self.kind {
            BlockKind::Transition(t) => vec![t.out_block_input(), t.in_block_input()],
            _ => Vec::new(),
        }
    }

    /// Refreshes translated strings; never touches structure or timing.
    pub fn retranslate(&mut self, translator: &dyn Translator) {
        self.name = match &mut self.kind {
            BlockKind::Clip(_) => translator.tr("Clip"),
            BlockKind::Gap => translator.tr("Gap"),
            BlockKind::Transition(t) => {
                t.retranslate(translator);
                t.name().to_string()
            }
        };
    }
}

//! Nestable blocks: `{ … }` with quantity, multiple, shift, tuplet and
//! conditional modifiers.
//!
//! Blocks are collected into a tree while parsing and executed when the
//! root block closes. Only the structure lives here; execution is the
//! emission pass's job, because playing a block touches channel state and
//! the event sink.

use crate::error::{CompileError, Result};
use crate::line::SourceLine;
use crate::options::{CondKind, Opts};

/// One element of a block body, in source order.
#[derive(Debug, Clone)]
pub enum BlockElement {
    Line(SourceLine),
    Block(NestableBlock),
}

/// A closed block with its parsed modifiers.
#[derive(Debug, Clone)]
pub struct NestableBlock {
    pub multiple: bool,
    pub quantity: u32,
    /// Tuplet modifier in duration syntax (`t`, `t5:4`), applied to every
    /// descendant line when the block plays.
    pub tuplet: Option<String>,
    /// Semitone shift, added to every descendant note when the block plays.
    pub shift: i32,
    /// Raw, unsubstituted condition; evaluated when the block plays.
    pub condition: Option<(CondKind, String)>,
    pub open_line: usize,
    pub close_line: usize,
    pub children: Vec<BlockElement>,
}

impl NestableBlock {
    fn from_opts(opts: Opts, open_line: usize, close_line: usize) -> Result<Self> {
        // Blocks take only the structural options.
        if opts.velocity.is_some()
            || opts.duration_ratio.is_some()
            || opts.lyrics.is_some()
            || opts.tremolo.is_some()
        {
            return Err(CompileError::syntax(
                "blocks accept only multiple, quantity, tuplet, shift and if/elsif/else options",
            ));
        }
        Ok(NestableBlock {
            multiple: opts.multiple,
            quantity: opts.quantity.unwrap_or(1),
            tuplet: opts.tuplet,
            shift: opts.shift.unwrap_or(0),
            condition: opts.condition,
            open_line,
            close_line,
            children: Vec::new(),
        })
    }

    /// The conditional role of this block in a sibling chain.
    pub fn cond_kind(&self) -> Option<CondKind> {
        self.condition.as_ref().map(|(kind, _)| *kind)
    }
}

/// Incremental block-tree builder driven by `{` and `}` lines.
///
/// While at least one block is open, every incoming line belongs to the
/// innermost block instead of being executed. Closing the outermost block
/// hands the finished tree back for execution.
#[derive(Debug, Default)]
pub struct BlockBuilder {
    /// Open blocks, outermost first. Options given on the open brace are
    /// kept with the pending block and merged with the close-brace options.
    stack: Vec<PendingBlock>,
}

#[derive(Debug)]
struct PendingBlock {
    opts: Opts,
    open_line: usize,
    children: Vec<BlockElement>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while lines should be buffered instead of executed.
    pub fn collecting(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Handle a `{` line.
    pub fn open(&mut self, opts: Opts, line: usize) {
        self.stack.push(PendingBlock {
            opts,
            open_line: line,
            children: Vec::new(),
        });
    }

    /// Handle a `}` line. Returns the finished root block once the
    /// outermost brace closes; nested closes return `None`.
    pub fn close(&mut self, close_opts: Opts, line: usize) -> Result<Option<NestableBlock>> {
        let pending = self
            .stack
            .pop()
            .ok_or_else(|| CompileError::syntax("'}' without a matching '{'"))?;

        let mut opts = pending.opts;
        opts.merge(close_opts)?;
        let mut block = NestableBlock::from_opts(opts, pending.open_line, line)?;
        block.children = pending.children;

        match self.stack.last_mut() {
            Some(parent) => {
                parent.children.push(BlockElement::Block(block));
                Ok(None)
            }
            None => Ok(Some(block)),
        }
    }

    /// Buffer a line into the innermost open block.
    pub fn push_line(&mut self, line: SourceLine) {
        if let Some(inner) = self.stack.last_mut() {
            inner.children.push(BlockElement::Line(line));
        }
    }

    /// Line number of the outermost unclosed brace, for EOF diagnostics.
    pub fn unclosed_line(&self) -> Option<usize> {
        self.stack.first().map(|b| b.open_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywords::KeywordTable;
    use pretty_assertions::assert_eq;

    fn opts(text: &str) -> Opts {
        Opts::parse(text, &KeywordTable::default()).unwrap()
    }

    #[test]
    fn test_flat_block() {
        let mut builder = BlockBuilder::new();
        builder.open(opts("q=2"), 1);
        assert!(builder.collecting());
        builder.push_line(SourceLine::tokenize("0 c /4", 2));
        let root = builder.close(opts(""), 3).unwrap().unwrap();

        assert_eq!(root.quantity, 2);
        assert_eq!(root.children.len(), 1);
        assert!(!builder.collecting());
    }

    #[test]
    fn test_nested_blocks() {
        let mut builder = BlockBuilder::new();
        builder.open(opts(""), 1);
        builder.open(opts("m"), 2);
        builder.push_line(SourceLine::tokenize("0 c /4", 3));
        assert!(builder.close(opts(""), 4).unwrap().is_none());
        let root = builder.close(opts(""), 5).unwrap().unwrap();

        assert_eq!(root.children.len(), 1);
        match &root.children[0] {
            BlockElement::Block(inner) => {
                assert!(inner.multiple);
                assert_eq!(inner.open_line, 2);
                assert_eq!(inner.close_line, 4);
            }
            _ => panic!("expected nested block"),
        }
    }

    #[test]
    fn test_options_merge_across_braces() {
        let mut builder = BlockBuilder::new();
        builder.open(opts("q=2"), 1);
        let root = builder.close(opts("s=12"), 2).unwrap().unwrap();
        assert_eq!(root.quantity, 2);
        assert_eq!(root.shift, 12);
    }

    #[test]
    fn test_option_conflict_across_braces() {
        let mut builder = BlockBuilder::new();
        builder.open(opts("q=2"), 1);
        assert!(builder.close(opts("q=3"), 2).is_err());
    }

    #[test]
    fn test_non_block_options_rejected() {
        let mut builder = BlockBuilder::new();
        builder.open(opts("v=95"), 1);
        assert!(builder.close(opts(""), 2).is_err());
    }

    #[test]
    fn test_unmatched_close() {
        let mut builder = BlockBuilder::new();
        assert!(builder.close(opts(""), 1).is_err());
    }
}

//! Loop lowering for operator graphs.
//!
//! Rewrites eligible operators (and fused producer-to-consumer chains of
//! them) into explicit `Loop` nodes that compute one output element per
//! iteration using scalar arithmetic and single-element gather/scatter.
//! The passes here preserve value semantics exactly; anything they cannot
//! express stays in the graph untouched.
//!
//! The pipeline: [`chain`] collects maximal fusable chains and cuts them
//! into segments, [`builders`] turn each segment into a loop body, and
//! [`driver`] splices the loops into the graph.

mod builders;
mod chain;
mod context;
mod driver;
mod handlers;
mod indexing;

use spindle_core::Graph;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors the lowering pass can raise.
///
/// Anything recoverable (a shape the default builder needs, a stretch that
/// is not broadcast-safe) degrades gracefully instead of erroring; these
/// variants are the unrecoverable rest.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operator reached a recipe that cannot express it.
    #[error("Unsupported construct: {0}")]
    Unsupported(String),

    /// A shape that must be static is unknown (reduction inputs).
    #[error("Missing static shape: {0}")]
    MissingShape(String),

    /// The graph or a segment is internally inconsistent.
    #[error("Structural inconsistency: {0}")]
    Structural(String),

    /// Error from the underlying graph model.
    #[error(transparent)]
    Graph(#[from] spindle_core::Error),
}

/// Tuning knobs for the pass.
#[derive(Debug, Clone)]
pub struct LowerOptions {
    /// Fuse producer-to-consumer stretches into single loops. When false,
    /// every eligible operator lowers to its own loop.
    pub fusion: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self { fusion: true }
    }
}

/// What one run of the pass did to the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LowerReport {
    /// Loop nodes spliced in.
    pub loops_built: usize,

    /// Operators removed and replaced by loops.
    pub ops_replaced: usize,

    /// Eligible operators left untouched (no builder accepted them).
    pub ops_skipped: usize,

    /// Multi-operator segments that fell apart into singletons.
    pub segments_demoted: usize,
}

/// Lower every eligible operator in the graph to a `Loop`.
///
/// The graph is mutated in place. On success the returned report says how
/// much changed; on error the graph may be partially lowered but is always
/// structurally consistent.
#[tracing::instrument(skip_all, fields(num_ops = graph.node_count()))]
pub fn lower_graph(graph: &mut Graph, options: &LowerOptions) -> Result<LowerReport> {
    let mut report = LowerReport::default();
    let mut names = context::NameGen::new();

    let chains = chain::collect_chains(graph)?;
    tracing::debug!(chains = chains.len(), "collected fusable chains");

    for chain in &chains {
        let _span = tracing::debug_span!("chain", ops = chain.ops.len()).entered();
        driver::lower_chain(graph, chain, options, &mut names, &mut report)?;
    }

    tracing::info!(
        loops = report.loops_built,
        replaced = report.ops_replaced,
        skipped = report.ops_skipped,
        demoted = report.segments_demoted,
        "lowering complete"
    );
    debug_assert!(
        graph.validate().is_ok(),
        "graph left inconsistent after lowering"
    );
    Ok(report)
}

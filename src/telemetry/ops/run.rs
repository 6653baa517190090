use tracing::info_span;
use tracing::Span;

use crate::telemetry::ctx::{OpMarker, PhaseSpan};

#[derive(Copy, Clone, Debug)]
pub struct Run;

#[derive(Copy, Clone, Debug)]
pub enum Phase { LoadState, FetchFeed, Detect, Enrich, Post, SaveState }

impl PhaseSpan for Phase {
    fn span(&self) -> Span { match self {
        Phase::LoadState => info_span!("load_state"),
        Phase::FetchFeed => info_span!("fetch_feed"),
        Phase::Detect => info_span!("detect"),
        Phase::Enrich => info_span!("enrich"),
        Phase::Post => info_span!("post"),
        Phase::SaveState => info_span!("save_state"),
    }}
}

impl OpMarker for Run {
    const NAME: &'static str = "run";
    type Phase = Phase;
    fn root_span() -> Span { info_span!("run") }
}

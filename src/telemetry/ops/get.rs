use tracing::info_span;
use tracing::Span;

use crate::telemetry::ctx::{OpMarker, PhaseSpan};

#[derive(Copy, Clone, Debug)]
pub struct Get;

#[derive(Copy, Clone, Debug)]
pub enum Phase { Fetch }

impl PhaseSpan for Phase {
    fn span(&self) -> Span { match self { Phase::Fetch => info_span!("fetch") } }
}

impl OpMarker for Get {
    const NAME: &'static str = "get";
    type Phase = Phase;
    fn root_span() -> Span { info_span!("get") }
}

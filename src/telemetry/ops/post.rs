use tracing::info_span;
use tracing::Span;

use crate::telemetry::ctx::{OpMarker, PhaseSpan};

#[derive(Copy, Clone, Debug)]
pub struct Post;

#[derive(Copy, Clone, Debug)]
pub enum Phase { Send }

impl PhaseSpan for Phase {
    fn span(&self) -> Span { match self { Phase::Send => info_span!("send") } }
}

impl OpMarker for Post {
    const NAME: &'static str = "post";
    type Phase = Phase;
    fn root_span() -> Span { info_span!("post") }
}

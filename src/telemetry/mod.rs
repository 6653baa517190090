pub mod config;
pub mod ctx;
pub mod emit;
pub mod ops;

use ctx::LogCtx;

// Factory helpers, one per subcommand
pub fn run() -> LogCtx<ops::run::Run> { LogCtx { json: config::logs_are_json(), _marker: std::marker::PhantomData } }
pub fn get() -> LogCtx<ops::get::Get> { LogCtx { json: config::logs_are_json(), _marker: std::marker::PhantomData } }
pub fn post() -> LogCtx<ops::post::Post> { LogCtx { json: config::logs_are_json(), _marker: std::marker::PhantomData } }
pub fn versions() -> LogCtx<ops::versions::Versions> { LogCtx { json: config::logs_are_json(), _marker: std::marker::PhantomData } }

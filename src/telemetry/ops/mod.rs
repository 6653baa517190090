pub mod get;
pub mod post;
pub mod run;
pub mod versions;

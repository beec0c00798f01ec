//! Console front end for `popchat chat`.

pub mod app;
pub mod command;
pub mod sink;

pub use app::{ChatOptions, Flow, execute, run};
pub use command::Command;
pub use sink::ConsoleSink;

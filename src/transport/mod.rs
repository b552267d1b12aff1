//! Transport module - worker processes and their stdio pipes.

mod process;

pub use process::{terminate, WorkerCommand, WorkerProcess, DEFAULT_EXIT_GRACE};

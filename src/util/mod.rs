//! Small shared utilities: line framing and background-task collection.

pub mod line_reader;
pub mod task_queue;

pub use line_reader::{LineReader, LineReaderError};
pub use task_queue::{Finished, TaskPanic, TaskQueue};

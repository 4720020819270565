pub mod storage;
pub mod source;

pub use storage::{MemoryLog, DEFAULT_MAX_RECORDS, DEFAULT_TAIL_BUFFER};
pub use source::MemorySource;

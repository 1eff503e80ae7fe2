//! Shell history model, codec and merge engine.

pub mod codec;
pub mod merge;
pub mod record;

pub use codec::{parse, read_history_file, serialize, write_history_file, TextEncoding};
pub use merge::{merge, merge_report, MergeStats};
pub use record::{HistoryRecord, HistorySet};

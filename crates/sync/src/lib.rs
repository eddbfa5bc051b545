mod merge;
mod record;

pub use merge::merge_journals;
pub use record::{now_ms, OpId, OperateKind, OperationRecord};

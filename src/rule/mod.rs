//! Rule compilation
//!
//! This module turns a declarative JSON rule document into a [`Rule`]: global timing
//! and concurrency policy, seed [`Entry`] values, and named [`TargetTemplate`]s whose
//! extraction plans are expressed as compiled [`Pipeline`]s.

mod entry;
mod parser;
mod pipeline;
mod template;
mod timing;

pub use entry::{apply_var, apply_vars, apply_vars_to_map, Entry};
pub use parser::Rule;
pub use pipeline::{Action, Pipeline};
pub use template::{
    is_file_extension, AgentMode, ClientKind, ContentKind, ListOutput, ObjectOutput, TargetTemplate,
    FILE_EXTENSIONS,
};
pub use timing::{compute_start_delay, parse_duration, parse_time_of_day, DayAnchor};

//! Batch image labelling: a submission becomes a process record, its images are
//! labelled by a bounded worker pool in the background, and the owner's
//! webhooks are told once the process reaches a terminal status.

pub mod dispatch;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod transform;

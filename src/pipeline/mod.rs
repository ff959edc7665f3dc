pub mod coordinator;
pub mod source;
pub mod task;

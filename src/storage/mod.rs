pub mod pages;
pub mod queue;

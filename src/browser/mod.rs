pub mod extract;
pub mod selectors;

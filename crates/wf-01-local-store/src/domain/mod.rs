//! Pure query and record rules of the store.

pub mod filters;
pub mod query;
pub mod records;

pub mod batch;
pub mod info;
pub mod list;
pub mod query;

pub mod portfolio;
pub mod query;

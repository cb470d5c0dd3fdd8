pub mod active_set;
pub mod cla;
pub mod kkt;
pub mod problem;

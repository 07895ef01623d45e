pub mod counting;
pub mod errand;
pub mod inbox;

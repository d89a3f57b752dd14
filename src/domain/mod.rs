pub mod caller;
pub mod credits;
pub mod identity;
pub mod models;
pub mod usage;

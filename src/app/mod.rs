pub(crate) mod app_state;
pub mod config;
pub mod logging;
pub mod shutdown;

pub(crate) mod blocking;
pub(crate) mod constants;
pub mod error;
pub(crate) mod ids;
pub(crate) mod mutex_ext;
pub mod time;

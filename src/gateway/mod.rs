mod auth;
mod handlers;
pub(crate) mod manager;
mod middleware;
mod normalize;
pub(crate) mod proxy;
pub(crate) mod routes;
pub(crate) mod streams;

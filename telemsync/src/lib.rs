pub mod auth;
pub mod config;
pub mod convert;
pub mod pipeline;
pub mod remote;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub mod api;
pub mod auth;
pub mod board;
pub mod notify;
pub mod orchestrator;
pub mod poller;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod fakes;

pub mod auth;
pub mod market_study;

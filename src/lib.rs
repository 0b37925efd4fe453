//! ASO Market Study Pipeline Client
//!
//! Client-side core of the app-store-optimization dashboard: keeps the
//! session's access token fresh, triggers market study pipeline steps on the
//! backend and polls each study to a terminal state, reconciling the local
//! list of studies as status reads come in.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;

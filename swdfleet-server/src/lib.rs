pub mod api;
pub mod auth;
pub mod config;
pub mod serve;
pub mod service;
pub mod store;
pub mod tls;

use std::sync::Arc;

use crate::api::security::{IpRateLimiter, LoginGuard};
use crate::config::Config;
use crate::service::Service;

/// Shared state handed to every HTTP handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    pub config: Arc<Config>,
    pub api_limiter: Arc<IpRateLimiter>,
    pub login_guard: Arc<LoginGuard>,
}

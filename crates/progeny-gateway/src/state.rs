use std::{sync::Arc, time::Duration};

use crate::backends::Backends;

#[derive(Clone)]
pub struct AppState {
    pub backends: Backends,
    pub upstream_host: Arc<str>,
    pub upstream_timeout: Duration,
}

impl AppState {
    pub fn new(backends: Backends, upstream_host: &str, upstream_timeout: Duration) -> Self {
        Self {
            backends,
            upstream_host: Arc::from(upstream_host),
            upstream_timeout,
        }
    }
}

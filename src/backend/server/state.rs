//! Application State
//!
//! The engine and token verifier shared with every socket handler. Both
//! sit behind `Arc`, so cloning the state per request is cheap.

use std::sync::Arc;

use axum::extract::FromRef;

use crate::backend::auth::TokenVerifier;
use crate::backend::engine::ChatEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl FromRef<AppState> for Arc<ChatEngine> {
    fn from_ref(state: &AppState) -> Self {
        state.engine.clone()
    }
}

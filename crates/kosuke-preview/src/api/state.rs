//! Application state shared across handlers.

use std::sync::Arc;

use crate::preview::PreviewService;

#[derive(Clone)]
pub struct AppState {
    pub previews: Arc<PreviewService>,
}

impl AppState {
    pub fn new(previews: PreviewService) -> Self {
        Self {
            previews: Arc::new(previews),
        }
    }
}

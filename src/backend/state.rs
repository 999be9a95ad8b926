use std::sync::RwLock;

use crate::environment::ServicePaths;

// backend's shared state
pub struct AppState {
    pub paths: ServicePaths,
    pub installed: Vec<String>, // models the backend advertises
    pub current: RwLock<String>, // model used for replies
}

impl AppState {
    pub fn new(paths: ServicePaths, installed: Vec<String>) -> Self {
        let current = installed.first().cloned().unwrap_or_default();
        Self {
            paths,
            installed,
            current: RwLock::new(current),
        }
    }

    pub fn current_model(&self) -> String {
        self.current
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    // false if the model is not installed
    pub fn select_model(&self, model: &str) -> bool {
        if !self.installed.iter().any(|m| m == model) {
            return false;
        }
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = model.to_string();
        true
    }
}

// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Two-state caller lifecycle.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::model::ModelLoader;

/// Caller lifecycle state. Checked at the entry of every caller operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerState {
    Running,
    Terminated,
}

impl std::fmt::Display for CallerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Transition-side state, held under the caller's lifecycle lock so that
/// `terminate`, `restart` and `swap_model` never interleave.
pub(super) struct Lifecycle {
    pub loader: Arc<dyn ModelLoader>,
    pub executor: Option<JoinHandle<()>>,
}

impl Lifecycle {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self { loader, executor: None }
    }

    pub fn is_running(&self) -> bool {
        self.executor.is_some()
    }
}

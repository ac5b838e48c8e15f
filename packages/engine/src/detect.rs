// packages/engine/src/detect.rs
//! Runtime detection from marker files
//!
//! Precedence, first match wins:
//! 1. `Dockerfile` → container (also forces the container backend)
//! 2. `go.mod` → go
//! 3. `package.json` → node
//! 4. `requirements.txt`, `pyproject.toml`, `setup.py`, `Pipfile` → python
//! 5. the configured default
//!
//! An image definition wins both for labeling and for backend selection,
//! so a repository that ships its own Dockerfile always runs the way its
//! authors packaged it.

use crate::workload::{BackendKind, RuntimeKind};
use std::path::Path;

/// Marker files in precedence order
const MARKERS: &[(&str, RuntimeKind)] = &[
    ("Dockerfile", RuntimeKind::Container),
    ("go.mod", RuntimeKind::Go),
    ("package.json", RuntimeKind::Node),
    ("requirements.txt", RuntimeKind::Python),
    ("pyproject.toml", RuntimeKind::Python),
    ("setup.py", RuntimeKind::Python),
    ("Pipfile", RuntimeKind::Python),
];

/// Classify a workspace. Never fails: unknown layouts get `default`.
pub fn detect(workspace: &Path, default: RuntimeKind) -> RuntimeKind {
    MARKERS
        .iter()
        .find(|(marker, _)| workspace.join(marker).is_file())
        .map(|(_, kind)| *kind)
        .unwrap_or(default)
}

/// Backend a runtime must use
pub fn select_backend(runtime: RuntimeKind, default: BackendKind) -> BackendKind {
    match runtime {
        RuntimeKind::Container => BackendKind::Container,
        _ => default,
    }
}

/// Entry point used when the operator does not name one
pub fn default_entry_point(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Python => "main.py",
        RuntimeKind::Node => "index.js",
        RuntimeKind::Go => ".",
        // the image's own CMD
        RuntimeKind::Container => "",
    }
}

//! Build identity used for client/daemon version mismatch detection.

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit SHA baked in by build.rs ("unknown" outside a git checkout).
pub const BUILD_SHA: &str = env!("KUBETUN_GIT_SHA");

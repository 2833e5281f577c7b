//! Deployment runtime
//!
//! Uploaded bundles and saved projects are staged on disk, matched to a
//! runtime, started on a local port and kept under supervision.

mod archive;
mod manager;
mod paths;
mod runtime;

pub use archive::{
    copy_tree, is_archive, resolve_app_root, sanitize_file_name, stage_upload,
    validate_entry_name, ARCHIVE_EXTENSIONS,
};
pub use manager::{Deployment, DeploymentRuntime};
pub use paths::{ensure_contained, join_within};
pub use runtime::{
    detect_runtime, find_entry, plan_launch, LaunchPlan, RuntimeBinaries, BIND_HOST,
    ENTRY_CANDIDATES, SCRIPT_MANIFESTS,
};

//! System requirements validation.
//!
//! This module provides functions to check that the host can run the
//! selected isolation backend before the service accepts requests.

mod requirements;

pub use requirements::{
    SystemRequirements, check_all, check_container_runtime, check_user_namespaces, kernel_release,
};

//! Shared plumbing for the KOS controllers.
//!
//! Provides the namespaced-name key type, an indexed object store fed by
//! watch events, a rate-limited de-duplicating work queue, and helpers for
//! classifying Kubernetes API errors.

pub mod api_errors;
pub mod backoff;
pub mod key;
pub mod store;
pub mod workqueue;

// Re-exports
pub use key::NamespacedName;
pub use store::Store;
pub use workqueue::WorkQueue;

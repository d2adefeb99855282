//! Fieldtask Model
//!
//! Data model and collaborator interfaces shared by the Fieldtask client:
//! - **Identity**: principals, identities and the reactive identity provider
//! - **Types**: profiles, fields, tasks and the bulk export bundle
//! - **Failure**: the raw, untyped failure value rejected by remote calls
//! - **Backend**: the remote procedure surface and the connector that binds it
//!   to an identity
//!
//! # Example
//!
//! ```rust
//! use fieldtask_model::{Identity, Principal};
//!
//! let anon = Identity::anonymous();
//! assert!(anon.is_anonymous());
//!
//! let alice = Identity::new(Principal::new("alice-principal"));
//! assert!(!alice.is_anonymous());
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod failure;
pub mod identity;
pub mod types;

// Re-exports
pub use backend::{Backend, Connector};
pub use failure::Failure;
pub use identity::{Identity, IdentityProvider, IdentitySnapshot, Principal};
pub use types::{
    format_total_duration, DurationUnit, ExportBundle, Field, FieldDraft, FieldId, FieldMetrics,
    Task, TaskAttribute, TaskDraft, TaskId, Timestamp, UserProfile, ValidationError,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the Fieldtask model
    pub use crate::{
        Backend, Connector, Failure, Field, FieldId, Identity, IdentityProvider,
        IdentitySnapshot, Principal, Task, TaskId, UserProfile,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

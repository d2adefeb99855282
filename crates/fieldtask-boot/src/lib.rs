//! Fieldtask Boot - client boot and session resilience
//!
//! Establishes a backend connection bound to the current identity and keeps
//! the client out of blank or half-initialized states:
//! - Classifies heterogeneous remote failures into actionable categories
//! - Supervises the single backend connection across identity changes
//! - Declares a stuck boot when no progress is made within a deadline
//! - Derives the top-level UI phase and drives Retry and Logout
//! - Shows a fallback error surface for failures before rendering starts
//!
//! # Architecture
//!
//! ```text
//! IdentityProvider ──► ConnectionSupervisor ──► QueryCache (identity-scoped)
//!         │                     │
//!         └──────► BootSequencer ◄──── BootWatchdog
//!                        │
//!                   BootPhase ──► BootContext (diagnostics)
//!
//! PreRenderFallback: installed first, independent of the above
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fieldtask_boot::{BootConfig, BootContext, BootSequencer, PreRenderFallback, StderrSurface};
//! use std::sync::Arc;
//!
//! # async fn example(identity: Arc<dyn fieldtask_model::IdentityProvider>,
//! #                  connector: Arc<dyn fieldtask_model::Connector>) {
//! let context = Arc::new(BootContext::new("build-1"));
//! let fallback = PreRenderFallback::new(Arc::clone(&context), Arc::new(StderrSurface));
//! fallback.install();
//!
//! let sequencer = Arc::new(BootSequencer::from_config(
//!     identity,
//!     connector,
//!     BootConfig::default(),
//!     context,
//! ));
//! fallback.mark_render_started();
//! tokio::spawn(Arc::clone(&sequencer).run());
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

// Core modules
pub mod cache;
pub mod classify;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod fallback;
pub mod phase;
pub mod sequencer;
pub mod supervisor;
pub mod watchdog;

// Re-exports for convenience
pub use cache::{CacheEntry, CacheKey, CacheStats, CacheValue, EntryLoader, MokaQueryCache, QueryCache};
pub use classify::{classify, classify_at, ClassifiedError, ErrorCategory};
pub use config::{BootConfig, RetryPolicy};
pub use connection::{Connection, ConnectionState};
pub use context::{BootContext, BootDiagnostics};
pub use error::{BootError, ConfigError, ConnectError, GuardError};
pub use fallback::{
    FailureKind, FallbackOutcome, FallbackReport, FallbackSurface, PreRenderFallback, StderrSurface,
};
pub use phase::{derive_phase, BootPhase, PhaseInputs, ProfileFetchState};
pub use sequencer::BootSequencer;
pub use supervisor::{ConnectionSupervisor, SupervisorStats};
pub use watchdog::{BootWatchdog, StuckReason, WatchdogFlags, WatchdogStatus};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the boot layer
    pub use crate::{
        BootConfig, BootContext, BootPhase, BootSequencer, ClassifiedError, ConnectionSupervisor,
        ErrorCategory, GuardError, PreRenderFallback, QueryCache,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Reconciliation for surfaces that read, but do not own, the canonical store.
//!
//! A surface runs the [`ReconciliationBootstrapper`] once when it opens, then
//! keeps its view current with a [`SurfaceMonitor`].

pub mod bootstrap;
pub mod probe_cache;
pub mod surface;
pub mod tabs;

pub use bootstrap::{BootstrapOutcome, BootstrapPhase, BootstrapReport, ReconciliationBootstrapper};
pub use probe_cache::ProbeFailureCache;
pub use surface::{SurfaceMonitor, SurfaceStatus};
pub use tabs::{NoTabProber, OriginAllowList, PageTabProber, ProbeError, TabInfo, TabProber};

//! PolyVox Core Library
//!
//! Job orchestration core for producing multi-language video content: queued
//! jobs fan out over a bounded worker pool, each language walks its stage
//! pipeline (translation, image prompts, images, voiceover, subtitles,
//! montage) against remote AI services, with human review checkpoints and a
//! crash-recovery journal.
//!
//! The host application wires the pieces together:
//!
//! ```no_run
//! use std::sync::{Arc, RwLock};
//! use polyvox::core::{
//!     events::EventBus, gateway::ServiceGateway, journal::JobJournal,
//!     pipeline::PipelineExecutor, queue::QueueStore, review::ReviewCoordinator,
//!     settings::AppSettings,
//! };
//!
//! let settings = AppSettings::default();
//! let events = EventBus::new();
//! let journal = Arc::new(JobJournal::new("/var/lib/polyvox/journal"));
//! let queue = Arc::new(QueueStore::new(Arc::clone(&journal), events.clone()));
//! let reviews = Arc::new(ReviewCoordinator::new(events.clone()));
//! let gateway = Arc::new(ServiceGateway::new(settings.gateway_config()));
//! let settings = Arc::new(RwLock::new(settings));
//!
//! let executor = Arc::new(PipelineExecutor::new(
//!     queue, journal, gateway, reviews, events, settings,
//! ));
//! # let _ = executor;
//! ```

pub mod core;

/// Installs a stderr tracing subscriber honoring `RUST_LOG`.
///
/// Hosts embedding the core can skip this and install their own subscriber;
/// calling it twice is harmless.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

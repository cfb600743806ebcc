// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Persisted and in-memory state for the control plane's data plane
//! (§4.2–§4.5): the event pipeline, artifact store, draft store, and
//! module store, plus the `<dataDir>` layout ([`paths`]) they all share.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod artifact_store;
pub mod draft_store;
pub mod event_pipeline;
pub mod module_store;
pub mod paths;

pub use artifact_store::{ArtifactStore, ArtifactStoreError, StoreArtifactRequest, TargetArtifactStats, INLINE_THRESHOLD_BYTES};
pub use draft_store::{DraftError, DraftStore};
pub use event_pipeline::{EventPipeline, EventPipelineLimits, FetchResult, FetchScope, Ingested};
pub use module_store::{ModuleStore, ModuleStoreError};
pub use paths::DataPaths;

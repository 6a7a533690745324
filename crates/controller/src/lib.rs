/*
 * 5D Labs Platform - Cluster Recovery Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Cluster recovery controller library
//!
//! Watches cluster events, matches them against a configurable rule set and
//! drives ordered, dependency-aware recreation of resources that entered an
//! unrecoverable state (immutable-field conflicts, stuck rollouts, failed
//! Flux reconciliations).
//!
//! Pipeline: [`events`] → [`patterns`] → [`state`] → [`executor`], with
//! [`graph`] providing cleanup/recreation ordering and impact analysis.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod patterns;
pub mod report;
pub mod resource;
pub mod server;
pub mod state;

// Re-export commonly used types
pub use cluster::{ClusterApi, ClusterError, InMemoryCluster, KubeCluster};
pub use config::RuntimeConfig;
pub use controller::RecoveryController;
pub use error::{Error, Result};
pub use events::ClusterEvent;
pub use executor::{Outcome, RecoveryExecutor};
pub use graph::{DependencyGraph, RecoveryPlan};
pub use patterns::{PatternMatcher, PatternStore, Severity};
pub use resource::ResourceKey;
pub use state::{Admission, DenialReason, RecoveryStateTracker, RecoveryStatus};

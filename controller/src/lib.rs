/*
 * Relay Workflow Controller - Kubernetes Controller for Workflow Runs
 * Copyright (C) 2025 Relay
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

//! Workflow controller core library
//!
//! This crate provides the control plane for declarative workflow runs:
//! the WorkflowRun reconciler, the step-graph compiler, the per-pod-identity
//! metadata API, and the tool-injection admission webhook.

pub mod admission;
pub mod crds;
pub mod expr;
pub mod manager;
pub mod metadataapi;
pub mod model;
pub mod storage;
pub mod workflow;

// Re-export commonly used types
pub use crds::{WorkflowRun, WorkflowRunSpec, WorkflowRunStatus};
pub use workflow::config::ControllerConfig;
pub use workflow::{run_workflow_controller, Context};

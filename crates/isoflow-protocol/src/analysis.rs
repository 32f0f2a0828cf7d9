// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Regional analysis requests, per-origin tasks and their results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Routing configuration shared by every task of a job.
///
/// The profile itself is opaque to the orchestrator and passed through to
/// workers untouched. The scenario may travel inline, but dispatch detaches it
/// and stores it separately so that workers fetch it once by `scenarioId`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRequest {
    /// Inline scenario JSON; must carry a string `id` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Value>,
    /// Identifier of a scenario stored out of band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
    /// Remaining profile fields (modes, departure window, walk speed, ...).
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

impl RoutingRequest {
    /// Take the inline scenario out of the request, pointing `scenario_id` at it.
    ///
    /// Returns the scenario and its id, or `None` when there is nothing inline
    /// or the inline scenario has no string `id`. In the latter case the
    /// request is left as it was.
    pub fn detach_scenario(&mut self) -> Option<(String, Value)> {
        let id = self
            .scenario
            .as_ref()?
            .get("id")
            .and_then(Value::as_str)?
            .to_string();
        let scenario = self.scenario.take()?;
        self.scenario_id = Some(id.clone());
        Some((id, scenario))
    }
}

/// A request to evaluate accessibility for every origin cell of a sub-grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionalAnalysis {
    /// Job identifier; also names the finished artifact.
    pub id: String,
    /// Transport network bundle (graph) the workers must load.
    pub bundle_id: String,
    /// Owning project, used to locate destination grids.
    pub project_id: String,
    /// Worker executable version required to serve the tasks.
    pub worker_version: String,
    /// Web-Mercator zoom level.
    pub zoom: i32,
    /// World x pixel of the western column.
    pub west: i32,
    /// World y pixel of the northern row.
    pub north: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
    /// Travel-time cutoff.
    pub cutoff_minutes: i32,
    /// Name of the destination opportunity grid within the project.
    pub grid: String,
    /// Routing configuration shared by all origins.
    pub request: RoutingRequest,
}

impl RegionalAnalysis {
    /// Number of origin cells, one task each.
    pub fn task_count(&self) -> u64 {
        u64::try_from(self.width).unwrap_or(0) * u64::try_from(self.height).unwrap_or(0)
    }

    /// Storage key of the destination grid: `{projectId}/{grid}.grid`.
    pub fn destination_grid_key(&self) -> String {
        format!("{}/{}.grid", self.project_id, self.grid)
    }

    /// Storage key of the detached scenario: `{bundleId}_{scenarioId}.json`.
    pub fn scenario_key(&self, scenario_id: &str) -> String {
        format!("{}_{}.json", self.bundle_id, scenario_id)
    }

    /// Task for the origin at grid-relative `(x, y)`.
    ///
    /// `request` is passed separately so callers can share one scenario-stripped
    /// copy across all tasks.
    pub fn task(&self, x: i32, y: i32, request: &RoutingRequest, output_queue: &str) -> RegionalTask {
        RegionalTask {
            job_id: self.id.clone(),
            task_id: u64::try_from(y).unwrap_or(0) * u64::try_from(self.width).unwrap_or(0)
                + u64::try_from(x).unwrap_or(0),
            graph_id: self.bundle_id.clone(),
            worker_version: self.worker_version.clone(),
            zoom: self.zoom,
            west: self.west,
            north: self.north,
            width: self.width,
            height: self.height,
            x,
            y,
            cutoff_minutes: self.cutoff_minutes,
            grid: self.destination_grid_key(),
            output_queue: output_queue.to_string(),
            request: request.clone(),
        }
    }
}

/// One origin cell's unit of distributed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionalTask {
    /// Owning job.
    pub job_id: String,
    /// Linear position of the origin, `y * width + x`.
    pub task_id: u64,
    /// Transport network the worker must load.
    pub graph_id: String,
    /// Worker executable version required.
    pub worker_version: String,
    /// Web-Mercator zoom level of the enclosing grid.
    pub zoom: i32,
    /// World x pixel of the enclosing grid's western column.
    pub west: i32,
    /// World y pixel of the enclosing grid's northern row.
    pub north: i32,
    /// Width of the enclosing grid.
    pub width: i32,
    /// Height of the enclosing grid.
    pub height: i32,
    /// Origin column within the grid.
    pub x: i32,
    /// Origin row within the grid.
    pub y: i32,
    /// Travel-time cutoff.
    pub cutoff_minutes: i32,
    /// Destination grid key.
    pub grid: String,
    /// Queue the worker publishes its result to.
    pub output_queue: String,
    /// Shared routing configuration.
    pub request: RoutingRequest,
}

/// What a worker publishes after evaluating one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionalWorkResult {
    /// Owning job.
    pub job_id: String,
    /// Linear position of the origin.
    pub task_id: u64,
    /// Accessibility indexed by destination pointset, percentile and cutoff.
    pub accessibility_values: Vec<Vec<Vec<i32>>>,
}

impl RegionalWorkResult {
    /// Result holding a single accessibility value.
    pub fn single(job_id: impl Into<String>, task_id: u64, value: i32) -> Self {
        Self {
            job_id: job_id.into(),
            task_id,
            accessibility_values: vec![vec![vec![value]]],
        }
    }
}

//! Data migration
//!
//! The engine replays a compiled layout against the live source data set.
//! Rows are handled strictly one after another: row `i + 1` is not fetched
//! until row `i`'s parent and children have both been answered, so the
//! host assigns case ids in source order and only one row is ever in flight.
//!
//! Per row:
//! 1. `get dataContext[src].collection[last].caseByIndex[i]`
//! 2. `create dataContext[dst].collection[last].case` with the parent values
//! 3. `create dataContext[dst].collection[<category>s].case` with one child per
//!    category value, all in one request, parented to the id from step 2
//!
//! A failed fetch or parent creation halts the migration. A failed child
//! batch is reported and the migration moves on.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::layout::PivotLayout;
use super::plan::StackingPlan;
use super::schema::{derive_target_schema, DataSetSchema};
use crate::bridge::{Bridge, CallOutcome, EventSender, PluginEvent, Request, Response};
use crate::error::{Result, ResultExt, StackerError};
use crate::selector::ResourceSelector;

/// What to do with the partially built data set when a migration halts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Keep the rows created so far and report the halt
    #[default]
    LeavePartial,
    /// Delete the new data set
    Rollback,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::LeavePartial => write!(f, "leave-partial"),
            FailurePolicy::Rollback => write!(f, "rollback"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = StackerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "leave-partial" => Ok(FailurePolicy::LeavePartial),
            "rollback" => Ok(FailurePolicy::Rollback),
            other => Err(StackerError::Config(format!(
                "unknown failure policy '{}' (expected leave-partial or rollback)",
                other
            ))),
        }
    }
}

/// Resource names for one migration
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationJob {
    pub source: String,
    pub source_collection: String,
    pub target: String,
    pub parent_collection: String,
    pub child_collection: String,
    pub plan: StackingPlan,
}

impl MigrationJob {
    pub fn new(
        source: &DataSetSchema,
        target: &DataSetSchema,
        plan: StackingPlan,
    ) -> Result<Self> {
        let last = source.last_collection().ok_or_else(|| {
            StackerError::Schema(format!("data set '{}' has no collections", source.name))
        })?;
        Ok(Self {
            source: source.name.clone(),
            source_collection: last.name.clone(),
            target: target.name.clone(),
            parent_collection: last.name.clone(),
            child_collection: plan.child_collection(),
            plan,
        })
    }

    fn source_collection(&self) -> ResourceSelector {
        ResourceSelector::root("dataContext", &self.source)
            .child("collection", &self.source_collection)
    }

    pub fn case_count_resource(&self) -> String {
        self.source_collection().leaf("caseCount").to_string()
    }

    pub fn case_by_index_resource(&self, index: u64) -> String {
        self.source_collection()
            .child("caseByIndex", index.to_string())
            .to_string()
    }

    pub fn parent_case_resource(&self) -> String {
        ResourceSelector::root("dataContext", &self.target)
            .child("collection", &self.parent_collection)
            .leaf("case")
            .to_string()
    }

    pub fn child_case_resource(&self) -> String {
        ResourceSelector::root("dataContext", &self.target)
            .child("collection", &self.child_collection)
            .leaf("case")
            .to_string()
    }
}

/// Result of migrating one source row
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// Parent and all children created
    Migrated { parent_id: i64, children: usize },
    /// Parent created but the child batch was not
    ChildrenFailed { parent_id: i64, reason: String },
    /// Fetching the row or creating its parent failed
    Failed(String),
    /// Fetching the row or creating its parent got no answer
    TimedOut(String),
}

impl RowOutcome {
    /// True if the migration must stop after this row
    pub fn halts(&self) -> bool {
        matches!(self, RowOutcome::Failed(_) | RowOutcome::TimedOut(_))
    }
}

/// Where and why a migration stopped early
#[derive(Debug, Clone, PartialEq)]
pub struct Halt {
    pub row: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub target: String,
    pub rows_total: u64,
    pub rows_migrated: u64,
    pub children_created: u64,
    /// Rows whose child batch failed, with the reason
    pub child_failures: Vec<(u64, String)>,
    pub halted: Option<Halt>,
    /// `Some(success)` when a rollback was attempted
    pub rolled_back: Option<bool>,
}

impl MigrationReport {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            rows_total: 0,
            rows_migrated: 0,
            children_created: 0,
            child_failures: Vec::new(),
            halted: None,
            rolled_back: None,
        }
    }

    /// Every row and every child row made it across
    pub fn is_complete(&self) -> bool {
        self.halted.is_none()
            && self.child_failures.is_empty()
            && self.rows_migrated == self.rows_total
    }
}

/// Drives stacking requests through the bridge
pub struct ReshapeEngine {
    bridge: Arc<Bridge>,
    policy: FailurePolicy,
    events: Option<EventSender>,
}

impl ReshapeEngine {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        let events = bridge.event_sender();
        Self {
            bridge,
            policy: FailurePolicy::default(),
            events,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    fn emit(&self, event: PluginEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Fetch a data set's schema with `get dataContext[NAME]`
    pub async fn fetch_schema(&self, name: &str) -> Result<DataSetSchema> {
        let resource = ResourceSelector::root("dataContext", name).to_string();
        let values = expect_values(
            &resource,
            self.bridge.send_request(&Request::get(&resource)).await?,
        )?;
        serde_json::from_value(values).map_err(|e| {
            StackerError::Schema(format!("data set '{}' has an unexpected shape: {}", name, e))
        })
    }

    /// Compile the layout, create the stacked data set and migrate every row
    pub async fn stack(
        &self,
        source: &DataSetSchema,
        layout: &PivotLayout,
    ) -> Result<MigrationReport> {
        let plan = layout.compile(source)?;
        let target = derive_target_schema(source, &plan)?;
        let job = MigrationJob::new(source, &target, plan)?;

        let definition = serde_json::to_value(&target)?;
        let outcome = self
            .bridge
            .send_request(&Request::create("dataContext", definition))
            .await
            .with_context(|| format!("Creating data set '{}'", target.name))?;
        expect_values("dataContext", outcome)
            .with_context(|| format!("Creating data set '{}'", target.name))?;
        tracing::info!("Created data set '{}'", target.name);

        Ok(self.migrate(&job).await)
    }

    /// Copy every source row into the target data set
    pub async fn migrate(&self, job: &MigrationJob) -> MigrationReport {
        let mut report = MigrationReport::new(&job.target);

        let count = match self.case_count(job).await {
            Ok(count) => count,
            Err(reason) => {
                self.halt(&mut report, 0, reason).await;
                return self.finish(report);
            }
        };
        report.rows_total = count;
        tracing::info!("Stacking {} rows of '{}' into '{}'", count, job.source, job.target);
        self.emit(PluginEvent::MigrationStarted {
            target: job.target.clone(),
            rows: count,
        });

        for row in 0..count {
            match self.migrate_row(job, row).await {
                RowOutcome::Migrated {
                    parent_id,
                    children,
                } => {
                    report.rows_migrated += 1;
                    report.children_created += children as u64;
                    tracing::debug!("Row {} -> case {} ({} children)", row, parent_id, children);
                    self.emit(PluginEvent::RowMigrated {
                        row,
                        parent_id,
                        children,
                    });
                }
                RowOutcome::ChildrenFailed { parent_id, reason } => {
                    report.rows_migrated += 1;
                    tracing::warn!(
                        "Children of row {} (case {}) not created: {}",
                        row,
                        parent_id,
                        reason
                    );
                    self.emit(PluginEvent::ChildRowsFailed {
                        row,
                        reason: reason.clone(),
                    });
                    report.child_failures.push((row, reason));
                }
                RowOutcome::Failed(reason) | RowOutcome::TimedOut(reason) => {
                    self.halt(&mut report, row, reason).await;
                    break;
                }
            }
        }

        self.finish(report)
    }

    /// Fetch one source row and create its parent and children
    pub async fn migrate_row(&self, job: &MigrationJob, row: u64) -> RowOutcome {
        let fetch = Request::get(job.case_by_index_resource(row));
        let source = match self.bridge.send_request(&fetch).await {
            Ok(CallOutcome::Replied(resp)) if resp.success => match case_values(&resp) {
                Some(values) => values,
                None => {
                    return RowOutcome::Failed(format!("row {} came back without a case", row))
                }
            },
            Ok(CallOutcome::Replied(resp)) => {
                return RowOutcome::Failed(failure_reason(&fetch.resource, &resp))
            }
            Ok(CallOutcome::TimedOut) => {
                return RowOutcome::TimedOut(format!("fetching row {} timed out", row))
            }
            Err(e) => return RowOutcome::Failed(e.to_string()),
        };

        let parent = Request::create(
            job.parent_case_resource(),
            json!({ "values": job.plan.parent_values(&source) }),
        );
        let parent_id = match self.bridge.send_request(&parent).await {
            Ok(CallOutcome::Replied(resp)) if resp.success => match created_id(&resp) {
                Some(id) => id,
                None => {
                    return RowOutcome::Failed(format!(
                        "parent of row {} was created without an id",
                        row
                    ))
                }
            },
            Ok(CallOutcome::Replied(resp)) => {
                return RowOutcome::Failed(failure_reason(&parent.resource, &resp))
            }
            Ok(CallOutcome::TimedOut) => {
                return RowOutcome::TimedOut(format!("creating parent of row {} timed out", row))
            }
            Err(e) => return RowOutcome::Failed(e.to_string()),
        };

        let children: Vec<Value> = job
            .plan
            .child_values(&source)
            .into_iter()
            .map(|values| json!({ "parent": parent_id, "values": values }))
            .collect();
        let count = children.len();
        let create = Request::create(job.child_case_resource(), Value::Array(children));
        match self.bridge.send_request(&create).await {
            Ok(CallOutcome::Replied(resp)) if resp.success => RowOutcome::Migrated {
                parent_id,
                children: count,
            },
            Ok(CallOutcome::Replied(resp)) => RowOutcome::ChildrenFailed {
                parent_id,
                reason: failure_reason(&create.resource, &resp),
            },
            Ok(CallOutcome::TimedOut) => RowOutcome::ChildrenFailed {
                parent_id,
                reason: "timed out".to_string(),
            },
            Err(e) => RowOutcome::ChildrenFailed {
                parent_id,
                reason: e.to_string(),
            },
        }
    }

    async fn case_count(&self, job: &MigrationJob) -> std::result::Result<u64, String> {
        let resource = job.case_count_resource();
        match self.bridge.send_request(&Request::get(&resource)).await {
            Ok(CallOutcome::Replied(resp)) if resp.success => resp
                .values
                .as_ref()
                .and_then(Value::as_u64)
                .ok_or_else(|| format!("{} did not return a number", resource)),
            Ok(CallOutcome::Replied(resp)) => Err(failure_reason(&resource, &resp)),
            Ok(CallOutcome::TimedOut) => Err("counting source rows timed out".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn halt(&self, report: &mut MigrationReport, row: u64, reason: String) {
        tracing::error!("Stacking into '{}' halted at row {}: {}", report.target, row, reason);
        self.emit(PluginEvent::MigrationHalted {
            row,
            reason: reason.clone(),
        });
        report.halted = Some(Halt { row, reason });

        if self.policy == FailurePolicy::Rollback {
            let success = self.rollback(&report.target).await;
            report.rolled_back = Some(success);
        }
    }

    async fn rollback(&self, target: &str) -> bool {
        let resource = ResourceSelector::root("dataContext", target).to_string();
        let success = matches!(
            self.bridge.send_request(&Request::delete(resource)).await,
            Ok(outcome) if outcome.is_success()
        );
        if success {
            tracing::info!("Removed partial data set '{}'", target);
        } else {
            tracing::warn!("Could not remove partial data set '{}'", target);
        }
        self.emit(PluginEvent::MigrationRolledBack {
            target: target.to_string(),
            success,
        });
        success
    }

    fn finish(&self, report: MigrationReport) -> MigrationReport {
        self.emit(PluginEvent::MigrationFinished {
            target: report.target.clone(),
            rows_migrated: report.rows_migrated,
            complete: report.is_complete(),
        });
        report
    }
}

/// Values of a successful reply, or an error describing why there are none
pub(crate) fn expect_values(resource: &str, outcome: CallOutcome) -> Result<Value> {
    match outcome {
        CallOutcome::Replied(resp) if resp.success => Ok(resp.values.unwrap_or(Value::Null)),
        CallOutcome::Replied(resp) => {
            Err(StackerError::host_failure(resource, resp.error_message()))
        }
        CallOutcome::TimedOut => Err(StackerError::Timeout(resource.to_string())),
    }
}

fn failure_reason(resource: &str, resp: &Response) -> String {
    StackerError::host_failure(resource, resp.error_message()).to_string()
}

/// `values.case.values` of a `caseByIndex` reply
fn case_values(resp: &Response) -> Option<Map<String, Value>> {
    resp.values
        .as_ref()?
        .get("case")?
        .get("values")?
        .as_object()
        .cloned()
}

/// `values[0].id` of a case creation reply
fn created_id(resp: &Response) -> Option<i64> {
    resp.values.as_ref()?.get(0)?.get("id")?.as_i64()
}

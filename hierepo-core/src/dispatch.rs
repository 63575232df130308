//! Operation dispatch
//!
//! Turns change logs into batches and workspace operations into direct
//! service calls, then hands the resulting events to the listener registry.

use crate::cache::WorkspaceItemStateCache;
use crate::changelog::ChangeLog;
use crate::error::{RepositoryError, Result};
use crate::event::{Event, EventBundle};
use crate::id::{ItemId, NodeId};
use crate::listeners::ListenerRegistry;
use crate::name::{names, well_known};
use crate::operation::Operation;
use crate::service::{Batch, RepositoryService, SessionInfo};
use crate::state::ItemState;
use crate::value::{QValue, ValuePayload};
use tracing::{debug, info, warn};

/// Executes operations for one session
pub(crate) struct OperationDispatcher<'a, S: RepositoryService> {
    pub(crate) service: &'a S,
    pub(crate) session: &'a SessionInfo,
    pub(crate) cache: &'a WorkspaceItemStateCache<S>,
    pub(crate) listeners: &'a ListenerRegistry,
    pub(crate) log_operations: bool,
}

impl<'a, S: RepositoryService> OperationDispatcher<'a, S> {
    fn log_execution(&self, operation: &Operation) {
        if self.log_operations {
            info!("executing: {}", operation);
        } else {
            debug!("executing: {}", operation);
        }
    }

    /// Apply a change log as one batch.
    ///
    /// The batch is submitted exactly once, even when translating one of the
    /// operations fails; the translation error is returned after the
    /// submitted batch's events have been delivered.
    pub(crate) async fn execute_change_log(&self, change_log: &ChangeLog) -> Result<()> {
        let mut batch = self
            .service
            .create_batch(self.session, change_log.target())
            .await?;

        let translated = self.translate_all(&mut batch, change_log);
        let submitted = self.service.submit(batch).await;

        match (translated, submitted) {
            (translated, Ok(events)) => {
                debug!(
                    operations = change_log.len(),
                    events = events.len(),
                    "batch submitted"
                );
                self.listeners.deliver(&events, true, Some(change_log));
                translated
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Err(submit_error)) => {
                warn!(
                    "submitting partial batch failed after translation error: {}",
                    submit_error
                );
                Err(e)
            }
        }
    }

    fn translate_all(&self, batch: &mut S::Batch, change_log: &ChangeLog) -> Result<()> {
        for operation in change_log.operations() {
            self.log_execution(operation);
            translate(batch, operation)?;
        }
        Ok(())
    }

    /// Execute a single workspace operation outside of any batch.
    pub(crate) async fn execute_standalone(&self, operation: &Operation) -> Result<()> {
        self.log_execution(operation);
        let service = self.service;
        let session = self.session;

        let events = match operation {
            Operation::Move { source, dest_parent, dest_name } => {
                service.move_node(session, source, dest_parent, dest_name).await?
            }
            Operation::Clone { workspace, source, dest_parent, dest_name, remove_existing } => {
                service
                    .clone_node(session, workspace, source, dest_parent, dest_name, *remove_existing)
                    .await?
            }
            Operation::Copy { workspace, source, dest_parent, dest_name } => {
                service.copy(session, workspace, source, dest_parent, dest_name).await?
            }
            Operation::Update { node, source_workspace } => {
                service.update(session, node, source_workspace).await?
            }
            Operation::Checkout { node } => service.checkout(session, node).await?,
            Operation::Checkin { node } => service.checkin(session, node).await?,
            Operation::Restore { node, rel_path, versions, remove_existing } => {
                if versions.is_empty() {
                    return Err(RepositoryError::IllegalArgument(
                        "Restore must specify at least a single version".to_string(),
                    ));
                }
                match node {
                    None => {
                        if rel_path.is_some() {
                            return Err(RepositoryError::IllegalArgument(
                                "Restore with a relative path requires a target node".to_string(),
                            ));
                        }
                        service.restore_versions(session, versions, *remove_existing).await?
                    }
                    Some(node) => {
                        if versions.len() > 1 {
                            return Err(RepositoryError::IllegalArgument(
                                "Restore onto a single node must specify exactly one version"
                                    .to_string(),
                            ));
                        }
                        let target = match rel_path {
                            Some(rel_path) => service.id_factory().create_node_id(node, rel_path)?,
                            None => node.clone(),
                        };
                        service
                            .restore(session, &target, &versions[0], *remove_existing)
                            .await?
                    }
                }
            }
            Operation::Merge { node, source_workspace, best_effort, listener } => {
                let events = service
                    .merge(session, node, source_workspace, *best_effort)
                    .await?;
                listener.0.on_event(&EventBundle::new(&events, true, None));
                events
            }
            Operation::ResolveMergeConflict { node, version, resolve_done } => {
                self.resolve_merge_conflict(node, version, *resolve_done).await?
            }
            Operation::Lock { node, deep } => service.lock(session, node, *deep).await?,
            Operation::LockRefresh { node } => service.refresh_lock(session, node).await?,
            Operation::LockRelease { node } => service.unlock(session, node).await?,
            Operation::AddLabel { version_history, version, label, move_label } => {
                service
                    .add_version_label(session, version_history, version, label, *move_label)
                    .await?
            }
            Operation::RemoveLabel { version_history, version, label } => {
                service
                    .remove_version_label(session, version_history, version, label)
                    .await?
            }
            Operation::AddNode { .. }
            | Operation::AddProperty { .. }
            | Operation::SetPropertyValue { .. }
            | Operation::Remove { .. }
            | Operation::SetMixin { .. }
            | Operation::ReorderNodes { .. } => {
                return Err(RepositoryError::IllegalArgument(format!(
                    "{} can only be executed as part of a change log",
                    operation.kind()
                )));
            }
        };

        // a workspace operation has no change log, but its events are still
        // local
        self.listeners.deliver(&events, true, None);
        Ok(())
    }

    /// Recompute `jcr:mergeFailed` and `jcr:predecessors` from the current
    /// cache content and send the resolution to the backend.
    async fn resolve_merge_conflict(
        &self,
        node: &NodeId,
        version: &NodeId,
        resolve_done: bool,
    ) -> Result<Vec<Event>> {
        let merge_failed: Vec<NodeId> = self
            .reference_values(node, names::JCR_MERGE_FAILED)
            .await?
            .into_iter()
            .filter(|id| id != version)
            .collect();

        let mut predecessors = self.reference_values(node, names::JCR_PREDECESSORS).await?;
        if resolve_done {
            predecessors.push(version.clone());
        }

        self.service
            .resolve_merge_conflict(self.session, node, &merge_failed, &predecessors)
            .await
    }

    /// Values of a reference property of `node`, as node ids
    async fn reference_values(&self, node: &NodeId, property: &'static str) -> Result<Vec<NodeId>> {
        let id_factory = self.service.id_factory();
        let property_id = id_factory.create_property_id(node, well_known(property));
        let state = match self.cache.item_state(&ItemId::Property(property_id)).await {
            Ok(state) => state,
            Err(e @ RepositoryError::ItemNotFound(_)) => {
                return Err(RepositoryError::internal(
                    format!("node {} has no {} property", node, property),
                    &e,
                ));
            }
            Err(e) => return Err(e),
        };

        Ok(values_of(&state, property)?
            .iter()
            .map(|v| id_factory.create_node_id_from_unique_id(&v.to_wire_string()))
            .collect())
    }
}

fn values_of<'s>(state: &'s ItemState, property: &str) -> Result<&'s [QValue]> {
    state
        .as_property()
        .map(|p| p.values.as_slice())
        .ok_or_else(|| RepositoryError::Internal(format!("{} is not a property state", property)))
}

/// Record one operation in `batch`
fn translate<B: Batch>(batch: &mut B, operation: &Operation) -> Result<()> {
    match operation {
        Operation::AddNode { parent, name, node_type, uuid } => {
            batch.add_node(parent, name, node_type, uuid.as_deref())
        }
        Operation::AddProperty { parent, name, property_type, values, multi_valued } => {
            let payload = ValuePayload::from_values(values, *property_type, *multi_valued)?;
            batch.add_property(parent, name, payload, *property_type)
        }
        Operation::SetPropertyValue { property, property_type, values, multi_valued } => {
            let payload = ValuePayload::from_values(values, *property_type, *multi_valued)?;
            batch.set_value(property, payload, *property_type)
        }
        Operation::Remove { item } => batch.remove(item),
        Operation::SetMixin { node, mixins } => batch.set_mixins(node, mixins),
        Operation::ReorderNodes { parent, insert, before } => {
            batch.reorder_nodes(parent, insert, before.as_ref())
        }
        Operation::Move { source, dest_parent, dest_name } => {
            batch.move_node(source, dest_parent, dest_name)
        }
        other => Err(RepositoryError::IllegalArgument(format!(
            "{} is a workspace operation and cannot be part of a change log",
            other.kind()
        ))),
    }
}

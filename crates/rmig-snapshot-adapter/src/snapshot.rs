use crate::SnapshotError;
use rmig_core::{
    ActivityInstance, CompletedActivity, ConnectorError, InstanceCursor, SourceConnector,
    SourceProcessInstance, SourceVariable,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    #[serde(default)]
    pub instances: Vec<SnapshotInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInstance {
    #[serde(flatten)]
    pub instance: SourceProcessInstance,
    pub activity_tree: ActivityInstance,
    #[serde(default)]
    pub variables: Vec<SourceVariable>,
    /// Completed activities before each parallel gateway, keyed by gateway activity id.
    #[serde(default)]
    pub completed_activities: BTreeMap<String, Vec<CompletedActivity>>,
}

/// Source engine state frozen in a JSON export.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSource {
    instances: Vec<SnapshotInstance>,
}

impl SnapshotSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let source = Self::from_json(&raw).map_err(|source| SnapshotError::Json {
            path: path.display().to_string(),
            source,
        })?;
        info!(
            path = %path.display(),
            instances = source.instances.len(),
            "loaded source snapshot"
        );
        Ok(source)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let snapshot: SourceSnapshot = serde_json::from_str(raw)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn from_snapshot(snapshot: SourceSnapshot) -> Self {
        let mut instances = snapshot.instances;
        instances.sort_by(|left, right| {
            (left.instance.start_time, &left.instance.id)
                .cmp(&(right.instance.start_time, &right.instance.id))
        });
        Self { instances }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn instance(&self, instance_id: &str) -> Option<&SnapshotInstance> {
        self.instances
            .iter()
            .find(|candidate| candidate.instance.id == instance_id)
    }
}

impl SourceConnector for SnapshotSource {
    fn list_active_root_instances_after(
        &self,
        after: Option<&InstanceCursor>,
        page_size: usize,
    ) -> Result<Vec<SourceProcessInstance>, ConnectorError> {
        Ok(self
            .instances
            .iter()
            .map(|snapshot| &snapshot.instance)
            .filter(|instance| after.map_or(true, |cursor| cursor.precedes(instance)))
            .take(page_size)
            .cloned()
            .collect())
    }

    fn count_active_root_instances(&self) -> Result<u64, ConnectorError> {
        Ok(self.instances.len() as u64)
    }

    fn find_process_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<SourceProcessInstance>, ConnectorError> {
        Ok(self
            .instance(instance_id)
            .map(|snapshot| snapshot.instance.clone()))
    }

    fn activity_tree(&self, instance_id: &str) -> Result<ActivityInstance, ConnectorError> {
        self.instance(instance_id)
            .map(|snapshot| snapshot.activity_tree.clone())
            .ok_or_else(|| {
                ConnectorError::on_source(
                    "activity_tree",
                    format!("unknown process instance {instance_id}"),
                )
            })
    }

    fn variables(&self, scope_id: &str) -> Result<Vec<SourceVariable>, ConnectorError> {
        Ok(self
            .instances
            .iter()
            .flat_map(|snapshot| snapshot.variables.iter())
            .filter(|variable| variable.scope_id == scope_id)
            .cloned()
            .collect())
    }

    fn completed_activities_before(
        &self,
        process_instance_id: &str,
        gateway_activity_id: &str,
    ) -> Result<Vec<CompletedActivity>, ConnectorError> {
        let snapshot = self.instance(process_instance_id).ok_or_else(|| {
            ConnectorError::on_source(
                "completed_activities_before",
                format!("unknown process instance {process_instance_id}"),
            )
        })?;
        Ok(snapshot
            .completed_activities
            .get(gateway_activity_id)
            .cloned()
            .unwrap_or_default())
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Variable carrying the source identifier on every migrated instance and sub-process scope.
pub const LEGACY_ID_VARIABLE: &str = "legacyId";
pub const DEFAULT_JOB_TYPE: &str = "migrator";

pub const SUB_PROCESS_ACTIVITY_TYPE: &str = "subProcess";
pub const PARALLEL_GATEWAY_ACTIVITY_TYPE: &str = "parallelGateway";
pub const MULTI_INSTANCE_BODY_ACTIVITY_TYPE: &str = "multiInstanceBody";
pub const PROCESS_DEFINITION_ACTIVITY_TYPE: &str = "processDefinition";

pub type VariableMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    RuntimeProcessInstance,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuntimeProcessInstance => "RUNTIME_PROCESS_INSTANCE",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::RuntimeProcessInstance => "Process Instance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNTIME_PROCESS_INSTANCE" => Some(Self::RuntimeProcessInstance),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the identifier mapping table.
///
/// A record is either migrated (carries `target_key`) or skipped (carries `skip_reason`),
/// never both. Build records through [`MappingRecord::migrated`] and
/// [`MappingRecord::skipped`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub legacy_id: String,
    pub entity_type: EntityType,
    pub target_key: Option<i64>,
    pub start_date: Option<DateTime<Utc>>,
    pub skip_reason: Option<String>,
}

impl MappingRecord {
    pub fn migrated(
        legacy_id: impl Into<String>,
        entity_type: EntityType,
        target_key: i64,
        start_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            legacy_id: legacy_id.into(),
            entity_type,
            target_key: Some(target_key),
            start_date,
            skip_reason: None,
        }
    }

    pub fn skipped(
        legacy_id: impl Into<String>,
        entity_type: EntityType,
        start_date: Option<DateTime<Utc>>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            legacy_id: legacy_id.into(),
            entity_type,
            target_key: None,
            start_date,
            skip_reason: Some(reason.into()),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.target_key.is_none()
    }
}

/// Resume point for forward pagination over source root instances.
///
/// Root instances are ordered by `(start_time, id)`; a missing start time sorts first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCursor {
    pub start_time: Option<DateTime<Utc>>,
    pub legacy_id: String,
}

impl InstanceCursor {
    pub fn new(start_time: Option<DateTime<Utc>>, legacy_id: impl Into<String>) -> Self {
        Self {
            start_time,
            legacy_id: legacy_id.into(),
        }
    }

    /// True when `instance` sorts strictly after this cursor.
    pub fn precedes(&self, instance: &SourceProcessInstance) -> bool {
        (self.start_time, self.legacy_id.as_str()) < (instance.start_time, instance.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceProcessInstance {
    pub id: String,
    pub process_definition_key: String,
    #[serde(default)]
    pub process_definition_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

impl SourceProcessInstance {
    pub fn cursor(&self) -> InstanceCursor {
        InstanceCursor::new(self.start_time, self.id.clone())
    }
}

/// Node of the source engine's activity-instance tree. The root node is the process
/// instance itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInstance {
    pub id: String,
    pub activity_id: String,
    pub activity_type: String,
    #[serde(default)]
    pub sub_process_instance_id: Option<String>,
    #[serde(default)]
    pub children: Vec<ActivityInstance>,
    #[serde(default)]
    pub transitions: Vec<TransitionInstance>,
}

impl ActivityInstance {
    pub fn new(
        id: impl Into<String>,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            sub_process_instance_id: None,
            children: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: ActivityInstance) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_transition(mut self, transition: TransitionInstance) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_sub_process_instance(mut self, sub_process_instance_id: impl Into<String>) -> Self {
        self.sub_process_instance_id = Some(sub_process_instance_id.into());
        self
    }

    pub fn is_of_type(&self, activity_type: &str) -> bool {
        self.activity_type == activity_type
    }
}

/// Token waiting at an asynchronous continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionInstance {
    pub id: String,
    pub activity_id: String,
    pub activity_type: String,
    #[serde(default)]
    pub sub_process_instance_id: Option<String>,
}

impl TransitionInstance {
    pub fn new(
        id: impl Into<String>,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            sub_process_instance_id: None,
        }
    }
}

/// Historic activity that finished before a parallel gateway was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedActivity {
    pub id: String,
    pub activity_id: String,
    pub activity_type: String,
    #[serde(default)]
    pub called_process_instance_id: Option<String>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeOrigin {
    Activity,
    Gateway,
    Transition,
    ReplayedBranch,
}

/// Element the target engine must activate to reproduce a source token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNode {
    pub activity_id: String,
    pub sub_process_instance_id: Option<String>,
    pub activity_type: Option<String>,
    pub origin: FlowNodeOrigin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Null,
    String,
    Boolean,
    Integer,
    Long,
    Double,
    Date,
    Json,
    Xml,
    Object,
    File,
}

impl VariableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Long => "long",
            Self::Double => "double",
            Self::Date => "date",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Object => "object",
            Self::File => "file",
        }
    }
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariableKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "null" => Ok(Self::Null),
            "string" => Ok(Self::String),
            "boolean" => Ok(Self::Boolean),
            "integer" | "short" => Ok(Self::Integer),
            "long" => Ok(Self::Long),
            "double" => Ok(Self::Double),
            "date" => Ok(Self::Date),
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            "object" => Ok(Self::Object),
            "file" => Ok(Self::File),
            other => Err(format!("Unknown variable kind: {other}")),
        }
    }
}

/// Variable as read from the source engine, owned by one activity-instance scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVariable {
    pub name: String,
    pub kind: VariableKind,
    #[serde(default)]
    pub value: Value,
    pub scope_id: String,
    pub process_instance_id: String,
}

impl SourceVariable {
    pub fn new(
        name: impl Into<String>,
        kind: VariableKind,
        value: Value,
        scope_id: impl Into<String>,
        process_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            scope_id: scope_id.into(),
            process_instance_id: process_instance_id.into(),
        }
    }
}

/// How an active parallel-gateway join is carried over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum GatewayStrategy {
    Ignore,
    ActivateLastActivities,
    Migrate,
    #[default]
    Skip,
}

impl GatewayStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::ActivateLastActivities => "activate-last-activities",
            Self::Migrate => "migrate",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for GatewayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayStrategy {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "ignore" => Ok(Self::Ignore),
            "activate-last-activities" => Ok(Self::ActivateLastActivities),
            "migrate" => Ok(Self::Migrate),
            "skip" => Ok(Self::Skip),
            other => Err(format!("Unknown gateway strategy: {other}")),
        }
    }
}

impl TryFrom<String> for GatewayStrategy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigratorMode {
    #[default]
    Migrate,
    RetrySkipped,
    ListSkipped,
}

impl MigratorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Migrate => "MIGRATE",
            Self::RetrySkipped => "RETRY_SKIPPED",
            Self::ListSkipped => "LIST_SKIPPED",
        }
    }
}

impl fmt::Display for MigratorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartEvent {
    pub id: String,
    #[serde(default)]
    pub listener_job_types: Vec<String>,
}

/// Deployed process definition on the target engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDefinition {
    pub key: i64,
    pub business_id: String,
    pub version: i32,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub flow_node_ids: Vec<String>,
    /// None start event, if the model has one.
    #[serde(default)]
    pub start_event: Option<StartEvent>,
}

impl TargetDefinition {
    pub fn has_flow_node(&self, element_id: &str) -> bool {
        self.flow_node_ids.iter().any(|id| id == element_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstance {
    pub definition_key: i64,
    pub business_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub variables: VariableMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHandle {
    pub instance_key: i64,
    pub definition_key: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementActivation {
    pub element_id: String,
    #[serde(default)]
    pub variables: VariableMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivatedJob {
    pub key: i64,
    pub job_type: String,
    pub process_instance_key: i64,
    pub element_instance_key: i64,
    pub element_id: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl ActivatedJob {
    pub fn legacy_id(&self) -> Option<&str> {
        self.variables.get(LEGACY_ID_VARIABLE).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorSide {
    Source,
    Target,
}

impl ConnectorSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }
}

impl fmt::Display for ConnectorSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infrastructure failure talking to either engine. Always fatal for a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{side} connector failed during {operation}: {message}")]
pub struct ConnectorError {
    pub side: ConnectorSide,
    pub operation: String,
    pub message: String,
}

impl ConnectorError {
    pub fn on_source(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            side: ConnectorSide::Source,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn on_target(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            side: ConnectorSide::Target,
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Read-only queries against the source engine.
pub trait SourceConnector {
    /// Active root process instances ordered by `(start_time, id)`, strictly after `after`.
    fn list_active_root_instances_after(
        &self,
        after: Option<&InstanceCursor>,
        page_size: usize,
    ) -> Result<Vec<SourceProcessInstance>, ConnectorError>;

    fn count_active_root_instances(&self) -> Result<u64, ConnectorError>;

    fn find_process_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<SourceProcessInstance>, ConnectorError>;

    fn activity_tree(&self, instance_id: &str) -> Result<ActivityInstance, ConnectorError>;

    /// Variables owned by exactly this scope (a process instance or an activity instance).
    fn variables(&self, scope_id: &str) -> Result<Vec<SourceVariable>, ConnectorError>;

    fn completed_activities_before(
        &self,
        process_instance_id: &str,
        gateway_activity_id: &str,
    ) -> Result<Vec<CompletedActivity>, ConnectorError>;
}

/// Commands against the target engine.
pub trait TargetConnector {
    fn create_instance(&self, request: &CreateInstance) -> Result<InstanceHandle, ConnectorError>;

    fn modify_instance(
        &self,
        instance_key: i64,
        terminate_element_instance_key: i64,
        activations: &[ElementActivation],
    ) -> Result<(), ConnectorError>;

    fn search_definitions(&self, business_id: &str)
        -> Result<Vec<TargetDefinition>, ConnectorError>;

    fn activate_jobs(
        &self,
        job_type: &str,
        max_jobs: usize,
    ) -> Result<Vec<ActivatedJob>, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single()
    }

    fn instance(id: &str, start_time: Option<DateTime<Utc>>) -> SourceProcessInstance {
        SourceProcessInstance {
            id: id.to_string(),
            process_definition_key: "order".to_string(),
            process_definition_id: "order:1".to_string(),
            tenant_id: None,
            start_time,
        }
    }

    #[test]
    fn cursor_orders_by_start_time_then_id() {
        let cursor = InstanceCursor::new(at(10), "m");

        assert!(cursor.precedes(&instance("a", at(11))));
        assert!(cursor.precedes(&instance("n", at(10))));
        assert!(!cursor.precedes(&instance("m", at(10))));
        assert!(!cursor.precedes(&instance("z", at(9))));
        assert!(!cursor.precedes(&instance("z", None)));
    }

    #[test]
    fn gateway_strategy_parses_loose_spellings() {
        assert_eq!(
            "ACTIVATE_LAST_ACTIVITIES"
                .parse::<GatewayStrategy>()
                .expect("strategy"),
            GatewayStrategy::ActivateLastActivities
        );
        assert_eq!(
            " Skip ".parse::<GatewayStrategy>().expect("strategy"),
            GatewayStrategy::Skip
        );
        assert!("merge".parse::<GatewayStrategy>().is_err());

        let parsed: GatewayStrategy =
            serde_json::from_value(Value::String("MIGRATE".to_string())).expect("deserialize");
        assert_eq!(parsed, GatewayStrategy::Migrate);
        assert_eq!(
            serde_json::to_value(GatewayStrategy::ActivateLastActivities).expect("serialize"),
            Value::String("activate-last-activities".to_string())
        );
    }

    #[test]
    fn mapping_record_constructors_keep_outcomes_exclusive() {
        let migrated = MappingRecord::migrated("p1", EntityType::RuntimeProcessInstance, 7, None);
        assert!(!migrated.is_skipped());
        assert!(migrated.skip_reason.is_none());

        let skipped =
            MappingRecord::skipped("p2", EntityType::RuntimeProcessInstance, None, "no target");
        assert!(skipped.is_skipped());
        assert_eq!(skipped.skip_reason.as_deref(), Some("no target"));
    }

    #[test]
    fn activated_job_reads_legacy_id_variable() {
        let mut variables = Map::new();
        variables.insert(
            LEGACY_ID_VARIABLE.to_string(),
            Value::String("p1".to_string()),
        );
        let job = ActivatedJob {
            key: 1,
            job_type: DEFAULT_JOB_TYPE.to_string(),
            process_instance_key: 2,
            element_instance_key: 3,
            element_id: "start".to_string(),
            variables,
        };
        assert_eq!(job.legacy_id(), Some("p1"));

        let external = ActivatedJob {
            variables: Map::new(),
            ..job
        };
        assert_eq!(external.legacy_id(), None);
    }

    #[test]
    fn entity_type_round_trips_through_its_tag() {
        let tag = EntityType::RuntimeProcessInstance.as_str();
        assert_eq!(
            EntityType::parse(tag),
            Some(EntityType::RuntimeProcessInstance)
        );
        assert_eq!(EntityType::parse("HISTORY"), None);
        assert_eq!(
            EntityType::RuntimeProcessInstance.display_name(),
            "Process Instance"
        );
    }
}

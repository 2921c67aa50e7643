use crate::resolver::find_activities_of_type;
use rmig_core::{
    ActivityInstance, FlowNode, GatewayStrategy, SourceProcessInstance, TargetDefinition,
    MULTI_INSTANCE_BODY_ACTIVITY_TYPE, PARALLEL_GATEWAY_ACTIVITY_TYPE,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Reasons an instance cannot be carried over. The display text is stored as the skip reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(
        "Found multi-instance loop characteristics for flow node with id [{0}] in source process instance."
    )]
    MultiInstance(String),
    #[error(
        "Parallel gateway [{0}] is active in source process instance and the gateway strategy is SKIP."
    )]
    ActiveParallelGateway(String),
    #[error(
        "No target deployment found for process ID [{business_id}] required for instance with legacyID [{legacy_id}]."
    )]
    NoTargetDefinition {
        business_id: String,
        legacy_id: String,
    },
    #[error("Couldn't find process None Start Event in target process with key [{0}].")]
    NoNoneStartEvent(i64),
    #[error(
        "No execution listener of type '{job_type}' found on start event [{start_event}] in target process with id [{business_id}]. At least one '{job_type}' listener is required."
    )]
    MissingJobTypeListener {
        job_type: String,
        start_event: String,
        business_id: String,
    },
    #[error("Flow node with id [{0}] doesn't exist in the equivalent deployed target model.")]
    UnknownFlowNode(String),
    #[error(
        "No active flow nodes could be resolved for process instance [{legacy_id}] under gateway strategy {strategy}."
    )]
    NoActiveFlowNodes {
        legacy_id: String,
        strategy: GatewayStrategy,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeValidator {
    gateway_strategy: GatewayStrategy,
    job_type: String,
    job_type_validation: bool,
}

impl RuntimeValidator {
    pub fn new(
        gateway_strategy: GatewayStrategy,
        job_type: impl Into<String>,
        job_type_validation: bool,
    ) -> Self {
        Self {
            gateway_strategy,
            job_type: job_type.into(),
            job_type_validation,
        }
    }

    /// Checks that only depend on the source tree.
    pub fn validate_tree(&self, tree: &ActivityInstance) -> Result<(), ValidationError> {
        if let Some(body) = find_activities_of_type(tree, MULTI_INSTANCE_BODY_ACTIVITY_TYPE)
            .into_iter()
            .next()
        {
            let activity_id = body
                .activity_id
                .strip_suffix("#multiInstanceBody")
                .unwrap_or(&body.activity_id);
            return Err(ValidationError::MultiInstance(activity_id.to_string()));
        }

        if self.gateway_strategy == GatewayStrategy::Skip {
            if let Some(gateway) = find_activities_of_type(tree, PARALLEL_GATEWAY_ACTIVITY_TYPE)
                .into_iter()
                .next()
            {
                return Err(ValidationError::ActiveParallelGateway(
                    gateway.activity_id.clone(),
                ));
            }
        }

        Ok(())
    }

    /// An instance with nothing to activate would end on the target as soon as its start
    /// token is cancelled.
    pub fn validate_flow_nodes(
        &self,
        instance: &SourceProcessInstance,
        flow_nodes: &BTreeMap<String, FlowNode>,
    ) -> Result<(), ValidationError> {
        if flow_nodes.is_empty() {
            return Err(ValidationError::NoActiveFlowNodes {
                legacy_id: instance.id.clone(),
                strategy: self.gateway_strategy,
            });
        }
        Ok(())
    }

    /// Latest deployed version matching the instance's business id and tenant.
    pub fn select_definition(
        &self,
        instance: &SourceProcessInstance,
        definitions: Vec<TargetDefinition>,
    ) -> Result<TargetDefinition, ValidationError> {
        definitions
            .into_iter()
            .filter(|definition| {
                definition.business_id == instance.process_definition_key
                    && definition.tenant_id == instance.tenant_id
            })
            .max_by_key(|definition| definition.version)
            .ok_or_else(|| ValidationError::NoTargetDefinition {
                business_id: instance.process_definition_key.clone(),
                legacy_id: instance.id.clone(),
            })
    }

    /// Checks that the target model can receive the resolved activations.
    pub fn validate_definition(
        &self,
        definition: &TargetDefinition,
        flow_nodes: &BTreeMap<String, FlowNode>,
    ) -> Result<(), ValidationError> {
        let start_event = definition
            .start_event
            .as_ref()
            .ok_or(ValidationError::NoNoneStartEvent(definition.key))?;

        if self.job_type_validation {
            if !start_event
                .listener_job_types
                .iter()
                .any(|job_type| job_type == &self.job_type)
            {
                return Err(ValidationError::MissingJobTypeListener {
                    job_type: self.job_type.clone(),
                    start_event: start_event.id.clone(),
                    business_id: definition.business_id.clone(),
                });
            }
        } else {
            debug!("job type validation is disabled, skipping execution listener validation");
        }

        for node in flow_nodes.values() {
            if !definition.has_flow_node(&node.activity_id) {
                return Err(ValidationError::UnknownFlowNode(node.activity_id.clone()));
            }
        }

        Ok(())
    }
}

use rmig_core::{
    ActivityInstance, CompletedActivity, FlowNode, FlowNodeOrigin, GatewayStrategy,
    PARALLEL_GATEWAY_ACTIVITY_TYPE, SUB_PROCESS_ACTIVITY_TYPE,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Completed activities that fed each active parallel gateway, keyed by gateway instance id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BranchHistory {
    by_gateway: BTreeMap<String, Vec<CompletedActivity>>,
}

impl BranchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, gateway_instance_id: impl Into<String>, completed: Vec<CompletedActivity>) {
        self.by_gateway.insert(gateway_instance_id.into(), completed);
    }

    pub fn completed_before(&self, gateway_instance_id: &str) -> &[CompletedActivity] {
        self.by_gateway
            .get(gateway_instance_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gateway.is_empty()
    }
}

/// Flatten an activity-instance tree into the elements the target engine has to activate,
/// keyed by the source instance id each activation stands for.
pub fn resolve_active_flow_nodes(
    tree: &ActivityInstance,
    strategy: GatewayStrategy,
    history: &BranchHistory,
) -> BTreeMap<String, FlowNode> {
    let mut active = BTreeMap::new();
    collect(tree, strategy, history, &mut active);
    active
}

fn collect(
    node: &ActivityInstance,
    strategy: GatewayStrategy,
    history: &BranchHistory,
    active: &mut BTreeMap<String, FlowNode>,
) {
    for child in &node.children {
        collect(child, strategy, history, active);

        if child.is_of_type(SUB_PROCESS_ACTIVITY_TYPE) {
            continue;
        }
        if child.is_of_type(PARALLEL_GATEWAY_ACTIVITY_TYPE) {
            resolve_gateway(child, strategy, history, active);
            continue;
        }
        if child.children.is_empty() && child.transitions.is_empty() {
            active.insert(
                child.id.clone(),
                FlowNode {
                    activity_id: child.activity_id.clone(),
                    sub_process_instance_id: child.sub_process_instance_id.clone(),
                    activity_type: Some(child.activity_type.clone()),
                    origin: FlowNodeOrigin::Activity,
                },
            );
        }
    }

    for transition in &node.transitions {
        if transition.activity_type == SUB_PROCESS_ACTIVITY_TYPE {
            continue;
        }
        active.insert(
            transition.id.clone(),
            FlowNode {
                activity_id: transition.activity_id.clone(),
                sub_process_instance_id: transition.sub_process_instance_id.clone(),
                activity_type: None,
                origin: FlowNodeOrigin::Transition,
            },
        );
    }
}

fn resolve_gateway(
    gateway: &ActivityInstance,
    strategy: GatewayStrategy,
    history: &BranchHistory,
    active: &mut BTreeMap<String, FlowNode>,
) {
    match strategy {
        GatewayStrategy::Ignore => {}
        GatewayStrategy::ActivateLastActivities => {
            let branches = last_completed_per_activity(history.completed_before(&gateway.id));
            if branches.is_empty() {
                debug!(
                    gateway = %gateway.activity_id,
                    "no completed branch recorded for active gateway"
                );
            }
            for branch in branches {
                active.insert(
                    branch.id.clone(),
                    FlowNode {
                        activity_id: branch.activity_id.clone(),
                        sub_process_instance_id: branch.called_process_instance_id.clone(),
                        activity_type: Some(branch.activity_type.clone()),
                        origin: FlowNodeOrigin::ReplayedBranch,
                    },
                );
            }
        }
        GatewayStrategy::Migrate | GatewayStrategy::Skip => {
            active.insert(
                gateway.id.clone(),
                FlowNode {
                    activity_id: gateway.activity_id.clone(),
                    sub_process_instance_id: gateway.sub_process_instance_id.clone(),
                    activity_type: Some(gateway.activity_type.clone()),
                    origin: FlowNodeOrigin::Gateway,
                },
            );
        }
    }
}

/// The latest completion of each distinct activity. Latest end time wins; on a tie the later
/// entry wins.
fn last_completed_per_activity(completed: &[CompletedActivity]) -> Vec<&CompletedActivity> {
    let mut latest: BTreeMap<&str, &CompletedActivity> = BTreeMap::new();
    for candidate in completed {
        match latest.get(candidate.activity_id.as_str()) {
            Some(current) if current.end_time > candidate.end_time => {}
            _ => {
                latest.insert(candidate.activity_id.as_str(), candidate);
            }
        }
    }
    latest.into_values().collect()
}

/// All nodes of `activity_type` in the tree, the root included, in pre-order.
pub fn find_activities_of_type<'a>(
    tree: &'a ActivityInstance,
    activity_type: &str,
) -> Vec<&'a ActivityInstance> {
    let mut found = Vec::new();
    let mut stack = vec![tree];
    while let Some(node) = stack.pop() {
        if node.is_of_type(activity_type) {
            found.push(node);
        }
        stack.extend(node.children.iter().rev());
    }
    found
}

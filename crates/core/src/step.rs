//! Workflow lifecycle labels
//!
//! Plain tags consumed by a workflow interpreter outside this workspace.
//! No behaviour is attached here.

use serde::{Deserialize, Serialize};

/// Lifecycle step of a workflow element.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BpmnStep {
    ElementActivating,
    ElementActivated,
    EventOccurred,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,

    ActivityElementActivating,
    ActivityElementActivated,
    ActivityEventOccurred,
    ActivityElementCompleting,
    ActivityElementTerminating,
    ActivityElementTerminated,

    ContainerElementActivated,
    ContainerElementTerminating,

    EventBasedGatewayElementActivating,
    EventBasedGatewayElementActivated,
    EventBasedGatewayEventOccurred,
    EventBasedGatewayElementCompleting,
    EventBasedGatewayElementCompleted,
    EventBasedGatewayElementTerminating,

    ExclusiveGatewayElementActivating,
    ExclusiveGatewayElementCompleted,

    FlowoutElementCompleted,

    IntermediateCatchEventElementActivating,
    IntermediateCatchEventElementActivated,
    IntermediateCatchEventEventOccurred,
    IntermediateCatchEventElementCompleting,
    IntermediateCatchEventElementTerminating,

    ParallelMergeSequenceFlowTaken,

    ReceiveTaskEventOccurred,

    SequenceFlowTaken,

    ServiceTaskElementActivated,
    ServiceTaskElementTerminating,

    StartEventEventOccurred,
}

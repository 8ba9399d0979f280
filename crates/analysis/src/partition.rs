use shopfloor_core::{
    AnalysisError, ErrorClass, IntegrityPattern, IsolationLevel, Partition, ResourceId,
    SchedulerConfig,
};

/// What differs between the global queue and a per-resource queue.
pub trait PartitionOps: Send + Sync + 'static {
    fn partition(&self) -> Partition;

    /// Isolation level of item attempts.
    fn isolation(&self) -> IsolationLevel;

    /// Resources announced to the store when an attempt opens its transaction.
    fn lock_hints(&self) -> Vec<ResourceId> {
        self.partition().resource().into_iter().collect()
    }

    /// Per-call bound on index materialization. `None` is unbounded.
    fn materialize_limit(&self) -> Option<usize>;

    /// Key used in log fields and thread names.
    fn label(&self) -> String {
        self.partition().to_string()
    }

    fn classify(&self, error: &AnalysisError, transient_integrity: &[IntegrityPattern]) -> ErrorClass {
        error.class(transient_integrity)
    }
}

/// The single global queue.
#[derive(Debug, Clone)]
pub struct GlobalPartition {
    isolation: IsolationLevel,
}

impl GlobalPartition {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            isolation: config.global_isolation,
        }
    }
}

impl PartitionOps for GlobalPartition {
    fn partition(&self) -> Partition {
        Partition::Global
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn materialize_limit(&self) -> Option<usize> {
        None
    }
}

/// The queue of one resource.
#[derive(Debug, Clone)]
pub struct ResourcePartition {
    resource: ResourceId,
    isolation: IsolationLevel,
    materialize_limit: usize,
}

impl ResourcePartition {
    pub fn new(resource: ResourceId, config: &SchedulerConfig) -> Self {
        Self {
            resource,
            isolation: config.resource_isolation,
            materialize_limit: config.materialize_limit(),
        }
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }
}

impl PartitionOps for ResourcePartition {
    fn partition(&self) -> Partition {
        Partition::Resource(self.resource)
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn materialize_limit(&self) -> Option<usize> {
        Some(self.materialize_limit)
    }
}

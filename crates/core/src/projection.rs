use crate::receivers::{MappingReceiver, SetChangeReceiver};
use crate::{
    DistributionBits, NamespacedDistributionTuple, NonNamespacedDistributionTuple, ProjectionModeKey,
    ProjectionModeVal, SinglePlacement, UpsyncSet,
};

/// The write surface handed out for the duration of one transaction.
pub trait WorkloadProjectionSections {
    fn namespaced_distributions(&mut self) -> &mut dyn MappingReceiver<NamespacedDistributionTuple, DistributionBits>;
    fn namespaced_modes(&mut self) -> &mut dyn MappingReceiver<ProjectionModeKey, ProjectionModeVal>;
    fn non_namespaced_distributions(
        &mut self,
    ) -> &mut dyn MappingReceiver<NonNamespacedDistributionTuple, DistributionBits>;
    fn non_namespaced_modes(&mut self) -> &mut dyn MappingReceiver<ProjectionModeKey, ProjectionModeVal>;
    fn upsyncs(&mut self) -> &mut dyn SetChangeReceiver<(SinglePlacement, UpsyncSet)>;
}

/// Sink of the distribution plan. `transact` is the only way to change it;
/// everything written through `f` becomes visible to readers at once.
pub trait WorkloadProjector: Send + Sync {
    fn transact(&self, f: &mut dyn FnMut(&mut dyn WorkloadProjectionSections));
}

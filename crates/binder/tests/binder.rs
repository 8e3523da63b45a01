#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use placement_binder::{InMemoryApiMapProvider, SetBinder};
use placement_core::config::EngineConfig;
use placement_core::modes::ResourceModes;
use placement_core::prelude::*;
use placement_core::receivers::{Adder, MappingReceiver, Remover};
use rustc_hash::FxHashMap;

#[derive(Default)]
struct UpsyncLog(Vec<(SinglePlacement, UpsyncSet)>);

impl Adder<(SinglePlacement, UpsyncSet)> for UpsyncLog {
    fn add(&mut self, item: (SinglePlacement, UpsyncSet)) -> bool {
        self.0.push(item);
        true
    }
}

impl Remover<(SinglePlacement, UpsyncSet)> for UpsyncLog {
    fn remove(&mut self, item: (SinglePlacement, UpsyncSet)) -> bool {
        match self.0.iter().position(|x| *x == item) {
            Some(i) => {
                self.0.remove(i);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Plan {
    namespaced: FxHashMap<NamespacedDistributionTuple, DistributionBits>,
    cluster_scoped: FxHashMap<NonNamespacedDistributionTuple, DistributionBits>,
    namespaced_modes: FxHashMap<ProjectionModeKey, ProjectionModeVal>,
    cluster_modes: FxHashMap<ProjectionModeKey, ProjectionModeVal>,
    upsyncs: UpsyncLog,
    transactions: usize,
}

impl WorkloadProjectionSections for Plan {
    fn namespaced_distributions(&mut self) -> &mut dyn MappingReceiver<NamespacedDistributionTuple, DistributionBits> {
        &mut self.namespaced
    }
    fn namespaced_modes(&mut self) -> &mut dyn MappingReceiver<ProjectionModeKey, ProjectionModeVal> {
        &mut self.namespaced_modes
    }
    fn non_namespaced_distributions(
        &mut self,
    ) -> &mut dyn MappingReceiver<NonNamespacedDistributionTuple, DistributionBits> {
        &mut self.cluster_scoped
    }
    fn non_namespaced_modes(&mut self) -> &mut dyn MappingReceiver<ProjectionModeKey, ProjectionModeVal> {
        &mut self.cluster_modes
    }
    fn upsyncs(&mut self) -> &mut dyn SetChangeReceiver<(SinglePlacement, UpsyncSet)> { &mut self.upsyncs }
}

#[derive(Default)]
struct Recorder(Mutex<Plan>);

impl WorkloadProjector for Recorder {
    fn transact(&self, f: &mut dyn FnMut(&mut dyn WorkloadProjectionSections)) {
        let mut plan = self.0.lock();
        plan.transactions += 1;
        f(&mut *plan);
    }
}

fn dest(n: &str) -> SinglePlacement {
    SinglePlacement {
        cluster: format!("inv-{n}"),
        location_name: format!("loc-{n}"),
        sync_target_name: format!("st-{n}"),
        sync_target_uid: format!("uid-{n}"),
    }
}

fn configmaps() -> GroupResource { GroupResource::new("", "configmaps") }

fn part(gr: GroupResource, ns: &str, name: &str) -> WorkloadPartID { WorkloadPartID::new(gr, ns, name) }

fn what(parts: Vec<(WorkloadPartID, WorkloadPartDetails)>, upsync: Vec<UpsyncSet>) -> ResolvedWhat {
    ResolvedWhat::new(parts.into_iter().collect(), upsync)
}

fn wher(dests: Vec<SinglePlacement>) -> ResolvedWhere {
    ResolvedWhere(vec![Arc::new(SinglePlacementSlice { destinations: dests })])
}

fn served(namespaced: bool, versions: &[&str]) -> ResourceDetails {
    ResourceDetails {
        namespaced,
        supports_informers: true,
        preferred_version: versions.first().map(|v| v.to_string()).unwrap_or_default(),
        versions: versions.iter().map(|v| v.to_string()).collect::<Vec<_>>().into(),
    }
}

struct Rig {
    provider: Arc<InMemoryApiMapProvider>,
    plan: Arc<Recorder>,
    binder: Arc<SetBinder>,
}

impl Rig {
    fn new() -> Self { Self::with_config(EngineConfig::default()) }

    fn with_config(cfg: EngineConfig) -> Self {
        let provider = Arc::new(InMemoryApiMapProvider::default());
        let plan = Arc::new(Recorder::default());
        let binder = SetBinder::new(provider.clone(), plan.clone(), ResourceModes::builtin(), &cfg);
        Self { provider, plan, binder }
    }

    fn settle(&self) {
        self.provider.deliver_pending();
        self.binder.process_discovery();
    }

    fn cm_key(&self, d: &SinglePlacement) -> ProjectionModeKey {
        ProjectionModeKey { group_resource: configmaps(), destination: d.clone() }
    }
}

fn cm_tuple(src: &str, d: &SinglePlacement, ns: &str, name: &str) -> NamespacedDistributionTuple {
    Distribution {
        key: ProjectionModeKey { group_resource: configmaps(), destination: d.clone() },
        object: NamespacedExternalName { cluster: src.into(), namespace: ns.into(), name: name.into() },
    }
}

#[test]
fn what_then_where_emits_distribution_and_mode() {
    let rig = Rig::new();
    rig.provider.set_resource("wmw1", configmaps(), served(true, &["v1"]));
    let p1 = ExternalName::new("wmw1", "p1");
    let a = dest("a");

    rig.binder.put_what(
        p1.clone(),
        what(vec![(part(configmaps(), "default", "cm1"), WorkloadPartDetails::default())], vec![]),
    );
    rig.settle();
    assert!(rig.plan.0.lock().namespaced.is_empty(), "no destinations yet");

    let before = rig.plan.0.lock().transactions;
    rig.binder.put_where(p1.clone(), wher(vec![a.clone()]));
    {
        let plan = rig.plan.0.lock();
        assert_eq!(plan.transactions, before + 1, "one notification, one transaction");
        assert_eq!(plan.namespaced.get(&cm_tuple("wmw1", &a, "default", "cm1")), Some(&DistributionBits::default()));
        assert_eq!(plan.namespaced_modes.get(&rig.cm_key(&a)).map(|m| m.api_version.as_str()), Some("v1"));
    }

    rig.binder.put_where(p1, ResolvedWhere::default());
    let plan = rig.plan.0.lock();
    assert!(plan.namespaced.is_empty());
    assert!(plan.namespaced_modes.is_empty(), "mode goes with its last distribution");
}

#[test]
fn undiscovered_resources_are_deferred_until_discovery() {
    let rig = Rig::new();
    let p1 = ExternalName::new("wmw1", "p1");
    let a = dest("a");
    rig.binder.put_what(p1.clone(), what(vec![(part(configmaps(), "ns", "cm"), WorkloadPartDetails::default())], vec![]));
    rig.binder.put_where(p1, wher(vec![a.clone()]));
    rig.settle();
    assert!(rig.plan.0.lock().namespaced.is_empty());
    assert_eq!(rig.binder.stats().bindings, 1);
    assert_eq!(rig.binder.stats().distributions, 0);

    rig.provider.set_resource("wmw1", configmaps(), served(true, &["v1"]));
    assert_eq!(rig.binder.process_discovery(), 1);
    assert!(rig.plan.0.lock().namespaced.contains_key(&cm_tuple("wmw1", &a, "ns", "cm")));

    rig.provider.remove_resource("wmw1", &configmaps());
    rig.binder.process_discovery();
    assert!(
        rig.plan.0.lock().namespaced.contains_key(&cm_tuple("wmw1", &a, "ns", "cm")),
        "leaving discovery keeps what was emitted"
    );
}

#[test]
fn deep_equal_resubmission_is_silent() {
    let rig = Rig::new();
    rig.provider.set_resource("wmw1", configmaps(), served(true, &["v1"]));
    let p1 = ExternalName::new("wmw1", "p1");
    let w = what(vec![(part(configmaps(), "ns", "cm"), WorkloadPartDetails::default())], vec![]);
    rig.binder.put_what(p1.clone(), w.clone());
    rig.binder.put_where(p1.clone(), wher(vec![dest("a")]));
    rig.settle();
    let n = rig.plan.0.lock().transactions;
    rig.binder.put_what(p1.clone(), what(vec![(part(configmaps(), "ns", "cm"), WorkloadPartDetails::default())], vec![]));
    rig.binder.put_where(p1, wher(vec![dest("a")]));
    assert_eq!(rig.plan.0.lock().transactions, n);
}

#[test]
fn overlapping_placements_aggregate_bits_and_pick_one_version() {
    let rig = Rig::new();
    rig.provider.set_resource("wmw1", configmaps(), served(true, &["v1", "v1beta1"]));
    let a = dest("a");
    let cm = part(configmaps(), "ns", "cm");
    let p1 = ExternalName::new("wmw1", "p1");
    let p2 = ExternalName::new("wmw1", "p2");
    let d1 = WorkloadPartDetails { api_version: "v1beta1".into(), create_only: true, ..Default::default() };
    let d2 = WorkloadPartDetails {
        api_version: "v1".into(),
        create_only: false,
        return_singleton_state: true,
        ..Default::default()
    };
    rig.binder.put_where(p1.clone(), wher(vec![a.clone()]));
    rig.binder.put_where(p2.clone(), wher(vec![a.clone()]));
    rig.binder.put_what(p1.clone(), what(vec![(cm.clone(), d1)], vec![]));
    rig.settle();
    {
        let plan = rig.plan.0.lock();
        let bits = plan.namespaced.get(&cm_tuple("wmw1", &a, "ns", "cm")).copied();
        assert_eq!(bits, Some(DistributionBits { create_only: true, return_singleton_state: false }));
        assert_eq!(plan.namespaced_modes[&rig.cm_key(&a)].api_version, "v1beta1");
    }

    rig.binder.put_what(p2.clone(), what(vec![(cm.clone(), d2)], vec![]));
    {
        let plan = rig.plan.0.lock();
        assert_eq!(plan.namespaced.len(), 1, "one tuple however many placements select it");
        let bits = plan.namespaced[&cm_tuple("wmw1", &a, "ns", "cm")];
        assert_eq!(bits, DistributionBits { create_only: false, return_singleton_state: true });
        assert_eq!(plan.namespaced_modes.len(), 1, "one version per group-resource and destination");
        assert_eq!(plan.namespaced_modes[&rig.cm_key(&a)].api_version, "v1", "GA wins over beta");
    }

    rig.binder.delete_what(p2.clone());
    rig.binder.delete_where(p2);
    let plan = rig.plan.0.lock();
    assert_eq!(
        plan.namespaced.get(&cm_tuple("wmw1", &a, "ns", "cm")),
        Some(&DistributionBits { create_only: true, return_singleton_state: false })
    );
    assert_eq!(plan.namespaced_modes[&rig.cm_key(&a)].api_version, "v1beta1");
}

#[test]
fn upsyncs_are_counted_across_placements() {
    let rig = Rig::new();
    let a = dest("a");
    let u = |names: &[&str]| UpsyncSet {
        api_group: "group1.test".into(),
        resources: vec!["sprockets".into()],
        namespaces: vec!["*".into()],
        names: names.iter().map(|s| s.to_string()).collect(),
    };
    let p1 = ExternalName::new("wmw1", "p1");
    let p2 = ExternalName::new("wmw1", "p2");
    rig.binder.put_where(p1.clone(), wher(vec![a.clone()]));
    rig.binder.put_where(p2.clone(), wher(vec![a.clone()]));
    rig.binder.put_what(p1.clone(), what(vec![], vec![u(&["x", "y"])]));
    rig.binder.put_what(p2.clone(), what(vec![], vec![u(&["y", "x"])]));
    assert_eq!(rig.plan.0.lock().upsyncs.0.len(), 1, "equal sets in any order count once");

    rig.binder.delete_what(p1);
    assert_eq!(rig.plan.0.lock().upsyncs.0.len(), 1, "still wanted by p2");
    rig.binder.put_where(p2, ResolvedWhere::default());
    assert!(rig.plan.0.lock().upsyncs.0.is_empty());
    assert_eq!(rig.binder.stats().upsyncs, 0);
}

#[test]
fn namespace_parts_need_the_include_flag() {
    let rig = Rig::new();
    rig.provider.set_resource("wmw1", GroupResource::namespaces(), served(false, &["v1"]));
    let a = dest("a");
    let p1 = ExternalName::new("wmw1", "p1");
    let ns = part(GroupResource::namespaces(), "", "team-a");
    rig.binder.put_where(p1.clone(), wher(vec![a.clone()]));
    rig.binder.put_what(p1.clone(), what(vec![(ns.clone(), WorkloadPartDetails::default())], vec![]));
    rig.settle();
    assert!(rig.plan.0.lock().cluster_scoped.is_empty());

    let with_ns = WorkloadPartDetails { include_namespace_object: true, ..Default::default() };
    rig.binder.put_what(p1, what(vec![(ns, with_ns)], vec![]));
    let plan = rig.plan.0.lock();
    let tuple = Distribution {
        key: ProjectionModeKey { group_resource: GroupResource::namespaces(), destination: a },
        object: ExternalName::new("wmw1", "team-a"),
    };
    assert!(plan.cluster_scoped.contains_key(&tuple));
    assert_eq!(plan.cluster_modes.len(), 1);
}

#[test]
fn tolerated_and_system_objects_are_not_distributed() {
    let rig = Rig::new();
    rig.provider.set_resource("wmw1", GroupResource::new("", "nodes"), served(false, &["v1"]));
    rig.provider.set_resource("wmw1", configmaps(), served(true, &["v1"]));
    let p1 = ExternalName::new("wmw1", "p1");
    rig.binder.put_where(p1.clone(), wher(vec![dest("a")]));
    rig.binder.put_what(
        p1,
        what(
            vec![
                (part(GroupResource::new("", "nodes"), "", "n1"), WorkloadPartDetails::default()),
                (part(configmaps(), "ns", "kube-root-ca.crt"), WorkloadPartDetails::default()),
            ],
            vec![],
        ),
    );
    rig.settle();
    let plan = rig.plan.0.lock();
    assert!(plan.cluster_scoped.is_empty());
    assert!(plan.namespaced.is_empty());
}

#[test]
fn system_objects_flow_when_included() {
    let rig = Rig::with_config(EngineConfig { include_system_objects: true, ..Default::default() });
    rig.provider.set_resource("wmw1", configmaps(), served(true, &["v1"]));
    let p1 = ExternalName::new("wmw1", "p1");
    rig.binder.put_where(p1.clone(), wher(vec![dest("a")]));
    rig.binder.put_what(p1, what(vec![(part(configmaps(), "ns", "kube-root-ca.crt"), Default::default())], vec![]));
    rig.settle();
    assert_eq!(rig.plan.0.lock().namespaced.len(), 1);
}

#[test]
fn deleting_both_halves_forgets_the_placement() {
    let rig = Rig::new();
    rig.provider.set_resource("wmw1", configmaps(), served(true, &["v1"]));
    let p1 = ExternalName::new("wmw1", "p1");
    rig.binder.put_where(p1.clone(), wher(vec![dest("a"), dest("b")]));
    rig.binder.put_what(p1.clone(), what(vec![(part(configmaps(), "ns", "cm"), Default::default())], vec![]));
    rig.settle();
    assert_eq!(rig.plan.0.lock().namespaced.len(), 2);

    rig.binder.delete_what(p1.clone());
    assert!(rig.plan.0.lock().namespaced.is_empty());
    assert_eq!(rig.binder.stats().placements, 1, "where half still present");
    rig.binder.delete_where(p1);
    assert_eq!(rig.binder.stats(), Default::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_loop_applies_discovery() {
    use placement_core::runnable::Runnable;
    use tokio_util::sync::CancellationToken;

    let rig = Rig::new();
    let ctx = CancellationToken::new();
    let provider_task = tokio::spawn(rig.provider.clone().run(ctx.clone()));
    let binder_task = tokio::spawn(rig.binder.clone().run(ctx.clone()));

    let p1 = ExternalName::new("wmw1", "p1");
    let mut where_rx = rig.binder.where_receiver();
    let mut what_rx = rig.binder.what_receiver();
    what_rx.put(p1.clone(), what(vec![(part(configmaps(), "ns", "cm"), Default::default())], vec![]));
    where_rx.put(p1, wher(vec![dest("a")]));
    rig.provider.set_resource("wmw1", configmaps(), served(true, &["v1"]));

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while rig.plan.0.lock().namespaced.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "discovery never reached the plan");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    ctx.cancel();
    provider_task.await.unwrap();
    binder_task.await.unwrap();
}

#![forbid(unsafe_code)]

use std::sync::Arc;

use placement_core::receivers::{ChangeBuffer, MapChange, MappingBuffer, Receiver, SetChange};
use placement_core::{ResolvedWhere, SinglePlacement, SinglePlacementSlice, UpsyncSet};
use placement_relations::{MapDifferencer, NativeDomain, SinglePlacementSliceSetReducer, SliceDifferencer, UpsyncDomain};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};

fn sp(n: usize) -> SinglePlacement {
    SinglePlacement {
        cluster: format!("ws{n}"),
        location_name: format!("loc{n}"),
        sync_target_name: format!("st{n}"),
        sync_target_uid: format!("uid{n}"),
    }
}

fn slice(dests: Vec<SinglePlacement>) -> Arc<SinglePlacementSlice> { Arc::new(SinglePlacementSlice { destinations: dests }) }

fn upsync(names: &[&str]) -> UpsyncSet {
    UpsyncSet {
        api_group: "group1.test".into(),
        resources: vec!["sprockets".into(), "flanges".into()],
        namespaces: vec!["*".into()],
        names: names.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn slice_differencer_emits_removals_first_and_is_idempotent() {
    let mut d: SliceDifferencer<u32, NativeDomain, ChangeBuffer<u32>> = SliceDifferencer::new(ChangeBuffer::default());
    let v1: Arc<[u32]> = Arc::from(vec![1, 2, 3]);
    d.receive(v1.clone());
    let first: Vec<_> = d.receiver_mut().drain().collect();
    assert_eq!(first, vec![SetChange::Add(1), SetChange::Add(2), SetChange::Add(3)]);

    d.receive(v1);
    assert!(d.receiver_mut().is_empty(), "same snapshot twice must emit nothing");

    d.receive(Arc::from(vec![3, 2, 1, 1]));
    assert!(d.receiver_mut().is_empty(), "equal value in a new allocation must emit nothing");

    d.receive(Arc::from(vec![2, 4, 5]));
    let got: Vec<_> = d.receiver_mut().drain().collect();
    let first_add = got.iter().position(|c| matches!(c, SetChange::Add(_))).unwrap_or(got.len());
    assert!(got[first_add..].iter().all(|c| matches!(c, SetChange::Add(_))), "removals must precede additions: {got:?}");
    let mut removed: Vec<u32> = got.iter().filter_map(|c| if let SetChange::Remove(x) = c { Some(*x) } else { None }).collect();
    let mut added: Vec<u32> = got.iter().filter_map(|c| if let SetChange::Add(x) = c { Some(*x) } else { None }).collect();
    removed.sort();
    added.sort();
    assert_eq!(removed, vec![1, 3]);
    assert_eq!(added, vec![4, 5]);

    d.receive(Arc::from(Vec::new()));
    let got: Vec<_> = d.receiver_mut().drain().collect();
    assert!(got.iter().all(|c| matches!(c, SetChange::Remove(_))));
    assert_eq!(got.len(), 3);
}

#[test]
fn deep_equal_upsync_set_fires_nothing() {
    let mut d: SliceDifferencer<UpsyncSet, UpsyncDomain, ChangeBuffer<UpsyncSet>> =
        SliceDifferencer::new(ChangeBuffer::default());
    d.receive(Arc::from(vec![upsync(&["n1", "n2"])]));
    assert_eq!(d.receiver_mut().drain().count(), 1);
    d.receive(Arc::from(vec![upsync(&["n1", "n2"])]));
    assert!(d.receiver_mut().is_empty(), "deep-equal upsync set in a new allocation must not fire");
    d.receive(Arc::from(vec![upsync(&["n2", "n1"])]));
    assert!(d.receiver_mut().is_empty(), "name order must not matter");
    d.receive(Arc::from(vec![upsync(&["n1"])]));
    let got: Vec<_> = d.receiver_mut().drain().collect();
    assert_eq!(got, vec![SetChange::Remove(upsync(&["n2", "n1"])), SetChange::Add(upsync(&["n1"]))]);
}

#[test]
fn map_differencer_puts_changes_and_deletes() {
    let mut d: MapDifferencer<&str, u8, MappingBuffer<&str, u8>> = MapDifferencer::new(MappingBuffer::default());
    let mut m = FxHashMap::default();
    m.insert("a", 1);
    m.insert("b", 2);
    let m1 = Arc::new(m.clone());
    d.receive(m1.clone());
    assert_eq!(d.receiver_mut().drain().count(), 2);
    d.receive(m1);
    assert_eq!(d.receiver_mut().drain().count(), 0);
    m.remove("a");
    m.insert("b", 3);
    m.insert("c", 4);
    d.receive(Arc::new(m));
    let got: Vec<_> = d.receiver_mut().drain().collect();
    assert_eq!(got[0], MapChange::Delete("a"), "deletes come first");
    let mut puts: Vec<_> = got[1..].to_vec();
    puts.sort_by_key(|c| match c {
        MapChange::Put(k, _) => *k,
        MapChange::Delete(k) => *k,
    });
    assert_eq!(puts, vec![MapChange::Put("b", 3), MapChange::Put("c", 4)]);
}

#[test]
fn reducer_counts_destinations_across_slices() {
    let mut r = SinglePlacementSliceSetReducer::new(ChangeBuffer::default());
    let s1 = slice(vec![sp(1), sp(2)]);
    let s2 = slice(vec![sp(2), sp(3)]);
    r.receive(ResolvedWhere(vec![s1.clone(), s2.clone()]));
    assert_eq!(r.receiver_mut().drain().count(), 3);
    r.receive(ResolvedWhere(vec![s2.clone()]));
    let got: Vec<_> = r.receiver_mut().drain().collect();
    assert_eq!(got, vec![SetChange::Remove(sp(1))], "sp2 is still covered by s2");
    r.receive(ResolvedWhere(vec![slice(vec![sp(3), sp(2)])]));
    assert!(r.receiver_mut().is_empty(), "same destinations in a new slice must emit nothing");
    r.receive(ResolvedWhere(Vec::new()));
    assert_eq!(r.receiver_mut().drain().count(), 2);
}

/// One random edit of a where-resolution; edited slices are replaced, never mutated.
fn revise(rng: &mut StdRng, slices: &[Arc<SinglePlacementSlice>]) -> Vec<Arc<SinglePlacementSlice>> {
    let mut out = slices.to_vec();
    if out.is_empty() || rng.gen_range(0..20) == 0 {
        let n = (rng.gen_range(0..12) + 2) / 3;
        out.push(slice((0..n).map(|_| sp(rng.gen_range(0..10))).collect()));
        return out;
    }
    let i = rng.gen_range(0..out.len());
    let mut dests = out[i].destinations.clone();
    match rng.gen_range(0..4) {
        0 => dests.push(sp(rng.gen_range(0..10))),
        1 if !dests.is_empty() => {
            let j = rng.gen_range(0..dests.len());
            let k = rng.gen_range(0..10);
            match rng.gen_range(0..4) {
                0 => dests[j].cluster = format!("ws{k}"),
                1 => dests[j].location_name = format!("loc{k}"),
                2 => dests[j].sync_target_name = format!("st{k}"),
                _ => dests[j].sync_target_uid = format!("uid{k}"),
            }
        }
        2 if !dests.is_empty() => {
            let j = rng.gen_range(0..dests.len());
            dests.remove(j);
        }
        _ => {
            out.remove(i);
            return out;
        }
    }
    out[i] = slice(dests);
    out
}

#[test]
fn randomized_reducer_converges_to_reference() {
    let mut rng = StdRng::seed_from_u64(0x5eed_0f_51ce);
    for round in 0..20 {
        let mut reducer = SinglePlacementSliceSetReducer::new(FxHashSet::<SinglePlacement>::default());
        let mut slices: Vec<Arc<SinglePlacementSlice>> = Vec::new();
        for step in 0..10 {
            slices = revise(&mut rng, &slices);
            reducer.receive(ResolvedWhere(slices.clone()));
            let reference: FxHashSet<SinglePlacement> = slices.iter().flat_map(|s| s.destinations.iter().cloned()).collect();
            assert_eq!(*reducer.receiver_mut(), reference, "round {round} step {step}: incremental set diverged");
            let covered: FxHashSet<SinglePlacement> = reducer.destinations().cloned().collect();
            assert_eq!(covered, reference, "round {round} step {step}: reducer counts diverged");
        }
    }
}

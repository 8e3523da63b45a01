#![forbid(unsafe_code)]

use placement_relations::factorer::{self, Factorer};

fn wholes() -> Vec<(u8, &'static str, char)> {
    vec![(0, "", 'a'), (1, "x", 'b'), (255, "yz", 'c'), (7, "x", 'a')]
}

fn check<P, R>(f: Factorer<(u8, &'static str, char), P, R>)
where
    P: Clone + PartialEq + std::fmt::Debug,
    R: Clone + PartialEq + std::fmt::Debug,
{
    for w in wholes() {
        let (p, r) = f.first(w);
        assert_eq!(f.second(p.clone(), r.clone()), w, "second(first(w)) must be w");
        assert_eq!(f.first(f.second(p.clone(), r.clone())), (p, r), "first(second(p, r)) must be (p, r)");
    }
}

#[test]
fn triple_factorers_are_mutually_inverse() {
    check(factorer::triple_to_1_and_23());
    check(factorer::triple_to_2_and_13());
    check(factorer::triple_to_3_and_21());
    check(factorer::triple_to_13_and_2());
    check(factorer::triple_to_23_and_1());
}

#[test]
fn pair_and_quad_factorers_round_trip() {
    let p = factorer::pair::<u8, String>();
    let r = factorer::pair_reverse::<u8, String>();
    for w in [(1u8, "a".to_string()), (2, String::new())] {
        let (a, b) = p.first(w.clone());
        assert_eq!(p.second(a, b), w);
        let (b, a) = r.first(w.clone());
        assert_eq!(r.second(b, a), w);
    }
    let q = factorer::quad_to_1_and_234::<u8, u8, u8, u8>();
    let (a, rest) = q.first((1, 2, 3, 4));
    assert_eq!((a, rest), (1, (2, 3, 4)));
    assert_eq!(q.second(a, rest), (1, 2, 3, 4));
}

#[test]
fn reversed_rotator_swaps_directions() {
    let f = factorer::triple_to_3_and_21::<u8, u8, u8>();
    let back = f.reverse();
    assert_eq!(back.forward((3, (2, 1))), (1, 2, 3));
    assert_eq!(back.backward((1, 2, 3)), (3, (2, 1)));
}

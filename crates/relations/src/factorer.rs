//! Invertible reshapings of tuple types.
//!
//! A [`Rotator`] converts between two shapes of the same information. A
//! [`Factorer`] is a rotator whose target shape is `(part, rest)`; every
//! secondary index is a map keyed by the part of some factorer.

use std::fmt;

pub struct Rotator<A, B> {
    forward: fn(A) -> B,
    backward: fn(B) -> A,
}

impl<A, B> Clone for Rotator<A, B> {
    fn clone(&self) -> Self { *self }
}

impl<A, B> Copy for Rotator<A, B> {}

impl<A, B> fmt::Debug for Rotator<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Rotator") }
}

impl<A, B> Rotator<A, B> {
    pub const fn new(forward: fn(A) -> B, backward: fn(B) -> A) -> Self { Self { forward, backward } }

    pub fn forward(&self, a: A) -> B { (self.forward)(a) }

    pub fn backward(&self, b: B) -> A { (self.backward)(b) }

    pub fn reverse(self) -> Rotator<B, A> { Rotator { forward: self.backward, backward: self.forward } }
}

pub type Factorer<W, P, R> = Rotator<W, (P, R)>;

impl<W, P, R> Rotator<W, (P, R)> {
    pub fn first(&self, whole: W) -> (P, R) { (self.forward)(whole) }

    pub fn second(&self, part: P, rest: R) -> W { (self.backward)((part, rest)) }
}

pub fn pair<A, B>() -> Factorer<(A, B), A, B> { Rotator::new(|w| w, |w| w) }

pub fn pair_reverse<A, B>() -> Factorer<(A, B), B, A> { Rotator::new(|(a, b)| (b, a), |(b, a)| (a, b)) }

pub fn triple_to_1_and_23<A, B, C>() -> Factorer<(A, B, C), A, (B, C)> {
    Rotator::new(|(a, b, c)| (a, (b, c)), |(a, (b, c))| (a, b, c))
}

pub fn triple_to_2_and_13<A, B, C>() -> Factorer<(A, B, C), B, (A, C)> {
    Rotator::new(|(a, b, c)| (b, (a, c)), |(b, (a, c))| (a, b, c))
}

pub fn triple_to_3_and_21<A, B, C>() -> Factorer<(A, B, C), C, (B, A)> {
    Rotator::new(|(a, b, c)| (c, (b, a)), |(c, (b, a))| (a, b, c))
}

pub fn triple_to_13_and_2<A, B, C>() -> Factorer<(A, B, C), (A, C), B> {
    Rotator::new(|(a, b, c)| ((a, c), b), |((a, c), b)| (a, b, c))
}

pub fn triple_to_23_and_1<A, B, C>() -> Factorer<(A, B, C), (B, C), A> {
    Rotator::new(|(a, b, c)| ((b, c), a), |((b, c), a)| (a, b, c))
}

pub fn quad_to_1_and_234<A, B, C, D>() -> Factorer<(A, B, C, D), A, (B, C, D)> {
    Rotator::new(|(a, b, c, d)| (a, (b, c, d)), |(a, (b, c, d))| (a, b, c, d))
}

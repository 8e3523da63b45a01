//! Kubernetes API version priority.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Alpha,
    Beta,
    Ga,
}

/// `v<major>[(alpha|beta)<minor>]`.
fn parse(v: &str) -> Option<(u32, Stage, u32)> {
    let rest = v.strip_prefix('v')?;
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits == 0 {
        return None;
    }
    let major: u32 = rest[..digits].parse().ok()?;
    let tail = &rest[digits..];
    if tail.is_empty() {
        return Some((major, Stage::Ga, 0));
    }
    let (stage, minor) = if let Some(m) = tail.strip_prefix("alpha") {
        (Stage::Alpha, m)
    } else if let Some(m) = tail.strip_prefix("beta") {
        (Stage::Beta, m)
    } else {
        return None;
    };
    if minor.is_empty() || !minor.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((major, stage, minor.parse().ok()?))
}

/// Orders versions best first: GA before beta before alpha, higher numbers
/// first within a stage, unparsable versions last, and ties lexicographically.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some((ma, sa, na)), Some((mb, sb, nb))) => sb.cmp(&sa).then(mb.cmp(&ma)).then(nb.cmp(&na)).then(a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// The best of the candidates, if any.
pub fn pick<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    candidates.into_iter().min_by(|a, b| compare(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kubernetes_priority_order() {
        let mut vs = vec!["v1alpha1", "foo", "v2beta1", "v1", "v1beta2", "v10", "v2", "v1beta1", "v11alpha2", "bar"];
        vs.sort_by(|a, b| compare(a, b));
        assert_eq!(vs, vec!["v10", "v2", "v1", "v2beta1", "v1beta2", "v1beta1", "v11alpha2", "v1alpha1", "bar", "foo"]);
    }

    #[test]
    fn pick_prefers_ga() {
        assert_eq!(pick(["v1beta1", "v1"]), Some("v1"));
        assert_eq!(pick(["x", "v1alpha1"]), Some("v1alpha1"));
        assert_eq!(pick(Vec::<&str>::new()), None);
    }

    #[test]
    fn malformed_versions_do_not_parse() {
        for v in ["", "v", "1", "vbeta1", "v1beta", "v1gamma1", "v1beta1x"] {
            assert_eq!(parse(v), None, "{v}");
        }
    }
}

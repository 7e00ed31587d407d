//! Identity of one time series across the whole process fleet.

use crate::LabelSet;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Histogram bucket upper bound with a total order.
#[derive(Debug, Clone, Copy)]
pub struct Bound(f64);

impl Bound {
    pub const INF: Bound = Bound(f64::INFINITY);

    #[must_use]
    pub const fn new(upper: f64) -> Self {
        Self(upper)
    }

    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for Bound {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Bound {}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Bound {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == f64::INFINITY {
            f.write_str("+Inf")
        } else if self.0 == f64::NEG_INFINITY {
            f.write_str("-Inf")
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

impl Serialize for Bound {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Sub-metric discriminator. Counters and gauges only use `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Value,
    Bucket(Bound),
    Sum,
    Count,
}

impl Component {
    /// Exposition suffix appended to the family name.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Value => "",
            Self::Bucket(_) => "_bucket",
            Self::Sum => "_sum",
            Self::Count => "_count",
        }
    }
}

/// Orders by family, then canonical labels, then component, which is the
/// order aggregated output is emitted in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SampleKey {
    pub family: String,
    pub labels: LabelSet,
    pub component: Component,
}

impl SampleKey {
    #[must_use]
    pub fn new(family: impl Into<String>, labels: LabelSet) -> Self {
        Self {
            family: family.into(),
            labels,
            component: Component::Value,
        }
    }

    #[must_use]
    pub fn with_component(mut self, component: Component) -> Self {
        self.component = component;
        self
    }

    /// Key of a histogram bucket; the family must be the histogram's name.
    #[must_use]
    pub fn bucket(family: impl Into<String>, labels: LabelSet, upper: f64) -> Self {
        Self::new(family, labels).with_component(Component::Bucket(Bound::new(upper)))
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.family, self.component.suffix())?;
        match self.component {
            Component::Bucket(bound) => {
                let labels = self.labels.clone().with("le", bound.to_string());
                write!(f, "{labels}")
            },
            _ => write!(f, "{}", self.labels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_ordering() {
        let mut bounds = vec![Bound::INF, Bound::new(0.5), Bound::new(-1.0), Bound::new(10.0)];
        bounds.sort();
        assert_eq!(bounds[0], Bound::new(-1.0));
        assert_eq!(bounds[3], Bound::INF);
        assert_eq!(Bound::INF.to_string(), "+Inf");
        assert_eq!(Bound::new(0.25).to_string(), "0.25");
        assert_eq!(Bound::new(1.0).to_string(), "1.0");
    }

    #[test]
    fn test_sample_key_order() {
        let a = SampleKey::new("a_total", LabelSet::new().with("x", "2"));
        let b = SampleKey::new("a_total", LabelSet::new().with("x", "10"));
        let c = SampleKey::new("b_total", LabelSet::new());
        let mut keys = vec![c.clone(), a.clone(), b.clone()];
        keys.sort();
        assert_eq!(keys, vec![b, a, c]);
    }

    #[test]
    fn test_histogram_components_sort_buckets_first() {
        let labels = LabelSet::new();
        let mut keys = vec![
            SampleKey::new("lat", labels.clone()).with_component(Component::Count),
            SampleKey::bucket("lat", labels.clone(), f64::INFINITY),
            SampleKey::new("lat", labels.clone()).with_component(Component::Sum),
            SampleKey::bucket("lat", labels.clone(), 0.1),
        ];
        keys.sort();
        assert_eq!(keys[0].component, Component::Bucket(Bound::new(0.1)));
        assert_eq!(keys[1].component, Component::Bucket(Bound::INF));
        assert_eq!(keys[2].component, Component::Sum);
        assert_eq!(keys[3].component, Component::Count);
    }

    #[test]
    fn test_display() {
        let key = SampleKey::bucket("lat", LabelSet::new().with("op", "get"), 0.5);
        assert_eq!(key.to_string(), "lat_bucket{le=\"0.5\",op=\"get\"}");
    }
}

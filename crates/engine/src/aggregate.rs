/// Combiner contract supplied by the job author: builds a per-key
/// accumulator from the first value, extends it with later values on the map
/// side, and merges accumulators across producers on the reduce side.
///
/// `merge_combiners` must be associative; the transport applies it in
/// arrival order, which is unspecified across producers.
pub trait Aggregator<V, C>: Send + Sync {
    /// Builds the accumulator for a key's first value.
    fn create_combiner(&self, value: V) -> C;

    /// Folds one more value into a key's accumulator (map side).
    fn merge_value(&self, combiner: C, value: V) -> C;

    /// Merges two accumulators for the same key (reduce side).
    fn merge_combiners(&self, a: C, b: C) -> C;
}

/// Closure-backed [`Aggregator`].
pub struct FnAggregator<CC, MV, MC> {
    create_combiner: CC,
    merge_value: MV,
    merge_combiners: MC,
}

impl<CC, MV, MC> FnAggregator<CC, MV, MC> {
    pub fn new(create_combiner: CC, merge_value: MV, merge_combiners: MC) -> Self {
        Self {
            create_combiner,
            merge_value,
            merge_combiners,
        }
    }
}

impl<V, C, CC, MV, MC> Aggregator<V, C> for FnAggregator<CC, MV, MC>
where
    CC: Fn(V) -> C + Send + Sync,
    MV: Fn(C, V) -> C + Send + Sync,
    MC: Fn(C, C) -> C + Send + Sync,
{
    fn create_combiner(&self, value: V) -> C {
        (self.create_combiner)(value)
    }

    fn merge_value(&self, combiner: C, value: V) -> C {
        (self.merge_value)(combiner, value)
    }

    fn merge_combiners(&self, a: C, b: C) -> C {
        (self.merge_combiners)(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::{Aggregator, FnAggregator};

    #[test]
    fn closure_aggregator_folds_values_and_combiners() {
        let agg = FnAggregator::new(|v: u64| v, |c, v| c + v, |a, b| a + b);
        let c = agg.create_combiner(1);
        let c = agg.merge_value(c, 2);
        assert_eq!(c, 3);
        assert_eq!(agg.merge_combiners(c, 5), 8);
    }
}

//! Merged results must not depend on the order partials arrive in.

use fabric_common::{CombineStrategy, PartialResult, PartitionKey, ResultValue, Row};
use fabric_coordinator::aggregator::combine;
use rand::seq::SliceRandom;
use rand::Rng;

const PERMUTATIONS: usize = 64;

fn random_partials(strategy: CombineStrategy, count: usize) -> Vec<(PartitionKey, PartialResult)> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let key = PartitionKey::new(format!("part-{i:03}"));
            let partial = match strategy {
                CombineStrategy::Concat | CombineStrategy::TopK { .. } => {
                    let rows = (0..rng.gen_range(0..5))
                        .map(|j| Row::new(format!("r{i}-{j}"), rng.gen_range(-50..50)))
                        .collect();
                    PartialResult::rows(rows)
                }
                CombineStrategy::Min | CombineStrategy::Max if rng.gen_bool(0.2) => {
                    PartialResult::new(ResultValue::Scalar(None))
                }
                _ => PartialResult::scalar(rng.gen_range(-1_000_000..1_000_000)),
            };
            (key, partial)
        })
        .collect()
}

#[test]
fn every_strategy_is_order_independent() {
    let strategies = [
        CombineStrategy::Sum,
        CombineStrategy::Count,
        CombineStrategy::Min,
        CombineStrategy::Max,
        CombineStrategy::Concat,
        CombineStrategy::TopK { k: 5 },
    ];
    let mut rng = rand::thread_rng();
    for strategy in strategies {
        let partials = random_partials(strategy, 12);
        let expected = combine(strategy, partials.clone()).unwrap();
        for _ in 0..PERMUTATIONS {
            let mut shuffled = partials.clone();
            shuffled.shuffle(&mut rng);
            assert_eq!(
                combine(strategy, shuffled).unwrap(),
                expected,
                "{strategy} changed under reordering"
            );
        }
    }
}

#[test]
fn top_k_with_duplicate_values_is_order_independent() {
    let partials: Vec<(PartitionKey, PartialResult)> = ["a", "b", "c", "d"]
        .iter()
        .map(|k| {
            (
                PartitionKey::from(*k),
                PartialResult::rows(vec![Row::new(format!("{k}-x"), 7), Row::new(format!("{k}-y"), 3)]),
            )
        })
        .collect();
    let strategy = CombineStrategy::TopK { k: 3 };
    let expected = combine(strategy, partials.clone()).unwrap();
    assert_eq!(
        expected,
        ResultValue::Rows(vec![Row::new("a-x", 7), Row::new("b-x", 7), Row::new("c-x", 7)])
    );

    let mut rng = rand::thread_rng();
    for _ in 0..PERMUTATIONS {
        let mut shuffled = partials.clone();
        shuffled.shuffle(&mut rng);
        assert_eq!(combine(strategy, shuffled).unwrap(), expected);
    }
}

#[test]
fn sum_overflow_is_reported_for_every_order() {
    let partials = vec![
        (PartitionKey::from("a"), PartialResult::scalar(i64::MAX)),
        (PartitionKey::from("b"), PartialResult::scalar(i64::MAX)),
        (PartitionKey::from("c"), PartialResult::scalar(i64::MIN)),
    ];
    let expected = combine(CombineStrategy::Sum, partials.clone()).unwrap();
    assert_eq!(expected, ResultValue::Scalar(Some(i64::MAX - 1)));

    let mut rng = rand::thread_rng();
    for _ in 0..PERMUTATIONS {
        let mut shuffled = partials.clone();
        shuffled.shuffle(&mut rng);
        assert_eq!(combine(CombineStrategy::Sum, shuffled).unwrap(), expected);
    }
}

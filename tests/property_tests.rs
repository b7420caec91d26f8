//! Property tests over generated write sequences.
//!
//! Small fleets of simulated replicas perform arbitrary writes and
//! deletes; however their state is exchanged afterwards, every replica
//! must converge to the same visible state and every clock must stay
//! monotone.

use proptest::prelude::*;

use estuary::{Change, Delta, Document, Value, VectorClock};

const REPLICAS: [&str; 3] = ["alpha", "beta", "gamma"];
const PATHS: [&str; 4] = ["title", "body", "due", "status"];

/// One local operation on one replica.
#[derive(Clone, Debug)]
enum Op {
    Set { replica: usize, path: usize, value: i64 },
    Delete { replica: usize, path: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..REPLICAS.len(), 0..PATHS.len(), -5i64..5).prop_map(|(replica, path, value)| Op::Set {
            replica,
            path,
            value
        }),
        (0..REPLICAS.len(), 0..PATHS.len())
            .prop_map(|(replica, path)| Op::Delete { replica, path }),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..20)
}

/// Run each op on its home replica, collecting the changes produced.
fn run_ops(ops: &[Op]) -> (Vec<Document>, Vec<Change>) {
    let mut docs: Vec<Document> = REPLICAS
        .iter()
        .map(|r| Document::new("doc-1", *r))
        .collect();
    let mut changes = Vec::new();
    for op in ops {
        let change = match *op {
            Op::Set {
                replica,
                path,
                value,
            } => docs[replica].set(PATHS[path], Value::int(value)).unwrap(),
            Op::Delete { replica, path } => docs[replica].delete(PATHS[path]).unwrap(),
        };
        changes.push(change);
    }
    (docs, changes)
}

fn delta_of(changes: &[Change]) -> Delta {
    Delta {
        document_id: "doc-1".to_string(),
        changes: changes.to_vec(),
    }
}

fn assert_value_equal(a: &Document, b: &Document) {
    let paths: std::collections::BTreeSet<&String> = a
        .fields()
        .map(|(p, _)| p)
        .chain(b.fields().map(|(p, _)| p))
        .collect();
    for path in paths {
        assert_eq!(a.get(path), b.get(path), "divergence at {path:?}");
    }
}

proptest! {
    /// Any delivery order of the same multiset of writes, with
    /// duplicates, converges to the same visible state.
    #[test]
    fn convergence_under_reordering(ops in ops_strategy(), seed in 0usize..6) {
        let (_, changes) = run_ops(&ops);

        let mut forward = Document::new("doc-1", "sink-f");
        forward.apply_delta(&delta_of(&changes)).unwrap();

        let mut shuffled: Vec<Change> = changes.clone();
        let shuffled_len = shuffled.len();
        shuffled.rotate_left(seed % shuffled_len.max(1));
        shuffled.reverse();
        // Duplicate every change for good measure.
        let doubled: Vec<Change> = shuffled.iter().chain(shuffled.iter()).cloned().collect();

        let mut backward = Document::new("doc-1", "sink-b");
        backward.apply_delta(&delta_of(&doubled)).unwrap();

        assert_value_equal(&forward, &backward);
        prop_assert_eq!(forward.clock(), backward.clock());
    }

    /// Applying a delta twice equals applying it once.
    #[test]
    fn delta_apply_is_idempotent(ops in ops_strategy()) {
        let (docs, _) = run_ops(&ops);
        let mut target = Document::new("doc-1", "sink");
        target.merge(&docs[0]).unwrap();

        let delta = Delta::compute(&target, &docs[1]);
        target.apply_delta(&delta).unwrap();
        let once = target.snapshot();
        target.apply_delta(&delta).unwrap();
        prop_assert_eq!(target.snapshot(), once);
    }

    /// Two deltas applied in either order produce the same state.
    #[test]
    fn delta_apply_commutes(ops in ops_strategy()) {
        let (docs, _) = run_ops(&ops);
        let empty = Document::new("doc-1", "seed");
        let d1 = Delta::compute(&empty, &docs[0]);
        let d2 = Delta::compute(&empty, &docs[1]);

        let mut one = Document::new("doc-1", "r1");
        one.apply_delta(&d1).unwrap();
        one.apply_delta(&d2).unwrap();

        let mut two = Document::new("doc-1", "r2");
        two.apply_delta(&d2).unwrap();
        two.apply_delta(&d1).unwrap();

        assert_value_equal(&one, &two);
        prop_assert_eq!(one.clock(), two.clock());
    }

    /// Clocks never regress, and every register's stamp stays
    /// covered by the document clock, after every single operation.
    #[test]
    fn clocks_stay_monotone_and_cover_stamps(ops in ops_strategy()) {
        let mut docs: Vec<Document> = REPLICAS
            .iter()
            .map(|r| Document::new("doc-1", *r))
            .collect();
        let mut highest: Vec<u64> = vec![0; REPLICAS.len()];

        for op in &ops {
            let replica = match *op {
                Op::Set { replica, path, value } => {
                    docs[replica].set(PATHS[path], Value::int(value)).unwrap();
                    replica
                }
                Op::Delete { replica, path } => {
                    docs[replica].delete(PATHS[path]).unwrap();
                    replica
                }
            };
            let coordinate = docs[replica].clock().get(REPLICAS[replica]);
            prop_assert!(coordinate >= highest[replica]);
            highest[replica] = coordinate;
            docs[replica].validate_invariants().unwrap();
        }

        // Merging everything everywhere keeps both properties.
        let snapshot: Vec<Document> = docs.clone();
        for doc in docs.iter_mut() {
            for other in &snapshot {
                doc.merge(other).unwrap();
                doc.validate_invariants().unwrap();
            }
        }
        for (i, doc) in docs.iter().enumerate() {
            prop_assert!(doc.clock().get(REPLICAS[i]) >= highest[i]);
        }
    }

    /// compute(a, b) applied to a reproduces b's visible state, for
    /// any b that has already observed a's writes.
    #[test]
    fn computed_delta_is_faithful(ops in ops_strategy(), extra in ops_strategy()) {
        let (docs, _) = run_ops(&ops);
        let mut a = Document::new("doc-1", "base");
        a.merge(&docs[0]).unwrap();

        // b extends a: it observes everything a has, then takes more writes.
        let mut b = Document::new("doc-1", "zeta");
        b.merge(&a).unwrap();
        for op in &extra {
            match *op {
                Op::Set { path, value, .. } => {
                    b.set(PATHS[path], Value::int(value)).unwrap();
                }
                Op::Delete { path, .. } => {
                    b.delete(PATHS[path]).unwrap();
                }
            }
        }

        let delta = Delta::compute(&a, &b);
        a.apply_delta(&delta).unwrap();
        assert_value_equal(&a, &b);
    }

    /// A set with a higher stamp overwrites a tombstone; a tombstone
    /// with a higher stamp sticks over a set.
    #[test]
    fn tombstones_follow_stamp_order(path in 0..PATHS.len()) {
        let path = PATHS[path];

        let mut a = Document::new("doc-1", "alpha");
        a.delete(path).unwrap();
        let mut b = Document::new("doc-1", "beta");
        b.merge(&a).unwrap();
        b.set(path, Value::int(7)).unwrap();
        a.merge(&b).unwrap();
        prop_assert_eq!(a.get(path), Some(&Value::int(7)));

        let mut c = Document::new("doc-2", "alpha");
        c.set(path, Value::int(7)).unwrap();
        let mut d = Document::new("doc-2", "beta");
        d.merge(&c).unwrap();
        d.delete(path).unwrap();
        c.merge(&d).unwrap();
        prop_assert_eq!(c.get(path), None);
    }
}

/// Equal-clock concurrent writes resolve to the lexicographically
/// greater replica, in both delivery orders.
#[test]
fn tie_break_is_deterministic() {
    for (first, second) in [("alpha", "beta"), ("beta", "alpha")] {
        let mut x = Document::new("doc-1", first);
        x.set("title", Value::Text(format!("from-{first}"))).unwrap();
        let mut y = Document::new("doc-1", second);
        y.set("title", Value::Text(format!("from-{second}"))).unwrap();

        x.merge(&y).unwrap();
        y.merge(&x).unwrap();

        for doc in [&x, &y] {
            assert_eq!(doc.get("title"), Some(&Value::text("from-beta")));
            assert_eq!(doc.register("title").unwrap().origin(), "beta");
        }
    }
}

/// Vector clock comparison matches the causal relationship of the
/// documents that produced the clocks.
#[test]
fn clock_comparison_tracks_causality() {
    use estuary::ClockOrdering;

    let mut a = Document::new("doc-1", "alpha");
    a.set("title", Value::int(1)).unwrap();

    let mut b = Document::new("doc-1", "beta");
    b.merge(&a).unwrap();
    b.set("title", Value::int(2)).unwrap();

    assert_eq!(a.clock().compare(b.clock()), ClockOrdering::Less);
    assert_eq!(b.clock().compare(a.clock()), ClockOrdering::Greater);
    assert_eq!(a.clock().compare(a.clock()), ClockOrdering::Equal);

    let mut c = Document::new("doc-1", "gamma");
    c.set("status", Value::int(3)).unwrap();
    assert_eq!(b.clock().compare(c.clock()), ClockOrdering::Concurrent);

    let mut merged = VectorClock::new();
    merged.merge(b.clock());
    merged.merge(c.clock());
    assert_eq!(merged.compare(b.clock()), ClockOrdering::Greater);
    assert_eq!(merged.compare(c.clock()), ClockOrdering::Greater);
}

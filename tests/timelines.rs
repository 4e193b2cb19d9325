//! End-to-end tests for timelines: branching, isolation, merging and the
//! structural invariants every stream keeps under mutation.

use std::sync::Arc;

use kyrolog::{
    BranchOptions, EventDraft, ExpectedVersion, InMemoryCommandLog, InMemoryEventLog,
    ManualClock, MergeOutcome, MessageId, StoreConfig, StreamDescriptor, StreamKey,
    StreamVersion, TimelineContext, TimelineId, TimelineStore,
};
use proptest::prelude::*;
use serde_json::json;

fn store() -> (Arc<ManualClock>, TimelineStore) {
    let clock = Arc::new(ManualClock::new(10_000));
    let store = TimelineStore::with_clock(
        StoreConfig::default(),
        Arc::new(InMemoryEventLog::new()),
        Arc::new(InMemoryCommandLog::new()),
        Arc::clone(&clock),
    )
    .unwrap();
    (clock, store)
}

fn root() -> StreamDescriptor {
    StreamDescriptor::aggregate("Root", "1")
}

fn append_one(store: &TimelineStore, ctx: &TimelineContext, kind: &str) -> MessageId {
    store
        .append(
            ctx,
            &root(),
            vec![EventDraft::new(kind, json!({ "kind": kind }))],
            ExpectedVersion::Any,
        )
        .unwrap()[0]
        .message_id
}

fn kinds(store: &TimelineStore, key: &StreamKey) -> Vec<String> {
    store
        .read_all(key)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[test]
fn test_root_created_updated_on_branch_and_merged() {
    let (_, store) = store();
    let master = store.root_context();
    let created = store
        .append(
            &master,
            &root(),
            vec![EventDraft::new("RootCreated", json!({}))],
            ExpectedVersion::Exact(StreamVersion::NoStream),
        )
        .unwrap()[0]
        .message_id;

    let test = store
        .branch(
            &master,
            &TimelineId::new("test").unwrap(),
            store.clock().now(),
            &BranchOptions::default(),
        )
        .unwrap();
    store
        .append(
            &test,
            &root(),
            vec![EventDraft::new("RootUpdated", json!({})).caused_by(created)],
            ExpectedVersion::Exact(StreamVersion::At(0)),
        )
        .unwrap();

    assert_eq!(store.version(&master.key("Root", "1")).unwrap(), StreamVersion::At(0));
    assert_eq!(store.version(&test.key("Root", "1")).unwrap(), StreamVersion::At(1));

    let outcome = store.merge(&master, test.timeline(), false).unwrap();
    assert!(outcome.is_success());
    assert_eq!(store.version(&master.key("Root", "1")).unwrap(), StreamVersion::At(1));
    let merged = store.read_all(&master.key("Root", "1")).unwrap();
    assert_eq!(merged[1].event_type, "RootUpdated");
    assert_eq!(merged[1].ancestor_id, Some(created));
    store.verify_stream(&master.key("Root", "1")).unwrap();
}

#[test]
fn test_branch_sees_only_the_past_and_stays_isolated() {
    let (clock, store) = store();
    let master = store.root_context();
    append_one(&store, &master, "A");
    clock.advance(5);
    append_one(&store, &master, "B");
    clock.advance(5);
    let cut = store.clock().now();
    clock.advance(5);
    append_one(&store, &master, "C");

    let b = store
        .branch(&master, &TimelineId::new("b").unwrap(), cut, &BranchOptions::default())
        .unwrap();
    assert_eq!(kinds(&store, &b.key("Root", "1")), vec!["A", "B"]);
    assert!(store
        .read_all(&b.key("Root", "1"))
        .unwrap()
        .iter()
        .all(|e| e.timestamp <= cut));

    append_one(&store, &b, "D");
    assert_eq!(kinds(&store, &master.key("Root", "1")), vec!["A", "B", "C"]);
    assert_eq!(kinds(&store, &b.key("Root", "1")), vec!["A", "B", "D"]);
}

#[test]
fn test_merging_an_unchanged_branch_is_a_no_op() {
    let (_, store) = store();
    let master = store.root_context();
    append_one(&store, &master, "A");
    append_one(&store, &master, "B");
    let key = master.key("Root", "1");
    let before = (store.read_all(&key).unwrap(), store.graph().stream_hash(&key).unwrap());

    let b = store
        .branch(
            &master,
            &TimelineId::new("b").unwrap(),
            store.clock().now(),
            &BranchOptions::default(),
        )
        .unwrap();
    for _ in 0..2 {
        let outcome = store.merge(&master, b.timeline(), true).unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { streams: 0, events: 0, commands: 0 });
        assert_eq!(
            (store.read_all(&key).unwrap(), store.graph().stream_hash(&key).unwrap()),
            before
        );
    }
}

#[test]
fn test_repeated_merge_copies_changes_once() {
    let (_, store) = store();
    let master = store.root_context();
    append_one(&store, &master, "A");
    let b = store
        .branch(
            &master,
            &TimelineId::new("b").unwrap(),
            store.clock().now(),
            &BranchOptions::default(),
        )
        .unwrap();
    append_one(&store, &b, "B");

    let first = store.merge(&master, b.timeline(), false).unwrap();
    assert_eq!(first, MergeOutcome::Merged { streams: 1, events: 1, commands: 0 });
    let second = store.merge(&master, b.timeline(), false).unwrap();
    assert_eq!(second, MergeOutcome::Merged { streams: 0, events: 0, commands: 0 });
    assert_eq!(kinds(&store, &master.key("Root", "1")), vec!["A", "B"]);
}

#[derive(Debug, Clone)]
enum Step {
    Append(usize),
    Burst(usize),
    Trim(u8),
    Insert(u8),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1usize..4).prop_map(Step::Append),
        (2usize..5).prop_map(Step::Burst),
        any::<u8>().prop_map(Step::Trim),
        any::<u8>().prop_map(Step::Insert),
    ]
}

fn scaled(ratio: u8, len: u64) -> u64 {
    u64::from(ratio) * len / 256
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_versions_stay_gapless(steps in proptest::collection::vec(step(), 1..16)) {
        let (clock, store) = store();
        let ctx = store.root_context();
        let key = ctx.key("Root", "1");
        append_one(&store, &ctx, "Seed");

        for step in steps {
            clock.advance(10);
            let len = store.read_all(&key).unwrap().len() as u64;
            match step {
                Step::Append(n) => {
                    for i in 0..n {
                        clock.advance(10);
                        append_one(&store, &ctx, &format!("A{i}"));
                    }
                }
                Step::Burst(n) => {
                    // One batch, one clock tick: neighbours differ only in counter.
                    let drafts = (0..n)
                        .map(|i| EventDraft::new(format!("B{i}"), json!(i)))
                        .collect();
                    store.append(&ctx, &root(), drafts, ExpectedVersion::Any).unwrap();
                }
                Step::Trim(ratio) => {
                    store.trim_stream(&key, StreamVersion::from_count(scaled(ratio, len))).unwrap();
                }
                Step::Insert(ratio) => {
                    let at = scaled(ratio, len + 1);
                    let outcome = store
                        .insert_into_stream(&key, at, vec![EventDraft::new("Inserted", json!(at))])
                        .unwrap();
                    prop_assert!(outcome.is_inserted(), "{:?}", outcome);
                }
            }

            let events = store.read_all(&key).unwrap();
            let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
            let expected: Vec<u64> = (0..events.len() as u64).collect();
            prop_assert_eq!(versions, expected);
            prop_assert!(events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            for event in &events {
                prop_assert_eq!(store.timestamp(&key, event.version).unwrap(), event.timestamp);
            }
            prop_assert_eq!(
                store.graph().get_stream_version(&key).unwrap(),
                Some(StreamVersion::from_count(events.len() as u64))
            );
            store.verify_stream(&key).unwrap();
        }
    }

    #[test]
    fn prop_stream_hash_tracks_every_payload(
        payloads in proptest::collection::vec(0i64..1_000, 1..12),
        pick in any::<prop::sample::Index>(),
    ) {
        let ids: Vec<MessageId> = payloads.iter().map(|_| MessageId::new()).collect();
        let build = |values: &[i64]| {
            let (_, store) = store();
            let ctx = store.root_context();
            let drafts = values
                .iter()
                .zip(&ids)
                .map(|(v, id)| EventDraft::new("Set", json!(v)).with_id(*id))
                .collect();
            store.append(&ctx, &root(), drafts, ExpectedVersion::Any).unwrap();
            store.graph().stream_hash(&ctx.key("Root", "1")).unwrap()
        };

        let original = build(&payloads);
        prop_assert_eq!(build(&payloads), original);

        let mut changed = payloads.clone();
        let idx = pick.index(changed.len());
        changed[idx] += 1;
        prop_assert_ne!(build(&changed), original);
    }
}

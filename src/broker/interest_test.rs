use super::interest::InterestLedger;

#[test]
fn repeated_subscribes_from_one_requester_accumulate() {
    let mut ledger = InterestLedger::new();

    assert_eq!(ledger.apply("r1", "name1", 1), 1);
    assert_eq!(ledger.apply("r1", "name1", 1), 2);

    assert_eq!(ledger.count("name1"), 2);
    assert_eq!(ledger.requester_count("name1", "r1"), 2);
}

#[test]
fn unsubscribes_decrement_down_to_zero() {
    let mut ledger = InterestLedger::new();
    ledger.apply("r1", "name1", 1);
    ledger.apply("r1", "name1", 1);

    assert_eq!(ledger.apply("r1", "name1", -1), 1);
    assert_eq!(ledger.apply("r1", "name1", -1), 0);

    assert_eq!(ledger.count("name1"), 0);
    assert!(ledger.interested_streams().is_empty(), "expected no interested streams at zero interest");
}

#[test]
fn interest_never_goes_negative() {
    let mut ledger = InterestLedger::new();

    assert_eq!(ledger.apply("r1", "name1", -1), 0, "expected an unsubscribe with no prior interest to floor at zero");
    assert_eq!(ledger.apply("r1", "name1", 1), 1, "expected a subsequent subscribe to count from zero, not negative");
}

#[test]
fn balanced_pairs_leave_exact_remainder() {
    let mut ledger = InterestLedger::new();
    for _ in 0..3 {
        ledger.apply("r1", "name1", 1);
    }
    for _ in 0..2 {
        ledger.apply("r1", "name1", -1);
    }

    assert_eq!(ledger.count("name1"), 1, "expected interest to equal subscribes minus unsubscribes");
}

#[test]
fn counts_are_keyed_per_requester() {
    let mut ledger = InterestLedger::new();
    ledger.apply("r1", "name1", 1);
    ledger.apply("r1", "name1", 1);
    ledger.apply("r2", "name1", 1);

    assert_eq!(ledger.count("name1"), 3);
    assert_eq!(ledger.requester_count("name1", "r1"), 2);
    assert_eq!(ledger.requester_count("name1", "r2"), 1);

    ledger.apply("r2", "name1", -1);
    assert_eq!(ledger.count("name1"), 2, "expected one requester's unsubscribe to leave the other's interest intact");
    assert_eq!(ledger.requester_count("name1", "r1"), 2);
}

#[test]
fn interested_streams_snapshot_covers_only_live_interest() {
    let mut ledger = InterestLedger::new();
    ledger.apply("r1", "alpha", 1);
    ledger.apply("r1", "beta", 1);
    ledger.apply("r1", "beta", -1);
    ledger.apply("r2", "gamma", 1);

    let mut snapshot = ledger.interested_streams();
    snapshot.sort();
    assert_eq!(snapshot, vec!["alpha".to_string(), "gamma".into()]);
}

#[test]
fn history_records_every_observation_including_floored_ones() {
    let mut ledger = InterestLedger::new();
    ledger.apply("r1", "name1", -1);
    ledger.apply("r1", "name1", 1);
    ledger.apply("r1", "name1", -1);

    assert_eq!(ledger.history().len(), 3, "expected the append-only log to record floored observations too");
    assert_eq!(ledger.count("name1"), 0);
}

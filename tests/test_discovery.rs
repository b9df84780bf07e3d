use medchain::{MembershipPolicy, MembershipRegistry};

#[test]
fn test_add_ignores_self_blanks_and_duplicates() {
    let mut registry = MembershipRegistry::new("a:9000");
    assert!(registry.add("b:9000"));
    assert!(!registry.add("b:9000"));
    assert!(!registry.add("a:9000"));
    assert!(!registry.add("  "));
    assert_eq!(registry.peers(), vec!["b:9000"]);
}

#[test]
fn test_remove_and_merge() {
    let mut registry = MembershipRegistry::new("a:9000");
    assert_eq!(registry.merge(["b:9000", "c:9000", "a:9000", "b:9000"]), 2);
    assert!(registry.remove("b:9000"));
    assert!(!registry.remove("b:9000"));
    assert_eq!(registry.peers(), vec!["c:9000"]);
}

#[test]
fn test_replace_is_last_writer_wins() {
    let mut registry = MembershipRegistry::new("a:9000");
    registry.merge(["b:9000", "c:9000"]);
    registry.replace(["d:9000", "a:9000"]);
    assert_eq!(registry.peers(), vec!["d:9000"]);
}

#[test]
fn test_snapshot_is_idempotent_under_both_policies() {
    let snapshot = vec!["b:9000", "c:9000", "b:9000", "a:9000"];
    for policy in [MembershipPolicy::Replace, MembershipPolicy::Union] {
        let mut registry = MembershipRegistry::new("a:9000");
        registry.add("z:9000");
        registry.apply_snapshot(&snapshot, policy);
        let once = registry.clone();
        registry.apply_snapshot(&snapshot, policy);
        assert_eq!(registry, once, "{:?}", policy);
    }
}

#[test]
fn test_union_keeps_existing_peers() {
    let mut registry = MembershipRegistry::new("a:9000");
    registry.add("z:9000");
    registry.apply_snapshot(["b:9000"], MembershipPolicy::Union);
    assert_eq!(registry.peers(), vec!["z:9000", "b:9000"]);
}

#[test]
fn test_star_broadcast_snapshots() {
    let mut registry = MembershipRegistry::new("a:9000");
    registry.merge(["b:9000", "c:9000"]);

    assert_eq!(
        registry.snapshot_with_self(),
        vec!["b:9000", "c:9000", "a:9000"]
    );
    assert_eq!(
        registry.snapshot_for("b:9000", "d:9000"),
        vec!["c:9000", "d:9000", "a:9000"]
    );
    // Already-known joiner is not listed twice
    assert_eq!(
        registry.snapshot_for("b:9000", "c:9000"),
        vec!["c:9000", "a:9000"]
    );
}

#[test]
fn test_set_local_address_drops_self_from_peers() {
    let mut registry = MembershipRegistry::new("127.0.0.1:0");
    registry.add("127.0.0.1:4000");
    registry.set_local_address("127.0.0.1:4000");
    assert_eq!(registry.local_address(), "127.0.0.1:4000");
    assert!(registry.is_empty());
}

#[test]
fn test_failure_tracking_and_eviction() {
    let mut registry = MembershipRegistry::new("a:9000");
    registry.merge(["b:9000", "c:9000"]);

    assert_eq!(registry.record_failure("b:9000"), 1);
    assert_eq!(registry.record_failure("b:9000"), 2);
    assert_eq!(registry.record_failure("c:9000"), 1);
    assert_eq!(registry.record_failure("unknown:1"), 0);

    registry.record_success("c:9000");
    assert_eq!(registry.evict_failing(2), vec!["b:9000"]);
    assert_eq!(registry.peers(), vec!["c:9000"]);
    assert!(registry.evict_failing(1).is_empty());
}

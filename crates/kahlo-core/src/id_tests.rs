use super::*;

define_id! {
    pub struct TestId("tst-");
}

#[test]
fn round_trips_through_string() {
    let id = TestId::new();
    let s = id.to_string();
    let back = TestId::from_string(&s);
    assert_eq!(id, back);
}

#[test]
fn prefix_is_stable() {
    let id = TestId::new();
    assert!(id.as_str().starts_with("tst-"));
    assert_eq!(id.as_str().len(), ID_MAX_LEN);
}

#[test]
fn suffix_strips_prefix() {
    let id = TestId::from_string("tst-abc123");
    assert_eq!(id.suffix(), "abc123");
}

#[test]
fn short_truncates_suffix() {
    let id = TestId::from_string("tst-abcdefgh");
    assert_eq!(id.short(3), "abc");
}

#[test]
fn borrow_str_matches_hashmap_lookup() {
    use std::collections::HashMap;
    let id = TestId::from_string("tst-lookup-me");
    let mut map: HashMap<TestId, u32> = HashMap::new();
    map.insert(id, 7);
    assert_eq!(map.get(&TestId::from_string("tst-lookup-me")), Some(&7));
}

#[test]
fn idbuf_rejects_oversized_on_deserialize() {
    let too_long = "\"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\"";
    let result: Result<IdBuf, _> = serde_json::from_str(too_long);
    assert!(result.is_err());
}

#[test]
fn distinct_ids_are_not_equal() {
    assert_ne!(TargetId::new(), TargetId::new());
}

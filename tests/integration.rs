// Integration tests for wirequery: filter registration, shared-tree matching and filter tables

use proptest::prelude::*;
use std::collections::BTreeSet;
use wirequery::*;

const BODY: &str = "/s12:Envelope/s12:Body";

fn message(action: &str, body: &str) -> Message {
    Message::builder(EnvelopeVersion::Soap12).action(action).body(body).build().expect("message")
}

fn xpath(expr: &str) -> MessageFilter {
    MessageFilter::xpath(expr).expect("xpath filter")
}

fn matched_ids<T: Clone>(table: &impl FilterTable<T>, msg: &Message) -> BTreeSet<FilterId> {
    let mut filters = Vec::new();
    table.get_matching_filters(msg, &mut filters).expect("match");
    filters.iter().map(MessageFilter::id).collect()
}

#[test]
fn test_shared_prefix_does_not_leak_matches() {
    let mut table = XPathFilterTable::new();
    let f1 = xpath(&format!("{BODY}/order and {BODY}/order/rush"));
    let f2 = xpath(&format!("{BODY}/order and {BODY}/order/gift"));
    table.add(f1.clone(), "F1").unwrap();
    table.add(f2.clone(), "F2").unwrap();

    assert_eq!(table.get_matching_value(&message("", "<order><rush/></order>")).unwrap(), Some("F1"));
    assert_eq!(table.get_matching_value(&message("", "<order><gift/></order>")).unwrap(), Some("F2"));
    assert_eq!(table.get_matching_value(&message("", "<order/>")).unwrap(), None);

    // One PushRoot per conjunct, shared by both filters.
    assert_eq!(table.matcher().arena().count_kind(OpcodeKind::PushRoot).unwrap(), 2);
}

#[test]
fn test_action_literals_promote_to_one_hashed_branch() {
    let mut table = XPathFilterTable::new();
    for action in ["x", "y", "z"] {
        table.add(xpath(&format!("/s12:Envelope/s12:Header/wsa10:Action = '{}'", action)), action).unwrap();
    }
    let arena = table.matcher().arena();
    assert_eq!(arena.count_kind(OpcodeKind::StringBranch).unwrap(), 1);
    assert_eq!(arena.count_kind(OpcodeKind::StringEquals).unwrap(), 0);
    for action in ["x", "y", "z"] {
        assert_eq!(table.get_matching_value(&message(action, "")).unwrap(), Some(action));
    }
}

#[test]
fn test_identical_actions_are_ambiguous() {
    let mut table = ActionFilterTable::new();
    let f1 = MessageFilter::action("urn:foo");
    let f2 = MessageFilter::action("urn:foo");
    table.add(f1.clone(), 1).unwrap();
    table.add(f2.clone(), 2).unwrap();
    let msg = message("urn:foo", "");

    let err = table.get_matching_filter(&msg).unwrap_err();
    assert!(!err.is_fatal());
    let colliding: BTreeSet<FilterId> = err.colliding_filters().unwrap().iter().map(MessageFilter::id).collect();
    assert_eq!(colliding, [f1.id(), f2.id()].into_iter().collect());

    let mut filters = Vec::new();
    assert!(table.get_matching_filters(&msg, &mut filters).unwrap());
    assert_eq!(filters.len(), 2);
}

#[test]
fn test_removal_leaves_only_live_opcodes() {
    let mut table = XPathFilterTable::new();
    let f1 = xpath(&format!("{BODY}/a/b = 'one' and ({BODY}/c or {BODY}/d)"));
    let f2 = xpath(&format!("{BODY}/a/b = 'two' and ({BODY}/c or {BODY}/e)"));
    table.add(f1.clone(), 1).unwrap();
    table.add(f2.clone(), 2).unwrap();
    table.remove(&f1);

    let msg = message("", "<a><b>two</b></a><e/>");
    assert_eq!(table.get_matching_value(&msg).unwrap(), Some(2));
    assert_eq!(table.get_matching_value(&message("", "<a><b>one</b></a><c/>")).unwrap(), None);

    let arena = table.matcher().arena();
    assert_eq!(arena.reachable().unwrap().len(), arena.live_count());

    table.remove(&f2);
    assert_eq!(table.matcher().arena().live_count(), 1);
}

#[test]
fn test_add_remove_add_is_idempotent() {
    let corpus = [
        message("", "<a>1</a>"),
        message("", "<a>2</a><b/>"),
        message("", "<b/>"),
    ];
    let keep = xpath(&format!("{BODY}/b"));
    let churn = xpath(&format!("{BODY}/a = 1 or {BODY}/b"));

    let mut once = XPathFilterTable::new();
    once.add(keep.clone(), ()).unwrap();
    once.add(churn.clone(), ()).unwrap();

    let mut twice = XPathFilterTable::new();
    twice.add(keep.clone(), ()).unwrap();
    twice.add(churn.clone(), ()).unwrap();
    twice.remove(&churn);
    twice.add(churn.clone(), ()).unwrap();

    for msg in &corpus {
        assert_eq!(matched_ids(&once, msg), matched_ids(&twice, msg));
    }
    assert_eq!(once.matcher().arena().live_count(), twice.matcher().arena().live_count());
}

#[test]
fn test_node_set_ordering_compares_numeric_pairs() {
    let mut table = XPathFilterTable::new();
    let ordered = xpath(&format!("{BODY}/a < {BODY}/b"));
    let sibling = xpath(&format!("{BODY}/a"));
    table.add(ordered.clone(), "ordered").unwrap();
    table.add(sibling.clone(), "sibling").unwrap();
    let msg = message("", "<a>1</a><a>9</a><b>2</b>");
    assert_eq!(matched_ids(&table, &msg), [ordered.id(), sibling.id()].into_iter().collect());
    assert_eq!(matched_ids(&table, &message("", "<a>3</a><b>2</b>")), [sibling.id()].into_iter().collect());
    assert!(ordered.matches(&msg).unwrap());
}

#[test]
fn test_non_node_set_argument_is_a_type_mismatch() {
    let mut table = XPathFilterTable::new();
    table.add(xpath("count('x') = 1"), ()).unwrap();
    let err = table.get_matching_filter(&message("", "<a/>")).unwrap_err();
    assert!(matches!(err, WirequeryError::TypeMismatch(_)));
    assert!(err.is_fatal());

    // Equality between node-sets is defined.
    let mut table = XPathFilterTable::new();
    table.add(xpath(&format!("{BODY}/a = {BODY}/b")), ()).unwrap();
    assert!(table.is_match(&message("", "<a>1</a><b>1</b>")).unwrap());
}

#[test]
fn test_whitespace_text_keeps_its_value() {
    let msg = message("", "<v> </v>");
    assert!(xpath(&format!("{BODY}/v = ' '")).matches(&msg).unwrap());
    assert!(xpath(&format!("string-length({BODY}/v) = 1")).matches(&msg).unwrap());
    assert!(!xpath(&format!("{BODY}/v = ''")).matches(&msg).unwrap());
}

#[test]
fn test_deeply_nested_message_matches() {
    const DEPTH: usize = 100_000;
    let body = format!("{}x{}", "<n>".repeat(DEPTH), "</n>".repeat(DEPTH));
    let msg = message("", &body);
    assert!(xpath("//n = 'x'").matches(&msg).unwrap());
    assert!(xpath(&format!("count(//n) = {}", DEPTH)).matches(&msg).unwrap());
    assert!(!xpath("//n = 'y'").matches(&msg).unwrap());
}

#[test]
fn test_ping_pong_always_scenario() {
    let mut table = MessageFilterTable::new();
    table.add(MessageFilter::action("Ping"), "A").unwrap();
    table.add(MessageFilter::action("Pong"), "B").unwrap();
    assert_eq!(table.get_matching_value(&message("Ping", "")).unwrap(), Some("A"));
    assert_eq!(table.get_matching_value(&message("Pong", "")).unwrap(), Some("B"));

    let always = MessageFilter::actions(Vec::<String>::new());
    table.add(always, "C").unwrap();
    let err = table.get_matching_value(&message("Ping", "")).unwrap_err();
    assert!(err.is_ambiguity());
    assert_eq!(table.get_matching_value(&message("Other", "")).unwrap(), Some("C"));
}

#[test]
fn test_mixed_table_end_to_end() {
    let table = ThreadSafeFilterTable::<&str>::default();
    let address = EndpointAddress::parse("http://orders.example/svc")
        .unwrap()
        .with_header(r#"<t:Tenant xmlns:t="urn:tenant">blue</t:Tenant>"#)
        .unwrap();
    table.add(MessageFilter::endpoint_address(address, true), "blue-tenant").unwrap();
    table
        .add(MessageFilter::and(MessageFilter::action("urn:cancel"), xpath(&format!("{BODY}/order/@id"))), "cancel")
        .unwrap();
    table.with(|t| t.add_with_priority(MessageFilter::match_all(), "fallback", -1)).unwrap();

    let tenant = Message::builder(EnvelopeVersion::Soap12)
        .action("urn:create")
        .to("http://orders.example/svc")
        .header(r#"<x:Tenant xmlns:x="urn:tenant">blue</x:Tenant>"#)
        .build()
        .unwrap();
    assert_eq!(table.get_matching_value(&tenant).unwrap(), Some("blue-tenant"));
    assert_eq!(table.get_matching_value(&message("urn:cancel", "<order id='3'/>")).unwrap(), Some("cancel"));
    assert_eq!(table.get_matching_value(&message("urn:cancel", "<order/>")).unwrap(), Some("fallback"));
    assert_eq!(table.len(), 3);
}

#[test]
fn test_query_table_values() {
    let mut table = MessageQueryTable::new();
    table.add(XPathQuery::new(&format!("count({BODY}/item)")).unwrap(), "items").unwrap();
    table.add(XPathQuery::new(&format!("{BODY}/item[2]")).unwrap(), "second").unwrap();
    let results = table.evaluate_values(&message("", "<item>a</item><item>b</item>")).unwrap();
    assert_eq!(
        results,
        vec![("items", QueryResult::Number(2.0)), ("second", QueryResult::Nodes(vec!["b".to_string()]))]
    );
}

#[test]
fn test_config_round_trip() {
    let config = EngineConfig::builder()
        .max_stack_depth(32)
        .branch_promotion(false)
        .namespace("o", "urn:orders")
        .build()
        .unwrap();
    let json = serde_json::to_string(&config).unwrap();
    let back: EngineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(config, back);

    // Without promotion the literal tests stay sequential and still match.
    let mut table = XPathFilterTable::with_config(config).unwrap();
    for action in ["x", "y"] {
        table.add(xpath(&format!("/s12:Envelope/s12:Header/wsa10:Action = '{}'", action)), action).unwrap();
    }
    assert_eq!(table.matcher().arena().count_kind(OpcodeKind::StringBranch).unwrap(), 0);
    assert_eq!(table.get_matching_value(&message("y", "")).unwrap(), Some("y"));
}

fn filter_source(kind: u8, field: u8, value: u8) -> String {
    let path = format!("{BODY}/r/f{}", field);
    match kind {
        0 => format!("{path} = 'v{value}'"),
        1 => format!("{path} and {BODY}/r/f{value}"),
        2 => format!("{path} = 'v{value}' or count({BODY}/r/*) > {value}"),
        3 => format!("{path}[. = 'v{value}'] and not({BODY}/r/f{})", (field + 1) % 4),
        _ => format!("{path} = {value} or ({BODY}/r/f{value} and {path} != 'v0')"),
    }
}

fn body(fields: &[Option<u8>]) -> String {
    let mut xml = String::from("<r>");
    for (i, value) in fields.iter().enumerate() {
        if let Some(v) = value {
            xml.push_str(&format!("<f{i}>v{v}</f{i}>"));
        }
    }
    xml.push_str("</r>");
    xml
}

proptest! {
    #[test]
    fn tree_matches_sequential_baseline(
        specs in prop::collection::vec((0u8..5, 0u8..4, 0u8..4), 1..24),
        messages in prop::collection::vec(prop::collection::vec(prop::option::of(0u8..4), 4), 1..6),
    ) {
        let mut tree = XPathFilterTable::new();
        let mut baseline = SequentialFilterTable::new();
        let filters: Vec<MessageFilter> = specs.iter().map(|&(k, f, v)| xpath(&filter_source(k, f, v))).collect();
        for (i, filter) in filters.iter().enumerate() {
            tree.add(filter.clone(), i).unwrap();
            baseline.add(filter.clone(), i).unwrap();
        }
        for fields in &messages {
            let msg = message("", &body(fields));
            prop_assert_eq!(matched_ids(&tree, &msg), matched_ids(&baseline, &msg));
        }
        for filter in filters.iter().step_by(3) {
            prop_assert_eq!(tree.remove(filter), baseline.remove(filter));
        }
        for fields in &messages {
            let msg = message("", &body(fields));
            prop_assert_eq!(matched_ids(&tree, &msg), matched_ids(&baseline, &msg));
        }
        let arena = tree.matcher().arena();
        prop_assert_eq!(arena.reachable().unwrap().len(), arena.live_count());
    }
}

proptest! {
    #[test]
    fn parser_does_not_panic_on_random_input(s in ".{0,128}") {
        let _ = MessageFilter::xpath(&s);
    }
}

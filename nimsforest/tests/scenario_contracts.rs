//! End-to-end scenario contracts over an in-process bus: the scoring
//! cascade, drop semantics, reload identity, provider timeouts and
//! malformed traffic.

mod common;

use common::{
    asset_file, identity_script, nim_spec, scoring_script, treehouse_spec, RECORDED_ANSWER,
};
use memory_bus::MemoryBus;
use nimsforest::bus::Bus;
use nimsforest::config::ForestConfig;
use nimsforest::{Forest, Leaf};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn json_leaf(subject: &str, value: serde_json::Value) -> Leaf {
    Leaf::new(subject, serde_json::to_vec(&value).expect("encode"), "test")
}

async fn running_forest(bus: &Arc<MemoryBus>, config: ForestConfig) -> Arc<Forest> {
    common::register_stub_providers();
    let forest = Arc::new(Forest::new(bus.clone() as Arc<dyn Bus>, config));
    forest.start().await.expect("forest starts");
    forest
}

#[tokio::test]
async fn lead_scoring_publishes_the_scored_lead() {
    let script = scoring_script();
    let bus = Arc::new(MemoryBus::new());
    let config = ForestConfig {
        treehouses: vec![treehouse_spec(
            "scoring",
            "contact.created",
            "lead.scored",
            script.path(),
        )],
        ..ForestConfig::default()
    };
    let forest = running_forest(&bus, config).await;

    bus.publish(json_leaf(
        "contact.created",
        json!({
            "id": "c1",
            "email": "e@x",
            "title": "VP Engineering",
            "company_size": 250,
            "industry": "technology",
        }),
    ))
    .await
    .expect("publish");

    let scored = bus.published_on("lead.scored").await;
    assert_eq!(scored.len(), 1);
    assert_eq!(scored[0].source, "transformer:scoring");

    let payload: serde_json::Value = serde_json::from_slice(&scored[0].data).expect("payload");
    assert_eq!(
        payload,
        json!({
            "contact_id": "c1",
            "email": "e@x",
            "score": 85,
            "signals": ["mid_market", "executive", "target_industry"],
        })
    );

    forest.stop().await;
}

#[tokio::test]
async fn qualification_cascades_from_the_scored_lead() {
    let script = scoring_script();
    let prompt = asset_file("Should we pursue {{ email }} with score {{ score }}?");
    let bus = Arc::new(MemoryBus::new());
    let config = ForestConfig {
        treehouses: vec![treehouse_spec(
            "scoring",
            "contact.created",
            "lead.scored",
            script.path(),
        )],
        nims: vec![nim_spec(
            "qualify",
            "lead.scored",
            "lead.qualified",
            prompt.path(),
            "recorded",
            Duration::from_secs(30),
        )],
        ..ForestConfig::default()
    };
    let forest = running_forest(&bus, config).await;

    bus.publish(json_leaf(
        "contact.created",
        json!({
            "id": "c1",
            "email": "e@x",
            "title": "VP Engineering",
            "company_size": 250,
            "industry": "technology",
        }),
    ))
    .await
    .expect("publish");

    let qualified = bus.published_on("lead.qualified").await;
    assert_eq!(qualified.len(), 1);
    assert_eq!(qualified[0].source, "transformer:qualify");

    let payload: serde_json::Value = serde_json::from_slice(&qualified[0].data).expect("payload");
    assert_eq!(payload, json!({"pursue": true, "reason": "strong fit"}));

    forest.stop().await;
}

#[tokio::test]
async fn low_scores_are_dropped_without_output() {
    let script = asset_file(
        r#"
fn process(x) {
    let score = 0;
    if x.company_size > 20 { score += 10; }
    if contains(x.title, "VP") { score += 40; }
    if x.industry == "technology" { score += 15; }
    if score < 20 { return; }
    #{ contact_id: x.id, score: score }
}
"#,
    );
    let bus = Arc::new(MemoryBus::new());
    let config = ForestConfig {
        treehouses: vec![treehouse_spec(
            "scoring",
            "contact.created",
            "lead.scored",
            script.path(),
        )],
        ..ForestConfig::default()
    };
    let forest = running_forest(&bus, config).await;

    bus.publish(json_leaf(
        "contact.created",
        json!({
            "id": "c2",
            "title": "Engineer",
            "company_size": 10,
            "industry": "retail",
        }),
    ))
    .await
    .expect("publish");

    assert!(bus.published_on("lead.scored").await.is_empty());
    forest.stop().await;
}

#[tokio::test]
async fn reload_preserves_unchanged_instances_and_swaps_the_rest() {
    let script = identity_script();
    let bus = Arc::new(MemoryBus::new());

    let spec_a = treehouse_spec("a", "in.a", "out.a", script.path());
    let spec_b = treehouse_spec("b", "in.b", "out.b", script.path());
    let spec_c = treehouse_spec("c", "in.c", "out.c", script.path());

    let config = ForestConfig {
        treehouses: vec![spec_a.clone(), spec_b.clone()],
        ..ForestConfig::default()
    };
    let forest = running_forest(&bus, config).await;

    let report = forest
        .reload(ForestConfig {
            treehouses: vec![spec_a.clone(), spec_c.clone()],
            ..ForestConfig::default()
        })
        .await
        .expect("reload");
    assert!(report.fully_applied());

    // A kept its original subscription, B is gone, C is new.
    assert_eq!(bus.subscribe_call_count("in.a").await, 1);
    assert_eq!(bus.active_subscription_count("in.a").await, 1);
    assert_eq!(bus.active_subscription_count("in.b").await, 0);
    assert_eq!(bus.active_subscription_count("in.c").await, 1);

    // Traffic for A is handled exactly once by the surviving instance.
    bus.publish(json_leaf("in.a", json!({"n": 1})))
        .await
        .expect("publish");
    assert_eq!(bus.published_on("out.a").await.len(), 1);

    forest.stop().await;
}

#[tokio::test(start_paused = true)]
async fn provider_timeouts_drop_the_leaf_and_keep_the_forest_running() {
    let prompt = asset_file("Qualify {{ email }}.");
    let bus = Arc::new(MemoryBus::new());
    let config = ForestConfig {
        nims: vec![nim_spec(
            "qualify",
            "lead.scored",
            "lead.qualified",
            prompt.path(),
            "sleepy",
            Duration::from_millis(100),
        )],
        ..ForestConfig::default()
    };
    let forest = running_forest(&bus, config).await;

    // The sleepy provider answers after 500ms against a 100ms deadline;
    // paused time lets the timeout fire deterministically.
    bus.publish(json_leaf("lead.scored", json!({"email": "e@x", "score": 85})))
        .await
        .expect("publish");

    assert!(bus.published_on("lead.qualified").await.is_empty());

    let statuses = forest.list().await;
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].running);

    forest.stop().await;
}

#[tokio::test]
async fn malformed_input_is_contained_and_the_next_leaf_proceeds() {
    let script = identity_script();
    let bus = Arc::new(MemoryBus::new());
    let config = ForestConfig {
        treehouses: vec![treehouse_spec(
            "echo",
            "contact.created",
            "lead.scored",
            script.path(),
        )],
        ..ForestConfig::default()
    };
    let forest = running_forest(&bus, config).await;

    bus.publish(Leaf::new(
        "contact.created",
        "not-json".as_bytes().to_vec(),
        "test",
    ))
    .await
    .expect("publish");
    assert!(bus.published_on("lead.scored").await.is_empty());
    assert!(forest.list().await[0].running);

    bus.publish(json_leaf("contact.created", json!({"id": "c3"})))
        .await
        .expect("publish");
    let scored = bus.published_on("lead.scored").await;
    assert_eq!(scored.len(), 1);
    let payload: serde_json::Value = serde_json::from_slice(&scored[0].data).expect("payload");
    assert_eq!(payload, json!({"id": "c3"}));

    forest.stop().await;
}

#[tokio::test]
async fn trees_lift_river_records_onto_the_bus() {
    let script = identity_script();
    let bus = Arc::new(MemoryBus::new());
    let config = ForestConfig {
        trees: vec![common::tree_spec(
            "intake",
            "river.contact.>",
            "contact.created",
            script.path(),
        )],
        ..ForestConfig::default()
    };
    let forest = running_forest(&bus, config).await;

    bus.append_river(
        "river.contact.created",
        serde_json::to_vec(&json!({"id": "c1"})).expect("encode"),
    )
    .await;

    let lifted = bus.published_on("contact.created").await;
    assert_eq!(lifted.len(), 1);
    assert_eq!(lifted[0].source, "ingress:intake");

    forest.stop().await;
}

#[test]
fn recorded_answer_is_a_fenced_json_block() {
    assert!(RECORDED_ANSWER.starts_with("```json\n"));
    assert!(RECORDED_ANSWER.trim_end().ends_with("```"));
}

// A parametric plate with a bored hole, evaluated against the stub kernel.
// Shows incremental recompute: edit one parameter, watch only the affected
// chain hit the kernel, then revert and watch everything come from cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use scriber::{
    EngineConfig, EvalOptions, Evaluator, Graph, GraphDoc, InProcessWorkerFactory, KernelBridge,
    NodeTypeRegistry, StubKernel,
};
use serde_json::json;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut graph = Graph::new(NodeTypeRegistry::with_builtins());
    let plate = graph.add_node_with_id(
        "plate",
        "solid::box",
        BTreeMap::from([
            ("width".to_string(), json!(40.0)),
            ("depth".to_string(), json!(20.0)),
            ("height".to_string(), json!(5.0)),
        ]),
    )?;
    let bore = graph.add_node_with_id(
        "bore",
        "solid::cylinder",
        BTreeMap::from([
            ("radius".to_string(), json!(3.0)),
            ("height".to_string(), json!(5.0)),
        ]),
    )?;
    let placed = graph.add_node_with_id(
        "placed_bore",
        "xform::translate",
        BTreeMap::from([("offset".to_string(), json!([20.0, 10.0, 0.0]))]),
    )?;
    let part = graph.add_node_with_id("part", "boolean::difference", BTreeMap::new())?;
    let bounds = graph.add_node_with_id("bounds", "analysis::bounding_box", BTreeMap::new())?;

    graph.bind(&bore, "shape", &placed, "shape")?;
    graph.bind(&plate, "shape", &part, "a")?;
    graph.bind(&placed, "shape", &part, "b")?;
    graph.bind(&part, "shape", &bounds, "shape")?;

    let kernel = StubKernel::with_latency(Duration::from_millis(120));
    let factory = InProcessWorkerFactory::new(Arc::new(kernel));
    let mut evaluator = Evaluator::new(EngineConfig::interactive(), KernelBridge::new(factory))?;

    // Narrate engine activity alongside the runs.
    let mut events = evaluator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!(
                "  event: {}",
                serde_json::to_string(&event).unwrap_or_default()
            );
        }
    });

    println!("First evaluation (everything dirty):");
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await?;
    println!(
        "  run {}: computed={} cache_hits={} dispatched={} in {}ms",
        report.run_id,
        report.stats.computed(),
        report.stats.cache_hits,
        report.stats.dispatched,
        report.duration().num_milliseconds(),
    );
    if let Some(result) = graph.node(&bounds).and_then(|node| node.result()) {
        println!(
            "  part size: {}",
            result.output("size").unwrap_or(&json!(null))
        );
    }

    println!("Widening the bore to r=4 (only its chain recomputes):");
    graph.set_param(&bore, "radius", json!(4.0))?;
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await?;
    println!(
        "  run {}: computed={} cache_hits={} dispatched={}",
        report.run_id,
        report.stats.computed(),
        report.stats.cache_hits,
        report.stats.dispatched,
    );

    println!("Reverting the bore to r=3 (everything comes from cache):");
    graph.set_param(&bore, "radius", json!(3.0))?;
    let report = evaluator
        .evaluate_dirty(&mut graph, &EvalOptions::new())
        .await?;
    println!(
        "  run {}: cache_hits={} dispatched={}",
        report.run_id, report.stats.cache_hits, report.stats.dispatched,
    );

    let doc = GraphDoc::from_graph(&graph);
    println!("Document (YAML):\n{}", doc.to_yaml()?);
    println!("Topology (DOT):\n{}", graph.to_dot());

    evaluator.bridge().shutdown().await;
    Ok(())
}

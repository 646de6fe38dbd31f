//! strata-runner: headless pipeline runner for the Strata analysis engine.
//!
//! Usage:
//!   strata-runner --evidence data/evidence/sample_evidence.json --db strata.db
//!   strata-runner --topic ev-charging --evidence ev.json --seed 7 --top-k 3
//!   strata-runner --topic ev-charging --db strata.db --resume-from matching_patterns
//!   strata-runner --topic ev-charging --db strata.db --bootstrap
//!   strata-runner --topic ev-charging --db strata.db --show
//!   strata-runner --topic ev-charging --db strata.db --force-unlock
//!   strata-runner --evidence ev.json --json > report.json
//!
//! The text generator is configured from STRATA_LLM_* environment variables.
//! Without them every layer degrades to a neutral score and the run still
//! completes.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use strata_core::{
    content::StaticContentStore,
    generator::{HttpTextGenerator, TextGenerator, UnavailableGenerator},
    orchestrator::{Orchestrator, PipelineOptions, PipelineState, PipelineSummary},
    persistence::{ResultStore, TopicResults},
    store::AnalysisStore,
    EngineConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = string_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = string_arg(&args, "--data-dir").unwrap_or("./data");
    let evidence = string_arg(&args, "--evidence");
    let seed = string_arg(&args, "--seed").and_then(|s| s.parse::<u64>().ok());
    let top_k = string_arg(&args, "--top-k").and_then(|s| s.parse::<usize>().ok());
    let resume_from = match string_arg(&args, "--resume-from") {
        Some(name) => Some(
            PipelineState::from_name(name).ok_or_else(|| anyhow!("unknown stage '{name}'"))?,
        ),
        None => None,
    };
    let bootstrap_only = args.iter().any(|a| a == "--bootstrap");
    let show_only = args.iter().any(|a| a == "--show");
    let force_unlock = args.iter().any(|a| a == "--force-unlock");
    let json_output = args.iter().any(|a| a == "--json");

    let config = EngineConfig::load(data_dir)?;
    let content = match evidence {
        Some(path) => StaticContentStore::from_json_file(path)?,
        None => StaticContentStore::new(),
    };

    let mut topics: Vec<String> = args
        .windows(2)
        .filter(|w| w[0] == "--topic")
        .flat_map(|w| w[1].split(',').map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty())
        .collect();
    if topics.is_empty() {
        topics = content.topic_ids();
    }
    if topics.is_empty() {
        return Err(anyhow!("no topics: pass --topic or an --evidence file"));
    }

    if !json_output {
        println!("Strata analysis runner");
        println!("  topics:    {}", topics.join(", "));
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        match seed {
            Some(seed) => println!("  seed:      {seed}"),
            None => println!("  seed:      (fresh per run)"),
        }
        println!();
    }

    let store = if db == ":memory:" {
        AnalysisStore::in_memory()?
    } else {
        AnalysisStore::open(db)?
    };
    store.migrate()?;
    let store = Arc::new(store);

    if force_unlock {
        for topic in &topics {
            match store.force_release_topic_lock(topic)? {
                Some(holder) => println!("  {topic}: released lock held by {holder}"),
                None => println!("  {topic}: not locked"),
            }
        }
        return Ok(());
    }

    if show_only {
        for topic in &topics {
            let results = store.fetch_latest(topic).await?;
            print_results(&results);
        }
        return Ok(());
    }

    let generator: Arc<dyn TextGenerator> = match HttpTextGenerator::from_env() {
        Ok(g) => Arc::new(g),
        Err(e) => {
            log::warn!("text generator not configured ({e}); layers will score neutral");
            Arc::new(UnavailableGenerator)
        }
    };
    let simulation_seed = seed.or(config.simulation.seed);
    let orchestrator = Orchestrator::new(config, Arc::new(content), generator, store.clone())?
        .with_seed(simulation_seed);

    if bootstrap_only {
        for topic in &topics {
            let layers = orchestrator.bootstrap_topic(topic).await?;
            println!("  {topic}: {} layer records", layers.len());
        }
        return Ok(());
    }

    let options = PipelineOptions { resume_from, top_k };
    let outcomes = orchestrator.run_topics(&topics, &options, None).await;
    let mut failures = 0;
    let mut reports = Vec::new();
    for (topic, outcome) in topics.iter().zip(outcomes) {
        match outcome {
            Ok(summary) => {
                if !summary.is_completed() {
                    failures += 1;
                }
                let results = store.fetch_latest(topic).await?;
                if json_output {
                    reports.push(RunReport { summary, results });
                } else {
                    print_summary(&summary);
                    print_results(&results);
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("{topic}: run not started: {e}");
            }
        }
    }
    if json_output {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    if failures > 0 {
        return Err(anyhow!("{failures} topic run(s) did not complete"));
    }
    Ok(())
}

/// One topic's outcome for `--json`.
#[derive(Serialize)]
struct RunReport {
    summary: PipelineSummary,
    results: TopicResults,
}

fn print_summary(summary: &PipelineSummary) {
    println!("=== RUN SUMMARY: {} ===", summary.topic_id);
    println!("  run token:      {}", summary.run_token);
    println!("  final state:    {}", summary.final_state.name());
    if let Some(stage) = summary.resumed_from {
        println!("  resumed from:   {}", stage.name());
    }
    println!("  layers scored:  {}", summary.layers_scored);
    println!("  layers degraded:{:>4}", summary.degraded_layers.len());
    for d in summary.degraded_layers.iter().take(5) {
        println!("    {:<24} {}", d.layer_id, d.reason);
    }
    if summary.degraded_layers.len() > 5 {
        println!("    ... {} more", summary.degraded_layers.len() - 5);
    }
    for note in &summary.degradations {
        println!("  degraded:       {note}");
    }
    if let Some(overall) = summary.overall_score {
        println!("  overall score:  {overall:.3}");
    }
    println!("  patterns:       {} evaluated, {} ranked", summary.patterns_evaluated, summary.top_matches.len());
    println!("  simulations:    {} ({} skipped)", summary.simulations_completed, summary.skipped_simulations.len());
    if let Some(error) = &summary.error {
        println!("  error:          {error}");
    }
    println!();
}

fn print_results(results: &TopicResults) {
    if results.is_empty() {
        println!("  ({}: nothing stored yet)", results.topic_id);
        return;
    }
    println!("=== SEGMENTS: {} ===", results.topic_id);
    for s in &results.segments {
        let flag = if s.insufficient_data { "  (insufficient)" } else { "" };
        println!(
            "  {:<14} value {:.3}  conf {:.3}  weight {:.2}{flag}",
            s.segment_id, s.value, s.confidence, s.weight_among_segments
        );
    }
    if let Some(o) = &results.overall {
        println!("  {:<14} value {:.3}  conf {:.3}", "overall", o.value, o.confidence);
    }

    println!();
    println!("=== PATTERN MATCHES ===");
    let matched: Vec<_> = results.matched().collect();
    if matched.is_empty() {
        println!("  (No pattern matched)");
    }
    for m in matched {
        println!(
            "  {:<28} match {:.2}  conf {:.3}  [{}]",
            m.pattern_name, m.match_score, m.confidence, m.type_tag
        );
        println!("    → {}", m.strategic_response);
        for sim in results.simulations.iter().filter(|s| s.pattern_id == m.pattern_id) {
            println!(
                "    {:<22} mean {:>8.3}  p5 {:>8.3}  p95 {:>8.3}  P(>{}) {:.2}",
                sim.kpi_id, sim.mean, sim.p5, sim.p95, sim.success_reference, sim.probability_positive
            );
        }
    }
    println!();
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

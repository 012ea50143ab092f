//! demo - end-to-end synthetic run of the kiosk analyzer

use anyhow::Result;
use clap::Parser;

use kiosk_vision::profile::{Category, CustomerProfile};
use kiosk_vision::storage::{InMemoryProfileStore, ProfileStore};
use kiosk_vision::synthetic::all_scenes;
use kiosk_vision::{present, Analyzer, AnalyzerConfig, ExecutionMode};

const DEMO_SESSION: &str = "demo:session";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Heuristic scheduling: threaded|inline.
    #[arg(long, default_value = "threaded")]
    mode: ExecutionMode,
    /// Per-call heuristic budget in milliseconds.
    #[arg(long, default_value_t = 500)]
    budget_ms: u64,
    /// Print full profile JSON instead of the summary table.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut config = AnalyzerConfig::default();
    config.runtime.mode = args.mode;
    config.runtime.heuristic_budget_ms = args.budget_ms;
    let analyzer = Analyzer::new(config)?;
    let mut store = InMemoryProfileStore::new();

    stage(&format!("analyzing synthetic scenes ({:?})", args.mode));
    for scene in all_scenes() {
        let profile = present(analyzer.analyze(&scene.frame, &scene.context)?);
        store.record_profile(DEMO_SESSION, &profile)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&profile)?);
        } else {
            print_summary(scene.name, &profile);
        }
    }

    stage(&format!("{} profiles recorded for {}", store.len(), DEMO_SESSION));
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}

fn print_summary(name: &str, profile: &CustomerProfile) {
    println!(
        "{name}: {:?} overall={:.2} fallback={}",
        profile.state, profile.overall_confidence, profile.fallback_used
    );
    for category in Category::ALL {
        let field = profile.field(category);
        println!(
            "  {:<16} {:<12} {:.2} ({:?})",
            category.as_str(),
            field.label,
            field.confidence,
            field.status
        );
    }
}

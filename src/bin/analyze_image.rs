//! analyze_image - run the kiosk analyzer over one still image.
//!
//! Prints the presented profile as JSON on stdout. Stage progress goes to
//! stderr so the output can be piped.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use kiosk_vision::{
    present, Analyzer, DetectionContext, Frame, KioskConfig, NormRect, PoseKeypoints,
    ProfileStore, SqliteProfileStore,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Analyze one kiosk camera still")]
struct Args {
    /// JPEG or PNG image to analyze.
    #[arg(long)]
    image: PathBuf,

    /// Face box reported by the face detector, normalized `x,y,w,h`.
    #[arg(long, conflicts_with = "face_detected")]
    face: Option<String>,

    /// A face was detected but no box is available.
    #[arg(long)]
    face_detected: bool,

    /// A pose was detected but no keypoints are available.
    #[arg(long)]
    pose_detected: bool,

    /// Pose keypoints as JSON (implies --pose-detected).
    #[arg(long)]
    pose: Option<PathBuf>,

    /// Record the profile for this kiosk session.
    #[arg(long)]
    session: Option<String>,

    /// Include per-chain reports (tier, fallback, evidence) in the output.
    #[arg(long)]
    explain: bool,

    /// UI mode: auto|plain|pretty
    #[arg(long, default_value = "auto")]
    ui: String,
}

fn parse_face(raw: &str) -> Result<NormRect> {
    let parts = raw
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid --face '{}'", raw))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(NormRect::new(*x, *y, *w, *h)),
        _ => Err(anyhow!("--face expects x,y,w,h, got '{}'", raw)),
    }
}

fn load_pose(path: &Path) -> Result<PoseKeypoints> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pose file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid pose JSON in {}", path.display()))
}

fn detection_context(args: &Args) -> Result<DetectionContext> {
    let mut ctx = DetectionContext::none();
    if let Some(face) = &args.face {
        ctx = ctx.with_face(Some(parse_face(face)?));
    } else if args.face_detected {
        ctx = ctx.with_face(None);
    }
    if let Some(path) = &args.pose {
        ctx = ctx.with_pose(Some(load_pose(path)?));
    } else if args.pose_detected {
        ctx = ctx.with_pose(None);
    }
    Ok(ctx)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let config = {
        let _stage = ui.stage("Load configuration");
        KioskConfig::load()?
    };
    let ctx = detection_context(&args)?;
    let frame = {
        let mut stage = ui.stage("Decode image");
        let frame = Frame::open(&args.image)?;
        stage.detail(format!("{}x{}", frame.width(), frame.height()));
        frame
    };
    let analyzer = Analyzer::new(config.analyzer.clone())?;
    let analysis = {
        let mut stage = ui.stage("Analyze frame");
        let analysis = analyzer.analyze_detailed(&frame, &ctx)?;
        stage.detail(format!(
            "{:?}, overall {:.2}{}",
            analysis.profile.state,
            analysis.profile.overall_confidence,
            if analysis.profile.fallback_used { ", fallback used" } else { "" }
        ));
        analysis
    };
    let profile = present(analysis.profile);

    if let Some(session_id) = &args.session {
        let _stage = ui.stage("Record profile");
        let mut store = SqliteProfileStore::open(&config.db_path)?;
        let stored = store.record_profile(session_id, &profile)?;
        log::info!(
            "recorded profile {} for session {} (digest {})",
            stored.id,
            session_id,
            &stored.digest[..12]
        );
    }

    let output = if args.explain {
        serde_json::json!({ "profile": profile, "reports": analysis.reports })
    } else {
        serde_json::to_value(&profile)?
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

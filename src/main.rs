use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use signer::capture::PathCapture;
use signer::config::EngineConfig;
use signer::export::{DocumentExporter, SourceDocument};
use signer::geometry::{DisplayContext, Point, Rect};
use signer::overlay::{DrawnSignature, OverlayContent, OverlayStore, TextContent};
use signer::{pdf, raster};

#[derive(Parser)]
#[command(name = "signer", about = "Places signatures on a PDF from a JSON placement plan")]
struct Args {
    /// Input PDF
    input: String,

    /// Placement plan (JSON)
    #[arg(long)]
    plan: String,

    /// Engine settings (JSON); omitted keys keep their defaults
    #[arg(long)]
    config: Option<String>,

    /// Output PDF; defaults to the input name with the configured suffix, next
    /// to the input
    #[arg(short, long)]
    output: Option<String>,
}

/// Placements as a browser session would have recorded them, in display
/// pixels at `display_scale`.
#[derive(Deserialize)]
struct Plan {
    #[serde(default = "unit_scale")]
    display_scale: f64,
    overlays: Vec<PlannedOverlay>,
}

fn unit_scale() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct PlannedOverlay {
    page: u32,
    x: f64,
    y: f64,
    #[serde(flatten)]
    content: PlannedContent,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlannedContent {
    Text {
        text: String,
        font_size: Option<f64>,
    },
    Drawn {
        /// Raw pad coordinates, one list of `[x, y]` pairs per stroke.
        strokes: Vec<Vec<[f64; 2]>>,
        #[serde(default = "unit_scale")]
        scale: f64,
    },
}

/// `file_name` placed in the directory holding `input`.
fn default_output_path(input: &str, file_name: &str) -> PathBuf {
    match Path::new(input).parent() {
        Some(dir) => dir.join(file_name),
        None => PathBuf::from(file_name),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            EngineConfig::from_json(&json).with_context(|| format!("parsing {}", path))?
        }
        None => EngineConfig::default(),
    };
    let plan: Plan = serde_json::from_str(
        &fs::read_to_string(&args.plan).with_context(|| format!("reading {}", args.plan))?,
    )
    .with_context(|| format!("parsing {}", args.plan))?;

    println!("  Input:  {}", args.input);
    println!("  Plan:   {} ({} overlays)", args.plan, plan.overlays.len());
    println!();

    println!("[1/3] Reading document...");
    let bytes = fs::read(&args.input).with_context(|| format!("reading {}", args.input))?;
    let doc = pdf::load(&bytes)?;
    let sizes = pdf::page_sizes(&doc);
    println!("  {} pages", sizes.len());

    let mut store = OverlayStore::new(config.min_overlay_size);
    for (i, size) in sizes.iter().enumerate() {
        store.set_page_context(i as u32 + 1, DisplayContext::new(*size, plan.display_scale));
    }

    println!("[2/3] Placing signatures...");
    for (i, planned) in plan.overlays.into_iter().enumerate() {
        if planned.page == 0 {
            bail!("overlay {} in plan: pages are numbered from 1", i + 1);
        }
        let origin = Point::new(planned.x, planned.y);
        let (geometry, content) = match planned.content {
            PlannedContent::Text { text, font_size } => {
                let font_size = font_size.unwrap_or(config.default_font_size);
                let (font_size, size) =
                    config.fit_text(&text, font_size, store.page_bounds(planned.page));
                (
                    Rect::new(origin, size),
                    OverlayContent::Text(TextContent { text, font_size }),
                )
            }
            PlannedContent::Drawn { strokes, scale } => {
                let mut capture = PathCapture::new(config.capture_padding);
                for stroke in &strokes {
                    let mut points = stroke.iter().map(|&[x, y]| Point::new(x, y));
                    if let Some(first) = points.next() {
                        capture.begin(first);
                        points.for_each(|p| capture.extend(p));
                        capture.end();
                    }
                }
                let path = capture
                    .finish()
                    .with_context(|| format!("overlay {} in plan", i + 1))?;
                let preview = raster::render_preview(&path, &config)
                    .map_err(|err| warn!(%err, "no preview for overlay {}", i + 1))
                    .ok();
                (
                    Rect::new(origin, path.size().scaled(scale)),
                    OverlayContent::Drawn(DrawnSignature { path, preview }),
                )
            }
        };
        let id = store.create(planned.page, geometry, content);
        println!("  {} on page {} ✓", id, planned.page);
    }

    println!("[3/3] Embedding and saving...");
    let source = SourceDocument {
        bytes,
        file_name: args.input.clone(),
    };
    let output = DocumentExporter::new(config).export(&source, &store)?;
    for warning in &output.warnings {
        println!("  warning: {}", warning);
    }
    let out_path = args
        .output
        .map(PathBuf::from)
        .unwrap_or_else(|| default_output_path(&args.input, &output.file_name));
    fs::write(&out_path, &output.bytes)
        .with_context(|| format!("writing {}", out_path.display()))?;

    println!("Done: {} ({} pages)", out_path.display(), output.page_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lands_next_to_input() {
        assert_eq!(
            default_output_path("docs/contracts/a.pdf", "a-signed.pdf"),
            PathBuf::from("docs/contracts/a-signed.pdf")
        );
        assert_eq!(default_output_path("a.pdf", "a-signed.pdf"), PathBuf::from("a-signed.pdf"));
    }
}

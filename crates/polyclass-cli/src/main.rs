/// Batch deployment job: classifies every polygon of a GeoJSON layer against
/// a directory of GeoTIFF tiles and writes the labelled layer plus a run
/// report. Nothing is written unless the whole run succeeds.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use polyclass_core::config::parse_class_list;
use polyclass_core::{BandStatsModel, Classifier, Pipeline, PipelineConfig, RasterCatalog, Resampling, VectorLayer};

const OUTPUT_NAME: &str = "classified.geojson";
const REPORT_NAME: &str = "report.json";

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "deploy-classifier",
    about = "Classify GeoJSON polygons with an image-chip classifier"
)]
struct Args {
    /// GeoJSON file, or a directory holding exactly one *.geojson
    #[arg(long)]
    geojson: PathBuf,

    /// Model file, or a directory holding exactly one *.json
    #[arg(long)]
    model: PathBuf,

    /// Directory of GeoTIFF tiles
    #[arg(long)]
    images: PathBuf,

    /// Output directory (created if absent)
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Base configuration (JSON); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated class names, in model output order
    #[arg(long)]
    classes: Option<String>,

    /// Smallest accepted bounding box side in pixels
    #[arg(long)]
    min_side_dim: Option<u32>,

    /// Largest accepted bounding box side in pixels ("None" = model input side)
    #[arg(long, value_parser = parse_max_side)]
    max_side_dim: Option<MaxSide>,

    /// Bit depth chips are cast to
    #[arg(long)]
    bit_depth: Option<u8>,

    /// Maximum number of chips held in memory at once
    #[arg(long)]
    chips_in_mem: Option<usize>,

    /// Resampling kernel: nearest or bilinear
    #[arg(long)]
    resampling: Option<Resampling>,

    /// Zero chip pixels outside the polygon
    #[arg(long)]
    mask: bool,

    /// Also write the winning class probability under this property
    #[arg(long)]
    confidence_property: Option<String>,
}

/// `--max-side-dim` value; `None` defers to the model.
#[derive(Debug, Clone, Copy)]
struct MaxSide(Option<u32>);

fn parse_max_side(raw: &str) -> Result<MaxSide, String> {
    if raw.eq_ignore_ascii_case("none") {
        return Ok(MaxSide(None));
    }
    raw.parse::<u32>()
        .map(|v| MaxSide(Some(v)))
        .map_err(|e| format!("expected a pixel count or None: {e}"))
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut cfg: PipelineConfig = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Cannot read {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };

        if let Some(raw) = &self.classes {
            cfg.class_names = parse_class_list(raw);
        }
        if let Some(v) = self.min_side_dim {
            cfg.min_side_dim = v;
        }
        if let Some(MaxSide(v)) = self.max_side_dim {
            cfg.max_side_dim = v;
        }
        if let Some(v) = self.bit_depth {
            cfg.bit_depth = v;
        }
        if let Some(v) = self.chips_in_mem {
            cfg.chips_in_mem = v;
        }
        if let Some(v) = self.resampling {
            cfg.resampling = v;
        }
        if self.mask {
            cfg.mask_outside_polygon = true;
        }
        if let Some(key) = &self.confidence_property {
            cfg.confidence_property = Some(key.clone());
        }
        Ok(cfg)
    }
}

/// A file path as given, or the single file with `ext` inside a directory.
fn single_input(path: &Path, ext: &str) -> Result<PathBuf> {
    if !path.is_dir() {
        return Ok(path.to_path_buf());
    }
    let mut found: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Cannot list {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case(ext)))
        .collect();
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => bail!("no *.{ext} file in {}", path.display()),
        n => bail!("{n} *.{ext} files in {}, expected exactly one", path.display()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = args.pipeline_config()?;

    let model_path = single_input(&args.model, "json")?;
    let model = BandStatsModel::load(&model_path)
        .with_context(|| format!("Failed to load model {}", model_path.display()))?;
    let shape = model.input_shape();
    info!(
        "model {}: {} bands, {}x{} px, {} classes",
        model_path.display(),
        shape.bands,
        shape.side,
        shape.side,
        model.num_classes()
    );

    let geojson_path = single_input(&args.geojson, "geojson")?;
    let layer = VectorLayer::read(&geojson_path)
        .with_context(|| format!("Failed to read {}", geojson_path.display()))?;
    info!("{} features from {}", layer.len(), geojson_path.display());

    let catalog = RasterCatalog::from_dir(&args.images)
        .with_context(|| format!("Failed to load tiles from {}", args.images.display()))?;
    info!("{} tiles from {}", catalog.len(), args.images.display());

    let pipeline = Pipeline::new(&model, config).context("Invalid configuration")?;
    let out = pipeline.run(layer, &catalog).context("Classification failed")?;

    fs::create_dir_all(&args.output)
        .with_context(|| format!("Cannot create {}", args.output.display()))?;
    let output_path = args.output.join(OUTPUT_NAME);
    out.layer
        .write(&output_path)
        .with_context(|| format!("Failed to write {}", output_path.display()))?;
    let report_path = args.output.join(REPORT_NAME);
    fs::write(&report_path, serde_json::to_string_pretty(&out.report)?)
        .with_context(|| format!("Failed to write {}", report_path.display()))?;

    for (reason, count) in out.report.dropped.iter() {
        info!("  dropped {count} ({reason})");
    }
    info!(
        "wrote {} classified features to {}",
        out.report.classified,
        output_path.display()
    );
    Ok(())
}

//! Diagnostic previewer: writes the first N extracted chips as PNGs so the
//! size filter and crop windows can be checked by eye. Not part of the main
//! pipeline.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use polyclass_core::chip::{Chip, ChipExtractor};
use polyclass_core::error::DropTally;
use polyclass_core::size_filter::SizeFilter;
use polyclass_core::{PipelineConfig, RasterCatalog, Resampling, VectorLayer};

#[derive(Parser, Debug)]
#[command(name = "chip_preview", about = "Write PNG previews of extracted chips")]
struct Args {
    /// GeoJSON layer to cut chips for
    #[arg(long)]
    geojson: PathBuf,

    /// Directory of GeoTIFF tiles
    #[arg(long)]
    images: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "data/debug/chips")]
    output: PathBuf,

    /// Chip side in pixels (the model input side)
    #[arg(long, default_value = "150")]
    side: usize,

    /// Number of chips to write
    #[arg(short = 'n', long, default_value = "16")]
    count: usize,

    /// Job configuration (JSON) to preview with; defaults otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resampling kernel; overrides the configuration
    #[arg(long)]
    resampling: Option<Resampling>,

    /// Zero pixels outside the polygon
    #[arg(long)]
    mask: bool,
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
        if let Some(v) = self.resampling {
            cfg.resampling = v;
        }
        if self.mask {
            cfg.mask_outside_polygon = true;
        }
        cfg.validate().context("Invalid configuration")?;
        Ok(cfg)
    }
}

/// First three bands as RGB, or band 0 as gray for fewer bands.
fn to_rgb(chip: &Chip) -> image::RgbImage {
    let norm = chip.normalized();
    let n = chip.side * chip.side;
    let px = |b: usize, i: usize| (norm[b * n + i].clamp(0.0, 1.0) * 255.0) as u8;
    image::RgbImage::from_fn(chip.side as u32, chip.side as u32, |c, r| {
        let i = r as usize * chip.side + c as usize;
        if chip.bands >= 3 {
            image::Rgb([px(0, i), px(1, i), px(2, i)])
        } else {
            let g = px(0, i);
            image::Rgb([g, g, g])
        }
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let layer = VectorLayer::read(&args.geojson)
        .with_context(|| format!("Failed to read {}", args.geojson.display()))?;
    let catalog = RasterCatalog::from_dir(&args.images)
        .with_context(|| format!("Failed to load tiles from {}", args.images.display()))?;
    fs::create_dir_all(&args.output)?;

    let cfg = args.pipeline_config()?;
    let filter = SizeFilter::new(&catalog, cfg.size_constraint(args.side as u32), &cfg.tile_property);
    let mut dropped = DropTally::default();
    let survivors = filter.retain(layer.features, &mut dropped);
    let extractor =
        ChipExtractor::new(args.side, cfg.bit_depth, cfg.resampling).with_mask(cfg.mask_outside_polygon);

    let mut written = 0usize;
    for survivor in &survivors {
        if written == args.count {
            break;
        }
        let chip = match extractor.extract(&survivor.feature, &survivor.placement) {
            Ok(chip) => chip,
            Err(err) => {
                warn!("{err}");
                continue;
            }
        };
        let path = args.output.join(format!("chip_{:03}_{}.png", written, survivor.feature.id));
        to_rgb(&chip)
            .save(&path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        written += 1;
    }

    info!(
        "wrote {written} previews to {} ({} survivors, {} dropped by size filter)",
        args.output.display(),
        survivors.len(),
        dropped.total()
    );
    Ok(())
}

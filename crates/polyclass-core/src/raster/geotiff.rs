//! GeoTIFF → [`RasterTile`] reader built on the pure-Rust `tiff` decoder.
//!
//! Only chunky (pixel-interleaved) images are supported; samples are
//! de-interleaved into band-sequential order on load. Geo-referencing comes
//! from `ModelTransformationTag` or `ModelPixelScaleTag` + `ModelTiepointTag`.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use log::warn;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;

use super::{GeoTransform, RasterTile};
use crate::error::{PipelineError, PipelineResult};

/// Decode a whole GeoTIFF into memory. The tile id is the file stem.
pub fn read_tile(path: &Path) -> PipelineResult<RasterTile> {
    let raster_err = |source| PipelineError::Raster { path: path.to_path_buf(), source };
    let layout_err = |reason: String| PipelineError::RasterLayout { path: path.to_path_buf(), reason };

    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(raster_err)?;
    let (width, height) = decoder.dimensions().map_err(raster_err)?;
    let color = decoder.colortype().map_err(raster_err)?;
    let bands = samples_per_pixel(color)
        .ok_or_else(|| layout_err(format!("unsupported colour type {color:?}")))?;

    let transform = read_transform(&mut decoder).unwrap_or_else(|| {
        warn!("{}: no geo-referencing tags, using the pixel grid", path.display());
        GeoTransform::identity()
    });

    let image = decoder.read_image().map_err(raster_err)?;
    let (interleaved, bit_depth) =
        to_f32(image, bits_per_sample(color)).ok_or_else(|| layout_err("unsupported sample format".into()))?;

    let (width, height) = (width as usize, height as usize);
    if interleaved.len() != width * height * bands {
        return Err(layout_err(format!(
            "expected {} samples for {width}x{height}x{bands}, decoded {}",
            width * height * bands,
            interleaved.len()
        )));
    }

    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    Ok(RasterTile {
        id,
        bands,
        width,
        height,
        bit_depth,
        transform,
        data: deinterleave(&interleaved, bands, width * height),
    })
}

fn samples_per_pixel(color: ColorType) -> Option<usize> {
    match color {
        ColorType::Gray(_) => Some(1),
        ColorType::GrayA(_) => Some(2),
        ColorType::RGB(_) | ColorType::YCbCr(_) => Some(3),
        ColorType::RGBA(_) | ColorType::CMYK(_) => Some(4),
        ColorType::Multiband { num_samples, .. } => Some(num_samples as usize),
        _ => None,
    }
}

fn bits_per_sample(color: ColorType) -> u8 {
    match color {
        ColorType::Gray(b)
        | ColorType::GrayA(b)
        | ColorType::RGB(b)
        | ColorType::YCbCr(b)
        | ColorType::RGBA(b)
        | ColorType::CMYK(b) => b,
        ColorType::Multiband { bit_depth, .. } => bit_depth,
        _ => 8,
    }
}

/// Widen decoded samples to f32. Integer sources keep their bit depth for
/// later rescaling; float sources report `None`.
fn to_f32(image: DecodingResult, bits: u8) -> Option<(Vec<f32>, Option<u8>)> {
    let out = match image {
        DecodingResult::U8(v) => (v.into_iter().map(f32::from).collect(), Some(bits.min(8))),
        DecodingResult::U16(v) => (v.into_iter().map(f32::from).collect(), Some(bits.min(16))),
        DecodingResult::U32(v) => (v.into_iter().map(|x| x as f32).collect(), Some(bits.min(32))),
        DecodingResult::I8(v) => (v.into_iter().map(f32::from).collect(), Some(bits.min(7))),
        DecodingResult::I16(v) => (v.into_iter().map(f32::from).collect(), Some(bits.min(15))),
        DecodingResult::F32(v) => (v, None),
        DecodingResult::F64(v) => (v.into_iter().map(|x| x as f32).collect(), None),
        _ => return None,
    };
    Some(out)
}

fn deinterleave(interleaved: &[f32], bands: usize, pixels: usize) -> Vec<f32> {
    let mut data = vec![0.0f32; interleaved.len()];
    for (p, px) in interleaved.chunks_exact(bands).enumerate() {
        for (b, &v) in px.iter().enumerate() {
            data[b * pixels + p] = v;
        }
    }
    data
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(Some(value)) = decoder.find_tag(Tag::ModelTransformationTag) {
        if let Ok(m) = value.into_f64_vec() {
            if m.len() >= 8 {
                return Some(GeoTransform::new([m[3], m[0], m[1], m[7], m[4], m[5]]));
            }
        }
    }

    let scale = decoder.find_tag(Tag::ModelPixelScaleTag).ok()??.into_f64_vec().ok()?;
    let tie = decoder.find_tag(Tag::ModelTiepointTag).ok()??.into_f64_vec().ok()?;
    if scale.len() < 2 || tie.len() < 6 {
        return None;
    }
    // Tiepoint (i, j, k) in raster space pins (x, y, z) in model space.
    let (i, j, x, y) = (tie[0], tie[1], tie[3], tie[4]);
    Some(GeoTransform::new([
        x - i * scale[0],
        scale[0],
        0.0,
        y + j * scale[1],
        0.0,
        -scale[1],
    ]))
}

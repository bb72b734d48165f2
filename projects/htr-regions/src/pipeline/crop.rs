// Crop processor: rotate + crop the original image and carry regions along
//
// The working image is always rebuilt from the preserved original, so crop
// boxes are interpreted in the original's (orientation-corrected) pixel grid.

use crate::error::PipelineError;
use crate::pipeline::geometry::remap_regions;
use crate::pipeline::types::{CropBox, CropParams, Status};
use crate::store::Storage;
use image::{DynamicImage, ImageDecoder, ImageError, ImageFormat, ImageReader, Rgba};
use imageproc::geometric_transformations::{rotate, Interpolation};
use std::io::Cursor;

const FILL: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Decodes an image and applies its EXIF orientation.
pub fn decode_oriented(image_name: &str, bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    let wrap = |e: ImageError| PipelineError::image(image_name, e);

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| wrap(ImageError::IoError(e)))?;
    let mut decoder = reader.into_decoder().map_err(wrap)?;
    let orientation = decoder.orientation().map_err(wrap)?;
    let mut img = DynamicImage::from_decoder(decoder).map_err(wrap)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Fits the requested box inside a `width` x `height` image.
///
/// The origin is clamped onto the image and the size shrunk until the box
/// fits. Boxes are never rejected; the result is at least 1x1.
pub fn clamp_box(b: &CropBox, width: u32, height: u32) -> CropParams {
    let (img_w, img_h) = (width.max(1) as i32, height.max(1) as i32);

    let x = b.x.clamp(0.0, (img_w - 1) as f64).round() as i32;
    let y = b.y.clamp(0.0, (img_h - 1) as f64).round() as i32;
    let w = (b.w.round() as i32).clamp(1, img_w - x);
    let h = (b.h.round() as i32).clamp(1, img_h - y);

    CropParams {
        x,
        y,
        w,
        h,
        angle: b.angle,
    }
}

/// Rotates the image visually clockwise by `params.angle` about the box
/// center, then cuts the axis-aligned box out of it.
pub fn rotate_and_crop(img: &DynamicImage, params: &CropParams) -> DynamicImage {
    let (x, y, w, h) = (
        params.x as u32,
        params.y as u32,
        params.w as u32,
        params.h as u32,
    );
    if params.angle == 0.0 {
        return img.crop_imm(x, y, w, h);
    }

    let (cx, cy) = params.center();
    let rotated = rotate(
        &img.to_rgba8(),
        (cx as f32, cy as f32),
        params.angle.to_radians() as f32,
        Interpolation::Bicubic,
        FILL,
    );
    let cropped = DynamicImage::ImageRgba8(rotated).crop_imm(x, y, w, h);

    if img.color().has_alpha() {
        cropped
    } else {
        DynamicImage::ImageRgb8(cropped.to_rgb8())
    }
}

/// Encodes in the format implied by the image name's extension.
pub fn encode_for_name(image_name: &str, img: &DynamicImage) -> Result<Vec<u8>, PipelineError> {
    let wrap = |e: ImageError| PipelineError::image(image_name, e);
    let format = ImageFormat::from_path(image_name).map_err(wrap)?;

    let mut buf = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut buf, format),
        _ => img.write_to(&mut buf, format),
    }
    .map_err(wrap)?;
    Ok(buf.into_inner())
}

/// Crops `image_name` from its original and remaps its regions into the new
/// crop space.
///
/// Pixels and record are both computed before anything is written. If the
/// record cannot be written the previous working image is put back.
pub fn perform_crop(
    storage: &Storage,
    image_name: &str,
    crop_box: &CropBox,
) -> Result<CropParams, PipelineError> {
    if image_name.is_empty() {
        return Err(PipelineError::Validation("image_name is required".into()));
    }
    let finite = [crop_box.x, crop_box.y, crop_box.w, crop_box.h, crop_box.angle]
        .iter()
        .all(|v| v.is_finite());
    if !finite {
        return Err(PipelineError::Validation(format!(
            "crop box for {image_name} has non-finite values"
        )));
    }

    let original = storage.images.load_original(image_name)?;
    let img = decode_oriented(image_name, &original)?;
    let params = clamp_box(crop_box, img.width(), img.height());
    let cropped = rotate_and_crop(&img, &params);
    let encoded = encode_for_name(image_name, &cropped)?;

    let mut replaced: Option<Vec<u8>> = None;
    let result = storage.annotations.update(image_name, |record| {
        let remapped = remap_regions(&record.regions, record.crop_params.as_ref(), &params);

        replaced = Some(storage.images.load_working(image_name).unwrap_or_default());
        storage.images.save_working(image_name, &encoded)?;

        record.regions = remapped;
        record.crop_params = Some(params);
        record.status = Status::Cropped;
        Ok::<_, PipelineError>(())
    });

    if let Err(e) = result {
        if let Some(previous) = replaced.filter(|bytes| !bytes.is_empty()) {
            if let Err(restore) = storage.images.save_working(image_name, &previous) {
                tracing::error!(
                    "Could not restore working image {} after failed crop: {}",
                    image_name,
                    restore
                );
            }
        }
        return Err(e);
    }

    tracing::info!(
        "Cropped {} to {}x{} at ({}, {}), angle {}",
        image_name,
        params.w,
        params.h,
        params.x,
        params.y,
        params.angle
    );
    Ok(params)
}

// Annotation data model
//
// These structs are persisted as one JSON document per image and travel
// unchanged through the HTTP layer.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Integer pixel coordinate in some crop space.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Closed polygon over an image. The first point is not repeated at the end.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    #[serde(default)]
    pub points: Vec<Point>,
}

impl Region {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle from (x, y) with size (w, h).
    pub fn rect(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self::new(vec![
            Point::new(x, y),
            Point::new(x + w, y),
            Point::new(x + w, y + h),
            Point::new(x, y + h),
        ])
    }
}

/// Crop box as sent by the cropper, in the displayed original's pixel space.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CropBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    /// Positive is a visually clockwise rotation of the image.
    #[serde(default)]
    pub angle: f64,
}

/// Clamped crop actually applied to an image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CropParams {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    #[serde(default)]
    pub angle: f64,
}

impl CropParams {
    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.w as f64 / 2.0,
            self.y as f64 + self.h as f64 / 2.0,
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Uncropped,
    Cropped,
    Segmented,
    Partial,
}

/// Workflow step shown next to an image in listings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Crop,
    Segment,
}

/// Annotation state of one image.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Record {
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub regions: Vec<Region>,
    /// Recognized text keyed by region index. Keys of removed regions may linger.
    #[serde(default)]
    pub texts: BTreeMap<String, String>,
    #[serde(default)]
    pub crop_params: Option<CropParams>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_params: Option<serde_json::Value>,
}

impl Record {
    pub fn empty(image_name: &str) -> Self {
        Self {
            image_name: image_name.to_string(),
            ..Self::default()
        }
    }

    /// Text recognized for the region at `index`, if any.
    pub fn text_for(&self, index: usize) -> Option<&str> {
        self.texts.get(&index.to_string()).map(String::as_str)
    }

    pub fn listing_status(record: Option<&Record>) -> ListingStatus {
        match record {
            Some(r) if !r.regions.is_empty() || r.status != Status::Uncropped => {
                ListingStatus::Segment
            }
            _ => ListingStatus::Crop,
        }
    }
}

/// Partial update of a [`Record`]. Only fields present in the payload are written.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub regions: Option<Vec<Region>>,
    #[serde(default)]
    pub texts: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub processing_params: Option<serde_json::Value>,
    /// `Some(None)` is an explicit `"crop_params": null`.
    #[serde(default, deserialize_with = "present")]
    pub crop_params: Option<Option<CropParams>>,
}

impl RecordPatch {
    pub fn apply_to(self, record: &mut Record) {
        if let Some(regions) = self.regions {
            record.regions = regions;
        }
        if let Some(texts) = self.texts {
            record.texts = texts;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(params) = self.processing_params {
            record.processing_params = Some(params);
        }
        if let Some(crop) = self.crop_params {
            record.crop_params = crop;
        }
    }
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Settings for detection passes, as sent by the project page.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionSettings {
    /// Confidence percent, 0..100.
    pub threshold: f64,
    /// Simplification distance in pixels; 0 disables it.
    pub simplification: f64,
    pub merge_overlapping: bool,
    /// Bounding-box overlap percent, 0..100.
    pub overlap_threshold: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            threshold: 50.0,
            simplification: 0.0,
            merge_overlapping: false,
            overlap_threshold: 50.0,
        }
    }
}

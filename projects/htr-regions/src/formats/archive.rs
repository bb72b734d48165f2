// ZIP export and import of whole projects
//
// Export layout: every project image, `<stem>.xml` PAGE files for annotated
// images and a `METS.xml` manifest, all at the archive root.

use crate::error::{FormatError, StoreError};
use crate::formats::mets::{write_mets, MetsEntry};
use crate::formats::page_xml::{parse_page_xml, write_page_xml};
use crate::pipeline::types::{Record, Status};
use crate::store::blob::MemoryFile;
use crate::store::images::is_allowed_image;
use crate::store::Storage;
use chrono::{SecondsFormat, Utc};
use image::metadata::Orientation;
use image::{ImageDecoder, ImageReader};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ImportSummary {
    pub project: String,
    pub imported: Vec<String>,
}

fn stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

/// Displayed width and height, swapped for quarter-turn EXIF orientations.
pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), FormatError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let (w, h) = decoder.dimensions();
    let orientation = decoder.orientation()?;
    Ok(match orientation {
        Orientation::Rotate90
        | Orientation::Rotate270
        | Orientation::Rotate90FlipH
        | Orientation::Rotate270FlipH => (h, w),
        _ => (w, h),
    })
}

fn zip_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Packs a project into a ZIP archive held in memory.
pub fn export_project(storage: &Storage, project_name: &str) -> Result<Vec<u8>, FormatError> {
    let project = storage.projects.get(project_name)?;
    if project.images.is_empty() {
        return Err(FormatError::invalid_format(format!(
            "Project {project_name} has no images"
        )));
    }

    let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut entries = Vec::new();

    for (idx, image_name) in project.images.iter().enumerate() {
        let bytes = match storage.images.load_working(image_name) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!("Skipping missing image {} in export", image_name);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        zip.start_file(image_name.as_str(), zip_options())?;
        zip.write_all(&bytes)?;

        let page_xml = match storage.annotations.load_existing(image_name)? {
            Some(record) => {
                let (width, height) = image_dimensions(&bytes)?;
                let xml = write_page_xml(image_name, width, height, &record, &created)?;
                let xml_name = format!("{}.xml", stem(image_name));
                zip.start_file(xml_name.as_str(), zip_options())?;
                zip.write_all(xml.as_bytes())?;
                Some(xml_name)
            }
            None => None,
        };

        entries.push(MetsEntry {
            id: format!("file_{idx}"),
            image: image_name.clone(),
            page_xml,
        });
    }

    let mets = write_mets(&entries)?;
    zip.start_file("METS.xml", zip_options())?;
    zip.write_all(mets.as_bytes())?;

    let cursor = zip.finish()?;
    tracing::info!(
        "Exported project {} with {} images",
        project_name,
        entries.len()
    );
    Ok(cursor.into_inner())
}

fn unique_project_name(storage: &Storage, base: &str) -> String {
    let base = if base.trim().is_empty() { "import" } else { base.trim() };
    let mut candidate = base.to_string();
    let mut n = 1;
    while storage.projects.get(&candidate).is_ok() {
        candidate = format!("{base}_{n}");
        n += 1;
    }
    candidate
}

/// Unpacks an archive into the library and a project.
///
/// With `project_name` the images join that project (created when missing);
/// otherwise a new project named after the archive is created. PAGE files
/// next to an image (`<stem>.xml` or `<name>.xml`) become its record.
pub fn import_archive(
    storage: &Storage,
    bytes: &[u8],
    archive_name: &str,
    simplify_threshold: f64,
    project_name: Option<&str>,
) -> Result<ImportSummary, FormatError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let mut images: Vec<(String, Vec<u8>)> = Vec::new();
    let mut xml_files: HashMap<String, Vec<u8>> = HashMap::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let Some(name) = file
            .enclosed_name()
            .and_then(|p| p.file_name().and_then(|s| s.to_str()).map(str::to_string))
        else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let lower = name.to_lowercase();
        if is_allowed_image(&name) {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            images.push((name, buf));
        } else if lower.ends_with(".xml") && lower != "mets.xml" {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            xml_files.insert(name, buf);
        }
    }

    if images.is_empty() {
        return Err(FormatError::invalid_format("Archive contains no images"));
    }

    let mut imported = Vec::with_capacity(images.len());
    for (name, data) in images {
        let xml = xml_files
            .get(&format!("{}.xml", stem(&name)))
            .or_else(|| xml_files.get(&format!("{name}.xml")));

        let stored = storage.images.add(&MemoryFile::new(name.clone(), data))?;

        if let Some(xml) = xml {
            let text = String::from_utf8_lossy(xml);
            match parse_page_xml(&text, simplify_threshold) {
                Ok(page) => {
                    let record = Record {
                        image_name: stored.clone(),
                        regions: page.regions,
                        texts: page.texts,
                        crop_params: None,
                        status: Status::Segmented,
                        processing_params: None,
                    };
                    storage.annotations.save(&record)?;
                    tracing::debug!(
                        "Imported {} regions for {}",
                        record.regions.len(),
                        stored
                    );
                }
                Err(e) => tracing::warn!("Ignoring unreadable PAGE file for {}: {}", stored, e),
            }
        }
        imported.push(stored);
    }

    let project = match project_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => match storage.projects.get(name) {
            Ok(project) => project,
            Err(StoreError::NotFound(_)) => storage.projects.create(name, "")?,
            Err(e) => return Err(e.into()),
        },
        None => {
            let name = unique_project_name(storage, stem(archive_name));
            storage
                .projects
                .create(&name, &format!("Imported from {archive_name}"))?
        }
    };
    let project = storage.projects.add_images(&project.name, &imported)?;

    tracing::info!(
        "Imported {} images from {} into project {}",
        imported.len(),
        archive_name,
        project.name
    );
    Ok(ImportSummary {
        project: project.name,
        imported,
    })
}

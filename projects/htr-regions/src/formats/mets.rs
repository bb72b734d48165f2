//! METS manifest for exported projects.

use std::io::Write;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::error::FormatError;

pub const METS_NS: &str = "http://www.loc.gov/METS/";
pub const XLINK_NS: &str = "http://www.w3.org/1999/xlink";

/// One page of the export: an image and, if annotated, its PAGE file.
#[derive(Debug, Clone, PartialEq)]
pub struct MetsEntry {
    pub id: String,
    pub image: String,
    pub page_xml: Option<String>,
}

fn image_mimetype(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

fn write<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> Result<(), FormatError> {
    writer
        .write_event(event)
        .map_err(|e| FormatError::Xml(e.into()))
}

fn write_file<W: Write>(
    writer: &mut Writer<W>,
    id: &str,
    mimetype: &str,
    href: &str,
) -> Result<(), FormatError> {
    write(
        writer,
        Event::Start(
            BytesStart::new("file").with_attributes([("ID", id), ("MIMETYPE", mimetype)]),
        ),
    )?;
    write(
        writer,
        Event::Empty(
            BytesStart::new("FLocat").with_attributes([("LOCTYPE", "URL"), ("xlink:href", href)]),
        ),
    )?;
    write(writer, Event::End(BytesEnd::new("file")))
}

fn write_fptr<W: Write>(writer: &mut Writer<W>, file_id: &str) -> Result<(), FormatError> {
    write(
        writer,
        Event::Empty(BytesStart::new("fptr").with_attributes([("FILEID", file_id)])),
    )
}

/// File section with `image` and `transcription` groups plus a physical
/// structure map with one page div per entry.
pub fn write_mets(entries: &[MetsEntry]) -> Result<String, FormatError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    write(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    write(
        &mut writer,
        Event::Start(
            BytesStart::new("mets").with_attributes([("xmlns", METS_NS), ("xmlns:xlink", XLINK_NS)]),
        ),
    )?;

    write(&mut writer, Event::Start(BytesStart::new("fileSec")))?;
    write(
        &mut writer,
        Event::Start(BytesStart::new("fileGrp").with_attributes([("USE", "image")])),
    )?;
    for entry in entries {
        let id = format!("{}_img", entry.id);
        write_file(&mut writer, &id, image_mimetype(&entry.image), &entry.image)?;
    }
    write(&mut writer, Event::End(BytesEnd::new("fileGrp")))?;

    write(
        &mut writer,
        Event::Start(BytesStart::new("fileGrp").with_attributes([("USE", "transcription")])),
    )?;
    for entry in entries {
        if let Some(xml) = &entry.page_xml {
            write_file(&mut writer, &format!("{}_xml", entry.id), "text/xml", xml)?;
        }
    }
    write(&mut writer, Event::End(BytesEnd::new("fileGrp")))?;
    write(&mut writer, Event::End(BytesEnd::new("fileSec")))?;

    write(
        &mut writer,
        Event::Start(BytesStart::new("structMap").with_attributes([("TYPE", "physical")])),
    )?;
    write(
        &mut writer,
        Event::Start(BytesStart::new("div").with_attributes([("TYPE", "document")])),
    )?;
    for entry in entries {
        write(
            &mut writer,
            Event::Start(BytesStart::new("div").with_attributes([("TYPE", "page")])),
        )?;
        write_fptr(&mut writer, &format!("{}_img", entry.id))?;
        if entry.page_xml.is_some() {
            write_fptr(&mut writer, &format!("{}_xml", entry.id))?;
        }
        write(&mut writer, Event::End(BytesEnd::new("div")))?;
    }
    write(&mut writer, Event::End(BytesEnd::new("div")))?;
    write(&mut writer, Event::End(BytesEnd::new("structMap")))?;
    write(&mut writer, Event::End(BytesEnd::new("mets")))?;

    String::from_utf8(writer.into_inner())
        .map_err(|_| FormatError::invalid_format("Invalid UTF-8 in XML"))
}

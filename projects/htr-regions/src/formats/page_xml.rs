//! PAGE-XML (2013-07-15 schema) writer and TextLine reader.
//!
//! Export writes one full-page `TextRegion` holding one `TextLine` per
//! annotation region. Import only looks at `TextLine` outlines and their
//! line-level transcriptions; word and glyph content is ignored.

use std::collections::BTreeMap;
use std::io::Write;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::FormatError;
use crate::pipeline::simplify::simplify;
use crate::pipeline::types::{Point, Record, Region};

pub const PAGE_NS: &str = "http://schema.primaresearch.org/PAGE/gts/pagecontent/2013-07-15";
pub const CREATOR: &str = "HTR Polygon Tool";

/// Lines and transcriptions read back from a PAGE file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageContent {
    pub image_filename: Option<String>,
    pub regions: Vec<Region>,
    /// Keyed by index into `regions`.
    pub texts: BTreeMap<String, String>,
}

fn points_attr(points: &[Point]) -> String {
    points
        .iter()
        .map(|p| format!("{},{}", p.x, p.y))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses `"x,y x,y ..."`. Malformed pairs are skipped, fractions truncated.
pub fn parse_points(value: &str) -> Vec<Point> {
    value
        .split_whitespace()
        .filter_map(|pair| {
            let (x, y) = pair.split_once(',')?;
            let x: f64 = x.trim().parse().ok()?;
            let y: f64 = y.trim().parse().ok()?;
            Some(Point::new(x as i32, y as i32))
        })
        .collect()
}

fn write<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> Result<(), FormatError> {
    writer
        .write_event(event)
        .map_err(|e| FormatError::Xml(e.into()))
}

fn write_text_element<W: Write>(
    writer: &mut Writer<W>,
    name: &str,
    value: &str,
) -> Result<(), FormatError> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    write(writer, Event::Text(BytesText::new(value)))?;
    write(writer, Event::End(BytesEnd::new(name)))
}

fn write_coords<W: Write>(writer: &mut Writer<W>, points: &str) -> Result<(), FormatError> {
    write(
        writer,
        Event::Empty(BytesStart::new("Coords").with_attributes([("points", points)])),
    )
}

/// Serializes an annotation record as a PAGE document.
///
/// Regions without points are left out but keep their index in line ids.
pub fn write_page_xml(
    image_filename: &str,
    width: u32,
    height: u32,
    record: &Record,
    created: &str,
) -> Result<String, FormatError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    write(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    write(
        &mut writer,
        Event::Start(BytesStart::new("PcGts").with_attributes([("xmlns", PAGE_NS)])),
    )?;

    write(&mut writer, Event::Start(BytesStart::new("Metadata")))?;
    write_text_element(&mut writer, "Creator", CREATOR)?;
    write_text_element(&mut writer, "Created", created)?;
    write(&mut writer, Event::End(BytesEnd::new("Metadata")))?;

    let (w, h) = (width.to_string(), height.to_string());
    write(
        &mut writer,
        Event::Start(BytesStart::new("Page").with_attributes([
            ("imageFilename", image_filename),
            ("imageWidth", w.as_str()),
            ("imageHeight", h.as_str()),
        ])),
    )?;
    write(
        &mut writer,
        Event::Start(BytesStart::new("TextRegion").with_attributes([("id", "region_main")])),
    )?;
    write_coords(&mut writer, &format!("0,0 {w},0 {w},{h} 0,{h}"))?;

    for (i, region) in record.regions.iter().enumerate() {
        if region.points.is_empty() {
            continue;
        }
        let id = format!("line_{i}");
        write(
            &mut writer,
            Event::Start(BytesStart::new("TextLine").with_attributes([("id", id.as_str())])),
        )?;
        write_coords(&mut writer, &points_attr(&region.points))?;
        if let Some(text) = record.text_for(i).filter(|t| !t.is_empty()) {
            write(&mut writer, Event::Start(BytesStart::new("TextEquiv")))?;
            write_text_element(&mut writer, "Unicode", text)?;
            write(&mut writer, Event::End(BytesEnd::new("TextEquiv")))?;
        }
        write(&mut writer, Event::End(BytesEnd::new("TextLine")))?;
    }

    write(&mut writer, Event::End(BytesEnd::new("TextRegion")))?;
    write(&mut writer, Event::End(BytesEnd::new("Page")))?;
    write(&mut writer, Event::End(BytesEnd::new("PcGts")))?;

    String::from_utf8(writer.into_inner())
        .map_err(|_| FormatError::invalid_format("Invalid UTF-8 in XML"))
}

#[derive(Default)]
struct LineState {
    points: Option<Vec<Point>>,
    text: String,
    /// Depth inside Word/Glyph children, whose content is not line-level.
    nested: usize,
    in_equiv: bool,
    in_unicode: bool,
}

fn open_element(
    e: &BytesStart<'_>,
    has_content: bool,
    page: &mut PageContent,
    line: &mut Option<LineState>,
) -> Result<(), FormatError> {
    match e.local_name().as_ref() {
        b"Page" => {
            if let Some(attr) = e.try_get_attribute("imageFilename")? {
                page.image_filename = Some(attr.unescape_value()?.into_owned());
            }
        }
        b"TextLine" if has_content => *line = Some(LineState::default()),
        b"Coords" => {
            if let Some(state) = line.as_mut().filter(|s| s.nested == 0 && s.points.is_none()) {
                if let Some(attr) = e.try_get_attribute("points")? {
                    state.points = Some(parse_points(&attr.unescape_value()?));
                }
            }
        }
        b"Word" | b"Glyph" if has_content => {
            if let Some(state) = line.as_mut() {
                state.nested += 1;
            }
        }
        b"TextEquiv" if has_content => {
            if let Some(state) = line.as_mut().filter(|s| s.nested == 0) {
                state.in_equiv = true;
            }
        }
        b"Unicode" if has_content => {
            if let Some(state) = line.as_mut().filter(|s| s.in_equiv) {
                state.in_unicode = true;
            }
        }
        _ => {}
    }
    Ok(())
}

fn close_element(
    e: &BytesEnd<'_>,
    page: &mut PageContent,
    line: &mut Option<LineState>,
    simplify_threshold: f64,
) {
    let name = e.local_name();
    if name.as_ref() == b"TextLine" {
        if let Some(state) = line.take() {
            finish_line(page, state, simplify_threshold);
        }
        return;
    }
    let Some(state) = line.as_mut() else {
        return;
    };
    match name.as_ref() {
        b"Word" | b"Glyph" => state.nested = state.nested.saturating_sub(1),
        b"TextEquiv" => state.in_equiv = false,
        b"Unicode" => state.in_unicode = false,
        _ => {}
    }
}

fn finish_line(page: &mut PageContent, state: LineState, simplify_threshold: f64) {
    let Some(points) = state.points.filter(|p| !p.is_empty()) else {
        return;
    };
    let points = if simplify_threshold > 0.0 {
        simplify(&points, simplify_threshold)
    } else {
        points
    };
    if !state.text.is_empty() {
        page.texts.insert(page.regions.len().to_string(), state.text);
    }
    page.regions.push(Region::new(points));
}

/// Reads every `TextLine` outline, optionally simplifying it.
///
/// Element names are matched without their namespace prefix.
pub fn parse_page_xml(xml: &str, simplify_threshold: f64) -> Result<PageContent, FormatError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut page = PageContent::default();
    let mut line: Option<LineState> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => open_element(e, true, &mut page, &mut line)?,
            Event::Empty(ref e) => open_element(e, false, &mut page, &mut line)?,
            Event::End(ref e) => close_element(e, &mut page, &mut line, simplify_threshold),
            Event::Text(ref t) => {
                if let Some(state) = line.as_mut().filter(|s| s.in_unicode) {
                    state.text.push_str(&t.unescape()?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Record {
        let mut record = Record::empty("page.png");
        record.regions = vec![
            Region::new(vec![Point::new(10, 20), Point::new(110, 20), Point::new(110, 40)]),
            Region::default(),
            Region::rect(5, 50, 100, 15),
        ];
        record.texts.insert("0".into(), "text & more".into());
        record.texts.insert("2".into(), String::new());
        record
    }

    #[test]
    fn test_write_page_xml_structure() {
        let xml = write_page_xml("page.png", 200, 100, &record(), "2024-01-01T00:00:00Z").unwrap();

        assert!(xml.contains(PAGE_NS));
        assert!(xml.contains("<Creator>HTR Polygon Tool</Creator>"));
        assert!(xml.contains("<Created>2024-01-01T00:00:00Z</Created>"));
        assert!(xml.contains(r#"imageFilename="page.png""#));
        assert!(xml.contains(r#"imageWidth="200""#));
        assert!(xml.contains(r#"imageHeight="100""#));
        assert!(xml.contains(r#"<TextRegion id="region_main">"#));
        assert!(xml.contains(r#"points="0,0 200,0 200,100 0,100""#));
        assert!(xml.contains(r#"<TextLine id="line_0">"#));
        assert!(xml.contains(r#"points="10,20 110,20 110,40""#));
        assert!(!xml.contains("line_1"));
        assert!(xml.contains(r#"<TextLine id="line_2">"#));
        assert!(xml.contains("<Unicode>text &amp; more</Unicode>"));
        assert_eq!(xml.matches("<TextEquiv>").count(), 1);
    }

    #[test]
    fn test_read_back_written_page() {
        let xml = write_page_xml("page.png", 200, 100, &record(), "now").unwrap();
        let page = parse_page_xml(&xml, 0.0).unwrap();

        assert_eq!(page.image_filename.as_deref(), Some("page.png"));
        assert_eq!(page.regions.len(), 2);
        assert_eq!(page.regions[1], Region::rect(5, 50, 100, 15));
        assert_eq!(page.texts.get("0").map(String::as_str), Some("text & more"));
        assert!(page.texts.get("1").is_none());
    }

    #[test]
    fn test_parse_prefixed_namespace_and_words() {
        let xml = r#"<?xml version="1.0"?>
<pc:PcGts xmlns:pc="http://schema.primaresearch.org/PAGE/gts/pagecontent/2019-07-15">
  <pc:Page imageFilename="scan.jpg" imageWidth="10" imageHeight="10">
    <pc:TextRegion id="r1">
      <pc:Coords points="0,0 10,0 10,10"/>
      <pc:TextLine id="l1">
        <pc:Coords points="1.9,2.2 8.7,2 8,5 bogus 1,5"/>
        <pc:Baseline points="1,4 8,4"/>
        <pc:Word id="w1">
          <pc:Coords points="1,1 2,2 3,3"/>
          <pc:TextEquiv><pc:Unicode>word</pc:Unicode></pc:TextEquiv>
        </pc:Word>
        <pc:TextEquiv><pc:Unicode>whole line</pc:Unicode></pc:TextEquiv>
      </pc:TextLine>
      <pc:TextLine id="l2"/>
      <pc:TextLine id="l3"><pc:Coords points=""/></pc:TextLine>
    </pc:TextRegion>
  </pc:Page>
</pc:PcGts>"#;
        let page = parse_page_xml(xml, 0.0).unwrap();
        assert_eq!(page.image_filename.as_deref(), Some("scan.jpg"));
        assert_eq!(page.regions.len(), 1);
        assert_eq!(
            page.regions[0].points,
            vec![
                Point::new(1, 2),
                Point::new(8, 2),
                Point::new(8, 5),
                Point::new(1, 5)
            ]
        );
        assert_eq!(page.texts.get("0").map(String::as_str), Some("whole line"));
    }

    #[test]
    fn test_parse_simplifies_outlines() {
        let xml = r#"<PcGts><Page><TextRegion><TextLine>
            <Coords points="0,0 1,0 2,0 20,0 20,1 20,20"/>
        </TextLine></TextRegion></Page></PcGts>"#;
        let page = parse_page_xml(xml, 5.0).unwrap();
        assert_eq!(
            page.regions[0].points,
            vec![Point::new(0, 0), Point::new(20, 0), Point::new(20, 20)]
        );
    }

    #[test]
    fn test_parse_rejects_broken_xml() {
        assert!(parse_page_xml("<PcGts><Page></PcGts>", 0.0).is_err());
    }
}

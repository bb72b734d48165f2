// Interchange formats: PAGE-XML, METS and project archives

pub mod archive;
pub mod mets;
pub mod page_xml;

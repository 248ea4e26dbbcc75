//! WebDAV PROPFIND XML reader and multistatus writer (spec §3, §4.2).
//!
//! The request-body parser answers "which properties does the client
//! want", and the writer produces the `<d:multistatus>` document RAP
//! streams back to the server over a pipe. Property encodings follow
//! spec §4.2 exactly, including the preserved `creationdate`/
//! `getlastmodified` quirk (both derived from ctime, see DESIGN.md).

use std::io::{self, Write};

use xml::writer::{EmitterConfig, XmlEvent};
use xmltree::Element;

use crate::errors::RapError;

/// Which properties a PROPFIND response should include. An absent or empty
/// request body means "all properties" (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySet {
    pub creationdate: bool,
    pub displayname: bool,
    pub getcontentlength: bool,
    pub getcontenttype: bool,
    pub getetag: bool,
    pub getlastmodified: bool,
    pub resourcetype: bool,
    pub quota_used_bytes: bool,
    pub quota_available_bytes: bool,
}

impl PropertySet {
    pub fn all() -> PropertySet {
        PropertySet {
            creationdate: true,
            displayname: true,
            getcontentlength: true,
            getcontenttype: true,
            getetag: true,
            getlastmodified: true,
            resourcetype: true,
            quota_used_bytes: true,
            quota_available_bytes: true,
        }
    }

    pub fn none() -> PropertySet {
        PropertySet {
            creationdate: false,
            displayname: false,
            getcontentlength: false,
            getcontenttype: false,
            getetag: false,
            getlastmodified: false,
            resourcetype: false,
            quota_used_bytes: false,
            quota_available_bytes: false,
        }
    }

    /// Parse a `<propfind><prop>...</prop></propfind>` body. An empty body
    /// (no bytes at all) means "all properties", matching the source's
    /// "no body sent, assume client wants everything" behavior.
    pub fn parse(body: &[u8]) -> Result<PropertySet, RapError> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(PropertySet::all());
        }

        let root = Element::parse(body).map_err(|_| RapError::BadClientRequest)?;
        if root.name != "propfind" {
            return Err(RapError::BadClientRequest);
        }
        let prop = match root.get_child("prop") {
            Some(p) => p,
            // <propfind><allprop/></propfind> and friends: treat as "all".
            None => return Ok(PropertySet::all()),
        };

        let mut set = PropertySet::none();
        for child in &prop.children {
            let el = match child.as_element() {
                Some(el) => el,
                None => continue,
            };
            match el.name.as_str() {
                "resourcetype" => set.resourcetype = true,
                "creationdate" => set.creationdate = true,
                "getcontentlength" => set.getcontentlength = true,
                "getlastmodified" => set.getlastmodified = true,
                "displayname" => set.displayname = true,
                "getcontenttype" => set.getcontenttype = true,
                "quota-available-bytes" => set.quota_available_bytes = true,
                "quota-used-bytes" => set.quota_used_bytes = true,
                "getetag" => set.getetag = true,
                _ => {}
            }
        }
        Ok(set)
    }
}

/// Depth header reduced to {self, self+children} (spec §4.2, §9: `infinity`
/// is deliberately treated the same as `1`, not true recursion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
}

impl Depth {
    pub fn parse(s: &str) -> Depth {
        if s == "0" {
            Depth::Zero
        } else {
            Depth::One
        }
    }
}

/// One resource's metadata, as needed to write a `<d:response>` block.
#[derive(Debug, Clone)]
pub struct PropfindEntry {
    /// Value for `<d:href>`; the root entry's path, or `path/child-name`.
    pub href: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime_secs: i64,
    /// Spec §4.2: both `creationdate` and `getlastmodified` are derived
    /// from ctime, not ctime/mtime respectively. Preserved as-is.
    pub ctime_secs: i64,
    pub content_type: String,
    /// Filesystem statistics, only meaningful (and only populated by the
    /// caller) for directories.
    pub quota_available_bytes: Option<u64>,
    pub quota_used_bytes: Option<u64>,
}

/// Write the full `<d:multistatus>` document for `root` and, if present,
/// `children` (omitted entirely when depth is zero or root is not a
/// directory).
pub fn write_multistatus<W: Write>(
    w: W,
    properties: &PropertySet,
    root: &PropfindEntry,
    children: &[PropfindEntry],
) -> io::Result<()> {
    let mut writer = EmitterConfig::new()
        .write_document_declaration(true)
        .perform_indent(false)
        .create_writer(w);

    writer
        .write(XmlEvent::start_element("d:multistatus").ns("d", "DAV:"))
        .map_err(xml_write_err)?;

    write_response(&mut writer, properties, root)?;
    for child in children {
        write_response(&mut writer, properties, child)?;
    }

    writer.write(XmlEvent::end_element()).map_err(xml_write_err)?;
    Ok(())
}

fn write_response<W: Write>(
    writer: &mut xml::writer::EventWriter<W>,
    properties: &PropertySet,
    entry: &PropfindEntry,
) -> io::Result<()> {
    writer
        .write(XmlEvent::start_element("d:response"))
        .map_err(xml_write_err)?;
    writer
        .write(XmlEvent::start_element("d:href"))
        .map_err(xml_write_err)?;
    writer.write(XmlEvent::characters(&entry.href)).map_err(xml_write_err)?;
    writer.write(XmlEvent::end_element()).map_err(xml_write_err)?; // href

    writer
        .write(XmlEvent::start_element("d:propstat"))
        .map_err(xml_write_err)?;
    writer.write(XmlEvent::start_element("d:prop")).map_err(xml_write_err)?;

    if properties.getetag {
        write_text_element(writer, "d:getetag", &format!("\"{}-{}\"", entry.size, entry.mtime_secs))?;
    }
    if properties.creationdate {
        write_text_element(writer, "d:creationdate", &crate::util::httpdate_from_unix(entry.ctime_secs))?;
    }
    if properties.getlastmodified {
        write_text_element(writer, "d:getlastmodified", &crate::util::httpdate_from_unix(entry.ctime_secs))?;
    }
    if properties.resourcetype {
        writer
            .write(XmlEvent::start_element("d:resourcetype"))
            .map_err(xml_write_err)?;
        if entry.is_dir {
            writer
                .write(XmlEvent::start_element("d:collection"))
                .map_err(xml_write_err)?;
            writer.write(XmlEvent::end_element()).map_err(xml_write_err)?;
        }
        writer.write(XmlEvent::end_element()).map_err(xml_write_err)?; // resourcetype
    }
    if properties.displayname {
        let name = entry.href.trim_end_matches('/').rsplit('/').next().unwrap_or("");
        write_text_element(writer, "d:displayname", name)?;
    }

    if entry.is_dir {
        if let Some(avail) = entry.quota_available_bytes {
            write_text_element(writer, "d:quota-available-bytes", &avail.to_string())?;
        }
        if let Some(used) = entry.quota_used_bytes {
            write_text_element(writer, "d:quota-used-bytes", &used.to_string())?;
        }
    } else {
        if properties.getcontentlength {
            write_text_element(writer, "d:getcontentlength", &entry.size.to_string())?;
        }
        if properties.getcontenttype {
            write_text_element(writer, "d:getcontenttype", &entry.content_type)?;
        }
    }

    writer.write(XmlEvent::end_element()).map_err(xml_write_err)?; // prop
    write_text_element(writer, "d:status", "HTTP/1.1 200 OK")?;
    writer.write(XmlEvent::end_element()).map_err(xml_write_err)?; // propstat
    writer.write(XmlEvent::end_element()).map_err(xml_write_err)?; // response
    Ok(())
}

fn write_text_element<W: Write>(
    writer: &mut xml::writer::EventWriter<W>,
    name: &str,
    text: &str,
) -> io::Result<()> {
    writer.write(XmlEvent::start_element(name)).map_err(xml_write_err)?;
    writer.write(XmlEvent::characters(text)).map_err(xml_write_err)?;
    writer.write(XmlEvent::end_element()).map_err(xml_write_err)?;
    Ok(())
}

fn xml_write_err(e: xml::writer::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(href: &str, is_dir: bool) -> PropfindEntry {
        PropfindEntry {
            href: href.to_string(),
            is_dir,
            size: 11,
            mtime_secs: 1_700_000_000,
            ctime_secs: 1_700_000_000,
            content_type: "text/plain".to_string(),
            quota_available_bytes: if is_dir { Some(1000) } else { None },
            quota_used_bytes: if is_dir { Some(500) } else { None },
        }
    }

    #[test]
    fn empty_body_means_all_properties() {
        let props = PropertySet::parse(b"").unwrap();
        assert_eq!(props, PropertySet::all());
    }

    #[test]
    fn parses_requested_props() {
        let body = br#"<?xml version="1.0"?>
            <D:propfind xmlns:D="DAV:">
              <D:prop><D:resourcetype/><D:getcontentlength/></D:prop>
            </D:propfind>"#;
        let props = PropertySet::parse(body).unwrap();
        assert!(props.resourcetype);
        assert!(props.getcontentlength);
        assert!(!props.getetag);
    }

    #[test]
    fn malformed_xml_is_bad_client_request() {
        let err = PropertySet::parse(b"<not valid").unwrap_err();
        assert_eq!(err, RapError::BadClientRequest);
    }

    #[test]
    fn depth_infinity_is_one() {
        assert_eq!(Depth::parse("infinity"), Depth::One);
        assert_eq!(Depth::parse("1"), Depth::One);
        assert_eq!(Depth::parse("0"), Depth::Zero);
    }

    #[test]
    fn writes_one_response_per_entry_with_collection_marker() {
        let mut out = Vec::new();
        let root = sample_entry("/dir/", true);
        let children = vec![sample_entry("/dir/a", false)];
        write_multistatus(&mut out, &PropertySet::all(), &root, &children).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert_eq!(s.matches("<d:response>").count(), 2);
        assert_eq!(s.matches("<d:href>").count(), 2);
        assert_eq!(s.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(s.contains("<d:collection"));
    }
}

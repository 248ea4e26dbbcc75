//! MIME-type lookup: a pure function on filename extensions, loaded once
//! from a system `mime.types`-style file (spec §3, §6).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::errors::ConfigError;

const UNKNOWN: &str = "application/octet-stream";

/// Extension -> media-type table. Lookup is longest-suffix by the final
/// `.`-delimited extension; anything without one (or with the `.` before
/// the last `/`) maps to `application/octet-stream`.
#[derive(Debug, Default, Clone)]
pub struct MimeTable {
    by_ext: HashMap<String, String>,
}

impl MimeTable {
    /// Parse a file of `<type> <ext1> [<ext2> ...]` lines; `#` starts a
    /// comment to end of line; blank lines are ignored (spec §6).
    pub fn load(path: &Path) -> Result<MimeTable, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(MimeTable::parse(&text))
    }

    pub fn parse(text: &str) -> MimeTable {
        let mut by_ext = HashMap::new();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            };
            let mut fields = line.split_whitespace();
            let media_type = match fields.next() {
                Some(t) => t,
                None => continue,
            };
            for ext in fields {
                by_ext.insert(ext.to_ascii_lowercase(), media_type.to_owned());
            }
        }
        MimeTable { by_ext }
    }

    /// Look up the media type for `filename` by its extension (the part
    /// after the last `.` that appears after the last `/`). No such
    /// extension, or no match in the table, yields `application/octet-stream`.
    pub fn lookup(&self, filename: &str) -> &str {
        match extension_of(filename) {
            Some(ext) => self
                .by_ext
                .get(&ext.to_ascii_lowercase())
                .map(|s| s.as_str())
                .unwrap_or(UNKNOWN),
            None => UNKNOWN,
        }
    }
}

fn extension_of(filename: &str) -> Option<&str> {
    let last_slash = filename.rfind('/').map(|i| i + 1).unwrap_or(0);
    let name = &filename[last_slash..];
    let dot = name.rfind('.')?;
    if dot + 1 >= name.len() {
        return None;
    }
    Some(&name[dot + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
        # comment line\n\
        text/plain txt text\n\
        text/html html htm\n\
        application/octet-stream bin\n";

    #[test]
    fn known_extension() {
        let t = MimeTable::parse(SAMPLE);
        assert_eq!(t.lookup("file.txt"), "text/plain");
        assert_eq!(t.lookup("index.html"), "text/html");
        assert_eq!(t.lookup("INDEX.HTM"), "text/html");
    }

    #[test]
    fn no_extension_or_dot_before_last_slash() {
        let t = MimeTable::parse(SAMPLE);
        assert_eq!(t.lookup("README"), UNKNOWN);
        assert_eq!(t.lookup("dir.d/file"), UNKNOWN);
    }

    #[test]
    fn unknown_extension() {
        let t = MimeTable::parse(SAMPLE);
        assert_eq!(t.lookup("file.qqq"), UNKNOWN);
    }

    #[test]
    fn comment_stripped() {
        let t = MimeTable::parse("text/plain txt # trailing comment ignored\n");
        assert_eq!(t.lookup("a.txt"), "text/plain");
    }
}

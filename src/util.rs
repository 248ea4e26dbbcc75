//! Small time-formatting helpers shared by the wire codec, PROPFIND writer
//! and access log.

use std::time::{SystemTime, UNIX_EPOCH};

use headers::Header;
use time::format_description::well_known::Rfc3339;
use time::macros::offset;

pub fn systemtime_to_offsetdatetime(t: SystemTime) -> time::OffsetDateTime {
    match t.duration_since(UNIX_EPOCH) {
        Ok(t) => {
            let tm = time::OffsetDateTime::from_unix_timestamp(t.as_secs() as i64).unwrap();
            tm.to_offset(offset!(UTC))
        }
        Err(_) => time::OffsetDateTime::UNIX_EPOCH.to_offset(offset!(UTC)),
    }
}

/// RFC-1123 HTTP date, as used for PROPFIND `creationdate`/`getlastmodified`
/// (spec §4.2: both are formatted as RFC-1123 dates derived from ctime).
pub fn httpdate_from_unix(secs: i64) -> String {
    systemtime_to_httpdate(UNIX_EPOCH + std::time::Duration::from_secs(secs.max(0) as u64))
}

pub fn systemtime_to_httpdate(t: SystemTime) -> String {
    let d = headers::Date::from(t);
    let mut v = Vec::new();
    d.encode(&mut v);
    v[0].to_str().unwrap().to_owned()
}

pub fn systemtime_to_rfc3339(t: SystemTime) -> String {
    // 1996-12-19T16:39:57Z
    systemtime_to_offsetdatetime(t).format(&Rfc3339).unwrap()
}

pub fn now_rfc3339() -> String {
    systemtime_to_rfc3339(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339() {
        assert!(systemtime_to_rfc3339(UNIX_EPOCH) == "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_httpdate_from_unix() {
        assert_eq!(httpdate_from_unix(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    }
}

//! Publish-time parsing.
//!
//! Article pages print their date in a handful of shapes, usually buried in a
//! line that also carries the source ("2024-05-01 10:23:45 来源: ..."). The
//! date-looking substring is cut out first, then each known format is tried
//! in order.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

static DATE_CANDIDATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}[-/年]\d{1,2}[-/月]\d{1,2}日?(?:[T\s]*\d{1,2}:\d{2}(?::\d{2})?)?")
        .expect("static regex")
});

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y年%m月%d日 %H:%M:%S",
    "%Y年%m月%d日 %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y年%m月%d日"];

/// Parse a publish time out of free text.
///
/// Offsets in RFC 3339 input are dropped and the wall-clock time kept, which
/// matches how the other formats (which carry no zone) are stored.
pub fn parse_publish_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_local());
    }

    let candidate = DATE_CANDIDATE.find(raw)?.as_str().replace('T', " ");
    let candidate = candidate.trim();

    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(candidate, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(candidate, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// [`parse_publish_time`], falling back to `crawl_time`.
pub fn publish_time_or(raw: Option<&str>, crawl_time: NaiveDateTime) -> NaiveDateTime {
    raw.and_then(parse_publish_time).unwrap_or(crawl_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_known_formats() {
        assert_eq!(parse_publish_time("2024-05-01 10:23:45"), Some(at(2024, 5, 1, 10, 23, 45)));
        assert_eq!(parse_publish_time("2024-05-01 10:23"), Some(at(2024, 5, 1, 10, 23, 0)));
        assert_eq!(parse_publish_time("2024/5/1 08:00"), Some(at(2024, 5, 1, 8, 0, 0)));
        assert_eq!(parse_publish_time("2024年05月01日 10:23"), Some(at(2024, 5, 1, 10, 23, 0)));
        assert_eq!(parse_publish_time("2024-05-01"), Some(at(2024, 5, 1, 0, 0, 0)));
    }

    #[test]
    fn test_rfc3339_keeps_wall_clock() {
        assert_eq!(
            parse_publish_time("2024-05-01T10:00:00+08:00"),
            Some(at(2024, 5, 1, 10, 0, 0))
        );
    }

    #[test]
    fn test_date_embedded_in_source_line() {
        assert_eq!(
            parse_publish_time("  2024-05-01 10:23:45\u{3000}来源: 新华社 "),
            Some(at(2024, 5, 1, 10, 23, 45))
        );
    }

    #[test]
    fn test_unparseable_falls_back_to_crawl_time() {
        let crawl = at(2025, 1, 2, 3, 4, 5);
        assert_eq!(parse_publish_time("yesterday"), None);
        assert_eq!(parse_publish_time("2024-13-45 10:00"), None);
        assert_eq!(publish_time_or(Some("yesterday"), crawl), crawl);
        assert_eq!(publish_time_or(None, crawl), crawl);
    }
}

//! `Range` request header parsing.
//!
//! Only single byte ranges are served. A header that is malformed or uses a
//! unit other than `bytes` is ignored and the full body is returned, as HTTP
//! allows; several valid ranges are reported separately so the caller can
//! answer 501.

use fibridge_proto::ByteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable header: serve everything.
    Full,
    Single(ByteRange),
    /// `bytes=0-1,5-9` and friends.
    Multiple,
}

impl RangeRequest {
    pub fn parse(header: Option<&str>) -> Self {
        let Some(value) = header else {
            return RangeRequest::Full;
        };

        let value = value.trim();
        let Some((unit, specs)) = value.split_once('=') else {
            return RangeRequest::Full;
        };
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return RangeRequest::Full;
        }

        let mut ranges = Vec::new();
        for spec in specs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match parse_spec(spec) {
                Some(range) => ranges.push(range),
                None => return RangeRequest::Full,
            }
        }

        match ranges.as_slice() {
            [] => RangeRequest::Full,
            [range] => RangeRequest::Single(*range),
            _ => RangeRequest::Multiple,
        }
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        match self {
            RangeRequest::Full => Some(ByteRange::Full),
            RangeRequest::Single(range) => Some(*range),
            RangeRequest::Multiple => None,
        }
    }
}

fn parse_spec(spec: &str) -> Option<ByteRange> {
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    match (first.is_empty(), last.is_empty()) {
        (true, true) => None,
        (true, false) => Some(ByteRange::Suffix {
            length: parse_pos(last)?,
        }),
        (false, true) => Some(ByteRange::From {
            start: parse_pos(first)?,
        }),
        (false, false) => {
            let start = parse_pos(first)?;
            let end = parse_pos(last)?;
            (end >= start).then_some(ByteRange::Bounded { start, end })
        }
    }
}

fn parse_pos(digits: &str) -> Option<u64> {
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `Content-Range` value of a partial response.
pub fn content_range(start: u64, len: u64, total: u64) -> String {
    if len == 0 {
        return unsatisfied_range(total);
    }
    format!("bytes {}-{}/{}", start, start + len - 1, total)
}

/// `Content-Range` value of a 416 response.
pub fn unsatisfied_range(total: u64) -> String {
    format!("bytes */{}", total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(header: &str) -> ByteRange {
        match RangeRequest::parse(Some(header)) {
            RangeRequest::Single(range) => range,
            other => panic!("{:?} parsed as {:?}", header, other),
        }
    }

    #[test]
    fn test_single_ranges() {
        assert_eq!(single("bytes=0-999"), ByteRange::Bounded { start: 0, end: 999 });
        assert_eq!(single("bytes=500-"), ByteRange::From { start: 500 });
        assert_eq!(single("bytes=-200"), ByteRange::Suffix { length: 200 });
        assert_eq!(single(" Bytes = 7 - 9 "), ByteRange::Bounded { start: 7, end: 9 });
    }

    #[test]
    fn test_missing_or_invalid_header_serves_full_body() {
        assert_eq!(RangeRequest::parse(None), RangeRequest::Full);
        for header in [
            "bytes=",
            "bytes=abc",
            "bytes=9-3",
            "bytes=-",
            "bytes=1-2-3",
            "items=0-9",
            "0-9",
            "bytes=0-99999999999999999999999",
            "bytes=+1-5",
        ] {
            assert_eq!(RangeRequest::parse(Some(header)), RangeRequest::Full, "{}", header);
        }
    }

    #[test]
    fn test_multiple_ranges() {
        assert_eq!(
            RangeRequest::parse(Some("bytes=0-1,5-9")),
            RangeRequest::Multiple
        );
        assert_eq!(RangeRequest::Multiple.byte_range(), None);
        // A single spec with a stray comma is still single.
        assert_eq!(single("bytes=0-1,"), ByteRange::Bounded { start: 0, end: 1 });
    }

    #[test]
    fn test_content_range_values() {
        assert_eq!(content_range(0, 1000, 10_000_000), "bytes 0-999/10000000");
        assert_eq!(content_range(5, 1, 6), "bytes 5-5/6");
        assert_eq!(unsatisfied_range(10_000_000), "bytes */10000000");
    }
}

//! Single-range `Range` header parsing.
//!
//! Only the single-range forms are supported: `bytes=a-b`, `bytes=a-`, and
//! the suffix form `bytes=-n`. Syntactically malformed headers are ignored
//! (the full resource is served, per RFC 9110); a well-formed range that
//! cannot be satisfied yields 416.

use crate::error::ApiError;

/// Inclusive byte range `(start, end)` within a resource of length `total`.
pub type ByteRange = (u64, u64);

/// Parse a `Range` header against a resource length.
///
/// Returns `Ok(None)` when the whole resource should be served.
pub fn parse_range(header: Option<&str>, total: u64) -> Result<Option<ByteRange>, ApiError> {
    let Some(header) = header else {
        return Ok(None);
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None); // not a byte range; ignore
    };
    if spec.contains(',') {
        return Ok(None); // multi-range unsupported; serve full
    }

    let Some((start_str, end_str)) = spec.split_once('-') else {
        return Ok(None);
    };
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    // Suffix form: last n bytes.
    if start_str.is_empty() {
        let Ok(suffix) = end_str.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || total == 0 {
            return Err(ApiError::RangeNotSatisfiable { total });
        }
        let len = suffix.min(total);
        return Ok(Some((total - len, total - 1)));
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return Ok(None);
    };
    if start >= total {
        return Err(ApiError::RangeNotSatisfiable { total });
    }

    let end = if end_str.is_empty() {
        total - 1
    } else {
        let Ok(end) = end_str.parse::<u64>() else {
            return Ok(None);
        };
        if end < start {
            return Ok(None); // inverted range is malformed; ignore
        }
        end.min(total - 1)
    };

    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_header_serves_full() {
        assert_eq!(parse_range(None, 100).unwrap(), None);
    }

    #[test]
    fn closed_range() {
        assert_eq!(parse_range(Some("bytes=0-99"), 1000).unwrap(), Some((0, 99)));
        assert_eq!(parse_range(Some("bytes=10-10"), 1000).unwrap(), Some((10, 10)));
    }

    #[test]
    fn end_clamps_to_resource() {
        assert_eq!(parse_range(Some("bytes=90-500"), 100).unwrap(), Some((90, 99)));
    }

    #[test]
    fn open_ended_range() {
        assert_eq!(parse_range(Some("bytes=50-"), 100).unwrap(), Some((50, 99)));
    }

    #[test]
    fn suffix_range() {
        assert_eq!(parse_range(Some("bytes=-10"), 100).unwrap(), Some((90, 99)));
        assert_eq!(parse_range(Some("bytes=-500"), 100).unwrap(), Some((0, 99)));
    }

    #[test]
    fn start_past_end_is_unsatisfiable() {
        assert!(matches!(
            parse_range(Some("bytes=100-"), 100),
            Err(ApiError::RangeNotSatisfiable { total: 100 })
        ));
        assert!(matches!(
            parse_range(Some("bytes=500-600"), 100),
            Err(ApiError::RangeNotSatisfiable { .. })
        ));
    }

    #[test]
    fn malformed_ranges_are_ignored() {
        assert_eq!(parse_range(Some("bytes=abc-def"), 100).unwrap(), None);
        assert_eq!(parse_range(Some("bytes=50-40"), 100).unwrap(), None);
        assert_eq!(parse_range(Some("items=0-10"), 100).unwrap(), None);
        assert_eq!(parse_range(Some("bytes=0-10,20-30"), 100).unwrap(), None);
    }
}

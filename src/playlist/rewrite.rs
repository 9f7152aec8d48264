//! Manifest rewriter

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::{PlaybackError, Result};

/// First line of every HLS manifest
const SIGNATURE: &str = "#EXTM3U";

/// Characters escaped in a `file` query value
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Build the base URL for rewritten references: `path` followed by the raw
/// query with any `file` parameter removed.
pub fn base_url(path: &str, raw_query: Option<&str>) -> String {
    let kept: Vec<&str> = raw_query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some("file"))
        .collect();
    format!("{}?{}", path, kept.join("&"))
}

/// Rewrite every media reference of `manifest` into
/// `<base>&file=<reference>`. Directive, comment and blank lines are kept.
pub fn rewrite_manifest(manifest: &str, base: &str) -> Result<String> {
    let manifest = manifest.strip_prefix('\u{feff}').unwrap_or(manifest);
    let first = manifest.lines().next().unwrap_or("").trim_end();
    if first != SIGNATURE {
        return Err(PlaybackError::InvalidManifest(format!(
            "expected {} header",
            SIGNATURE
        )));
    }

    let mut out = String::with_capacity(manifest.len() * 2);
    for line in manifest.lines() {
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            out.push_str(base);
            out.push_str("&file=");
            out.extend(utf8_percent_encode(trimmed, QUERY_VALUE));
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_references() {
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\n#EXTINF:10.0,\nindex0.ts\n#EXTINF:4.5,\nindex1.ts\n#EXT-X-ENDLIST\n";
        let out = rewrite_manifest(manifest, "/get?path=cam&format=hls").unwrap();
        assert_eq!(
            out,
            "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\n#EXTINF:10.0,\n\
             /get?path=cam&format=hls&file=index0.ts\n#EXTINF:4.5,\n\
             /get?path=cam&format=hls&file=index1.ts\n#EXT-X-ENDLIST\n"
        );
    }

    #[test]
    fn test_reference_is_encoded() {
        let out = rewrite_manifest("#EXTM3U\nseg 1&x.ts\n", "/get?a=b").unwrap();
        assert_eq!(out, "#EXTM3U\n/get?a=b&file=seg%201%26x.ts\n");
    }

    #[test]
    fn test_crlf_manifest() {
        let out = rewrite_manifest("#EXTM3U\r\nindex0.ts\r\n", "/get?a=b").unwrap();
        assert_eq!(out, "#EXTM3U\n/get?a=b&file=index0.ts\n");
    }

    #[test]
    fn test_missing_signature() {
        for bad in ["", "index0.ts\n", "#EXT-X-VERSION:3\n#EXTM3U\n"] {
            assert!(matches!(
                rewrite_manifest(bad, "/get?"),
                Err(PlaybackError::InvalidManifest(_))
            ));
        }
    }

    #[test]
    fn test_base_url_strips_file() {
        assert_eq!(
            base_url("/get", Some("path=cam&file=index0.ts&format=hls")),
            "/get?path=cam&format=hls"
        );
        assert_eq!(base_url("/get", None), "/get?");
        // only the exact key is removed
        assert_eq!(base_url("/get", Some("filed=1")), "/get?filed=1");
    }
}

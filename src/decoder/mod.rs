//! Response body normalisation: gzip transfer decoding and charset sniffing.
//!
//! Order of precedence for the charset:
//!   1. `charset=` parameter of the declared Content-Type
//!   2. first `<meta>` tag in the document that names one
//!   3. UTF-8 (lossy)

use crate::error::DecodeError;
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use flate2::read::GzDecoder;
use scraper::{Html, Selector};
use std::io::Read;
use tracing::debug;

/// Decode a raw body into text.
pub fn decode(
    body: Bytes,
    content_encoding: Option<&str>,
    content_type: Option<&str>,
) -> Result<String, DecodeError> {
    let bytes = if is_gzip(content_encoding) {
        gunzip(&body)?
    } else {
        body.to_vec()
    };

    if let Some(label) = content_type.and_then(charset_from_content_type) {
        let encoding = resolve(&label)?;
        return Ok(decode_with(encoding, &bytes));
    }

    let tentative = UTF_8.decode_with_bom_removal(&bytes).0.into_owned();
    match html_charset(&tentative) {
        Some(label) => {
            let encoding = resolve(&label)?;
            debug!(charset = encoding.name(), "charset taken from <meta>");
            Ok(decode_with(encoding, &bytes))
        }
        None => Ok(tentative),
    }
}

/// Decode bytes with an already-resolved encoding. A leading BOM never
/// overrides the declared charset.
pub fn decode_with(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let (text, _) = encoding.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Look up a charset label the way browsers do, e.g. "gb2312" → GBK.
pub fn resolve(label: &str) -> Result<&'static Encoding, DecodeError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| DecodeError::UnsupportedCharset(label.trim().to_string()))
}

fn is_gzip(content_encoding: Option<&str>) -> bool {
    content_encoding
        .map(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip")
        })
        .unwrap_or(false)
}

fn gunzip(compressed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(compressed.len() * 4);
    GzDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(DecodeError::Gzip)?;
    Ok(out)
}

/// "text/html; charset=GBK" → Some("GBK")
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, v)| v.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|v| !v.is_empty())
}

/// Charset named by the first `<meta>` element that names one, in document order.
pub fn html_charset(html: &str) -> Option<String> {
    if html.is_empty() {
        return None;
    }

    let doc = Html::parse_document(html);
    let Ok(meta_sel) = Selector::parse("meta") else {
        return None;
    };

    for meta in doc.select(&meta_sel) {
        let el = meta.value();

        if let Some(content) = el.attr("content") {
            let lower = content.to_ascii_lowercase();
            if let Some(idx) = lower.find("charset=") {
                let value: String = content[idx + "charset=".len()..]
                    .chars()
                    .take_while(|c| !matches!(c, ';' | '"' | '\'') && !c.is_whitespace())
                    .collect();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }

        if let Some(charset) = el.attr("charset") {
            let charset = charset.trim();
            if !charset.is_empty() {
                return Some(charset.to_string());
            }
        }
    }

    None
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{GBK, SHIFT_JIS, WINDOWS_1252};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn encode(encoding: &'static Encoding, text: &str) -> Bytes {
        let (bytes, _, _) = encoding.encode(text);
        Bytes::from(bytes.into_owned())
    }

    fn gzip(data: &[u8]) -> Bytes {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        Bytes::from(enc.finish().unwrap())
    }

    #[test]
    fn test_content_type_charset_wins() {
        for (encoding, text) in [
            (GBK, "中文页面，价格：一百元"),
            (SHIFT_JIS, "日本語のテキスト"),
            (WINDOWS_1252, "café crème brûlée"),
        ] {
            let body = encode(encoding, text);
            let ct = format!("text/html; charset={}", encoding.name());
            let decoded = decode(body.clone(), None, Some(&ct)).unwrap();
            assert_eq!(decoded, decode_with(encoding, &body));
            assert_eq!(decoded, text);
        }
    }

    #[test]
    fn test_meta_charset_attribute() {
        let html = r#"<html><head><meta charset="gbk"><title>标题</title></head><body>你好</body></html>"#;
        let body = encode(GBK, html);
        let decoded = decode(body.clone(), None, Some("text/html")).unwrap();
        assert_eq!(decoded, decode_with(GBK, &body));
        assert!(decoded.contains("你好"));
    }

    #[test]
    fn test_meta_http_equiv_content() {
        let html = r#"<html><head>
            <meta http-equiv="Content-Type" content="text/html; charset=gb2312">
            </head><body>数据</body></html>"#;
        let body = encode(GBK, html);
        let decoded = decode(body.clone(), None, None).unwrap();
        assert_eq!(decoded, GBK.decode_without_bom_handling(&body).0);
        assert!(decoded.contains("数据"));
    }

    #[test]
    fn test_declared_charset_beats_bom() {
        let body = Bytes::from_static(b"\xEF\xBB\xBFcaf\xE9");
        let decoded = decode(body.clone(), None, Some("text/html; charset=windows-1252")).unwrap();
        assert_eq!(decoded, WINDOWS_1252.decode_without_bom_handling(&body).0);
        assert_eq!(decoded, "\u{EF}\u{BB}\u{BF}caf\u{E9}");

        let body = Bytes::from_static(b"\xFF\xFEab");
        let decoded = decode(body.clone(), None, Some("text/plain; charset=gbk")).unwrap();
        assert_eq!(decoded, GBK.decode_without_bom_handling(&body).0);
        // read as UTF-16LE the same bytes would be a single "扡"
        assert_ne!(decoded, "扡");
    }

    #[test]
    fn test_first_meta_in_document_order() {
        let html = r#"<html><head>
            <meta name="viewport" content="width=device-width">
            <meta charset="shift_jis">
            <meta http-equiv="Content-Type" content="text/html; charset=gbk">
            </head></html>"#;
        assert_eq!(html_charset(html).as_deref(), Some("shift_jis"));
    }

    #[test]
    fn test_no_charset_falls_back_to_utf8() {
        let html = "<html><body>plain ünïcode</body></html>";
        let decoded = decode(Bytes::from(html), None, None).unwrap();
        assert_eq!(decoded, html);
    }

    #[test]
    fn test_gzip_matches_uncompressed() {
        let html = r#"<html><head><meta charset="gbk"></head><body>压缩内容</body></html>"#;
        let plain = encode(GBK, html);
        let compressed = gzip(&plain);

        let a = decode(plain, None, Some("text/html")).unwrap();
        let b = decode(compressed, Some("gzip"), Some("text/html")).unwrap();
        assert_eq!(a, b);
        assert!(b.contains("压缩内容"));
    }

    #[test]
    fn test_corrupt_gzip_is_error() {
        let err = decode(Bytes::from_static(b"not gzip"), Some("GZIP"), None).unwrap_err();
        assert!(matches!(err, DecodeError::Gzip(_)));
    }

    #[test]
    fn test_unknown_charset_is_error() {
        let err = decode(Bytes::from_static(b"abc"), None, Some("text/plain; charset=x-klingon"))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedCharset(ref l) if l == "x-klingon"));

        let html = r#"<meta charset="bogus-8">hi"#;
        assert!(decode(Bytes::from(html), None, None).is_err());
    }

    #[test]
    fn test_charset_from_content_type() {
        assert_eq!(
            charset_from_content_type("text/html; charset=UTF-8").as_deref(),
            Some("UTF-8")
        );
        assert_eq!(
            charset_from_content_type("text/html;Charset=\"gbk\"; q=1").as_deref(),
            Some("gbk")
        );
        assert_eq!(charset_from_content_type("text/html"), None);
        assert_eq!(charset_from_content_type("text/html; charset="), None);
    }
}

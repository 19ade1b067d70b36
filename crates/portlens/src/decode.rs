//! Payload decoding: content-encoding, charset, then JSON or HTML.
//!
//! JSON bodies decode to a single value. HTML bodies yield every embedded
//! structured fragment (JSON script blocks, hydration state, `data-*`
//! attributes) plus the rows of any "Top ports"/"Top lanes" section found
//! by its header text.

use crate::types::{CapturedResponse, DecodeError, Diagnostic, DiagnosticKind, EndpointCategory};
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::HashSet;
use std::io::Read;
use std::sync::OnceLock;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_HEADER_LEN: usize = 80;
const MAX_PARENT_CLIMB: usize = 3;

/// Where a decoded value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrigin {
    /// A data endpoint matched by a categorised rule.
    Endpoint,
    /// The rendered company page. Only used to fill categories no
    /// endpoint supplied.
    Document,
}

/// One decoded structured value.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredValue {
    pub source_url: String,
    /// Set when the value is known to hold a single category.
    pub category: Option<EndpointCategory>,
    pub origin: ValueOrigin,
    pub value: Value,
}

/// Result of decoding a whole capture batch.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub values: Vec<StructuredValue>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Decode every response; a failing response becomes a diagnostic.
pub fn decode_batch(responses: &[CapturedResponse]) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    for response in responses {
        match decode(response) {
            Ok(values) => {
                tracing::debug!("decoded {} value(s) from {}", values.len(), response.url);
                batch.values.extend(values);
            }
            Err(e) => {
                tracing::warn!("failed to decode {}: {e}", response.url);
                batch.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::DecodeError,
                    url: Some(response.url.clone()),
                    message: e.to_string(),
                });
            }
        }
    }
    batch
}

/// Decode one captured response into structured values.
pub fn decode(response: &CapturedResponse) -> Result<Vec<StructuredValue>, DecodeError> {
    let bytes = decompress(&response.body, response.content_encoding.as_deref())?;
    let mime = response.mime_type.trim().to_ascii_lowercase();
    let text = to_text(&bytes, &mime);
    let body = strip_xssi_prefix(text.trim_start());

    if body.is_empty() {
        return Err(DecodeError::NoStructuredData("empty".to_string()));
    }

    let hint = match response.categories.as_slice() {
        [single] => Some(*single),
        _ => None,
    };
    let origin = if response.categories.is_empty() {
        ValueOrigin::Document
    } else {
        ValueOrigin::Endpoint
    };
    let wrap = |category, value| StructuredValue {
        source_url: response.url.clone(),
        category,
        origin,
        value,
    };

    let looks_json = body.starts_with('{') || body.starts_with('[');
    if mime.contains("json") || (!mime.contains("html") && looks_json) {
        let value: Value = serde_json::from_str(body)?;
        return Ok(vec![wrap(hint, value)]);
    }

    if mime.contains("html") || body.starts_with('<') {
        let values: Vec<StructuredValue> = extract_html(body)
            .into_iter()
            .map(|(category, value)| wrap(category.or(hint), value))
            .collect();
        if values.is_empty() {
            return Err(DecodeError::NoStructuredData("html".to_string()));
        }
        return Ok(values);
    }

    let label = if mime.is_empty() { "untyped" } else { mime.as_str() };
    Err(DecodeError::NoStructuredData(label.to_string()))
}

// ── Content encoding ────────────────────────────────────────────────────────

fn decompress<'a>(body: &'a [u8], encoding: Option<&str>) -> Result<Cow<'a, [u8]>, DecodeError> {
    let encodings: Vec<String> = encoding
        .unwrap_or("")
        .split(',')
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e != "identity")
        .collect();

    let mut current = Cow::Borrowed(body);
    // Encodings are listed in the order they were applied.
    for encoding in encodings.iter().rev() {
        current = match encoding.as_str() {
            "gzip" | "x-gzip" => {
                if current.starts_with(&GZIP_MAGIC) {
                    Cow::Owned(inflate(MultiGzDecoder::new(&current[..]), encoding)?)
                } else {
                    // DevTools usually hands back the already-decoded body.
                    current
                }
            }
            "deflate" => {
                if looks_like_zlib(&current) {
                    Cow::Owned(inflate(ZlibDecoder::new(&current[..]), encoding)?)
                } else if std::str::from_utf8(&current).is_ok() {
                    current
                } else {
                    Cow::Owned(inflate(DeflateDecoder::new(&current[..]), encoding)?)
                }
            }
            other => {
                if std::str::from_utf8(&current).is_ok() {
                    current
                } else {
                    return Err(DecodeError::UnsupportedEncoding(other.to_string()));
                }
            }
        };
    }

    if encodings.is_empty() && current.starts_with(&GZIP_MAGIC) {
        current = Cow::Owned(inflate(MultiGzDecoder::new(&current[..]), "gzip")?);
    }
    Ok(current)
}

fn inflate<R: Read>(mut reader: R, encoding: &str) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|source| DecodeError::Decompress {
            encoding: encoding.to_string(),
            source,
        })?;
    Ok(out)
}

fn looks_like_zlib(bytes: &[u8]) -> bool {
    match bytes {
        [cmf, flg, ..] => cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

// ── Text ────────────────────────────────────────────────────────────────────

fn charset(mime: &str) -> Option<&str> {
    mime.split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("charset="))
        .map(|c| c.trim_matches('"'))
        .next()
}

fn to_text<'a>(bytes: &'a [u8], mime: &str) -> Cow<'a, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match charset(mime) {
        Some("iso-8859-1" | "latin1" | "latin-1" | "windows-1252") => {
            Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect())
        }
        _ => String::from_utf8_lossy(bytes),
    }
}

fn strip_xssi_prefix(body: &str) -> &str {
    body.strip_prefix(")]}'")
        .map(|rest| rest.trim_start_matches(',').trim_start())
        .unwrap_or(body)
}

// ── HTML fragments ──────────────────────────────────────────────────────────

const DATA_ATTRIBUTES: [&str; 3] = ["data-props", "data-json", "data-page"];

fn extract_html(html: &str) -> Vec<(Option<EndpointCategory>, Value)> {
    let document = Html::parse_document(html);
    let mut out = Vec::new();
    extract_json_scripts(&document, &mut out);
    extract_state_assignments(&document, &mut out);
    extract_data_attributes(&document, &mut out);
    extract_sections(&document, &mut out);
    out
}

fn extract_json_scripts(document: &Html, out: &mut Vec<(Option<EndpointCategory>, Value)>) {
    let Ok(sel) = Selector::parse(
        r#"script[type="application/json"], script[type="application/ld+json"], script#__NEXT_DATA__"#,
    ) else {
        return;
    };
    for element in document.select(&sel) {
        let text = element.text().collect::<String>();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            out.push((None, value));
        }
    }
}

fn state_assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)window\.__[A-Z0-9_]+__\s*=\s*(\{.*\})\s*;?\s*$")
            .expect("state assignment regex is valid")
    })
}

/// `window.__INITIAL_STATE__ = {...};` hydration blocks.
fn extract_state_assignments(document: &Html, out: &mut Vec<(Option<EndpointCategory>, Value)>) {
    let Ok(sel) = Selector::parse("script:not([src])") else {
        return;
    };
    for element in document.select(&sel) {
        let text = element.text().collect::<String>();
        let Some(captures) = state_assignment_re().captures(text.trim()) else {
            continue;
        };
        if let Ok(value) = serde_json::from_str::<Value>(&captures[1]) {
            out.push((None, value));
        }
    }
}

fn extract_data_attributes(document: &Html, out: &mut Vec<(Option<EndpointCategory>, Value)>) {
    let Ok(sel) = Selector::parse("[data-props], [data-json], [data-page]") else {
        return;
    };
    for element in document.select(&sel) {
        for attr in DATA_ATTRIBUTES {
            let Some(raw) = element.value().attr(attr) else {
                continue;
            };
            if let Ok(value) = serde_json::from_str::<Value>(raw.trim()) {
                if value.is_object() || value.is_array() {
                    out.push((None, value));
                }
            }
        }
    }
}

// ── Header-anchored sections ────────────────────────────────────────────────

struct SectionPatterns {
    headers: [(EndpointCategory, Regex); 3],
    row: Regex,
}

fn section_patterns() -> &'static SectionPatterns {
    static PATTERNS: OnceLock<SectionPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).expect("section regex is valid");
        SectionPatterns {
            headers: [
                (
                    EndpointCategory::ExportPorts,
                    re(r"(?i)\b(top\s+ports?\s+(shipped\s+)?from|origin\s+ports?|export\s+ports?|exit\s+ports?|shipping\s+from)\b"),
                ),
                (
                    EndpointCategory::ImportPorts,
                    re(r"(?i)\b(top\s+ports?\s+(shipped\s+)?to|destination\s+ports?|import\s+ports?|entry\s+ports?|shipping\s+to)\b"),
                ),
                (
                    EndpointCategory::TradeLanes,
                    re(r"(?i)\b(top\s+(trade\s+)?lanes(\s+used)?|trade\s+lanes|trade\s+routes|shipping\s+(lanes|routes))\b"),
                ),
            ],
            row: re(r"(?i)^(.+?)[\s:|—–-]*\s(\d[\d,]*)(\s+shipments?)?$"),
        }
    })
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a `"Yantian, China — 1,247 shipments"` row into label and count.
fn parse_row(text: &str) -> Option<(String, u64)> {
    let captures = section_patterns().row.captures(text)?;
    let label = captures[1]
        .trim()
        .trim_end_matches(|c: char| c == ':' || c == '|' || c == '-' || c == '—' || c == '–')
        .trim();
    let count = captures[2].replace(',', "").parse().ok()?;
    if label.is_empty() || !label.chars().any(char::is_alphabetic) {
        return None;
    }
    Some((label.to_string(), count))
}

fn is_list_container(element: &ElementRef, rows: &Selector) -> bool {
    matches!(element.value().name(), "ul" | "ol" | "table" | "tbody")
        || element.select(rows).next().is_some()
}

/// The first list or table following `header`, climbing a few parents.
fn find_container<'a>(header: ElementRef<'a>, rows: &Selector) -> Option<ElementRef<'a>> {
    let mut anchor = header;
    for _ in 0..=MAX_PARENT_CLIMB {
        let found = anchor
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|sibling| is_list_container(sibling, rows));
        if found.is_some() {
            return found;
        }
        anchor = anchor.parent().and_then(ElementRef::wrap)?;
    }
    None
}

fn extract_sections(document: &Html, out: &mut Vec<(Option<EndpointCategory>, Value)>) {
    let (Ok(headers), Ok(lists), Ok(rows), Ok(table_rows), Ok(list_items)) = (
        Selector::parse("h1, h2, h3, h4, h5, h6, p, span, div, strong, b, th, caption, dt, label, summary"),
        Selector::parse("ul, ol, table, li, tr"),
        Selector::parse("li, tr"),
        Selector::parse("tr"),
        Selector::parse("li"),
    ) else {
        return;
    };

    let patterns = section_patterns();
    let mut seen_containers = HashSet::new();

    for header in document.select(&headers) {
        let text = collapse(&header.text().collect::<String>());
        if text.is_empty() || text.len() > MAX_HEADER_LEN || header.select(&lists).next().is_some() {
            continue;
        }
        let Some(category) = patterns
            .headers
            .iter()
            .find(|(_, re)| re.is_match(&text))
            .map(|(category, _)| *category)
        else {
            continue;
        };
        let Some(container) = find_container(header, &rows) else {
            continue;
        };
        if !seen_containers.insert(container.id()) {
            continue;
        }

        let row_selector = if container.select(&table_rows).next().is_some() {
            &table_rows
        } else {
            &list_items
        };
        let key = if category == EndpointCategory::TradeLanes {
            "lane"
        } else {
            "port"
        };
        let records: Vec<Value> = container
            .select(row_selector)
            .filter_map(|row| {
                let cells: Vec<String> = row.text().map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).collect();
                parse_row(&cells.join(" "))
            })
            .map(|(label, count)| json!({ key: label, "shipments": count }))
            .collect();

        if !records.is_empty() {
            tracing::debug!("found {} {} rows under \"{text}\"", records.len(), category);
            out.push((Some(category), Value::Array(records)));
        }
    }
}

use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::error::ProbeError;

/// Resource metadata learned from the HEAD probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// `None` when the server declares no usable length.
    pub content_length: Option<u64>,
    pub supports_partial: bool,
    pub filename: Option<String>,
}

impl Probe {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|len| *len > 0);

        let supports_partial = headers
            .get_all(ACCEPT_RANGES)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"));

        let filename = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition);

        Self {
            content_length,
            supports_partial,
            filename,
        }
    }
}

/// Issues the HEAD request that every download starts with.
pub async fn probe(client: &Client, url: &Url) -> Result<Probe, ProbeError> {
    let response = client
        .head(url.clone())
        .send()
        .await
        .map_err(ProbeError::Transport)?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status));
    }

    let probe = Probe::from_headers(response.headers());
    debug!(
        %url,
        content_length = ?probe.content_length,
        supports_partial = probe.supports_partial,
        filename = ?probe.filename,
        "probe finished"
    );
    Ok(probe)
}

/// Extracts the filename parameter of a `Content-Disposition` value.
///
/// `filename*` (RFC 5987) wins over `filename`. A value whose disposition type is
/// missing, or whose parameters do not parse, yields `None`.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut parts = split_params(value)?.into_iter();
    let disposition = parts.next()?;
    if disposition.is_empty() || disposition.contains('=') {
        return None;
    }

    let mut plain = None;
    let mut extended = None;
    for param in parts {
        let (key, raw) = param.split_once('=')?;
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim();
        match key.as_str() {
            "filename*" => extended = decode_ext_value(raw),
            "filename" => plain = Some(unquote(raw)?),
            _ => {}
        }
    }

    extended
        .or(plain)
        .and_then(|name| last_component(&name))
}

/// Splits on `;` outside of quoted strings.
fn split_params(value: &str) -> Option<Vec<String>> {
    let mut parts = vec![];
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;
    for c in value.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' if quoted => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                quoted = !quoted;
            }
            ';' if !quoted => parts.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    if quoted {
        return None;
    }
    parts.push(current.trim().to_string());
    parts.retain(|p| !p.is_empty());
    Some(parts)
}

fn unquote(raw: &str) -> Option<String> {
    match raw.strip_prefix('"') {
        Some(inner) => {
            let inner = inner.strip_suffix('"')?;
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    out.push(chars.next()?);
                } else {
                    out.push(c);
                }
            }
            Some(out)
        }
        None if raw.is_empty() || raw.contains(char::is_whitespace) => None,
        None => Some(raw.to_string()),
    }
}

/// Decodes `charset'language'percent-encoded`.
fn decode_ext_value(raw: &str) -> Option<String> {
    let mut fields = raw.splitn(3, '\'');
    let charset = fields.next()?;
    let _language = fields.next()?;
    let encoded = fields.next()?;
    let decoded = percent_decode_str(encoded);
    if charset.eq_ignore_ascii_case("utf-8") {
        decoded.decode_utf8().ok().map(|s| s.into_owned())
    } else {
        // ISO-8859-1 maps byte for byte onto the first 256 code points.
        Some(decoded.map(char::from).collect())
    }
}

fn last_component(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

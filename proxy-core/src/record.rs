//! Persistable form of a captured HTTP request.
//!
//! A [`RequestRecord`] holds everything needed to rebuild and re-issue a
//! request later: the opaque request target, headers, the fully materialized
//! body, parsed forms and trailers. Records are stored as JSON blobs with the
//! body base64-encoded.

use crate::error::ProxyError;
use crate::Result;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::SocketAddr;
use url::form_urlencoded;

const MAX_PARSED_HEADERS: usize = 64;

pub type HeaderRecord = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    /// Request target exactly as received; scheme and host may be absent.
    #[serde(rename = "path")]
    pub url: String,
    pub proto: String,
    pub host: String,
    #[serde(rename = "header", default)]
    pub headers: HeaderRecord,
    #[serde(with = "base64_body", default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    /// `None` when the length was not declared (chunked bodies).
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transfer_encoding: Vec<String>,
    pub close: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub form: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_form: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart_form: Option<MultipartForm>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trailer: HeaderRecord,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    pub request_uri: String,
}

/// Parsed `multipart/form-data` body. File contents are not retained, only
/// their metadata; the raw bytes live in [`RequestRecord::body`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartForm {
    #[serde(default)]
    pub values: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub files: BTreeMap<String, Vec<FileHeader>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size: u64,
}

/// Forms attached to decoded requests as an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormValues {
    /// Query and urlencoded body values combined
    pub form: Vec<(String, String)>,
    /// Urlencoded body values only
    pub post_form: Vec<(String, String)>,
}

impl RequestRecord {
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProxyError::Store(format!("encode record: {}", e)))
    }

    pub fn from_blob(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ProxyError::Decode(format!("record blob: {}", e)))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }
}

/// Read the whole body of `req` and build its record.
///
/// The returned request carries a fresh buffer with the same bytes so it can
/// still be forwarded.
pub async fn capture<B>(
    req: Request<B>,
    remote_addr: Option<SocketAddr>,
) -> Result<(RequestRecord, Request<Bytes>)>
where
    B: hyper::body::Body,
    B::Error: Display,
{
    let (parts, body) = req.into_parts();
    let collected = body
        .collect()
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))?;
    let trailers = collected.trailers().cloned();
    let body = collected.to_bytes();

    let record = encode_head(RequestHead::from(&parts), &body, trailers.as_ref(), remote_addr)?;
    Ok((record, Request::from_parts(parts, body)))
}

/// Build a record from a request whose body is already buffered.
pub fn encode(req: &Request<Bytes>, remote_addr: Option<SocketAddr>) -> Result<RequestRecord> {
    let head = RequestHead {
        method: req.method(),
        uri: req.uri(),
        version: req.version(),
        headers: req.headers(),
    };
    encode_head(head, req.body(), None, remote_addr)
}

struct RequestHead<'a> {
    method: &'a Method,
    uri: &'a Uri,
    version: Version,
    headers: &'a HeaderMap,
}

impl<'a> From<&'a Parts> for RequestHead<'a> {
    fn from(parts: &'a Parts) -> Self {
        Self {
            method: &parts.method,
            uri: &parts.uri,
            version: parts.version,
            headers: &parts.headers,
        }
    }
}

fn encode_head(
    head: RequestHead<'_>,
    body: &Bytes,
    trailers: Option<&HeaderMap>,
    remote_addr: Option<SocketAddr>,
) -> Result<RequestRecord> {
    let query = parse_form(head.uri.query().unwrap_or(""))?;
    let content_type = head
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<mime::Mime>().ok());

    let post_form = if has_form_body(head.method)
        && content_type
            .as_ref()
            .map(|m| m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
            .unwrap_or(false)
    {
        let raw = std::str::from_utf8(body)
            .map_err(|e| ProxyError::FormParse(format!("form body is not UTF-8: {}", e)))?;
        parse_form(raw)?
    } else {
        Vec::new()
    };

    let multipart_form = match content_type.as_ref() {
        Some(m) if m.type_() == mime::MULTIPART && m.subtype() == mime::FORM_DATA => {
            let boundary = m.get_param(mime::BOUNDARY).ok_or_else(|| {
                ProxyError::FormParse("multipart body without boundary".to_string())
            })?;
            Some(parse_multipart(body, boundary.as_str())?)
        }
        _ => None,
    };

    // Body values come first, as they take precedence for lookups.
    let mut combined = post_form.clone();
    combined.extend(query);

    let transfer_encoding: Vec<String> = head
        .headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    let content_length = match head
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        Some(declared) => Some(declared),
        None if transfer_encoding.iter().any(|te| te.eq_ignore_ascii_case("chunked")) => None,
        None => Some(body.len() as u64),
    };

    let close = head
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"));

    let host = head
        .uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            head
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let target = head.uri.to_string();

    Ok(RequestRecord {
        method: head.method.as_str().to_string(),
        url: target.clone(),
        proto: format!("{:?}", head.version),
        host,
        headers: headers_to_record(head.headers),
        body: body.to_vec(),
        content_length,
        transfer_encoding,
        close,
        form: encode_form(&combined),
        post_form: encode_form(&post_form),
        multipart_form,
        trailer: trailers.map(headers_to_record).unwrap_or_default(),
        remote_addr: remote_addr.map(|a| a.to_string()).unwrap_or_default(),
        request_uri: target,
    })
}

/// Rebuild a live request from `record`.
///
/// A target without a scheme gets `https` or `http` depending on `is_https`;
/// a target without a host takes it from `record.host`.
pub fn decode(record: &RequestRecord, is_https: bool) -> Result<Request<Bytes>> {
    let uri = effective_uri(record, is_https)?;
    let method = Method::from_bytes(record.method.as_bytes())
        .map_err(|e| ProxyError::Decode(format!("method {:?}: {}", record.method, e)))?;

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .version(parse_version(&record.proto));

    if let Some(headers) = builder.headers_mut() {
        *headers = record_to_headers(&record.headers)?;
    }

    let forms = FormValues {
        form: parse_form(&record.form)?,
        post_form: parse_form(&record.post_form)?,
    };
    builder = builder.extension(forms);
    if let Some(multipart) = record.multipart_form.clone() {
        builder = builder.extension(multipart);
    }

    builder
        .body(Bytes::from(record.body.clone()))
        .map_err(|e| ProxyError::Decode(e.to_string()))
}

/// Absolute URI the record targets.
pub fn effective_uri(record: &RequestRecord, is_https: bool) -> Result<Uri> {
    let uri = Uri::try_from(record.url.as_str())
        .map_err(|e| ProxyError::Decode(format!("url {:?}: {}", record.url, e)))?;
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri);
    }

    let authority = match uri.authority() {
        Some(authority) => authority.as_str().to_string(),
        None if !record.host.is_empty() => record.host.clone(),
        None => {
            return Err(ProxyError::Decode(format!(
                "url {:?} has no host",
                record.url
            )))
        }
    };
    let scheme = match uri.scheme_str() {
        Some(scheme) => scheme.to_string(),
        None if is_https => "https".to_string(),
        None => "http".to_string(),
    };
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");

    Uri::builder()
        .scheme(scheme.as_str())
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Decode(format!("url {:?}: {}", record.url, e)))
}

fn parse_version(proto: &str) -> Version {
    match proto {
        "HTTP/0.9" => Version::HTTP_09,
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/2.0" => Version::HTTP_2,
        "HTTP/3.0" => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}

fn has_form_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

fn headers_to_record(map: &HeaderMap) -> HeaderRecord {
    let mut out = HeaderRecord::new();
    for (name, value) in map {
        out.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

fn record_to_headers(record: &HeaderRecord) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, values) in record {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::Decode(format!("header name {:?}: {}", name, e)))?;
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProxyError::Decode(format!("header {}: {}", name, e)))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

/// Parse `a=1&b=2` style input, rejecting malformed percent escapes.
pub fn parse_form(raw: &str) -> Result<Vec<(String, String)>> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                let end = (i + 3).min(bytes.len());
                return Err(ProxyError::FormParse(format!(
                    "invalid URL escape {:?}",
                    String::from_utf8_lossy(&bytes[i..end])
                )));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(form_urlencoded::parse(bytes).into_owned().collect())
}

/// Encode values sorted by key, keeping each key's values in order.
pub fn encode_form(pairs: &[(String, String)]) -> String {
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (key, value) in pairs {
        grouped.entry(key.as_str()).or_default().push(value.as_str());
    }

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, values) in grouped {
        for value in values {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

fn parse_multipart(body: &[u8], boundary: &str) -> Result<MultipartForm> {
    let delimiter = format!("--{}", boundary);
    let malformed = |what: &str| ProxyError::FormParse(format!("multipart: {}", what));

    let mut form = MultipartForm::default();
    let mut rest = match find(body, delimiter.as_bytes()) {
        Some(start) => &body[start + delimiter.len()..],
        None => return Err(malformed("missing opening boundary")),
    };

    loop {
        if rest.starts_with(b"--") {
            return Ok(form);
        }
        rest = rest
            .strip_prefix(b"\r\n")
            .ok_or_else(|| malformed("boundary not followed by CRLF"))?;

        let header_end = find(rest, b"\r\n\r\n").ok_or_else(|| malformed("unterminated part headers"))?;
        let headers = String::from_utf8_lossy(&rest[..header_end]);
        let after_headers = &rest[header_end + 4..];

        let closing = format!("\r\n{}", delimiter);
        let content_end = find(after_headers, closing.as_bytes())
            .ok_or_else(|| malformed("missing closing boundary"))?;
        let content = &after_headers[..content_end];
        rest = &after_headers[content_end + closing.len()..];

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').skip(1) {
                    if let Some((k, v)) = param.split_once('=') {
                        let v = v.trim().trim_matches('"').to_string();
                        match k.trim() {
                            "name" => name = Some(v),
                            "filename" => filename = Some(v),
                            _ => {}
                        }
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }

        let Some(name) = name else {
            continue;
        };
        match filename {
            Some(filename) => form.files.entry(name).or_default().push(FileHeader {
                filename,
                content_type,
                size: content.len() as u64,
            }),
            None => form
                .values
                .entry(name)
                .or_default()
                .push(String::from_utf8_lossy(content).into_owned()),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse raw HTTP/1.1 request bytes, possibly several pipelined requests.
///
/// Stops at the first malformed or incomplete message; whatever parsed
/// cleanly before it is returned.
pub fn parse_requests(mut data: &[u8]) -> Vec<Request<Bytes>> {
    let mut requests = Vec::new();
    while !data.is_empty() {
        match parse_one(data) {
            Some((req, consumed)) => {
                requests.push(req);
                data = &data[consumed..];
            }
            None => break,
        }
    }
    requests
}

fn parse_one(data: &[u8]) -> Option<(Request<Bytes>, usize)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_PARSED_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let head_len = match parsed.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        _ => return None,
    };

    let mut builder = Request::builder()
        .method(parsed.method?)
        .uri(parsed.path?)
        .version(match parsed.version? {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        });

    let mut chunked = false;
    let mut content_length = 0usize;
    for header in parsed.headers.iter() {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = String::from_utf8_lossy(header.value)
                .to_ascii_lowercase()
                .contains("chunked");
        } else if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value).ok()?.trim().parse().ok()?;
        }
        builder = builder.header(header.name, header.value);
    }

    let rest = &data[head_len..];
    let (body, body_len) = if chunked {
        decode_chunked(rest)?
    } else if rest.len() >= content_length {
        (Bytes::copy_from_slice(&rest[..content_length]), content_length)
    } else {
        return None;
    };

    let req = builder.body(body).ok()?;
    Some((req, head_len + body_len))
}

fn decode_chunked(data: &[u8]) -> Option<(Bytes, usize)> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = pos + find(&data[pos..], b"\r\n")?;
        let size_line = std::str::from_utf8(&data[pos..line_end]).ok()?;
        let size_hex = size_line.split(';').next()?.trim();
        let size = usize::from_str_radix(size_hex, 16).ok()?;
        pos = line_end + 2;

        if size == 0 {
            // Skip trailer fields up to the terminating empty line.
            loop {
                let end = pos + find(&data[pos..], b"\r\n")?;
                let empty = end == pos;
                pos = end + 2;
                if empty {
                    return Some((Bytes::from(body), pos));
                }
            }
        }

        // Chunk sizes come straight from the client.
        let chunk_end = pos.checked_add(size)?;
        let next = chunk_end.checked_add(2)?;
        if data.len() < next || &data[chunk_end..next] != b"\r\n" {
            return None;
        }
        body.extend_from_slice(&data[pos..chunk_end]);
        pos = next;
    }
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

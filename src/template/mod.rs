//! Response and fan-out body templating.
//!
//! Bodies containing `{{ … }}` markers are rendered with Handlebars against
//! a root context of the decoded request body fields plus `Query` (first
//! query-parameter values) and `Random` (the per-transaction random cache).
//! Helpers memoize generated values through [`TransactionCache`] so the
//! response body and every fan-out body of one transaction agree.
//!
//! Rendered output is `Vec<u8>`: the `invalidUTF8` helper emits an opaque
//! placeholder during rendering and the raw (possibly malformed) bytes are
//! spliced in afterwards, since a Rust `String` cannot hold them.

pub mod invalid_utf8;

use crate::error::{CatalystError, Result};
use crate::random::TransactionCache;
use chrono::Utc;
use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Markers bracketing a raw-bytes placeholder in rendered output.
/// Private-use code points keep them out of any realistic template text.
const RAW_MARK_OPEN: char = '\u{E000}';
const RAW_MARK_CLOSE: char = '\u{E001}';

const FIRST_NAMES: &[&str] = &[
    "Kathryn", "Rebecca", "John", "Maria", "Carlos", "Ana", "Luis", "Patricia", "Roberto",
    "Laura", "David", "Sofia", "Michael", "Isabella", "James", "Emily", "William", "Olivia",
    "Richard", "Emma",
];

const LAST_NAMES: &[&str] = &[
    "Schmitt", "Anderson", "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller",
    "Davis", "Rodriguez", "Martinez", "Hernandez", "Lopez", "Gonzalez", "Wilson", "Thomas",
    "Taylor", "Moore",
];

const MESSAGES: &[&str] = &[
    "PRUEBA ENVIO",
    "TRANSFERENCIA",
    "PAGO SERVICIO",
    "ABONO CUENTA",
    "DEBITO AUTOMATICO",
    "CREDITO AUTOMATICO",
    "TRANSACCION PRUEBA",
    "OPERACION TEST",
];

/// The request-scoped inputs a template render needs.
#[derive(Debug, Clone, Default)]
pub struct RequestInput {
    /// Buffered request body bytes.
    pub body: Vec<u8>,
    /// The request's `Content-Type`, if any.
    pub content_type: Option<String>,
    /// First value of each query parameter.
    pub query: HashMap<String, String>,
}

/// Decoded request data shared by all helpers of one render.
struct HelperState {
    cache: Arc<TransactionCache>,
    query: HashMap<String, String>,
    /// Decoded JSON body (object root), or `Null` when the body is not
    /// JSON-shaped.
    body: Value,
    /// Raw body text when the request carried XML instead of JSON.
    body_xml: String,
}

/// Render a template to bytes.
///
/// Templates without `{{` markers pass through untouched. Rendering
/// failures surface as [`CatalystError::Template`].
pub fn render_bytes(
    template: &str,
    input: &RequestInput,
    cache: &Arc<TransactionCache>,
) -> Result<Vec<u8>> {
    if !template.contains("{{") {
        return Ok(template.as_bytes().to_vec());
    }

    let state = Arc::new(decode_request(input, cache));

    let mut data = match &state.body {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    data.insert(
        "Query".to_string(),
        json!(state.query.clone()),
    );
    data.insert("Random".to_string(), Value::Object(cache.snapshot()));

    let registry = build_registry(&state);
    let rendered = registry
        .render_template(template, &Value::Object(data))
        .map_err(|e| CatalystError::Template(e.to_string()))?;

    Ok(splice_raw_bytes(rendered, cache))
}

/// Render a template, lossily converting the output to a `String`.
/// Convenient for callers that never use `invalidUTF8`.
pub fn render_string(
    template: &str,
    input: &RequestInput,
    cache: &Arc<TransactionCache>,
) -> Result<String> {
    let bytes = render_bytes(template, input, cache)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_request(input: &RequestInput, cache: &Arc<TransactionCache>) -> HelperState {
    let mut body = Value::Null;
    let mut body_xml = String::new();

    if !input.body.is_empty() {
        match serde_json::from_slice::<Value>(&input.body) {
            Ok(value @ Value::Object(_)) => body = value,
            _ => {
                let text = String::from_utf8_lossy(&input.body);
                let is_xml = input
                    .content_type
                    .as_deref()
                    .map(|ct| ct.contains("xml"))
                    .unwrap_or(false)
                    || text.contains("<?xml")
                    || text.contains('<');
                if is_xml {
                    body_xml = text.into_owned();
                }
            }
        }
    }

    HelperState {
        cache: Arc::clone(cache),
        query: input.query.clone(),
        body,
        body_xml,
    }
}

fn build_registry(state: &Arc<HelperState>) -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    // Bodies are JSON/XML/plain text, never HTML.
    hb.register_escape_fn(handlebars::no_escape);

    hb.register_helper(
        "toJson",
        Box::new(
            |h: &Helper,
             _: &Handlebars,
             _: &Context,
             _: &mut RenderContext,
             out: &mut dyn Output|
             -> HelperResult {
                let rendered = h
                    .param(0)
                    .map(|p| serde_json::to_string(p.value()).unwrap_or_else(|_| "null".into()))
                    .unwrap_or_else(|| "null".into());
                out.write(&rendered)?;
                Ok(())
            },
        ),
    );

    hb.register_helper(
        "now",
        Box::new(
            |h: &Helper,
             _: &Handlebars,
             _: &Context,
             _: &mut RenderContext,
             out: &mut dyn Output|
             -> HelperResult {
                let now = Utc::now();
                match h.param(0).and_then(|p| p.value().as_str()) {
                    Some(format) => out.write(&now.format(format).to_string())?,
                    None => out.write(&now.to_rfc3339())?,
                }
                Ok(())
            },
        ),
    );

    hb.register_helper(
        "default",
        Box::new(
            |h: &Helper,
             _: &Handlebars,
             _: &Context,
             _: &mut RenderContext,
             out: &mut dyn Output|
             -> HelperResult {
                let value = h.param(0).map(|p| p.value().clone()).unwrap_or(Value::Null);
                let fallback = h.param(1).map(|p| p.value().clone()).unwrap_or(Value::Null);
                let chosen = match &value {
                    Value::Null => fallback,
                    Value::String(s) if s.is_empty() => fallback,
                    _ => value,
                };
                out.write(&value_to_string(&chosen))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "query",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let name = h.param(0).and_then(|p| p.value().as_str()).unwrap_or("");
                if let Some(value) = st.query.get(name) {
                    out.write(value)?;
                }
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randInt",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let min = h.param(0).and_then(|p| p.value().as_i64()).unwrap_or(0);
                let max = h.param(1).and_then(|p| p.value().as_i64()).unwrap_or(min + 1);
                let key = format!("randInt_{min}_{max}");
                let value = st.cache.get_or_insert_with(&key, || {
                    let upper = if max > min { max } else { min + 1 };
                    json!(rand::thread_rng().gen_range(min..upper))
                });
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randNumericString",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let len = h.param(0).and_then(|p| p.value().as_u64()).unwrap_or(0) as usize;
                let key = format!("randNumericString_{len}");
                let value = st
                    .cache
                    .get_or_insert_with(&key, || json!(numeric_string(len)));
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randString",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                const CHARS: &[u8] =
                    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
                let len = h.param(0).and_then(|p| p.value().as_u64()).unwrap_or(0) as usize;
                let key = format!("randString_{len}");
                let value = st.cache.get_or_insert_with(&key, || {
                    let mut rng = rand::thread_rng();
                    let s: String = (0..len)
                        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
                        .collect();
                    json!(s)
                });
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randChoice",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let choices: Vec<String> = h
                    .params()
                    .iter()
                    .map(|p| value_to_string(p.value()))
                    .collect();
                if choices.is_empty() {
                    return Ok(());
                }
                let key = format!("randChoice_{}", choices.join("_"));
                let value = st.cache.get_or_insert_with(&key, || {
                    json!(choices[rand::thread_rng().gen_range(0..choices.len())])
                });
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randFloat",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let min = h.param(0).and_then(|p| p.value().as_f64()).unwrap_or(0.0);
                let max = h.param(1).and_then(|p| p.value().as_f64()).unwrap_or(min);
                let key = format!("randFloat_{min}_{max}");
                let value = st.cache.get_or_insert_with(&key, || {
                    let sample: f64 = rand::thread_rng().gen();
                    json!(min + sample * (max - min))
                });
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randName",
        Box::new(
            move |_: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let value = st.cache.get_or_insert_with("randName", || {
                    let mut rng = rand::thread_rng();
                    json!(format!(
                        "{} {}",
                        FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())],
                        LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())]
                    ))
                });
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randMessage",
        Box::new(
            move |_: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let value = st.cache.get_or_insert_with("randMessage", || {
                    json!(MESSAGES[rand::thread_rng().gen_range(0..MESSAGES.len())])
                });
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randAccount",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let prefix = h
                    .param(0)
                    .map(|p| value_to_string(p.value()))
                    .unwrap_or_default();
                let len = h.param(1).and_then(|p| p.value().as_u64()).unwrap_or(0) as usize;
                let key = format!("randAccount_{prefix}_{len}");
                let value = st
                    .cache
                    .get_or_insert_with(&key, || json!(format!("{prefix}{}", numeric_string(len))));
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "randVenezuelanID",
        Box::new(
            move |_: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let value = st.cache.get_or_insert_with("randVenezuelanID", || {
                    const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
                    let letter = LETTERS[rand::thread_rng().gen_range(0..LETTERS.len())] as char;
                    json!(format!("{letter}{}", numeric_string(8)))
                });
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "invalidUTF8",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                // The utf8_type query parameter wins over the template argument.
                let kind = st
                    .query
                    .get("utf8_type")
                    .cloned()
                    .or_else(|| {
                        h.param(0)
                            .and_then(|p| p.value().as_str())
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                    });

                let value = match kind {
                    Some(kind) => {
                        let cache = Arc::clone(&st.cache);
                        st.cache.get_or_insert_with(&format!("invalidUTF8_{kind}"), move || {
                            let token = uuid::Uuid::new_v4().simple().to_string();
                            cache.put_raw_bytes(&token, invalid_utf8::generate_by_type_name(&kind));
                            json!(format!("{RAW_MARK_OPEN}{token}{RAW_MARK_CLOSE}"))
                        })
                    }
                    None => st.cache.get_or_insert_with("invalidUTF8_valid", || {
                        json!(invalid_utf8::generate_valid_utf8())
                    }),
                };
                out.write(&value_to_string(&value))?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "jsonValue",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let path = h.param(0).and_then(|p| p.value().as_str()).unwrap_or("");
                if let Some(value) = lookup_json_path(&st.body, path) {
                    out.write(&value_to_string(&value))?;
                }
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "jsonValueOr",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let path = h.param(0).and_then(|p| p.value().as_str()).unwrap_or("");
                let fallback = h
                    .param(1)
                    .map(|p| value_to_string(p.value()))
                    .unwrap_or_default();
                let resolved = lookup_json_path(&st.body, path)
                    .map(|v| value_to_string(&v))
                    .filter(|s| !s.is_empty())
                    .unwrap_or(fallback);
                out.write(&resolved)?;
                Ok(())
            },
        ),
    );

    let st = Arc::clone(state);
    hb.register_helper(
        "xmlValue",
        Box::new(
            move |h: &Helper,
                  _: &Handlebars,
                  _: &Context,
                  _: &mut RenderContext,
                  out: &mut dyn Output|
                  -> HelperResult {
                let path = h.param(0).and_then(|p| p.value().as_str()).unwrap_or("");
                if let Some(value) = lookup_xml_path(&st.body_xml, path) {
                    out.write(&value)?;
                }
                Ok(())
            },
        ),
    );

    hb
}

/// Dotted-path lookup with numeric array indexes, e.g. `items.0.name`.
fn lookup_json_path(root: &Value, path: &str) -> Option<Value> {
    if path.is_empty() || root.is_null() {
        return None;
    }

    let mut current = root;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => {
                let index: usize = part.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Tag-scoped substring extraction from a raw XML body.
///
/// A dotted path narrows the search to the fragment inside the parent tag
/// first, then extracts the innermost tag's text content.
fn lookup_xml_path(xml: &str, path: &str) -> Option<String> {
    if xml.is_empty() || path.is_empty() {
        return None;
    }

    let parts: Vec<&str> = path.split('.').collect();
    let tag = parts.last()?;

    let mut haystack = xml;
    let narrowed;
    if parts.len() > 1 {
        let parent = parts[parts.len() - 2];
        let parent_re = regex::Regex::new(&format!(
            r"<{0}(?:\s[^>]*)?>([\s\S]*?)</{0}>",
            regex::escape(parent)
        ))
        .ok()?;
        narrowed = parent_re.captures(xml)?.get(1)?.as_str().to_string();
        haystack = &narrowed;
    }

    let tag_re = regex::Regex::new(&format!(
        r"<{0}(?:\s[^>]*)?>([^<]*)</{0}>",
        regex::escape(tag)
    ))
    .ok()?;
    tag_re
        .captures(haystack)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Render a JSON value the way a template author expects: bare strings,
/// integral floats without the trailing `.0`.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn numeric_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect()
}

/// Replace raw-bytes placeholders with their stored byte sequences.
fn splice_raw_bytes(rendered: String, cache: &Arc<TransactionCache>) -> Vec<u8> {
    if !rendered.contains(RAW_MARK_OPEN) {
        return rendered.into_bytes();
    }

    let mut out = Vec::with_capacity(rendered.len());
    let mut rest = rendered.as_str();
    while let Some(start) = rest.find(RAW_MARK_OPEN) {
        out.extend_from_slice(rest[..start].as_bytes());
        let after = &rest[start + RAW_MARK_OPEN.len_utf8()..];
        match after.find(RAW_MARK_CLOSE) {
            Some(end) => {
                let token = &after[..end];
                if let Some(bytes) = cache.raw_bytes(token) {
                    out.extend_from_slice(&bytes);
                }
                rest = &after[end + RAW_MARK_CLOSE.len_utf8()..];
            }
            None => {
                out.extend_from_slice(rest[start..].as_bytes());
                rest = "";
            }
        }
    }
    out.extend_from_slice(rest.as_bytes());
    out
}

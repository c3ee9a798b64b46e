use std::collections::HashMap;

use serde_json::Value;

use crate::error::RequestError;

/// One client-to-server message: an unordered set of string pairs.
pub type Map = HashMap<String, String>;

/// Decodes the forward-channel body. The client flattens each map into
/// `reqN_<key>=<value>` pairs and announces the batch with `count` and the
/// offset of the first map in `ofs`.
pub fn decode_incoming_maps(pairs: &[(String, String)]) -> Result<(u64, Vec<Map>), RequestError> {
    let count: usize = single_value(pairs, "count")?
        .parse()
        .map_err(|_| RequestError::malformed("count is not a non-negative integer"))?;
    let offset: u64 = single_value(pairs, "ofs")?
        .parse()
        .map_err(|_| RequestError::malformed("ofs is not a non-negative integer"))?;

    let mut maps = vec![Map::new(); count];
    for (key, value) in pairs {
        let Some(rest) = key.strip_prefix("req") else {
            continue;
        };
        let Some(sep) = rest.find('_') else {
            continue;
        };
        // Only keys shaped like reqN_* belong to the batch; anything else in
        // the body is not ours to judge.
        let Ok(index) = rest[..sep].parse::<usize>() else {
            continue;
        };
        let map_key = &rest[sep + 1..];
        let map = maps
            .get_mut(index)
            .ok_or_else(|| RequestError::malformed("map index out of range"))?;
        if map.insert(map_key.to_string(), value.clone()).is_some() {
            return Err(RequestError::malformed("duplicate key in map"));
        }
    }

    Ok((offset, maps))
}

/// Encodes one outgoing batch as `[[arrayId, payload], ...]`.
pub fn encode_batch(items: &[(u64, &Value)]) -> String {
    serde_json::to_string(&items).expect("batch of JSON values serializes")
}

/// Raw back-channel framing: the byte length of the JSON payload, a newline,
/// then the payload itself.
pub fn length_prefixed(json: &str) -> String {
    format!("{}\n{}", json.len(), json)
}

pub const HTML_HEAD: &str = "<html><body>";

/// Legacy streaming clients only surface incremental data once the response
/// has crossed the browser's internal buffering threshold; this padding block
/// is a protocol constant, not tunable.
pub fn html_padding() -> String {
    let mut padding = " ".repeat(1024);
    padding.push_str("<br>");
    padding
}

pub fn html_domain(domain: &str) -> String {
    format!(
        "<script>try{{document.domain=\"{}\"}}catch(e){{}}</script>",
        js_escape(domain)
    )
}

pub fn html_rpc(payload: &str) -> String {
    format!(
        "<script>try{{parent.m(\"{}\")}}catch(e){{}}</script>",
        js_escape(payload)
    )
}

pub fn html_done() -> &'static str {
    "<script>try{parent.d()}catch(e){}</script>"
}

/// Escapes a string for embedding inside a double-quoted JS string literal
/// within an HTML script block. Angle brackets are hex-escaped so the
/// payload cannot terminate the surrounding `<script>` element.
pub fn js_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '<' => out.push_str("\\x3c"),
            '>' => out.push_str("\\x3e"),
            '&' => out.push_str("\\x26"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn single_value<'a>(pairs: &'a [(String, String)], key: &str) -> Result<&'a str, RequestError> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| RequestError::malformed(format!("missing {key} parameter")))
}

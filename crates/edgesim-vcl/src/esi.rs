//! Edge Side Includes applied to the delivered body.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Budget for each include sub-request.
pub const INCLUDE_TIMEOUT: Duration = Duration::from_secs(10);

const REMOVE_OPEN: &str = "<esi:remove>";
const REMOVE_CLOSE: &str = "</esi:remove>";

fn include_pattern() -> &'static Regex {
    static INCLUDE: OnceLock<Regex> = OnceLock::new();
    INCLUDE.get_or_init(|| {
        Regex::new(r#"<esi:include\s*src=['"]([^'"]+)['"]\s*/?\s*>"#)
            .unwrap_or_else(|_| unreachable!("static ESI pattern"))
    })
}

/// Splits `<esi:remove>inner</esi:remove>rest` into `(inner, rest)`.
fn split_remove(block: &str) -> Result<(&str, &str), String> {
    let body = &block[REMOVE_OPEN.len()..];
    let close = body
        .find(REMOVE_CLOSE)
        .ok_or_else(|| "Syntax error: does not seem to close </esi:remove>".to_string())?;
    Ok((&body[..close], &body[close + REMOVE_CLOSE.len()..]))
}

/// Request path for an include `src` found on the page at `base`. Sources
/// without a leading `/` resolve against the page's directory.
pub fn resolve_path(base: &str, src: &str) -> String {
    if src.starts_with('/') {
        return src.to_string();
    }
    let (src_path, query) = match src.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (src, None),
    };
    let base_path = base.split(['?', '#']).next().unwrap_or_default();
    let dir = base_path.rfind('/').map_or("", |idx| &base_path[..idx]);

    let mut segments: Vec<&str> = dir.split('/').filter(|seg| !seg.is_empty()).collect();
    for seg in src_path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            seg => segments.push(seg),
        }
    }
    let mut out = format!("/{}", segments.join("/"));
    if src_path.ends_with('/') && out.len() > 1 {
        out.push('/');
    }
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Replaces every include with the body `fetch` returns for its `src`.
///
/// A remove block directly after an include is the include's fallback: it
/// is dropped when the include succeeds and its contents are emitted when
/// the include fails. Any other remove block is dropped.
pub fn expand(
    body: &str,
    mut fetch: impl FnMut(&str) -> Result<Vec<u8>, String>,
) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;
    loop {
        let include = include_pattern().captures(rest);
        let include_at = include
            .as_ref()
            .and_then(|caps| caps.get(0))
            .map(|m| m.start());
        let remove_at = rest.find(REMOVE_OPEN);

        match (include_at, remove_at) {
            (None, None) => {
                out.extend_from_slice(rest.as_bytes());
                return Ok(out);
            }
            (Some(inc), Some(rem)) if rem < inc => {
                out.extend_from_slice(rest[..rem].as_bytes());
                rest = split_remove(&rest[rem..])?.1;
            }
            (None, Some(rem)) => {
                out.extend_from_slice(rest[..rem].as_bytes());
                rest = split_remove(&rest[rem..])?.1;
            }
            (Some(_), _) => {
                let Some(caps) = include else {
                    return Ok(out);
                };
                let (Some(whole), Some(src)) = (caps.get(0), caps.get(1)) else {
                    return Ok(out);
                };
                out.extend_from_slice(rest[..whole.start()].as_bytes());
                let after = &rest[whole.end()..];
                let trimmed = after.trim_start();
                let fallback = if trimmed.starts_with(REMOVE_OPEN) {
                    Some(split_remove(trimmed)?)
                } else {
                    None
                };
                match fetch(src.as_str()) {
                    Ok(included) => {
                        out.extend_from_slice(&included);
                        rest = fallback.map(|(_, tail)| tail).unwrap_or(after);
                    }
                    Err(err) => {
                        edgesim_rt::log::warn(&format!(
                            "esi include {} failed: {err}",
                            src.as_str()
                        ));
                        match fallback {
                            Some((inner, tail)) => {
                                out.extend_from_slice(inner.as_bytes());
                                rest = tail;
                            }
                            None => rest = after,
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{expand, resolve_path};

    fn fetch_ok(src: &str) -> Result<Vec<u8>, String> {
        match src {
            "/header" => Ok(b"<h1>hi</h1>".to_vec()),
            other => Err(format!("404 for {other}")),
        }
    }

    fn expand_text(body: &str) -> Result<String, String> {
        expand(body, fetch_ok).map(|out| String::from_utf8_lossy(&out).into_owned())
    }

    #[test]
    fn includes_are_spliced_in_place() {
        let out = expand_text(r#"<p>a</p><esi:include src="/header" /><p>b</p>"#).expect("esi");
        assert_eq!(out, "<p>a</p><h1>hi</h1><p>b</p>");
        let single = expand_text("x<esi:include src='/header'>y").expect("esi");
        assert_eq!(single, "x<h1>hi</h1>y");
    }

    #[test]
    fn failed_include_falls_back_to_remove_block() {
        let out = expand_text(
            r#"<esi:include src="/missing"/> <esi:remove><a href="/missing">fallback</a></esi:remove>!"#,
        )
        .expect("esi");
        assert_eq!(out, r#"<a href="/missing">fallback</a>!"#);
    }

    #[test]
    fn successful_include_drops_adjacent_remove_block() {
        let out = expand_text(
            r#"<esi:include src="/header"/><esi:remove>fallback</esi:remove>."#,
        )
        .expect("esi");
        assert_eq!(out, "<h1>hi</h1>.");
    }

    #[test]
    fn standalone_remove_blocks_are_dropped() {
        let out = expand_text("a<esi:remove>b</esi:remove>c").expect("esi");
        assert_eq!(out, "ac");
    }

    #[test]
    fn unclosed_remove_is_an_error() {
        let err = expand_text("a<esi:remove>b").expect_err("unclosed");
        assert_eq!(err, "Syntax error: does not seem to close </esi:remove>");
    }

    #[test]
    fn relative_sources_resolve_against_the_page_directory() {
        assert_eq!(resolve_path("/shop/index.html?x=1", "frag.html"), "/shop/frag.html");
        assert_eq!(resolve_path("/shop/cart/", "../nav.html?v=2"), "/shop/nav.html?v=2");
        assert_eq!(resolve_path("/", "./frag.html"), "/frag.html");
        assert_eq!(resolve_path("/shop/index.html", "/abs.html"), "/abs.html");
    }
}

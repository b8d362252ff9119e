use std::collections::BTreeMap;

use crate::value::{LenientString, Value, ValueKind};

/// Headers VCL may neither `set` nor `unset`.
const RESERVED: &[&str] = &[
    "proxy-authenticate",
    "proxy-authorization",
    "content-length",
    "content-range",
    "te",
    "trailer",
    "expect",
    "transfer-encoding",
    "upgrade",
    "fastly-ff",
];

pub fn is_reserved(name: &str) -> bool {
    let name = name.split(':').next().unwrap_or(name);
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name))
}

/// MIME-style canonical form: `content-type` becomes `Content-Type`.
/// Keys carrying characters outside the token set are returned unchanged.
pub fn canonical_key(key: &str) -> String {
    let valid = key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
    if !valid {
        return key.to_string();
    }
    let mut upper = true;
    key.chars()
        .map(|ch| {
            let out = if upper {
                ch.to_ascii_uppercase()
            } else {
                ch.to_ascii_lowercase()
            };
            upper = ch == '-';
            out
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct HeaderItem {
    pub key: LenientString,
    pub value: Option<LenientString>,
}

impl HeaderItem {
    fn plain(key: LenientString) -> Self {
        Self { key, value: None }
    }

    fn render(&self) -> Option<String> {
        if self.key.strict().is_empty() {
            return None;
        }
        let mut line = self.key.lenient();
        if let Some(value) = &self.value {
            if !value.strict().is_empty() {
                line.push('=');
                line.push_str(&value.lenient());
            }
        }
        Some(line)
    }
}

/// Header field map: canonical name to lines, each line a list of items.
/// `Name:sub` addresses a named item inside the first line.
#[derive(Clone, Debug, Default)]
pub struct Header {
    fields: BTreeMap<String, Vec<Vec<HeaderItem>>>,
}

fn to_lenient(value: Value) -> LenientString {
    match value.kind {
        ValueKind::String { value, not_set } => {
            let mut ls = LenientString {
                values: Vec::new(),
                not_set,
            };
            if !value.is_empty() {
                ls.values.push(Value::string(value));
            }
            ls
        }
        ValueKind::Ip(addr) => match addr {
            Some(addr) => LenientString::from_text(&addr.to_string()),
            None => LenientString::not_set(),
        },
        ValueKind::Lenient(ls) => ls,
        ValueKind::Backend(backend) => LenientString::from_text(backend.name()),
        _ => LenientString::from_value(value),
    }
}

fn separator(name: &str) -> &'static str {
    if name == "Cookie" { "; " } else { "," }
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: Value) {
        if let Some((name, sub)) = key.split_once(':') {
            self.set_object(name, sub, value);
            return;
        }
        self.fields
            .insert(canonical_key(key), vec![vec![HeaderItem::plain(to_lenient(value))]]);
    }

    pub fn set_object(&mut self, name: &str, sub: &str, value: Value) {
        let item = HeaderItem {
            key: LenientString::from_text(sub),
            value: Some(to_lenient(value)),
        };
        let lines = self.fields.entry(canonical_key(name)).or_default();
        match lines.first_mut() {
            Some(first) => {
                if let Some(existing) = first
                    .iter_mut()
                    .find(|existing| existing.key.lenient() == sub)
                {
                    *existing = item;
                } else {
                    first.push(item);
                }
            }
            None => lines.push(vec![item]),
        }
    }

    /// Appends a new line, as `add req.http.Name = ...` does.
    pub fn add(&mut self, key: &str, value: Value) {
        let name = canonical_key(key);
        match self.fields.get_mut(&name) {
            Some(lines) => lines.push(vec![HeaderItem::plain(to_lenient(value))]),
            None => self.set(key, value),
        }
    }

    /// Appends a raw wire value, splitting it into items the way inbound
    /// headers are parsed.
    pub fn append_raw(&mut self, name: &str, raw: &str) {
        let name = canonical_key(name);
        let parts: Vec<&str> = match name.as_str() {
            "Cookie" => raw.split(';').collect(),
            "Set-Cookie" => vec![raw],
            _ => raw.split(',').collect(),
        };
        let line = parts
            .into_iter()
            .map(|part| match part.split_once('=') {
                Some((key, value)) if name != "Set-Cookie" => HeaderItem {
                    key: LenientString::from_text(key.trim()),
                    value: Some(LenientString::from_text(value.trim())),
                },
                _ => HeaderItem::plain(LenientString::from_text(part)),
            })
            .collect();
        self.fields.entry(name).or_default().push(line);
    }

    pub fn get(&self, key: &str) -> LenientString {
        if let Some((name, sub)) = key.split_once(':') {
            return self.get_object(name, sub);
        }
        let name = canonical_key(key);
        let Some(first) = self.fields.get(&name).and_then(|lines| lines.first()) else {
            return LenientString::not_set();
        };
        let mut merged = LenientString::default();
        for item in first {
            if item.key.not_set {
                continue;
            }
            if !merged.values.is_empty() {
                merged.push(Value::string(separator(&name)));
            }
            merged.values.extend(item.key.values.iter().cloned());
            if let Some(value) = item.value.as_ref().filter(|v| !v.not_set) {
                if !value.strict().is_empty() {
                    merged.push(Value::string("="));
                }
                merged.values.extend(value.values.iter().cloned());
            }
        }
        if merged.values.is_empty() {
            return LenientString::not_set();
        }
        merged
    }

    pub fn get_object(&self, name: &str, sub: &str) -> LenientString {
        self.fields
            .get(&canonical_key(name))
            .and_then(|lines| lines.first())
            .and_then(|first| first.iter().find(|item| item.key.lenient() == sub))
            .and_then(|item| item.value.clone())
            .unwrap_or_else(LenientString::not_set)
    }

    pub fn del(&mut self, key: &str) {
        if let Some((name, sub)) = key.split_once(':') {
            self.del_object(name, sub);
            return;
        }
        self.fields.remove(&canonical_key(key));
    }

    pub fn del_object(&mut self, name: &str, sub: &str) {
        if let Some(first) = self
            .fields
            .get_mut(&canonical_key(name))
            .and_then(|lines| lines.first_mut())
        {
            first.retain(|item| item.key.lenient() != sub);
        }
    }

    /// Folds every line of `name` into the first one (`std.collect`).
    pub fn collect(&mut self, name: &str) {
        let name = canonical_key(name);
        if let Some(lines) = self.fields.get_mut(&name) {
            if lines.len() > 1 {
                let merged: Vec<HeaderItem> = lines.drain(..).flatten().collect();
                lines.push(merged);
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        !self.get(key).not_set
    }

    /// First wire line of a field, if any.
    pub fn get_raw(&self, name: &str) -> Option<String> {
        let name = canonical_key(name);
        self.fields
            .get(&name)
            .and_then(|lines| lines.first())
            .map(|line| render_line(&name, line))
            .filter(|line| !line.is_empty())
    }

    /// Wire form, one `(name, value)` pair per line.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (name, lines) in &self.fields {
            for line in lines {
                let rendered = render_line(name, line);
                if !rendered.is_empty() {
                    out.push((name.clone(), rendered));
                }
            }
        }
        out
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut header = Header::new();
        for (name, value) in pairs {
            header.append_raw(name, value);
        }
        header
    }

    /// Number of wire lines.
    pub fn line_count(&self) -> usize {
        self.fields.values().map(Vec::len).sum()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn lines(&self, name: &str) -> &[Vec<HeaderItem>] {
        self.fields
            .get(&canonical_key(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn render_line(name: &str, line: &[HeaderItem]) -> String {
    line.iter()
        .filter_map(HeaderItem::render)
        .collect::<Vec<_>>()
        .join(separator(name))
}

#[cfg(test)]
mod tests {
    use super::{Header, canonical_key, is_reserved};
    use crate::value::Value;

    #[test]
    fn canonicalizes_keys() {
        assert_eq!(canonical_key("x-forwarded-for"), "X-Forwarded-For");
        assert_eq!(canonical_key("CONTENT-type"), "Content-Type");
        assert_eq!(canonical_key("bad key"), "bad key");
    }

    #[test]
    fn absent_header_is_not_set() {
        let header = Header::new();
        assert!(header.get("X-Missing").not_set);
        assert!(header.get("X-Missing:sub").not_set);
    }

    #[test]
    fn sub_fields_live_in_the_first_line() {
        let mut header = Header::new();
        header.set("Cookie:session", Value::string("abc"));
        header.set("Cookie:theme", Value::string("dark"));
        assert_eq!(header.get("cookie:session").strict(), "abc");
        assert_eq!(header.get_raw("Cookie").as_deref(), Some("session=abc; theme=dark"));
        header.del("Cookie:session");
        assert_eq!(header.get("Cookie").strict(), "theme=dark");
        assert!(header.get("Cookie:Session").not_set);
    }

    #[test]
    fn add_appends_lines_and_set_replaces() {
        let mut header = Header::new();
        header.set("Set-Cookie", Value::string("a=1"));
        header.add("set-cookie", Value::string("b=2"));
        assert_eq!(header.to_pairs().len(), 2);
        header.set("Set-Cookie", Value::string("c=3"));
        assert_eq!(
            header.to_pairs(),
            vec![("Set-Cookie".to_string(), "c=3".to_string())]
        );
    }

    #[test]
    fn inbound_values_split_into_items() {
        let header = Header::from_pairs([
            ("cache-control", "public, max-age=60"),
            ("cookie", "a=1; b=2"),
        ]);
        assert_eq!(header.get("Cache-Control:max-age").strict(), "60");
        assert_eq!(header.get_raw("Cookie").as_deref(), Some("a=1; b=2"));
        let replayed = Header::from_pairs(
            header
                .to_pairs()
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        assert_eq!(replayed.to_pairs(), header.to_pairs());
    }

    #[test]
    fn collect_folds_lines_into_one() {
        let mut header = Header::new();
        header.append_raw("Vary", "Accept");
        header.append_raw("Vary", "Accept-Encoding");
        assert_eq!(header.line_count(), 2);
        header.collect("vary");
        assert_eq!(header.line_count(), 1);
        assert_eq!(header.get_raw("Vary").as_deref(), Some("Accept,Accept-Encoding"));
    }

    #[test]
    fn reserved_headers_are_recognized() {
        assert!(is_reserved("Content-Length"));
        assert!(is_reserved("fastly-ff:x"));
        assert!(!is_reserved("X-Foo"));
    }
}

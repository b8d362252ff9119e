use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

use crate::acl::Acl;
use crate::director::{Backend, Director};

/// Rendering of a not-set fragment inside a lenient string.
pub const NULL_STRING: &str = "(null)";

const HTTP_TIME_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NumState {
    #[default]
    Finite,
    Nan,
    NegInf,
    PosInf,
}

/// Backend slot value: either a plain backend or a director standing in for one.
#[derive(Clone, Debug)]
pub enum BackendRef {
    Backend(Arc<Backend>),
    Director(Arc<Director>),
}

impl BackendRef {
    pub fn name(&self) -> &str {
        match self {
            BackendRef::Backend(backend) => &backend.name,
            BackendRef::Director(director) => &director.name,
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self {
            BackendRef::Backend(backend) => backend.is_healthy(),
            BackendRef::Director(director) => director.is_healthy(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Value {
    pub kind: ValueKind,
    /// True iff the value came straight from VCL source text.
    pub literal: bool,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Ident(String),
    String { value: String, not_set: bool },
    Lenient(LenientString),
    Integer { value: i64, state: NumState },
    Float { value: f64, state: NumState },
    Bool(bool),
    Ip(Option<IpAddr>),
    /// Relative time in milliseconds.
    RTime(i64),
    Time {
        at: DateTime<Utc>,
        out_of_bounds: bool,
    },
    Backend(BackendRef),
    Acl(Arc<Acl>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Ident,
    String,
    Integer,
    Float,
    Bool,
    Ip,
    RTime,
    Time,
    Backend,
    Acl,
}

impl ValueType {
    /// Maps a VCL type keyword (`declare local`, parameters, return types).
    pub fn from_keyword(name: &str) -> Option<Self> {
        Some(match name {
            "STRING" => ValueType::String,
            "INTEGER" => ValueType::Integer,
            "FLOAT" => ValueType::Float,
            "BOOL" => ValueType::Bool,
            "IP" => ValueType::Ip,
            "RTIME" => ValueType::RTime,
            "TIME" => ValueType::Time,
            "BACKEND" => ValueType::Backend,
            "ACL" => ValueType::Acl,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Null => "NULL",
            ValueType::Ident => "IDENT",
            ValueType::String => "STRING",
            ValueType::Integer => "INTEGER",
            ValueType::Float => "FLOAT",
            ValueType::Bool => "BOOL",
            ValueType::Ip => "IP",
            ValueType::RTime => "RTIME",
            ValueType::Time => "TIME",
            ValueType::Backend => "BACKEND",
            ValueType::Acl => "ACL",
        }
    }

    /// Zero value used for fresh locals.
    pub fn zero(self) -> Value {
        match self {
            ValueType::String => Value::not_set(),
            ValueType::Integer => Value::int(0),
            ValueType::Float => Value::float(0.0),
            ValueType::Bool => Value::bool(false),
            ValueType::Ip => Value::new(ValueKind::Ip(None)),
            ValueType::RTime => Value::rtime(0),
            ValueType::Time => Value::time(epoch()),
            _ => Value::null(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Self {
            kind,
            literal: false,
        }
    }

    pub fn into_literal(mut self) -> Self {
        self.literal = true;
        self
    }

    pub fn null() -> Self {
        Self::new(ValueKind::Null)
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Self::new(ValueKind::Ident(name.into()))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(ValueKind::String {
            value: value.into(),
            not_set: false,
        })
    }

    pub fn not_set() -> Self {
        Self::new(ValueKind::String {
            value: String::new(),
            not_set: true,
        })
    }

    pub fn int(value: i64) -> Self {
        Self::new(ValueKind::Integer {
            value,
            state: NumState::Finite,
        })
    }

    pub fn float(value: f64) -> Self {
        let state = if value.is_nan() {
            NumState::Nan
        } else if value == f64::INFINITY {
            NumState::PosInf
        } else if value == f64::NEG_INFINITY {
            NumState::NegInf
        } else {
            NumState::Finite
        };
        Self::new(ValueKind::Float { value, state })
    }

    pub fn bool(value: bool) -> Self {
        Self::new(ValueKind::Bool(value))
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self::new(ValueKind::Ip(Some(addr)))
    }

    pub fn rtime(ms: i64) -> Self {
        Self::new(ValueKind::RTime(ms))
    }

    pub fn time(at: DateTime<Utc>) -> Self {
        Self::new(ValueKind::Time {
            at,
            out_of_bounds: false,
        })
    }

    /// `at` moved by `delta_ms`; out of bounds when chrono cannot represent it.
    pub fn time_shifted(at: DateTime<Utc>, delta_ms: i64) -> Self {
        match shift_time(at, delta_ms) {
            Some(at) => Self::time(at),
            None => Self::new(ValueKind::Time {
                at,
                out_of_bounds: true,
            }),
        }
    }

    pub fn backend(backend: BackendRef) -> Self {
        Self::new(ValueKind::Backend(backend))
    }

    pub fn acl(acl: Arc<Acl>) -> Self {
        Self::new(ValueKind::Acl(acl))
    }

    pub fn lenient(values: LenientString) -> Self {
        Self::new(ValueKind::Lenient(values))
    }

    pub fn ty(&self) -> ValueType {
        match &self.kind {
            ValueKind::Null => ValueType::Null,
            ValueKind::Ident(_) => ValueType::Ident,
            ValueKind::String { .. } | ValueKind::Lenient(_) => ValueType::String,
            ValueKind::Integer { .. } => ValueType::Integer,
            ValueKind::Float { .. } => ValueType::Float,
            ValueKind::Bool(_) => ValueType::Bool,
            ValueKind::Ip(_) => ValueType::Ip,
            ValueKind::RTime(_) => ValueType::RTime,
            ValueKind::Time { .. } => ValueType::Time,
            ValueKind::Backend(_) => ValueType::Backend,
            ValueKind::Acl(_) => ValueType::Acl,
        }
    }

    pub fn is_not_set(&self) -> bool {
        match &self.kind {
            ValueKind::Null => true,
            ValueKind::String { not_set, .. } => *not_set,
            ValueKind::Lenient(ls) => ls.not_set,
            ValueKind::Ip(addr) => addr.is_none(),
            _ => false,
        }
    }

    /// Textual form used by string concatenation and header serialization.
    pub fn render(&self) -> String {
        match &self.kind {
            ValueKind::Null => "NULL".to_string(),
            ValueKind::Ident(name) => name.clone(),
            ValueKind::String { value, .. } => value.clone(),
            ValueKind::Lenient(ls) => ls.strict(),
            ValueKind::Integer { value, state } => match state {
                NumState::Finite => value.to_string(),
                other => render_num_state(*other).to_string(),
            },
            ValueKind::Float { value, state } => match state {
                NumState::Finite => format!("{value:.3}"),
                other => render_num_state(*other).to_string(),
            },
            ValueKind::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            ValueKind::Ip(addr) => addr.map(|a| a.to_string()).unwrap_or_default(),
            ValueKind::RTime(ms) => format!("{:.3}", *ms as f64 / 1000.0),
            ValueKind::Time { at, out_of_bounds } => {
                if *out_of_bounds {
                    "[out of bounds]".to_string()
                } else {
                    format_http_time(at)
                }
            }
            ValueKind::Backend(backend) => backend.name().to_string(),
            ValueKind::Acl(acl) => acl.name.clone(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind {
            ValueKind::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer { value, .. } => Some(value),
            _ => None,
        }
    }
}

fn render_num_state(state: NumState) -> &'static str {
    match state {
        NumState::Nan => "NAN",
        NumState::NegInf => "-inf",
        NumState::PosInf => "inf",
        NumState::Finite => "",
    }
}

/// Ordered concatenation of heterogeneous fragments, used where header
/// values mix strings with other VCL types.
#[derive(Clone, Debug, Default)]
pub struct LenientString {
    pub values: Vec<Value>,
    pub not_set: bool,
}

impl LenientString {
    pub fn from_value(value: Value) -> Self {
        match value.kind {
            ValueKind::Lenient(ls) => ls,
            _ => {
                let not_set = value.is_not_set();
                Self {
                    values: vec![value],
                    not_set,
                }
            }
        }
    }

    pub fn from_text(value: &str) -> Self {
        Self::from_value(Value::string(value))
    }

    pub fn not_set() -> Self {
        Self {
            values: Vec::new(),
            not_set: true,
        }
    }

    pub fn push(&mut self, value: Value) {
        match value.kind {
            ValueKind::Lenient(ls) => self.values.extend(ls.values),
            _ => self.values.push(value),
        }
    }

    /// Rendering that spells out not-set fragments as `(null)`.
    pub fn lenient(&self) -> String {
        let mut out = String::new();
        for value in &self.values {
            if value.is_not_set() && matches!(value.kind, ValueKind::String { .. } | ValueKind::Ip(_)) {
                out.push_str(NULL_STRING);
            }
            out.push_str(&value.render());
        }
        out
    }

    /// Rendering that skips not-set fragments.
    pub fn strict(&self) -> String {
        if self.not_set {
            return String::new();
        }
        self.values
            .iter()
            .filter(|value| {
                !(value.is_not_set()
                    && matches!(value.kind, ValueKind::String { .. } | ValueKind::Ip(_)))
            })
            .map(Value::render)
            .collect()
    }

    pub fn to_value(&self) -> Value {
        if self.not_set {
            Value::not_set()
        } else {
            Value::string(self.strict())
        }
    }
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub fn format_http_time(at: &DateTime<Utc>) -> String {
    at.format(HTTP_TIME_FORMAT).to_string()
}

pub fn parse_http_time(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), HTTP_TIME_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn shift_time(at: DateTime<Utc>, delta_ms: i64) -> Option<DateTime<Utc>> {
    at.checked_add_signed(Duration::try_milliseconds(delta_ms)?)
}

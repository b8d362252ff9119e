//! Per-request process trace: which subroutines ran with what HTTP state,
//! what VCL logged, and how the request was served.

use std::time::Duration;

use edgesim_rt::json::JsonValue;

use crate::header::Header;
use crate::http::{Request, Response};

#[derive(Clone, Debug)]
pub struct Flow {
    pub file: String,
    pub line: u32,
    pub position: u32,
    pub subroutine: String,
    pub req: Option<JsonValue>,
    pub bereq: Option<JsonValue>,
    pub beresp: Option<JsonValue>,
    pub resp: Option<JsonValue>,
    pub object: Option<JsonValue>,
}

#[derive(Clone, Debug)]
pub struct LogLine {
    pub scope: String,
    pub file: String,
    pub line: u32,
    pub position: u32,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub struct Trace {
    pub flows: Vec<Flow>,
    pub logs: Vec<LogLine>,
    pub restarts: i64,
    pub backend: Option<String>,
    pub cached: bool,
    /// Rendered exception that aborted the request.
    pub error: Option<String>,
    pub elapsed: Duration,
    pub coverage: Option<JsonValue>,
}

fn optional(value: &Option<JsonValue>) -> JsonValue {
    value.clone().unwrap_or(JsonValue::Null)
}

fn number(value: impl Into<f64>) -> JsonValue {
    JsonValue::Number(value.into())
}

pub fn header_json(header: &Header) -> JsonValue {
    let mut fields: Vec<(String, JsonValue)> = Vec::new();
    for (name, value) in header.to_pairs() {
        match fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, JsonValue::Array(values))) => values.push(JsonValue::String(value)),
            _ => fields.push((name, JsonValue::Array(vec![JsonValue::String(value)]))),
        }
    }
    JsonValue::object(fields)
}

pub fn request_json(req: &Request) -> JsonValue {
    JsonValue::object([
        ("method", JsonValue::string(&req.method)),
        ("url", JsonValue::string(&req.url)),
        ("proto", JsonValue::string(&req.proto)),
        ("headers", header_json(&req.header)),
    ])
}

pub fn response_json(resp: &Response) -> JsonValue {
    JsonValue::object([
        ("status", number(resp.status)),
        ("response", JsonValue::string(&resp.reason)),
        ("proto", JsonValue::string(&resp.proto)),
        ("headers", header_json(&resp.header)),
        (
            "body",
            JsonValue::String(String::from_utf8_lossy(&resp.body).into_owned()),
        ),
    ])
}

impl Flow {
    fn to_json(&self) -> JsonValue {
        JsonValue::object([
            ("file", JsonValue::string(&self.file)),
            ("line", number(self.line)),
            ("position", number(self.position)),
            ("subroutine", JsonValue::string(&self.subroutine)),
            ("req", optional(&self.req)),
            ("bereq", optional(&self.bereq)),
            ("beresp", optional(&self.beresp)),
            ("resp", optional(&self.resp)),
            ("object", optional(&self.object)),
        ])
    }
}

impl LogLine {
    fn to_json(&self) -> JsonValue {
        JsonValue::object([
            ("scope", JsonValue::string(&self.scope)),
            ("file", JsonValue::string(&self.file)),
            ("line", number(self.line)),
            ("position", number(self.position)),
            ("message", JsonValue::string(&self.message)),
        ])
    }
}

impl Trace {
    /// Trace document; `response` is what the client was sent.
    pub fn to_json(&self, response: Option<&Response>) -> JsonValue {
        let client_response = match response {
            Some(resp) => JsonValue::object([
                ("status_code", number(resp.status)),
                ("body_bytes", number(resp.body.len() as f64)),
                ("headers", header_json(&resp.header)),
            ]),
            None => JsonValue::Null,
        };
        JsonValue::object([
            (
                "flows",
                JsonValue::Array(self.flows.iter().map(Flow::to_json).collect()),
            ),
            (
                "logs",
                JsonValue::Array(self.logs.iter().map(LogLine::to_json).collect()),
            ),
            ("restarts", number(self.restarts as f64)),
            (
                "backend",
                self.backend
                    .as_ref()
                    .map(JsonValue::string)
                    .unwrap_or(JsonValue::Null),
            ),
            ("cached", JsonValue::Bool(self.cached)),
            ("elapsed_time_us", number(self.elapsed.as_micros() as f64)),
            (
                "error",
                self.error
                    .as_ref()
                    .map(JsonValue::string)
                    .unwrap_or(JsonValue::Null),
            ),
            ("client_response", client_response),
            ("coverage", optional(&self.coverage)),
        ])
    }
}

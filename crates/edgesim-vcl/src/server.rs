//! HTTP/1.1 listener: every accepted connection carries one request through
//! the simulator on the shared worker pool.

use std::net::{TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use edgesim_rt::error::{error_json, error_json_with_detail};
use edgesim_rt::json as rt_json;

use crate::config::{ServerMode, ServerSettings};
use crate::http::{self, Request, Response};
use crate::interp::Interpreter;
use crate::observability::{
    REQUEST_ID_HEADER, RequestRecord, classify_panic_payload, emit_request_log,
    format_panic_message, resolve_request_id,
};
use crate::task_pool::Batch;
use crate::value::Value;

/// What requests are served by. A program that failed to initialize still
/// gets a listener; every request then answers 500 with the failure.
#[derive(Clone, Debug)]
pub enum Handler {
    Ready(Arc<Interpreter>),
    Failed(String),
}

impl Handler {
    pub fn new(program: Result<Interpreter, String>) -> Self {
        match program {
            Ok(interp) => Handler::Ready(Arc::new(interp)),
            Err(message) => Handler::Failed(message),
        }
    }
}

fn json_response(status: u16, body: &rt_json::JsonValue) -> Response {
    Response::with_body(status, "application/json", rt_json::encode(body))
}

/// Runs one request and renders it per `mode`. Never panics.
pub fn respond(handler: &Handler, request: Request, mode: ServerMode) -> Response {
    let started = Instant::now();
    let request_id = resolve_request_id(&request.header);
    let method = request.method.clone();
    let path = request.path().to_string();
    let mut cached = false;
    let mut backend = None;

    let mut response = match handler {
        Handler::Failed(message) => {
            let detail: Vec<String> = message.lines().map(str::to_string).collect();
            json_response(
                500,
                &error_json_with_detail("init_failed", "program failed to initialize", &detail),
            )
        }
        Handler::Ready(interp) => {
            match panic::catch_unwind(AssertUnwindSafe(|| interp.process(request))) {
                Ok(outcome) => {
                    cached = outcome.trace.cached;
                    backend = outcome.trace.backend.clone();
                    match mode {
                        ServerMode::Trace => {
                            let status = if outcome.error.is_some() { 500 } else { 200 };
                            json_response(status, &outcome.trace_json())
                        }
                        ServerMode::Response => match (outcome.response, outcome.trace.error) {
                            (Some(resp), _) => resp,
                            (None, message) => json_response(
                                500,
                                &error_json(
                                    "runtime_error",
                                    message.as_deref().unwrap_or("request aborted"),
                                ),
                            ),
                        },
                    }
                }
                Err(payload) => {
                    let details = classify_panic_payload(payload.as_ref());
                    let message = format_panic_message(&details);
                    edgesim_rt::log::error(&format!("request {request_id} panicked: {message}"));
                    json_response(500, &error_json("internal_error", &message))
                }
            }
        }
    };
    response
        .header
        .set(REQUEST_ID_HEADER, Value::string(request_id.as_str()));

    emit_request_log(&RequestRecord {
        request_id: &request_id,
        method: &method,
        path: &path,
        status: response.status,
        duration: started.elapsed(),
        cached,
        backend: backend.as_deref(),
        response_bytes: response.body.len(),
    });
    response
}

fn handle_connection(handler: &Handler, mode: ServerMode, mut stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "127.0.0.1:0".to_string());
    let response = match http::read_request(&mut stream, &peer) {
        Ok(request) => respond(handler, request, mode),
        Err(message) => {
            edgesim_rt::log::warn(&format!("bad request from {peer}: {message}"));
            json_response(400, &error_json("bad_request", &message))
        }
    };
    if let Err(message) = http::write_response(&mut stream, &response) {
        edgesim_rt::log::debug(&format!("failed to answer {peer}: {message}"));
    }
}

/// Accepts connections until `max_requests` have been served, or forever.
pub fn serve_listener(
    listener: TcpListener,
    handler: Handler,
    mode: ServerMode,
    max_requests: Option<usize>,
) -> Result<(), String> {
    let mut batch = Batch::new();
    let mut accepted = 0usize;
    for stream in listener.incoming() {
        let stream = stream.map_err(|err| format!("failed to accept connection: {err}"))?;
        let handler = handler.clone();
        batch.submit(move || handle_connection(&handler, mode, stream));
        accepted += 1;
        if max_requests.is_some_and(|max| max > 0 && accepted >= max) {
            break;
        }
    }
    batch.wait();
    Ok(())
}

pub fn serve(handler: Handler, settings: &ServerSettings) -> Result<(), String> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener =
        TcpListener::bind(&addr).map_err(|err| format!("failed to bind {addr}: {err}"))?;
    edgesim_rt::log::info(&format!("edgesim listening on http://{addr}"));
    eprintln!("edgesim simulator listening on http://{addr}");
    serve_listener(listener, handler, settings.mode, settings.max_requests)
}

#[cfg(test)]
mod tests {
    use super::{Handler, respond};
    use crate::config::{Options, ServerMode};
    use crate::http::Request;
    use crate::interp::Interpreter;
    use crate::loader::{MemoryResolver, load_program};

    fn handler(src: &str) -> Handler {
        let (program, diags) = load_program("main.vcl", src, &MemoryResolver::default());
        assert!(diags.is_empty(), "{diags:?}");
        Handler::new(Interpreter::new(program, Options::default()).map_err(|err| err.message))
    }

    #[test]
    fn response_mode_returns_the_edge_response() {
        let handler = handler("sub vcl_recv { error 418 \"teapot\"; }\n");
        let resp = respond(&handler, Request::new("GET", "/"), ServerMode::Response);
        assert_eq!(resp.status, 418);
        assert_eq!(resp.reason, "teapot");
        assert!(resp.header.get_raw("X-Request-Id").is_some());
    }

    #[test]
    fn trace_mode_wraps_the_trace_in_json() {
        let handler = handler("sub vcl_recv { error 404; }\n");
        let resp = respond(&handler, Request::new("GET", "/x"), ServerMode::Trace);
        assert_eq!(resp.status, 200);
        let body = String::from_utf8(resp.body).expect("utf8");
        assert!(body.contains("\"flows\""), "{body}");
        assert!(body.contains("\"status_code\":404"), "{body}");
    }

    #[test]
    fn runtime_errors_answer_500() {
        let handler = handler("sub vcl_recv { restart; }\n");
        let resp = respond(&handler, Request::new("GET", "/"), ServerMode::Response);
        assert_eq!(resp.status, 500);
        let body = String::from_utf8(resp.body).expect("utf8");
        assert!(body.contains("Max restart limit exceeded"), "{body}");
    }

    #[test]
    fn failed_programs_answer_500() {
        let handler = Handler::Failed("Backend F_a is duplicated".to_string());
        let resp = respond(&handler, Request::new("GET", "/"), ServerMode::Trace);
        assert_eq!(resp.status, 500);
        let body = String::from_utf8(resp.body).expect("utf8");
        assert!(body.contains("init_failed"), "{body}");
        assert!(body.contains("Backend F_a is duplicated"), "{body}");
    }
}

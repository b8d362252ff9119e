//! Predefined variables: `req.*`, `bereq.*`, `beresp.*`, `obj.*`, `resp.*`
//! and the read-only clock, server and counter namespaces. Each owner object
//! is only reachable from the phases where it exists.

use std::time::Duration as StdDuration;

use sha2::{Digest, Sha256};

use super::{Context, Interpreter, Scope, ScopeSet};
use crate::assign;
use crate::cache::NODE_NAME;
use crate::header::{self, Header};
use crate::token::AssignOp;
use crate::value::{BackendRef, LenientString, Value, ValueKind};

const BEREQ_SCOPES: ScopeSet = ScopeSet::of(&[Scope::Miss, Scope::Pass, Scope::Fetch]);
const BERESP_SCOPES: ScopeSet = ScopeSet::of(&[Scope::Fetch]);
const OBJ_READ_SCOPES: ScopeSet =
    ScopeSet::of(&[Scope::Hit, Scope::Error, Scope::Deliver, Scope::Log]);
const OBJ_WRITE_SCOPES: ScopeSet = ScopeSet::of(&[Scope::Hit, Scope::Error]);
const RESP_READ_SCOPES: ScopeSet = ScopeSet::of(&[Scope::Deliver, Scope::Log]);
const RESP_WRITE_SCOPES: ScopeSet = ScopeSet::of(&[Scope::Deliver]);

const BUCKET_WINDOWS: &[u64] = &[10, 20, 30, 40, 50, 60];
const RATE_WINDOWS: &[u64] = &[1, 10, 60];

fn ensure(ctx: &Context, allowed: ScopeSet, name: &str, verb: &str) -> Result<(), String> {
    if allowed.contains(ctx.scope) {
        Ok(())
    } else {
        Err(format!(
            "Variable {name} could not {verb} in {} scope",
            ctx.scope.as_str()
        ))
    }
}

fn scopes_of(object: &str, write: bool) -> ScopeSet {
    match (object, write) {
        ("bereq", _) => BEREQ_SCOPES,
        ("beresp", _) => BERESP_SCOPES,
        ("obj", false) => OBJ_READ_SCOPES,
        ("obj", true) => OBJ_WRITE_SCOPES,
        ("resp", false) => RESP_READ_SCOPES,
        ("resp", true) => RESP_WRITE_SCOPES,
        _ => ScopeSet::ALL,
    }
}

/// `bereq.http.Host` splits into `("bereq", "Host")`.
fn http_variable(name: &str) -> Option<(&str, &str)> {
    let (object, key) = name.split_once(".http.")?;
    matches!(object, "req" | "bereq" | "beresp" | "obj" | "resp").then_some((object, key))
}

fn header_value(ls: LenientString) -> Value {
    if ls.not_set {
        Value::not_set()
    } else {
        Value::lenient(ls)
    }
}

/// Header owned by `object` in the current phase.
fn header_of<'a>(
    ctx: &'a mut Context,
    object: &str,
    name: &str,
    write: bool,
) -> Result<&'a mut Header, String> {
    let verb = if write { "set" } else { "access" };
    ensure(ctx, scopes_of(object, write), name, verb)?;
    let missing = format!("Variable {name} is not available in {} scope", ctx.scope.as_str());
    let header = match object {
        "req" => Some(&mut ctx.request.header),
        "bereq" => ctx.backend_request.as_mut().map(|req| &mut req.header),
        "beresp" => ctx.backend_response.as_mut().map(|resp| &mut resp.header),
        "obj" => ctx.object.as_mut().map(|resp| &mut resp.header),
        "resp" => ctx.response.as_mut().map(|resp| &mut resp.header),
        _ => None,
    };
    header.ok_or(missing)
}

fn string_value(value: &Value) -> Result<String, String> {
    let mut out = Value::not_set();
    assign::assign(&mut out, value)?;
    Ok(out.render())
}

fn status_value(name: &str, value: &Value) -> Result<u16, String> {
    let status = value
        .as_int()
        .ok_or_else(|| format!("{name} must be INTEGER, got {}", value.ty()))?;
    u16::try_from(status)
        .ok()
        .filter(|status| *status <= 999)
        .ok_or_else(|| format!("{name} out of range: {status}"))
}

fn rtime_ms(value: &Value) -> i64 {
    match value.kind {
        ValueKind::RTime(ms) => ms,
        _ => 0,
    }
}

fn url_basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

fn window(raw: &str, allowed: &[u64]) -> Option<StdDuration> {
    let secs: u64 = raw.strip_suffix('s')?.parse().ok()?;
    allowed.contains(&secs).then(|| StdDuration::from_secs(secs))
}

impl Interpreter {
    /// Reads a predefined variable. `Ok(None)` means the name is unknown.
    pub(super) fn get_variable(&self, ctx: &mut Context, name: &str) -> Result<Option<Value>, String> {
        if let Some((object, key)) = http_variable(name) {
            let header = header_of(ctx, object, name, false)?;
            return Ok(Some(header_value(header.get(key))));
        }
        if let Some(value) = self.counter_variable(ctx, name)? {
            return Ok(Some(value));
        }
        if let Some(index) = name.strip_prefix("re.group.") {
            let group = index
                .parse::<usize>()
                .ok()
                .and_then(|idx| ctx.regex_groups.get(idx))
                .map(|group| Value::string(group.clone()))
                .unwrap_or_else(Value::not_set);
            return Ok(Some(group));
        }

        let value = match name {
            "req.method" | "req.request" => Value::string(ctx.request.method.clone()),
            "req.url" => Value::string(ctx.request.url.clone()),
            "req.url.path" => Value::string(ctx.request.path()),
            "req.url.qs" => Value::string(ctx.request.query()),
            "req.url.basename" => Value::string(url_basename(ctx.request.path())),
            "req.url.ext" => {
                let basename = url_basename(ctx.request.path());
                Value::string(basename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or(""))
            }
            "req.proto" => Value::string(ctx.request.proto.clone()),
            "req.hash" => Value::string(ctx.request_hash.clone()),
            "req.digest" => {
                let digest = Sha256::digest(ctx.request_hash.as_bytes());
                Value::string(edgesim_rt::bytes::encode_hex(&digest))
            }
            "req.backend" => match &ctx.backend {
                Some(backend) => Value::backend(backend.clone()),
                None => Value::null(),
            },
            "req.restarts" => Value::int(ctx.restarts),
            "req.is_purge" => Value::bool(ctx.is_purge),
            "req.esi" => Value::bool(ctx.esi_enabled),
            "req.body" => Value::string(String::from_utf8_lossy(&ctx.request.body).into_owned()),
            "req.vcl.generation" => Value::int(1),
            "client.ip" => Value::new(ValueKind::Ip(ctx.request.remote_ip().parse().ok())),
            "client.identity" => Value::string(ctx.client_identity()),
            "server.identity" | "server.hostname" => Value::string(NODE_NAME),
            "server.datacenter" => Value::string(self.datacenter.clone()),
            "now" => Value::time(ctx.now()),
            "now.sec" => Value::string(ctx.now().timestamp().to_string()),
            "time.start" => Value::time(ctx.started_at),
            "time.start.sec" => Value::string(ctx.started_at.timestamp().to_string()),
            "time.start.msec" => Value::string(ctx.started_at.timestamp_millis().to_string()),
            "time.start.usec_frac" => {
                Value::string(format!("{:06}", ctx.started_at.timestamp_subsec_micros()))
            }
            "time.elapsed" => Value::rtime(ctx.elapsed().as_millis() as i64),
            "time.elapsed.msec" => Value::string(ctx.elapsed().as_millis().to_string()),
            "fastly_info.state" => Value::string(ctx.state.clone()),
            _ => return self.phase_variable(ctx, name),
        };
        Ok(Some(value))
    }

    /// Variables owned by the backend request, backend response, cached
    /// object or client response.
    fn phase_variable(&self, ctx: &mut Context, name: &str) -> Result<Option<Value>, String> {
        let Some((object, _)) = name.split_once('.') else {
            return Ok(None);
        };
        if !matches!(object, "bereq" | "beresp" | "obj" | "resp") {
            return Ok(None);
        }
        ensure(ctx, scopes_of(object, false), name, "access")?;
        let value = match name {
            "bereq.method" | "bereq.request" => {
                ctx.backend_request.as_ref().map(|req| Value::string(req.method.clone()))
            }
            "bereq.url" => ctx.backend_request.as_ref().map(|req| Value::string(req.url.clone())),
            "bereq.proto" => ctx.backend_request.as_ref().map(|req| Value::string(req.proto.clone())),
            "beresp.status" => ctx
                .backend_response
                .as_ref()
                .map(|resp| Value::int(i64::from(resp.status))),
            "beresp.response" => ctx
                .backend_response
                .as_ref()
                .map(|resp| Value::string(resp.reason.clone())),
            "beresp.ttl" => Some(Value::rtime(ctx.beresp_ttl)),
            "beresp.grace" => Some(Value::rtime(ctx.beresp_grace)),
            "beresp.cacheable" => Some(Value::bool(ctx.beresp_cacheable)),
            "beresp.backend.name" => Some(Value::string(
                ctx.selected_backend
                    .as_ref()
                    .map(|backend| backend.name.clone())
                    .unwrap_or_default(),
            )),
            "obj.status" => Some(Value::int(
                ctx.object
                    .as_ref()
                    .map(|obj| i64::from(obj.status))
                    .unwrap_or(ctx.object_status),
            )),
            "obj.response" => Some(Value::string(
                ctx.object
                    .as_ref()
                    .map(|obj| obj.reason.clone())
                    .unwrap_or_else(|| ctx.object_response.clone()),
            )),
            "obj.ttl" => Some(Value::rtime(ctx.object_ttl)),
            "obj.grace" => Some(Value::rtime(ctx.object_grace)),
            "obj.hits" => Some(Value::int(
                ctx.cache_hit.as_ref().map(|item| item.hits).unwrap_or(0),
            )),
            "obj.lastuse" => Some(Value::rtime(
                ctx.cache_hit
                    .as_ref()
                    .map(|item| item.last_used.num_milliseconds())
                    .unwrap_or(0),
            )),
            "resp.status" => ctx
                .response
                .as_ref()
                .map(|resp| Value::int(i64::from(resp.status))),
            "resp.response" => ctx.response.as_ref().map(|resp| Value::string(resp.reason.clone())),
            "resp.proto" => ctx.response.as_ref().map(|resp| Value::string(resp.proto.clone())),
            "resp.is_locally_generated" => Some(Value::bool(ctx.is_locally_generated)),
            _ => return Ok(None),
        };
        value
            .map(Some)
            .ok_or_else(|| format!("Variable {name} is not available in {} scope", ctx.scope.as_str()))
    }

    /// `ratecounter.NAME.*`, `backend.NAME.healthy` and `director.NAME.healthy`.
    fn counter_variable(&self, ctx: &Context, name: &str) -> Result<Option<Value>, String> {
        if let Some(rest) = name.strip_prefix("ratecounter.") {
            let (counter_name, metric, raw) = if let Some((counter, raw)) = rest.split_once(".bucket.") {
                (counter, "bucket", raw)
            } else if let Some((counter, raw)) = rest.split_once(".rate.") {
                (counter, "rate", raw)
            } else {
                return Ok(None);
            };
            let Some(counter) = self.decls.ratecounters.get(counter_name) else {
                return Err(format!("Ratecounter {counter_name} is not defined"));
            };
            let entry = ctx
                .ratecounter_entries
                .get(counter_name)
                .cloned()
                .unwrap_or_default();
            let value = if metric == "bucket" {
                let window = window(raw, BUCKET_WINDOWS)
                    .ok_or_else(|| format!("Undefined variable {name}"))?;
                Value::int(counter.bucket(&entry, window))
            } else {
                let window = window(raw, RATE_WINDOWS)
                    .ok_or_else(|| format!("Undefined variable {name}"))?;
                Value::float(counter.rate(&entry, window))
            };
            return Ok(Some(value));
        }
        for (prefix, director) in [("backend.", false), ("director.", true)] {
            let Some(target) = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(".healthy"))
            else {
                continue;
            };
            let healthy = match self.decls.backends.get(target) {
                Some(BackendRef::Backend(backend)) if !director => backend.is_healthy(),
                Some(BackendRef::Director(dir)) if director => dir.is_healthy(),
                _ => return Err(format!("{prefix}{target} is not defined")),
            };
            return Ok(Some(Value::bool(healthy)));
        }
        Ok(None)
    }

    /// `set NAME <op> value;` for everything but locals and `req.hash`.
    pub(super) fn set_variable(
        &self,
        ctx: &mut Context,
        name: &str,
        op: AssignOp,
        value: &Value,
    ) -> Result<(), String> {
        if let Some((object, key)) = http_variable(name) {
            if header::is_reserved(key) {
                return Err(format!("Header {key} is reserved and could not be modified"));
            }
            let header = header_of(ctx, object, name, true)?;
            let mut current = match op {
                AssignOp::Assign => Value::not_set(),
                _ => header.get(key).to_value(),
            };
            assign::apply(op, &mut current, value)?;
            header.set(key, current);
            return Ok(());
        }

        if name == "req.backend" {
            let ValueKind::Backend(backend) = &value.kind else {
                return Err(format!("req.backend requires BACKEND value, got {}", value.ty()));
            };
            if op != AssignOp::Assign {
                return Err("req.backend only accepts = operator".to_string());
            }
            ctx.backend = Some(backend.clone());
            return Ok(());
        }

        let mut current = self
            .get_variable(ctx, name)?
            .ok_or_else(|| format!("Undefined variable {name}"))?;
        if let ValueKind::Lenient(ls) = &current.kind {
            current = ls.to_value();
        }
        current.literal = false;
        assign::apply(op, &mut current, value)?;
        self.store(ctx, name, current)
    }

    fn store(&self, ctx: &mut Context, name: &str, value: Value) -> Result<(), String> {
        let object = name.split('.').next().unwrap_or("");
        if matches!(object, "bereq" | "beresp" | "obj" | "resp") {
            ensure(ctx, scopes_of(object, true), name, "set")?;
        }
        let unavailable = format!("Variable {name} is not available in {} scope", ctx.scope.as_str());
        match name {
            "req.method" | "req.request" => ctx.request.method = value.render(),
            "req.url" => ctx.request.url = value.render(),
            "req.proto" => ctx.request.proto = value.render(),
            "req.esi" => ctx.esi_enabled = value.as_bool().unwrap_or(false),
            "client.identity" => ctx.client_identity = Some(value.render()),
            "bereq.method" | "bereq.request" => {
                ctx.backend_request.as_mut().ok_or(unavailable)?.method = value.render();
            }
            "bereq.url" => ctx.backend_request.as_mut().ok_or(unavailable)?.url = value.render(),
            "bereq.proto" => {
                ctx.backend_request.as_mut().ok_or(unavailable)?.proto = value.render();
            }
            "beresp.status" => {
                let status = status_value(name, &value)?;
                ctx.backend_response.as_mut().ok_or(unavailable)?.status = status;
            }
            "beresp.response" => {
                ctx.backend_response.as_mut().ok_or(unavailable)?.reason = value.render();
            }
            "beresp.ttl" => ctx.beresp_ttl = rtime_ms(&value),
            "beresp.grace" => ctx.beresp_grace = rtime_ms(&value),
            "beresp.cacheable" => ctx.beresp_cacheable = value.as_bool().unwrap_or(false),
            "obj.status" => {
                let status = status_value(name, &value)?;
                ctx.object_status = i64::from(status);
                if let Some(object) = ctx.object.as_mut() {
                    object.status = status;
                }
            }
            "obj.response" => {
                let reason = value.render();
                if let Some(object) = ctx.object.as_mut() {
                    object.reason = reason.clone();
                }
                ctx.object_response = reason;
            }
            "obj.ttl" => ctx.object_ttl = rtime_ms(&value),
            "obj.grace" => ctx.object_grace = rtime_ms(&value),
            "resp.status" => {
                let status = status_value(name, &value)?;
                ctx.response.as_mut().ok_or(unavailable)?.status = status;
            }
            "resp.response" => ctx.response.as_mut().ok_or(unavailable)?.reason = value.render(),
            "resp.proto" => ctx.response.as_mut().ok_or(unavailable)?.proto = value.render(),
            _ => return Err(format!("Variable {name} is read-only")),
        }
        Ok(())
    }

    /// `unset` and `remove`; only headers can be removed.
    pub(super) fn unset_variable(&self, ctx: &mut Context, name: &str) -> Result<(), String> {
        let Some((object, key)) = http_variable(name) else {
            return Err(format!("Variable {name} could not be unset"));
        };
        if header::is_reserved(key) {
            return Err(format!("Header {key} is reserved and could not be modified"));
        }
        header_of(ctx, object, name, true)?.del(key);
        Ok(())
    }

    /// `add NAME = value;` appends a header line.
    pub(super) fn add_variable(&self, ctx: &mut Context, name: &str, value: Value) -> Result<(), String> {
        let Some((object, key)) = http_variable(name) else {
            return Err(format!("Add statement could not use for {name}"));
        };
        if header::is_reserved(key) {
            return Err(format!("Header {key} is reserved and could not be modified"));
        }
        let rendered = string_value(&value)?;
        header_of(ctx, object, name, true)?.add(key, Value::string(rendered));
        Ok(())
    }

    /// Header map of `object` for builtins such as `header.get`.
    pub(super) fn header_object<'a>(
        &self,
        ctx: &'a mut Context,
        object: &str,
        write: bool,
    ) -> Result<&'a mut Header, String> {
        if !matches!(object, "req" | "bereq" | "beresp" | "obj" | "resp") {
            return Err(format!("{object} has no headers"));
        }
        header_of(ctx, object, &format!("{object}.http"), write)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Options;
    use crate::http::Request;
    use crate::interp::{Interpreter, Outcome};
    use crate::loader::{MemoryResolver, load_program};

    fn run(src: &str, req: Request) -> Outcome {
        let (program, diags) = load_program("main.vcl", src, &MemoryResolver::default());
        assert!(diags.is_empty(), "{diags:?}");
        let interp = Interpreter::new(program, Options::default()).expect("compile");
        interp.process(req)
    }

    fn reason(src: &str, req: Request) -> String {
        let outcome = run(src, req);
        assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
        outcome.response.expect("response").reason
    }

    fn error_message(src: &str) -> String {
        run(src, Request::new("GET", "/")).error.expect("error").message
    }

    #[test]
    fn url_components_are_derived_from_the_request() {
        let src = "sub vcl_recv {\n  error 600 req.url.path \"|\" req.url.qs \"|\" req.url.basename \"|\" req.url.ext;\n}\n";
        assert_eq!(
            reason(src, Request::new("GET", "/assets/app.min.js?v=3")),
            "/assets/app.min.js|v=3|app.min.js|js"
        );
    }

    #[test]
    fn request_fields_are_writable() {
        let src = "sub vcl_recv {\n  set req.url = \"/rewritten\";\n  set req.http.X-Count = \"1\";\n  set req.http.X-Count = req.http.X-Count \"2\";\n  error 600 req.url \" \" req.http.X-Count;\n}\n";
        assert_eq!(reason(src, Request::new("GET", "/")), "/rewritten 12");
    }

    #[test]
    fn reserved_headers_are_protected() {
        assert_eq!(
            error_message("sub vcl_recv { set req.http.Content-Length = \"1\"; }\n"),
            "Header Content-Length is reserved and could not be modified"
        );
        assert_eq!(
            error_message("sub vcl_recv { unset req.http.Transfer-Encoding; }\n"),
            "Header Transfer-Encoding is reserved and could not be modified"
        );
    }

    #[test]
    fn phase_objects_are_scoped() {
        assert_eq!(
            error_message("sub vcl_recv { set req.http.A = beresp.status; }\n"),
            "Variable beresp.status could not access in RECV scope"
        );
        assert_eq!(
            error_message("sub vcl_recv { set resp.http.A = \"1\"; }\n"),
            "Variable resp.http.A could not set in RECV scope"
        );
    }

    #[test]
    fn read_only_variables_reject_assignment() {
        assert_eq!(
            error_message("sub vcl_recv { set req.restarts = 2; }\n"),
            "Variable req.restarts is read-only"
        );
    }

    #[test]
    fn object_fields_are_writable_in_error() {
        let src = "sub vcl_recv { error 600 \"x\"; }\n\
                   sub vcl_error {\n  set obj.status = 302;\n  set obj.response = \"Found\";\n  set obj.http.Location = \"/elsewhere\";\n  return(deliver);\n}\n";
        let outcome = run(src, Request::new("GET", "/"));
        let response = outcome.response.expect("response");
        assert_eq!(response.status, 302);
        assert_eq!(response.reason, "Found");
        assert_eq!(response.header.get_raw("Location").as_deref(), Some("/elsewhere"));
    }

    #[test]
    fn header_sub_fields_are_addressable() {
        let mut req = Request::new("GET", "/");
        req.header.append_raw("Cookie", "a=1; b=2");
        let src = "sub vcl_recv {\n  set req.http.Cookie:c = \"3\";\n  unset req.http.Cookie:a;\n  error 600 req.http.Cookie:b \"/\" req.http.Cookie:c;\n}\n";
        assert_eq!(reason(src, req), "2/3");
    }
}

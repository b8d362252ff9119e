//! The edge state machine: RECV, HASH, then HIT, MISS or PASS, FETCH,
//! ERROR, DELIVER and LOG, driven by the states each phase returns.

use std::fmt;
use std::sync::Arc;

use chrono::Duration;

use super::{Context, Interpreter, Scope};
use crate::cache::{self, CacheItem};
use crate::director::DirectorIdentity;
use crate::esi;
use crate::exception::Exception;
use crate::http::Response;
use crate::limits::{self, MAX_VARNISH_RESTARTS};
use crate::transport::Target;
use crate::value::{BackendRef, Value};

/// What a subroutine hands back to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    None,
    Lookup,
    Pass,
    Hash,
    Error,
    Restart,
    Deliver,
    DeliverStale,
    Fetch,
    Log,
    HitForPass,
    /// `return;` with no state.
    BareReturn,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::None => "NONE",
            State::Lookup => "LOOKUP",
            State::Pass => "PASS",
            State::Hash => "HASH",
            State::Error => "ERROR",
            State::Restart => "RESTART",
            State::Deliver => "DELIVER",
            State::DeliverStale => "DELIVER_STALE",
            State::Fetch => "FETCH",
            State::Log => "LOG",
            State::HitForPass => "HIT_FOR_PASS",
            State::BareReturn => "_BARE_RETURN_",
        }
    }

    /// State named by `return(<name>)`.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "lookup" => State::Lookup,
            "pass" => State::Pass,
            "hash" => State::Hash,
            "error" => State::Error,
            "restart" => State::Restart,
            "deliver" => State::Deliver,
            "deliver_stale" => State::DeliverStale,
            "fetch" => State::Fetch,
            "log" => State::Log,
            "hit_for_pass" => State::HitForPass,
            _ => return None,
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn or_default(state: Option<State>, default: State) -> State {
    match state {
        None | Some(State::None) => default,
        Some(state) => state,
    }
}

const PURGE_METHOD: &str = "FASTLYPURGE";

impl Interpreter {
    pub(super) fn run(&self, ctx: &mut Context) -> Result<(), Exception> {
        limits::check_request_limit(&mut ctx.request)?;
        if ctx.request.method.eq_ignore_ascii_case(PURGE_METHOD) {
            ctx.is_purge = true;
            ctx.request
                .header
                .set("Host", Value::string("api.fastly.com"));
        }
        self.recv(ctx)
    }

    /// Runs the reserved subroutine of `scope`, if the program has one.
    fn run_phase(&self, ctx: &mut Context, scope: Scope) -> Result<Option<State>, Exception> {
        ctx.scope = scope;
        ctx.return_called = false;
        let Some(sub) = self.decls.subroutines.get(scope.subroutine()) else {
            return Ok(None);
        };
        let state = self.run_subroutine(ctx, sub)?;
        Ok(Some(match state {
            State::BareReturn => State::None,
            state => state,
        }))
    }

    fn unexpected(&self, scope: Scope, state: State) -> Exception {
        let name = scope.subroutine();
        let message = format!(
            "Subroutine {name} returned unexpected state {state} in {}",
            scope.as_str()
        );
        match self.decls.subroutines.get(name) {
            Some(sub) => Exception::runtime(sub.name.span, message),
            None => Exception::runtime_bare(message),
        }
    }

    fn recv(&self, ctx: &mut Context) -> Result<(), Exception> {
        let state = match self.run_phase(ctx, Scope::Recv)? {
            None => State::Pass,
            Some(State::None) => State::Lookup,
            Some(state) => state,
        };

        if ctx.is_purge {
            if !ctx.return_called {
                return Err(Exception::runtime_bare(
                    "Failed to accept purge request. The vcl_recv subroutine must determine next state with return statement",
                ));
            }
            if !matches!(state, State::Lookup | State::Pass) {
                return Err(Exception::runtime_bare(
                    "Failed to accept purge request. The vcl_recv subroutine MUST return \"lookup\" or \"pass\" state with return statement",
                ));
            }
            ctx.response = Some(Response::with_body(
                200,
                "application/json",
                r#"{"status":"ok"}"#,
            ));
            return Ok(());
        }

        match state {
            State::Pass => {
                ctx.state = "PASS".to_string();
                self.hash(ctx)?;
                self.pass(ctx)
            }
            State::Error => self.error(ctx),
            State::Restart => self.restart(ctx),
            State::Lookup => {
                self.hash(ctx)?;
                self.lookup(ctx)
            }
            other => Err(self.unexpected(Scope::Recv, other)),
        }
    }

    fn hash(&self, ctx: &mut Context) -> Result<(), Exception> {
        ctx.request_hash.clear();
        let state = or_default(self.run_phase(ctx, Scope::Hash)?, State::Hash);
        if state != State::Hash {
            return Err(self.unexpected(Scope::Hash, state));
        }
        if ctx.request_hash.is_empty() {
            ctx.request_hash = ctx.request.url.clone();
        }
        Ok(())
    }

    fn lookup(&self, ctx: &mut Context) -> Result<(), Exception> {
        let now = ctx.now();
        match self.cache.get_at(&ctx.request_hash, now) {
            Some(item) => {
                ctx.trace.cached = true;
                ctx.state = "HIT".to_string();
                ctx.object = Some(item.response.clone());
                ctx.object_ttl = item.remaining_ttl(now).num_milliseconds().max(0);
                ctx.cache_hit = Some(item);
                self.hit(ctx)
            }
            None => {
                ctx.state = "MISS".to_string();
                self.miss(ctx)
            }
        }
    }

    /// Elects the origin for this fetch and derives the backend request.
    fn prepare_backend_request(&self, ctx: &mut Context, scope: Scope) -> Result<(), Exception> {
        let Some(backend) = ctx.backend.clone() else {
            return Err(Exception::runtime_bare(format!(
                "No backend determined in {}",
                scope.as_str()
            )));
        };
        let origin = match &backend {
            BackendRef::Backend(origin) => Arc::clone(origin),
            BackendRef::Director(director) => {
                let identity = ctx.client_identity();
                director.select(DirectorIdentity {
                    request_hash: &ctx.request_hash,
                    client_identity: &identity,
                })?
            }
        };
        let target = self.transport.target(&origin)?;
        ctx.backend_request = Some(
            self.transport
                .backend_request(&origin, &target, &ctx.request),
        );
        ctx.selected_backend = Some(origin);
        ctx.backend_target = Some(target);
        Ok(())
    }

    fn miss(&self, ctx: &mut Context) -> Result<(), Exception> {
        self.prepare_backend_request(ctx, Scope::Miss)?;
        match or_default(self.run_phase(ctx, Scope::Miss)?, State::Fetch) {
            State::Fetch => self.fetch(ctx),
            State::DeliverStale => self.deliver(ctx),
            State::Pass => self.pass(ctx),
            State::Error => self.error(ctx),
            other => Err(self.unexpected(Scope::Miss, other)),
        }
    }

    fn pass(&self, ctx: &mut Context) -> Result<(), Exception> {
        ctx.state = "PASS".to_string();
        self.prepare_backend_request(ctx, Scope::Pass)?;
        match or_default(self.run_phase(ctx, Scope::Pass)?, State::Pass) {
            State::Pass => self.fetch(ctx),
            State::Error => self.error(ctx),
            other => Err(self.unexpected(Scope::Pass, other)),
        }
    }

    fn hit(&self, ctx: &mut Context) -> Result<(), Exception> {
        let state = or_default(self.run_phase(ctx, Scope::Hit)?, State::Deliver);
        if ctx.object_ttl > 0 {
            self.cache.update_ttl(
                &ctx.request_hash,
                ctx.now(),
                Duration::milliseconds(ctx.object_ttl),
            );
        }
        match state {
            State::Deliver => self.deliver(ctx),
            State::Pass => self.pass(ctx),
            State::Error => self.error(ctx),
            State::Restart => self.restart(ctx),
            other => Err(self.unexpected(Scope::Hit, other)),
        }
    }

    fn fetch(&self, ctx: &mut Context) -> Result<(), Exception> {
        ctx.scope = Scope::Fetch;
        let (Some(bereq), Some(target), Some(origin)) = (
            ctx.backend_request.as_ref(),
            ctx.backend_target.as_ref(),
            ctx.selected_backend.as_ref(),
        ) else {
            return Err(Exception::system("No backend determined on FETCH"));
        };
        let response = self.transport.send(target, bereq).map_err(|err| {
            Exception::runtime_bare(format!(
                "Failed to retrieve backend response from {}: {err}",
                origin.name
            ))
        })?;
        limits::check_response_limit(&response)?;
        ctx.trace.backend = Some(origin.name.clone());

        let now = ctx.now();
        ctx.beresp_cacheable = cache::is_cacheable_status(response.status);
        ctx.beresp_ttl = if ctx.beresp_cacheable {
            cache::determine_ttl(&response, now).saturating_mul(1000)
        } else {
            0
        };
        ctx.beresp_grace = 0;
        ctx.object = None;
        ctx.backend_response = Some(response);

        let state = or_default(self.run_phase(ctx, Scope::Fetch)?, State::Deliver);
        let passed = ctx.state == "PASS" || matches!(state, State::Pass | State::HitForPass);
        if ctx.beresp_cacheable && ctx.beresp_ttl > 0 && !passed {
            if let Some(response) = ctx.backend_response.clone() {
                let item = CacheItem::new(response, now, Duration::milliseconds(ctx.beresp_ttl));
                self.cache.set(&ctx.request_hash, item);
            }
        }

        match state {
            State::Deliver | State::DeliverStale | State::Pass | State::HitForPass => {
                self.deliver(ctx)
            }
            State::Error => self.error(ctx),
            State::Restart => self.restart(ctx),
            other => Err(self.unexpected(Scope::Fetch, other)),
        }
    }

    fn error(&self, ctx: &mut Context) -> Result<(), Exception> {
        ctx.is_locally_generated = true;
        let status = u16::try_from(ctx.object_status).unwrap_or(503);
        let mut object = Response::with_body(status, "text/plain", ctx.object_response.clone());
        object.reason = ctx.object_response.clone();
        ctx.object = Some(object);
        match or_default(self.run_phase(ctx, Scope::Error)?, State::Deliver) {
            State::Deliver => self.deliver(ctx),
            State::Restart => self.restart(ctx),
            other => Err(self.unexpected(Scope::Error, other)),
        }
    }

    fn deliver(&self, ctx: &mut Context) -> Result<(), Exception> {
        let response = ctx
            .object
            .clone()
            .or_else(|| ctx.backend_response.clone())
            .ok_or_else(|| Exception::system("No response is available to deliver"))?;
        ctx.response = Some(response);
        match or_default(self.run_phase(ctx, Scope::Deliver)?, State::Log) {
            State::Restart => self.restart(ctx),
            State::Log | State::Deliver => {
                if ctx.esi_triggered {
                    self.expand_esi(ctx)?;
                }
                self.stamp_delivery(ctx);
                self.log(ctx)
            }
            other => Err(self.unexpected(Scope::Deliver, other)),
        }
    }

    fn log(&self, ctx: &mut Context) -> Result<(), Exception> {
        self.run_phase(ctx, Scope::Log)?;
        Ok(())
    }

    fn restart(&self, ctx: &mut Context) -> Result<(), Exception> {
        if ctx.restarts >= MAX_VARNISH_RESTARTS {
            return Err(Exception::runtime_bare("Max restart limit exceeded"));
        }
        ctx.restarts += 1;
        ctx.reset_for_restart();
        edgesim_rt::log::debug(&format!("restart #{}", ctx.restarts));
        self.recv(ctx)
    }

    /// Headers the edge adds to every delivered response.
    fn stamp_delivery(&self, ctx: &mut Context) {
        let served_by = cache::served_by(&self.datacenter);
        let now = ctx.now();
        let started = ctx.started_at.timestamp();
        let hit = ctx.cache_hit.as_ref();
        let hits = hit.map(|item| item.hits).unwrap_or(0);
        let age = hit.map(|item| item.age(now));
        let debug = ctx.request.header.contains("Fastly-Debug");
        let fetched = ctx.backend_response.is_some();
        let (ttl, grace) = if hit.is_some() {
            (ctx.object_ttl, ctx.object_grace)
        } else {
            (ctx.beresp_ttl, ctx.beresp_grace)
        };
        let Some(response) = ctx.response.as_mut() else {
            return;
        };
        let header = &mut response.header;
        header.set("X-Served-By", Value::string(served_by.clone()));
        header.set("X-Cache", Value::string(ctx.state.clone()));
        header.set("X-Cache-Hits", Value::string(hits.to_string()));
        if let Some(age) = age {
            header.set("Age", Value::string(age.to_string()));
        }
        if debug {
            let mut path = format!("(D {served_by} {started})");
            if fetched {
                path.push_str(&format!(" (F {served_by} {started})"));
            }
            header.set("Fastly-Debug-Path", Value::string(path));
            let flag = if ctx.state == "HIT" { "H" } else { "M" };
            header.set(
                "Fastly-Debug-TTL",
                Value::string(format!(
                    "({flag} {served_by} {:.3} {:.3} {})",
                    ttl as f64 / 1000.0,
                    grace as f64 / 1000.0,
                    age.unwrap_or(0)
                )),
            );
        }
    }

    fn expand_esi(&self, ctx: &mut Context) -> Result<(), Exception> {
        let Some(body) = ctx
            .response
            .as_ref()
            .map(|resp| String::from_utf8_lossy(&resp.body).into_owned())
        else {
            return Ok(());
        };
        let expanded = esi::expand(&body, |src| self.fetch_include(ctx, src))
            .map_err(Exception::runtime_bare)?;
        if let Some(response) = ctx.response.as_mut() {
            response.body = expanded;
            response.header.del("Content-Length");
        }
        Ok(())
    }

    /// Sub-request for one `<esi:include>`. Sources without a scheme go to
    /// the backend that served the page; paths resolve against `req.url`.
    fn fetch_include(&self, ctx: &Context, src: &str) -> Result<Vec<u8>, String> {
        let (mut target, path, absolute) = match Target::from_url(src) {
            Some((target, path)) => (target, path, true),
            None => {
                let target = ctx
                    .backend_target
                    .clone()
                    .ok_or_else(|| format!("no backend to resolve include {src}"))?;
                (target, esi::resolve_path(&ctx.request.url, src), false)
            }
        };
        target.timeout = target.timeout.min(esi::INCLUDE_TIMEOUT);
        target.connect_timeout = target.connect_timeout.min(esi::INCLUDE_TIMEOUT);

        let mut req = ctx
            .backend_request
            .clone()
            .unwrap_or_else(|| ctx.request.clone());
        req.method = "GET".to_string();
        req.url = path;
        req.body.clear();
        if absolute {
            req.header.set("Host", Value::string(target.authority()));
        }
        let resp = self.transport.send(&target, &req)?;
        if resp.status >= 400 {
            return Err(format!("include {src} responded with status {}", resp.status));
        }
        Ok(resp.body)
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::cache::CacheItem;
use crate::director::Backend;
use crate::http::{Request, Response};
use crate::trace::Trace;
use crate::transport::Target;
use crate::value::{BackendRef, Value};

/// Phase the request is currently executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Init,
    Recv,
    Hash,
    Hit,
    Miss,
    Pass,
    Fetch,
    Error,
    Deliver,
    Log,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Init => "INIT",
            Scope::Recv => "RECV",
            Scope::Hash => "HASH",
            Scope::Hit => "HIT",
            Scope::Miss => "MISS",
            Scope::Pass => "PASS",
            Scope::Fetch => "FETCH",
            Scope::Error => "ERROR",
            Scope::Deliver => "DELIVER",
            Scope::Log => "LOG",
        }
    }

    /// Reserved subroutine driving this phase.
    pub fn subroutine(self) -> &'static str {
        match self {
            Scope::Init => "vcl_init",
            Scope::Recv => "vcl_recv",
            Scope::Hash => "vcl_hash",
            Scope::Hit => "vcl_hit",
            Scope::Miss => "vcl_miss",
            Scope::Pass => "vcl_pass",
            Scope::Fetch => "vcl_fetch",
            Scope::Error => "vcl_error",
            Scope::Deliver => "vcl_deliver",
            Scope::Log => "vcl_log",
        }
    }

    pub fn from_subroutine(name: &str) -> Option<Self> {
        Some(match name {
            "vcl_recv" => Scope::Recv,
            "vcl_hash" => Scope::Hash,
            "vcl_hit" => Scope::Hit,
            "vcl_miss" => Scope::Miss,
            "vcl_pass" => Scope::Pass,
            "vcl_fetch" => Scope::Fetch,
            "vcl_error" => Scope::Error,
            "vcl_deliver" => Scope::Deliver,
            "vcl_log" => Scope::Log,
            _ => return None,
        })
    }

    /// Phase named by a `#FASTLY <phase>` marker.
    pub fn from_macro(name: &str) -> Option<Self> {
        Self::from_subroutine(&format!("vcl_{}", name.to_ascii_lowercase()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScopeSet(u16);

impl ScopeSet {
    pub const ALL: ScopeSet = ScopeSet(u16::MAX);

    pub const fn of(scopes: &[Scope]) -> Self {
        let mut bits = 0u16;
        let mut idx = 0;
        while idx < scopes.len() {
            bits |= 1 << (scopes[idx] as u16);
            idx += 1;
        }
        ScopeSet(bits)
    }

    pub fn contains(self, scope: Scope) -> bool {
        self.0 & (1 << (scope as u16)) != 0
    }
}

/// Everything one request owns while it walks the state machine.
#[derive(Debug)]
pub struct Context {
    pub scope: Scope,
    pub request: Request,
    pub backend_request: Option<Request>,
    pub backend_response: Option<Response>,
    pub object: Option<Response>,
    pub response: Option<Response>,

    /// `req.backend`: a backend or a director.
    pub backend: Option<BackendRef>,
    /// Origin elected for the current fetch.
    pub selected_backend: Option<Arc<Backend>>,
    pub backend_target: Option<Target>,

    pub request_hash: String,
    pub restarts: i64,
    /// `fastly_info.state`, also stamped as `X-Cache`.
    pub state: String,
    pub cache_hit: Option<CacheItem>,

    pub object_status: i64,
    pub object_response: String,
    /// Milliseconds.
    pub object_ttl: i64,
    pub object_grace: i64,
    pub beresp_ttl: i64,
    pub beresp_grace: i64,
    pub beresp_cacheable: bool,

    pub is_locally_generated: bool,
    pub is_purge: bool,
    pub esi_enabled: bool,
    pub esi_triggered: bool,
    pub return_called: bool,
    pub client_identity: Option<String>,
    /// Last entry touched per ratecounter, read by `ratecounter.NAME.*`.
    pub ratecounter_entries: HashMap<String, String>,

    pub regex_groups: Vec<String>,
    pub locals: HashMap<String, Value>,
    /// True while a functional subroutine is the innermost frame.
    pub functional: bool,
    pub call_stack: Vec<String>,
    pub sub_calls: HashMap<String, usize>,

    pub started_at: DateTime<Utc>,
    clock: Option<DateTime<Utc>>,
    started: Instant,
    pub trace: Trace,
}

impl Context {
    /// `clock` pins `now` for reproducible runs.
    pub fn new(request: Request, clock: Option<DateTime<Utc>>) -> Self {
        Self {
            scope: Scope::Init,
            request,
            backend_request: None,
            backend_response: None,
            object: None,
            response: None,
            backend: None,
            selected_backend: None,
            backend_target: None,
            request_hash: String::new(),
            restarts: 0,
            state: "NONE".to_string(),
            cache_hit: None,
            object_status: 0,
            object_response: String::new(),
            object_ttl: 0,
            object_grace: 0,
            beresp_ttl: 0,
            beresp_grace: 0,
            beresp_cacheable: false,
            is_locally_generated: false,
            is_purge: false,
            esi_enabled: true,
            esi_triggered: false,
            return_called: false,
            client_identity: None,
            ratecounter_entries: HashMap::new(),
            regex_groups: Vec::new(),
            locals: HashMap::new(),
            functional: false,
            call_stack: Vec::new(),
            sub_calls: HashMap::new(),
            started_at: clock.unwrap_or_else(Utc::now),
            clock,
            started: Instant::now(),
            trace: Trace::default(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn client_identity(&self) -> String {
        self.client_identity
            .clone()
            .unwrap_or_else(|| self.request.remote_ip().to_string())
    }

    /// Drops the per-attempt HTTP state before re-entering RECV.
    pub fn reset_for_restart(&mut self) {
        self.backend_request = None;
        self.backend_response = None;
        self.object = None;
        self.response = None;
        self.selected_backend = None;
        self.backend_target = None;
        self.cache_hit = None;
        self.esi_triggered = false;
        self.is_locally_generated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::{Scope, ScopeSet};

    #[test]
    fn scope_sets_are_bitmasks() {
        const FETCH_ONLY: ScopeSet = ScopeSet::of(&[Scope::Fetch]);
        assert!(FETCH_ONLY.contains(Scope::Fetch));
        assert!(!FETCH_ONLY.contains(Scope::Recv));
        assert!(ScopeSet::ALL.contains(Scope::Log));
    }

    #[test]
    fn macro_markers_name_phases() {
        assert_eq!(Scope::from_macro("RECV"), Some(Scope::Recv));
        assert_eq!(Scope::from_macro("deliver"), Some(Scope::Deliver));
        assert_eq!(Scope::from_macro("init"), None);
        assert_eq!(Scope::Miss.subroutine(), "vcl_miss");
    }
}

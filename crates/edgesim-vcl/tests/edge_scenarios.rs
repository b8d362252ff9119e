mod support;

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use edgesim_rt::json::JsonValue;
use edgesim_vcl::config::{Options, OverrideBackend};
use edgesim_vcl::http::Request;
use edgesim_vcl::interp::{Interpreter, Outcome};
use edgesim_vcl::{MemoryResolver, load_program};
use support::net::{Origin, ok_response, skip_if_loopback_unavailable};

fn compile(src: &str, options: Options) -> Interpreter {
    let (program, diags) = load_program("main.vcl", src, &MemoryResolver::default());
    assert!(diags.is_empty(), "{diags:?}");
    Interpreter::new(program, options).expect("program initializes")
}

fn origin_backend(name: &str, port: u16) -> String {
    format!("backend {name} {{ .host = \"127.0.0.1\"; .port = \"{port}\"; }}\n")
}

fn header(outcome: &Outcome, name: &str) -> Option<String> {
    outcome.response.as_ref()?.header.get_raw(name)
}

/// `req.headers.<name>[0]` of the flow recorded when `subroutine` began.
fn flow_request_header(outcome: &Outcome, subroutine: &str, name: &str) -> Option<String> {
    let trace = outcome.trace_json();
    let flows = trace.get("flows")?.as_array()?;
    let flow = flows
        .iter()
        .find(|flow| flow.get("subroutine").and_then(JsonValue::as_str) == Some(subroutine))?;
    let values = flow.get("req")?.get("headers")?.get(name)?.as_array()?;
    values.first()?.as_str().map(str::to_string)
}

#[test]
fn header_set_in_recv_reaches_origin_and_trace() {
    if skip_if_loopback_unavailable("header_set_in_recv_reaches_origin_and_trace") {
        return;
    }
    let origin = Origin::spawn(&ok_response(&["Content-Type: text/plain"], "hello"));
    let src = format!(
        "{}sub vcl_recv {{\n  set req.http.Foo = \"yes\";\n}}\n\nsub vcl_deliver {{\n}}\n",
        origin_backend("F_origin", origin.port)
    );
    let interp = compile(&src, Options::default());

    let outcome = interp.process(Request::new("GET", "/"));
    assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
    assert_eq!(outcome.status(), 200);
    assert_eq!(outcome.response.as_ref().map(|r| r.body.clone()), Some(b"hello".to_vec()));
    assert_eq!(flow_request_header(&outcome, "vcl_deliver", "Foo").as_deref(), Some("yes"));
    assert_eq!(outcome.trace.backend.as_deref(), Some("F_origin"));

    let seen = origin.requests();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].to_ascii_lowercase().contains("\r\nfoo: yes\r\n"), "{}", seen[0]);
    assert!(seen[0].to_ascii_lowercase().contains("\r\nfastly-ff: "), "{}", seen[0]);
}

#[test]
fn time_concatenation_uses_the_request_clock() {
    let interp = compile(
        "sub vcl_recv {\n  set req.http.T = now + 5m;\n  error 600;\n}\n\nsub vcl_error {\n}\n",
        Options::default(),
    );
    let clock = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single();
    let outcome = interp.process_at(Request::new("GET", "/"), clock);
    assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
    assert_eq!(
        flow_request_header(&outcome, "vcl_error", "T").as_deref(),
        Some("Wed, 01 Jan 2025 00:05:00 GMT")
    );
}

#[test]
fn director_without_quorum_fails_the_request() {
    let interp = compile(
        r#"
backend F_a { .host = "a.example"; }
backend F_b { .host = "b.example"; }
backend F_c { .host = "c.example"; }
director D_random random {
  .quorum = 50%;
  .retries = 2;
  { .backend = F_a; .weight = 1; }
  { .backend = F_b; .weight = 1; }
  { .backend = F_c; .weight = 1; }
}
sub vcl_recv {
  set req.backend = D_random;
  return(pass);
}
"#,
        Options::default(),
    );
    for name in ["F_a", "F_b", "F_c"] {
        interp.backend(name).expect("backend").set_healthy(false);
    }
    let outcome = interp.process(Request::new("GET", "/"));
    assert_eq!(outcome.status(), 500);
    let message = outcome.error.map(|err| err.message).unwrap_or_default();
    assert!(message.contains("Quorum"), "{message}");
}

#[test]
fn second_request_is_served_from_cache() {
    if skip_if_loopback_unavailable("second_request_is_served_from_cache") {
        return;
    }
    let origin = Origin::spawn(&ok_response(&["Cache-Control: max-age=60"], "cached body"));
    let src = format!(
        "{}sub vcl_recv {{\n  return(lookup);\n}}\n",
        origin_backend("F_origin", origin.port)
    );
    let interp = compile(&src, Options::default());

    let first = interp.process(Request::new("GET", "/asset.css"));
    assert!(first.error.is_none(), "{:?}", first.trace.error);
    assert!(!first.trace.cached);
    assert!(header(&first, "X-Cache").is_some_and(|v| v.contains("MISS")));

    let second = interp.process(Request::new("GET", "/asset.css"));
    assert!(second.error.is_none(), "{:?}", second.trace.error);
    assert!(second.trace.cached);
    assert!(header(&second, "X-Cache").is_some_and(|v| v.contains("HIT")));
    assert_eq!(
        second.response.as_ref().map(|r| r.body.clone()),
        Some(b"cached body".to_vec())
    );
    assert_eq!(origin.hits(), 1);
    assert_eq!(interp.cache().len(), 1);
}

#[test]
fn uncacheable_status_is_fetched_every_time() {
    if skip_if_loopback_unavailable("uncacheable_status_is_fetched_every_time") {
        return;
    }
    let origin = Origin::spawn(
        "HTTP/1.1 500 Internal Server Error\r\nCache-Control: max-age=60\r\nContent-Length: 0\r\n\r\n",
    );
    let src = format!(
        "{}sub vcl_recv {{\n  return(lookup);\n}}\n",
        origin_backend("F_origin", origin.port)
    );
    let interp = compile(&src, Options::default());
    for _ in 0..2 {
        let outcome = interp.process(Request::new("GET", "/broken"));
        assert_eq!(outcome.status(), 500);
        assert!(!outcome.trace.cached);
    }
    assert_eq!(origin.hits(), 2);
    assert!(interp.cache().is_empty());
}

#[test]
fn restarts_are_capped_at_three() {
    let interp = compile("sub vcl_recv {\n  restart;\n}\n", Options::default());
    let outcome = interp.process(Request::new("GET", "/"));
    assert_eq!(outcome.status(), 500);
    assert_eq!(outcome.trace.restarts, 3);
    let message = outcome.error.map(|err| err.message).unwrap_or_default();
    assert_eq!(message, "Max restart limit exceeded");
    let recv_entries = outcome
        .trace
        .flows
        .iter()
        .filter(|flow| flow.subroutine == "vcl_recv")
        .count();
    assert_eq!(recv_entries, 4);
}

#[test]
fn consistent_hash_director_is_sticky() {
    if skip_if_loopback_unavailable("consistent_hash_director_is_sticky") {
        return;
    }
    let origin = Origin::spawn(&ok_response(&[], "ok"));
    let src = format!(
        r#"{}{}{}
director D_chash chash {{
  .quorum = 50%;
  .seed = 1;
  .key = object;
  {{ .backend = test01; .id = "b01"; }}
  {{ .backend = test02; .id = "b02"; }}
  {{ .backend = test03; .id = "b03"; }}
}}
sub vcl_recv {{
  set req.backend = D_chash;
  return(pass);
}}
"#,
        origin_backend("test01", origin.port),
        origin_backend("test02", origin.port),
        origin_backend("test03", origin.port),
    );
    let interp = compile(&src, Options::default());
    for _ in 0..20 {
        let outcome = interp.process(Request::new("GET", "/?foo=bar"));
        assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
        assert_eq!(outcome.trace.backend.as_deref(), Some("test03"));
        assert!(header(&outcome, "X-Cache").is_some_and(|v| v.contains("PASS")));
    }
    assert_eq!(origin.hits(), 20);
}

#[test]
fn override_backends_redirect_matching_origins() {
    if skip_if_loopback_unavailable("override_backends_redirect_matching_origins") {
        return;
    }
    let origin = Origin::spawn(&ok_response(&[], "overridden"));
    let options = Options {
        override_backends: vec![(
            "F_*".to_string(),
            OverrideBackend {
                host: Some(format!("127.0.0.1:{}", origin.port)),
                ssl: Some(false),
            },
        )],
        ..Options::default()
    };
    let interp = compile(
        "backend F_prod { .host = \"origin.invalid\"; .port = \"443\"; .ssl = true; }\nsub vcl_recv {\n  return(pass);\n}\n",
        options,
    );
    let outcome = interp.process(Request::new("GET", "/"));
    assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
    assert_eq!(
        outcome.response.as_ref().map(|r| r.body.clone()),
        Some(b"overridden".to_vec())
    );
    assert_eq!(origin.hits(), 1);
}

#[test]
fn purge_requests_answer_without_fetching() {
    let interp = compile(
        "backend F_a { .host = \"a.example\"; }\nsub vcl_recv {\n  return(lookup);\n}\n",
        Options::default(),
    );
    let outcome = interp.process(Request::new("FASTLYPURGE", "/asset.css"));
    assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
    let response = outcome.response.expect("response");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, br#"{"status":"ok"}"#.to_vec());

    let interp = compile("sub vcl_recv {\n  set req.http.X = \"1\";\n}\n", Options::default());
    let outcome = interp.process(Request::new("FASTLYPURGE", "/"));
    let message = outcome.error.map(|err| err.message).unwrap_or_default();
    assert!(message.contains("must determine next state"), "{message}");
}

#[test]
fn edge_dictionaries_become_tables() {
    let mut dictionary = BTreeMap::new();
    dictionary.insert("/old".to_string(), "/new".to_string());
    let options = Options {
        edge_dictionary: BTreeMap::from([("redirects".to_string(), dictionary)]),
        ..Options::default()
    };
    let interp = compile(
        "sub vcl_recv {\n  error 301 table.lookup(redirects, req.url.path, \"/\");\n}\n",
        options,
    );
    let outcome = interp.process(Request::new("GET", "/old"));
    let response = outcome.response.expect("response");
    assert_eq!(response.status, 301);
    assert_eq!(response.reason, "/new");
}

#[test]
fn coverage_counts_executed_statements() {
    let interp = compile(
        "sub vcl_recv {\n  if (req.url == \"/a\") {\n    set req.http.A = \"1\";\n  } else {\n    set req.http.B = \"1\";\n  }\n  error 600;\n}\n",
        Options {
            coverage: true,
            ..Options::default()
        },
    );
    let plain = compile(
        "sub vcl_recv {\n  if (req.url == \"/a\") {\n    set req.http.A = \"1\";\n  } else {\n    set req.http.B = \"1\";\n  }\n  error 600;\n}\n",
        Options::default(),
    );
    let outcome = interp.process(Request::new("GET", "/a"));
    let baseline = plain.process(Request::new("GET", "/a"));
    assert_eq!(outcome.status(), baseline.status());

    let report = interp.coverage_report().expect("coverage enabled");
    let statements = report.get("statements").expect("statements");
    let hit = statements.get("hit").and_then(JsonValue::as_f64).unwrap_or(0.0);
    let total = statements.get("total").and_then(JsonValue::as_f64).unwrap_or(0.0);
    assert!(hit > 0.0 && hit < total, "hit={hit} total={total}");
    let subroutines = report.get("subroutines").expect("subroutines");
    assert_eq!(subroutines.get("percent").and_then(JsonValue::as_f64), Some(100.0));
    assert!(plain.coverage_report().is_none());
}

#[test]
fn esi_includes_are_fetched_relative_to_the_page() {
    if skip_if_loopback_unavailable("esi_includes_are_fetched_relative_to_the_page") {
        return;
    }
    let page = concat!(
        "<main><esi:include src=\"frag.html\"/>|",
        "<esi:include src=\"/shop/missing.html\"/><esi:remove>offline</esi:remove></main>"
    );
    let origin = Origin::spawn_routes(&[
        ("/shop/index.html", ok_response(&["Content-Type: text/html"], page)),
        ("/shop/frag.html", ok_response(&[], "FRAG")),
    ]);
    let src = format!(
        "{}sub vcl_recv {{\n  return(pass);\n}}\n\nsub vcl_fetch {{\n  esi;\n}}\n",
        origin_backend("F_origin", origin.port)
    );
    let interp = compile(&src, Options::default());

    let outcome = interp.process(Request::new("GET", "/shop/index.html?lang=en"));
    assert!(outcome.error.is_none(), "{:?}", outcome.trace.error);
    let body = outcome.response.map(|r| r.body).unwrap_or_default();
    assert_eq!(String::from_utf8_lossy(&body), "<main>FRAG|offline</main>");

    let paths: Vec<String> = origin
        .requests()
        .iter()
        .filter_map(|request| request.split_whitespace().nth(1).map(str::to_string))
        .collect();
    assert_eq!(
        paths,
        vec!["/shop/index.html?lang=en", "/shop/frag.html", "/shop/missing.html"]
    );
}

#[test]
fn unclosed_esi_remove_fails_the_request() {
    if skip_if_loopback_unavailable("unclosed_esi_remove_fails_the_request") {
        return;
    }
    let origin = Origin::spawn(&ok_response(&[], "a<esi:remove>b"));
    let src = format!(
        "{}sub vcl_recv {{\n  return(pass);\n}}\n\nsub vcl_fetch {{\n  esi;\n}}\n",
        origin_backend("F_origin", origin.port)
    );
    let interp = compile(&src, Options::default());
    let outcome = interp.process(Request::new("GET", "/"));
    assert_eq!(outcome.status(), 500);
    let message = outcome.error.map(|err| err.message).unwrap_or_default();
    assert!(message.contains("does not seem to close"), "{message}");
}

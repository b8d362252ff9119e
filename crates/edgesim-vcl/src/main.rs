use std::env;
use std::path::{Path, PathBuf};
use std::process;

use chrono::{DateTime, Utc};
use edgesim_rt::json;
use edgesim_vcl::compile_entry;
use edgesim_vcl::config::{Options, load_manifest};
use edgesim_vcl::http::Request;
use edgesim_vcl::value::Value;

const USAGE: &str = "usage: edgesim-vcl [--method M] [--url U] [--header K:V]... [--body TEXT] [--client IP] [--now RFC3339] [--manifest PATH] [--coverage] <file>";

struct Args {
    path: PathBuf,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
    client: Option<String>,
    now: Option<DateTime<Utc>>,
    manifest: Option<PathBuf>,
    coverage: bool,
}

fn usage_error(message: &str) -> ! {
    eprintln!("{message}");
    eprintln!("{USAGE}");
    process::exit(2);
}

fn parse_args() -> Args {
    let mut args = env::args().skip(1);
    let mut parsed = Args {
        path: PathBuf::new(),
        method: "GET".to_string(),
        url: "/".to_string(),
        headers: Vec::new(),
        body: None,
        client: None,
        now: None,
        manifest: None,
        coverage: false,
    };
    let mut path = None;

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .unwrap_or_else(|| usage_error(&format!("{flag} expects a value")))
        };
        match arg.as_str() {
            "--method" => parsed.method = value("--method").to_ascii_uppercase(),
            "--url" => parsed.url = value("--url"),
            "--header" => {
                let raw = value("--header");
                let Some((name, field)) = raw.split_once(':') else {
                    usage_error(&format!("invalid header '{raw}', expected NAME:VALUE"));
                };
                parsed
                    .headers
                    .push((name.trim().to_string(), field.trim().to_string()));
            }
            "--body" => parsed.body = Some(value("--body")),
            "--client" => parsed.client = Some(value("--client")),
            "--now" => {
                let raw = value("--now");
                let at = DateTime::parse_from_rfc3339(&raw)
                    .unwrap_or_else(|err| usage_error(&format!("invalid --now '{raw}': {err}")));
                parsed.now = Some(at.with_timezone(&Utc));
            }
            "--manifest" => parsed.manifest = Some(PathBuf::from(value("--manifest"))),
            "--coverage" => parsed.coverage = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                process::exit(0);
            }
            _ if path.is_none() && !arg.starts_with("--") => path = Some(PathBuf::from(arg)),
            _ => usage_error(&format!("unexpected argument: {arg}")),
        }
    }
    parsed.path = path.unwrap_or_else(|| usage_error("missing VCL file"));
    parsed
}

fn main() {
    let args = parse_args();

    let (manifest, manifest_dir) = match load_manifest(args.manifest.as_deref()) {
        Ok(found) => found,
        Err(message) => {
            eprintln!("error: {message}");
            process::exit(1);
        }
    };
    let mut options = manifest
        .as_ref()
        .map(|manifest| manifest.options(manifest_dir.as_deref()))
        .unwrap_or_else(Options::default);
    options.coverage |= args.coverage;
    let include_paths = manifest
        .as_ref()
        .map(|manifest| manifest.include_paths(manifest_dir.as_deref()))
        .unwrap_or_default();

    let interp = match compile_entry(Path::new(&args.path), &include_paths, options) {
        Ok(interp) => interp,
        Err(errors) => {
            for error in errors {
                eprintln!("{error}");
            }
            process::exit(1);
        }
    };

    let mut request = Request::new(&args.method, &args.url);
    for (name, field) in &args.headers {
        request.header.add(name, Value::string(field.as_str()));
    }
    if let Some(body) = args.body {
        request.body = body.into_bytes();
    }
    if let Some(client) = args.client {
        request.remote_addr = format!("{client}:0");
    }

    let outcome = interp.process_at(request, args.now);
    println!("{}", json::encode_pretty(&outcome.trace_json()));
    if outcome.error.is_some() {
        process::exit(1);
    }
}

use std::env;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use edgesim_vcl::config::{Manifest, Options, load_manifest};
use edgesim_vcl::server::{self, Handler};

const USAGE: &str = r#"usage: edgesim <command> [options] [file]

commands:
  serve     Run the edge simulator on [server] host:port
  check     Parse, resolve includes and initialize the VCL program

options:
  --manifest <path>       Path to edgesim.toml (defaults to nearest parent)
  --file <path>           Entry file override
  --coverage              Instrument the program and report coverage in traces
  --color <auto|always|never>  Colorized CLI output policy
  --version               Print version and platform information
"#;

#[derive(Default)]
struct CommonArgs {
    manifest_path: Option<PathBuf>,
    entry: Option<String>,
    coverage: bool,
    color: Option<ColorChoice>,
}

#[derive(Copy, Clone)]
enum Command {
    Serve,
    Check,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "auto" => Some(Self::Auto),
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

static COLOR_MODE: AtomicU8 = AtomicU8::new(0);

fn apply_color_choice(choice: ColorChoice) {
    let enabled = match choice {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => env::var_os("NO_COLOR").is_none() && color_auto_is_tty(),
    };
    COLOR_MODE.store(u8::from(enabled), Ordering::Relaxed);
}

fn color_auto_is_tty() -> bool {
    if let Some(force) = env::var_os("EDGESIM_COLOR_FORCE_TTY") {
        return force == "1";
    }
    std::io::stderr().is_terminal()
}

fn ansi_paint(text: &str, code: &str) -> String {
    if COLOR_MODE.load(Ordering::Relaxed) != 0 {
        format!("\x1b[{code}m{text}\x1b[0m")
    } else {
        text.to_string()
    }
}

fn style_error(text: &str) -> String {
    ansi_paint(text, "31;1")
}

fn style_warning(text: &str) -> String {
    ansi_paint(text, "33;1")
}

fn style_header(text: &str) -> String {
    ansi_paint(text, "36;1")
}

fn emit_cli_error(message: &str) {
    eprintln!("{}", style_error(&format!("error: {message}")));
}

fn emit_cli_warning(message: &str) {
    eprintln!("{}", style_warning(&format!("warning: {message}")));
}

fn command_tag(command: Command) -> &'static str {
    match command {
        Command::Serve => "serve",
        Command::Check => "check",
    }
}

fn emit_command_step(command: Command, message: &str) {
    let prefix = style_header(&format!("[{}]", command_tag(command)));
    eprintln!("{prefix} {message}");
}

fn finalize_command(command: Command, code: i32) -> i32 {
    match code {
        0 => emit_command_step(command, "ok"),
        2 => emit_command_step(command, "validation failed"),
        _ => emit_command_step(command, "failed"),
    }
    code
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let code = run(args);
    std::process::exit(code);
}

fn run(args: Vec<String>) -> i32 {
    apply_color_choice(ColorChoice::Auto);
    let Some((cmd, rest)) = args.split_first() else {
        eprintln!("{}", style_header(USAGE));
        return 1;
    };
    let command = match cmd.as_str() {
        "serve" => Command::Serve,
        "check" => Command::Check,
        "--version" | "-V" => {
            println!(
                "edgesim {} ({}-{}, edgesim-vcl {})",
                env!("CARGO_PKG_VERSION"),
                env::consts::ARCH,
                env::consts::OS,
                edgesim_vcl::VERSION
            );
            return 0;
        }
        "--help" | "-h" | "help" => {
            println!("{USAGE}");
            return 0;
        }
        _ => {
            emit_cli_error(&format!("unknown command: {cmd}"));
            eprintln!("{}", style_header(USAGE));
            return 1;
        }
    };
    let common = match parse_common_args(rest) {
        Ok(args) => args,
        Err(err) => {
            emit_cli_error(&err);
            eprintln!("{}", style_header(USAGE));
            return 1;
        }
    };
    apply_color_choice(common.color.unwrap_or(ColorChoice::Auto));

    let (manifest, manifest_dir) = match load_manifest(common.manifest_path.as_deref()) {
        Ok(value) => value,
        Err(err) => {
            emit_cli_error(&err);
            return 1;
        }
    };
    apply_dotenv(manifest_dir.as_deref());

    let entry = match resolve_entry(&common, manifest.as_ref(), manifest_dir.as_deref()) {
        Ok(entry) => entry,
        Err(err) => {
            emit_cli_error(&err);
            return 1;
        }
    };

    emit_command_step(command, "start");
    let code = match command {
        Command::Check => run_check(&entry, &common, manifest.as_ref(), manifest_dir.as_deref()),
        Command::Serve => run_serve(&entry, &common, manifest.as_ref(), manifest_dir.as_deref()),
    };
    finalize_command(command, code)
}

fn parse_common_args(args: &[String]) -> Result<CommonArgs, String> {
    let mut out = CommonArgs::default();
    let mut idx = 0usize;
    while idx < args.len() {
        let arg = &args[idx];
        let mut value = |flag: &str| -> Result<String, String> {
            idx += 1;
            args.get(idx)
                .cloned()
                .ok_or_else(|| format!("{flag} expects a value"))
        };
        match arg.as_str() {
            "--manifest" | "--manifest-path" => {
                out.manifest_path = Some(PathBuf::from(value("--manifest")?));
            }
            "--file" => out.entry = Some(value("--file")?),
            "--coverage" => out.coverage = true,
            "--color" => {
                let raw = value("--color")?;
                out.color = Some(
                    ColorChoice::parse(&raw)
                        .ok_or_else(|| format!("invalid --color value: {raw}"))?,
                );
            }
            other if other.starts_with("--") => return Err(format!("unknown option: {other}")),
            other => {
                if out.entry.is_some() {
                    return Err(format!("unexpected argument: {other}"));
                }
                out.entry = Some(other.to_string());
            }
        }
        idx += 1;
    }
    Ok(out)
}

fn resolve_entry(
    common: &CommonArgs,
    manifest: Option<&Manifest>,
    manifest_dir: Option<&Path>,
) -> Result<PathBuf, String> {
    if let Some(entry) = &common.entry {
        return Ok(PathBuf::from(entry));
    }
    let entry = manifest
        .and_then(|manifest| manifest.package.entry.clone())
        .ok_or_else(|| "no entry file: pass <file> or set [package].entry in edgesim.toml".to_string())?;
    Ok(match manifest_dir {
        Some(dir) => dir.join(entry),
        None => PathBuf::from(entry),
    })
}

fn options_for(common: &CommonArgs, manifest: Option<&Manifest>, manifest_dir: Option<&Path>) -> Options {
    let mut options = manifest
        .map(|manifest| manifest.options(manifest_dir))
        .unwrap_or_default();
    options.coverage |= common.coverage;
    options
}

fn compile(
    entry: &Path,
    common: &CommonArgs,
    manifest: Option<&Manifest>,
    manifest_dir: Option<&Path>,
) -> Result<edgesim_vcl::interp::Interpreter, Vec<String>> {
    let include_paths = manifest
        .map(|manifest| manifest.include_paths(manifest_dir))
        .unwrap_or_default();
    edgesim_vcl::compile_entry(entry, &include_paths, options_for(common, manifest, manifest_dir))
}

fn run_check(
    entry: &Path,
    common: &CommonArgs,
    manifest: Option<&Manifest>,
    manifest_dir: Option<&Path>,
) -> i32 {
    match compile(entry, common, manifest, manifest_dir) {
        Ok(interp) => {
            eprintln!(
                "{} is valid ({} source files)",
                entry.display(),
                interp.files().len()
            );
            0
        }
        Err(errors) => {
            for error in errors {
                eprintln!("{}", style_error(&error));
            }
            2
        }
    }
}

fn run_serve(
    entry: &Path,
    common: &CommonArgs,
    manifest: Option<&Manifest>,
    manifest_dir: Option<&Path>,
) -> i32 {
    let settings = match manifest
        .map(|manifest| manifest.server.resolve())
        .unwrap_or_else(|| Manifest::default().server.resolve())
    {
        Ok(settings) => settings,
        Err(err) => {
            emit_cli_error(&err);
            return 1;
        }
    };
    let program = compile(entry, common, manifest, manifest_dir).map_err(|errors| {
        for error in &errors {
            emit_cli_warning(error);
        }
        errors.join("\n")
    });
    match &program {
        Ok(_) => edgesim_rt::log::info(&format!(
            "serving {} in {:?} mode",
            entry.display(),
            settings.mode
        )),
        Err(_) => emit_cli_warning("program failed to initialize; every request will answer 500"),
    }
    match server::serve(Handler::new(program), &settings) {
        Ok(()) => 0,
        Err(err) => {
            emit_cli_error(&err);
            1
        }
    }
}

/// Loads `KEY=VALUE` lines from `.env` beside the manifest without
/// overriding variables already set.
fn apply_dotenv(manifest_dir: Option<&Path>) {
    let path = match manifest_dir {
        Some(dir) => dir.join(".env"),
        None => PathBuf::from(".env"),
    };
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            emit_cli_warning(&format!("failed to read {}: {err}", path.display()));
            return;
        }
    };
    for (key, value) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue;
        }
        // Single-threaded at this point; the listener starts afterwards.
        unsafe {
            env::set_var(key, value);
        }
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let unquoted = ['"', '\'']
            .iter()
            .find_map(|quote| {
                value
                    .strip_prefix(*quote)
                    .and_then(|rest| rest.strip_suffix(*quote))
            })
            .unwrap_or(value);
        out.push((key.to_string(), unquoted.to_string()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{parse_common_args, parse_dotenv};

    #[test]
    fn dotenv_lines_are_unquoted() {
        let pairs = parse_dotenv("# comment\nexport EDGESIM_SERVER_PORT=4001\nNAME=\"quoted value\"\nBAD\n");
        assert_eq!(
            pairs,
            vec![
                ("EDGESIM_SERVER_PORT".to_string(), "4001".to_string()),
                ("NAME".to_string(), "quoted value".to_string()),
            ]
        );
    }

    #[test]
    fn common_args_accept_positional_entry() {
        let args: Vec<String> = ["--coverage", "main.vcl"].iter().map(|s| s.to_string()).collect();
        let common = parse_common_args(&args).expect("args");
        assert!(common.coverage);
        assert_eq!(common.entry.as_deref(), Some("main.vcl"));

        let args = vec!["--color".to_string(), "sometimes".to_string()];
        assert!(parse_common_args(&args).is_err());
    }
}

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_project_dir(tag: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("edgesim_cli_{tag}_{nanos}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[test]
fn check_resolves_includes_from_manifest_paths() {
    let dir = temp_project_dir("check_ok");
    fs::create_dir_all(dir.join("vcl/lib")).expect("create lib dir");
    fs::write(
        dir.join("edgesim.toml"),
        "[package]\nentry = \"vcl/main.vcl\"\ninclude_paths = [\"vcl/lib\"]\n",
    )
    .expect("write manifest");
    fs::write(
        dir.join("vcl/main.vcl"),
        "include \"headers\";\n\nsub vcl_recv {\n  call add_headers;\n  return(lookup);\n}\n",
    )
    .expect("write main.vcl");
    fs::write(
        dir.join("vcl/lib/headers.vcl"),
        "sub add_headers {\n  set req.http.X-From-Include = \"1\";\n}\n",
    )
    .expect("write headers.vcl");

    let output = Command::new(env!("CARGO_BIN_EXE_edgesim"))
        .arg("check")
        .arg("--manifest")
        .arg(&dir)
        .output()
        .expect("run edgesim");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stderr: {stderr}");
    assert!(stderr.contains("is valid (2 source files)"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn check_reports_diagnostics_with_location() {
    let dir = temp_project_dir("check_err");
    let entry = dir.join("main.vcl");
    fs::write(&entry, "sub vcl_recv {\n  set req.http.X = \"a\"\n}\n").expect("write main.vcl");

    let output = Command::new(env!("CARGO_BIN_EXE_edgesim"))
        .arg("check")
        .arg(&entry)
        .output()
        .expect("run edgesim");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("main.vcl:"), "stderr: {stderr}");
    assert!(stderr.contains("[check] validation failed"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn check_reports_initialization_errors() {
    let dir = temp_project_dir("check_init");
    let entry = dir.join("main.vcl");
    fs::write(
        &entry,
        "backend F_a { .host = \"a.example\"; }\nbackend F_a { .host = \"b.example\"; }\n",
    )
    .expect("write main.vcl");

    let output = Command::new(env!("CARGO_BIN_EXE_edgesim"))
        .arg("check")
        .arg(&entry)
        .output()
        .expect("run edgesim");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Backend F_a is duplicated"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unknown_commands_print_usage() {
    let output = Command::new(env!("CARGO_BIN_EXE_edgesim"))
        .arg("deploy")
        .output()
        .expect("run edgesim");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown command: deploy"), "stderr: {stderr}");
    assert!(stderr.contains("usage: edgesim"), "stderr: {stderr}");
}

#[test]
fn version_reports_platform_and_engine() {
    let output = Command::new(env!("CARGO_BIN_EXE_edgesim"))
        .arg("--version")
        .output()
        .expect("run edgesim");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("edgesim "), "stdout: {stdout}");
    assert!(stdout.contains(std::env::consts::OS), "stdout: {stdout}");
    assert!(stdout.contains("edgesim-vcl "), "stdout: {stdout}");
}

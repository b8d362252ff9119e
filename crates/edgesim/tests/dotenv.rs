use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn temp_project_dir() -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("edgesim_dotenv_test_{nanos}"));
    dir
}

fn free_port() -> Option<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").ok()?;
    listener.local_addr().ok().map(|addr| addr.port())
}

fn get(port: u16, path: &str) -> Option<String> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)) {
            let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
            stream.write_all(request.as_bytes()).ok()?;
            let mut response = String::new();
            stream.read_to_string(&mut response).ok()?;
            return Some(response);
        }
        thread::sleep(Duration::from_millis(50));
    }
    None
}

#[test]
fn serve_reads_server_settings_from_dotenv() {
    let Some(port) = free_port() else {
        eprintln!("skipping serve_reads_server_settings_from_dotenv: loopback bind is not permitted");
        return;
    };
    let dir = temp_project_dir();
    fs::create_dir_all(&dir).expect("create temp dir");
    fs::write(dir.join("edgesim.toml"), "[package]\nentry = \"main.vcl\"\n").expect("write manifest");
    fs::write(
        dir.join("main.vcl"),
        "sub vcl_recv {\n  error 200 \"ok\";\n}\n\nsub vcl_error {\n  synthetic \"hello from the edge\";\n  return(deliver);\n}\n",
    )
    .expect("write main.vcl");
    fs::write(
        dir.join(".env"),
        format!(
            "EDGESIM_SERVER_PORT={port}\nEDGESIM_SERVER_MAX_REQUESTS=1\nEDGESIM_SERVER_MODE=\"response\"\n"
        ),
    )
    .expect("write .env");

    let mut child = Command::new(env!("CARGO_BIN_EXE_edgesim"))
        .arg("serve")
        .arg("--manifest")
        .arg(&dir)
        .env_remove("EDGESIM_SERVER_PORT")
        .env_remove("EDGESIM_SERVER_MAX_REQUESTS")
        .env_remove("EDGESIM_SERVER_MODE")
        .spawn()
        .expect("spawn edgesim");

    let response = get(port, "/");
    let status = child.wait().expect("wait edgesim");
    let response = response.expect("server answered");
    assert!(response.starts_with("HTTP/1.1 200 ok\r\n"), "{response}");
    assert!(response.contains("X-Cache: "), "{response}");
    assert!(response.ends_with("hello from the edge"), "{response}");
    assert!(status.success());

    let _ = fs::remove_dir_all(&dir);
}

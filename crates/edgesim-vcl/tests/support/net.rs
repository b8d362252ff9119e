#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

pub fn can_bind_loopback() -> bool {
    static CAN_BIND: OnceLock<bool> = OnceLock::new();
    *CAN_BIND.get_or_init(|| match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to check loopback bind capability: {err}"),
    })
}

pub fn skip_if_loopback_unavailable(test_name: &str) -> bool {
    if can_bind_loopback() {
        return false;
    }
    eprintln!("skipping {test_name}: loopback bind is not permitted in this environment");
    true
}

pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind free port");
    listener.local_addr().expect("missing local addr").port()
}

/// Reads a request head and whatever body `Content-Length` announces.
pub fn read_request_text(stream: &mut impl Read) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        raw.extend_from_slice(&buf[..n]);
        if let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if raw.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}

const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

/// Scripted origin that remembers the requests it saw.
pub struct Origin {
    pub port: u16,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Origin {
    /// Answers every connection with the same raw response.
    pub fn spawn(response: &str) -> Self {
        let response = response.to_string();
        Self::spawn_with(move |_| response.clone())
    }

    /// Answers by request path; unknown paths get a 404.
    pub fn spawn_routes(routes: &[(&str, String)]) -> Self {
        let routes: Vec<(String, String)> = routes
            .iter()
            .map(|(path, response)| (path.to_string(), response.clone()))
            .collect();
        Self::spawn_with(move |request| {
            let path = request.split_whitespace().nth(1).unwrap_or("/");
            routes
                .iter()
                .find(|(route, _)| route == path)
                .map(|(_, response)| response.clone())
                .unwrap_or_else(|| NOT_FOUND.to_string())
        })
    }

    fn spawn_with(respond: impl Fn(&str) -> String + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind origin");
        let port = listener.local_addr().expect("origin addr").port();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (thread_hits, thread_requests) = (Arc::clone(&hits), Arc::clone(&requests));
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                serve_one(&mut stream, &respond, &thread_hits, &thread_requests);
            }
        });
        Self {
            port,
            hits,
            requests,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn serve_one(
    stream: &mut TcpStream,
    respond: &dyn Fn(&str) -> String,
    hits: &AtomicUsize,
    requests: &Mutex<Vec<String>>,
) {
    let request = read_request_text(stream);
    let response = respond(&request);
    requests.lock().expect("requests lock").push(request);
    hits.fetch_add(1, Ordering::SeqCst);
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

/// Raw `200 OK` response with a body and extra header lines.
pub fn ok_response(extra_headers: &[&str], body: &str) -> String {
    let mut out = String::from("HTTP/1.1 200 OK\r\n");
    for line in extra_headers {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    out
}

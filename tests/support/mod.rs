//! Shared test scaffolding: a tiny hand-rolled HTTP server standing in
//! for the Generator backend, and a capturing `Egress`.

use async_trait::async_trait;
use clank::egress::Egress;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone)]
pub enum GenBehavior {
    Healthy(String),
    Down,
    EmptyOutput,
}

pub struct FakeGenerator {
    pub base_url: String,
    behavior: Arc<Mutex<GenBehavior>>,
}

impl FakeGenerator {
    pub fn start(models: Vec<String>, behavior: GenBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake generator");
        let addr = listener.local_addr().unwrap();
        let behavior = Arc::new(Mutex::new(behavior));
        let behavior_for_thread = behavior.clone();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let models = models.clone();
                let behavior = behavior_for_thread.clone();
                thread::spawn(move || serve_one(stream, &models, &behavior));
            }
        });

        FakeGenerator {
            base_url: format!("http://{addr}"),
            behavior,
        }
    }

    pub fn set_behavior(&self, behavior: GenBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

fn serve_one(mut stream: std::net::TcpStream, models: &[String], behavior: &Arc<Mutex<GenBehavior>>) {
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let mut head = request.lines();
    let first_line = head.next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let (status, body) = if path == "/health" {
        ("200 OK", "{}".to_string())
    } else if path == "/models" && method == "GET" {
        let joined = models
            .iter()
            .map(|m| serde_json::to_string(m).unwrap())
            .collect::<Vec<_>>()
            .join(",");
        ("200 OK", format!("{{\"models\":[{joined}]}}"))
    } else if path == "/generate" && method == "POST" {
        match behavior.lock().unwrap().clone() {
            GenBehavior::Healthy(text) => (
                "200 OK",
                format!("{{\"text\":{}}}", serde_json::to_string(&text).unwrap()),
            ),
            GenBehavior::Down => ("503 Service Unavailable", "{}".to_string()),
            GenBehavior::EmptyOutput => ("200 OK", "{\"text\":\"\"}".to_string()),
        }
    } else {
        ("404 Not Found", "{}".to_string())
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Captures every send instead of touching a real chat network.
#[derive(Default)]
pub struct CapturingEgress {
    pub sent: AsyncMutex<Vec<(String, String)>>,
}

#[async_trait]
impl Egress for CapturingEgress {
    async fn send(&self, channel: &str, text: &str) {
        self.sent
            .lock()
            .await
            .push((channel.to_string(), text.to_string()));
    }
}

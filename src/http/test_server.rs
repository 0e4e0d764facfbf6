//! Raw HTTP/1.1 server with a per-connection script, for failures mockito
//! can't produce (dropped connections, missing replies, slow bodies).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What the server does with one accepted connection.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Read the request, then close the connection without answering.
    Close,
    /// Read the request and never answer.
    Hang,
    /// Send the headers, wait `body_delay`, then send the body.
    Respond {
        status: u16,
        body: &'static str,
        body_delay: Duration,
    },
}

impl Reply {
    pub fn ok(body: &'static str) -> Self {
        Reply::Respond {
            status: 200,
            body,
            body_delay: Duration::ZERO,
        }
    }
}

pub struct ScriptedServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedServer {
    /// Connection `n` gets `script[n]`; connections past the end repeat the
    /// last reply. Every response closes its connection, so each attempt
    /// arrives on a new one.
    pub async fn start(script: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&connections);
        let peak = Arc::clone(&max_active);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = accepted.fetch_add(1, Ordering::SeqCst);
                let reply = script
                    .get(n)
                    .or(script.last())
                    .cloned()
                    .unwrap_or(Reply::Close);

                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let active = Arc::clone(&active);
                tokio::spawn(async move { serve(stream, reply, &active).await });
            }
        });

        Self {
            addr,
            connections,
            max_active,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/graphql", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Highest number of connections that were being served at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

async fn serve(mut stream: TcpStream, reply: Reply, active: &AtomicUsize) {
    read_request(&mut stream).await;

    match reply {
        Reply::Close => {
            active.fetch_sub(1, Ordering::SeqCst);
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);
        }
        Reply::Respond {
            status,
            body,
            body_delay,
        } => {
            let head = format!(
                "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.flush().await;
            tokio::time::sleep(body_delay).await;

            // Released before the body goes out: once the client holds the full
            // reply, this connection no longer counts as active.
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = stream.write_all(body.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }
}

/// Reads the request head and a `Content-Length` body.
async fn read_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let content_length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + content_length {
                return;
            }
        }

        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

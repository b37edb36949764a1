//! HTTP MJPEG server for viewers.
//!
//! Routes:
//! - `GET /health`: `{"status":"ok"}`
//! - `GET /snapshot.jpg`: latest JPEG, 503 before the first frame
//! - any other `GET`: `multipart/x-mixed-replace` stream of the latest frames
//!
//! One accept thread; one thread per streaming viewer.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::MjpegStream;

pub const MJPEG_BOUNDARY: &str = "MJPEGBOUNDARY";

const MAX_REQUEST_BYTES: usize = 8192;
/// How often idle viewer threads re-check for shutdown.
const VIEWER_POLL: Duration = Duration::from_millis(500);
/// A viewer that stops reading for this long is dropped.
const VIEWER_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// `:8080` binds every interface; anything else is used as given.
pub fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

pub struct MjpegServer;

#[derive(Debug)]
pub struct MjpegServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl MjpegServerHandle {
    /// Viewers currently receiving the multipart stream.
    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("mjpeg server thread panicked"))?;
        }
        Ok(())
    }
}

impl MjpegServer {
    /// Bind `addr` and serve `stream` from a background thread.
    pub fn spawn(addr: &str, stream: Arc<MjpegStream>) -> Result<MjpegServerHandle> {
        let configured = normalize_listen_addr(addr);
        let listener = TcpListener::bind(configured.as_str())
            .with_context(|| format!("bind {}", configured))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let viewers = Arc::new(AtomicUsize::new(0));
        let join = {
            let shutdown = shutdown.clone();
            let viewers = viewers.clone();
            std::thread::Builder::new()
                .name("mjpeg-accept".to_string())
                .spawn(move || {
                    if let Err(err) = run_server(listener, stream, shutdown, viewers) {
                        log::error!("mjpeg server stopped: {}", err);
                    }
                })
                .context("spawn mjpeg accept thread")?
        };
        log::info!("mjpeg server listening on {}", addr);

        Ok(MjpegServerHandle {
            addr,
            shutdown,
            viewers,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    stream: Arc<MjpegStream>,
    shutdown: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((conn, peer)) => {
                let stream = stream.clone();
                let shutdown = shutdown.clone();
                let viewers = viewers.clone();
                let spawned = std::thread::Builder::new()
                    .name("mjpeg-viewer".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(conn, &stream, &shutdown, &viewers) {
                            log::debug!("viewer {} disconnected: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("could not serve viewer {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut conn: TcpStream,
    stream: &MjpegStream,
    shutdown: &AtomicBool,
    viewers: &AtomicUsize,
) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    conn.set_nonblocking(false)?;
    let request = read_request(&mut conn)?;
    if request.method != "GET" {
        return write_response(
            &mut conn,
            405,
            "application/json",
            br#"{"error":"method_not_allowed"}"#,
        );
    }

    match request.path.as_str() {
        "/health" => write_response(&mut conn, 200, "application/json", br#"{"status":"ok"}"#),
        "/snapshot.jpg" => match stream.latest() {
            Some(frame) => write_response(&mut conn, 200, "image/jpeg", &frame.data),
            None => write_response(
                &mut conn,
                503,
                "application/json",
                br#"{"error":"no_frame_yet"}"#,
            ),
        },
        _ => {
            viewers.fetch_add(1, Ordering::SeqCst);
            let result = stream_frames(&mut conn, stream, shutdown);
            viewers.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}

fn stream_frames(conn: &mut TcpStream, stream: &MjpegStream, shutdown: &AtomicBool) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace;boundary={}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n",
        MJPEG_BOUNDARY
    );
    conn.set_write_timeout(Some(VIEWER_WRITE_TIMEOUT))?;
    conn.write_all(header.as_bytes())?;

    // Start from the current frame so a new viewer sees something immediately.
    let mut last_sent = stream.latest().map_or(0, |f| f.sequence.saturating_sub(1));
    while !shutdown.load(Ordering::SeqCst) {
        let Some(frame) = stream.wait_newer(last_sent, VIEWER_POLL) else {
            continue;
        };
        let part = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            MJPEG_BOUNDARY,
            frame.data.len()
        );
        conn.write_all(part.as_bytes())?;
        conn.write_all(&frame.data)?;
        conn.write_all(b"\r\n")?;
        conn.flush()?;
        last_sent = frame.sequence;
    }
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

fn read_request(conn: &mut TcpStream) -> Result<HttpRequest> {
    conn.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = conn.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_response(conn: &mut TcpStream, status: u16, content_type: &str, body: &[u8]) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    conn.write_all(header.as_bytes())?;
    conn.write_all(body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_binds_all_interfaces() {
        assert_eq!(normalize_listen_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_listen_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[test]
    fn rejects_unparseable_address() {
        assert!(MjpegServer::spawn("not-an-address", Arc::new(MjpegStream::new())).is_err());
    }

    #[test]
    fn binds_host_name() -> Result<()> {
        let handle = MjpegServer::spawn("localhost:0", Arc::new(MjpegStream::new()))?;
        assert!(handle.addr.ip().is_loopback());
        assert_ne!(handle.addr.port(), 0);
        handle.stop()
    }
}

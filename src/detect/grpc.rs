//! gRPC detection client for the DOODS `odrpc` service.
//!
//! The client owns its own tokio runtime and exposes the synchronous
//! `DetectionClient` trait: the capture loop and the receive thread never see
//! async code. Outbound requests travel through a bounded channel feeding the
//! request stream; the inbound stream is awaited lazily on the first
//! `receive`, so a server that withholds response headers until it has seen a
//! request cannot stall the dial.

use anyhow::{anyhow, Context, Result};
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};

use crate::detect::client::DetectionClient;
use crate::detect::result::{DetectionRequest, DetectionResult};
use crate::detect::wire::{DetectRequest, DetectResponse, DETECT_STREAM_PATH};

/// Metadata key DOODS checks for its auth key.
const AUTH_METADATA_KEY: &str = "session";

/// Outbound buffer. One request is in flight at a time; the slack absorbs a
/// request written just before the stream task starts polling.
const OUTBOUND_CAPACITY: usize = 2;

/// Connection settings for the detection service.
#[derive(Clone, Debug)]
pub struct GrpcSettings {
    /// `host:port` or a full `http://` URI.
    pub addr: String,
    pub connect_timeout: Duration,
    pub auth_key: Option<String>,
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            connect_timeout: Duration::from_secs(10),
            auth_key: None,
        }
    }
}

type StreamOpen =
    JoinHandle<std::result::Result<tonic::Response<Streaming<DetectResponse>>, tonic::Status>>;

enum Inbound {
    Opening(StreamOpen),
    Open(Streaming<DetectResponse>),
}

impl Inbound {
    async fn next_response(&mut self) -> Result<DetectResponse> {
        loop {
            match self {
                Inbound::Opening(open) => {
                    let response = open
                        .await
                        .context("detection stream task failed")?
                        .map_err(|status| anyhow!("could not open detection stream: {}", status))?;
                    *self = Inbound::Open(response.into_inner());
                }
                Inbound::Open(stream) => {
                    return match stream.message().await {
                        Ok(Some(response)) => Ok(response),
                        Ok(None) => Err(anyhow!("detection stream ended")),
                        Err(status) => Err(anyhow!("can not receive: {}", status)),
                    };
                }
            }
        }
    }
}

/// Bidirectional `DetectStream` client.
pub struct GrpcDetectionClient {
    endpoint: String,
    runtime: Runtime,
    outbound: mpsc::Sender<DetectRequest>,
    inbound: Mutex<Inbound>,
    /// Id of the request whose response is expected next.
    expected_id: Mutex<Option<String>>,
    // The request stream task borrows the connection through this handle.
    _channel: Channel,
}

impl GrpcDetectionClient {
    /// Dial the detector (blocking, bounded by `connect_timeout`) and open the stream.
    pub fn connect(settings: &GrpcSettings) -> Result<Self> {
        let uri = endpoint_uri(&settings.addr);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("detect-grpc")
            .enable_all()
            .build()
            .context("build grpc runtime")?;

        let endpoint = Endpoint::from_shared(uri.clone())
            .with_context(|| format!("invalid detector address {}", settings.addr))?
            .connect_timeout(settings.connect_timeout);
        let channel = runtime
            .block_on(endpoint.connect())
            .with_context(|| format!("could not connect to detector at {}", uri))?;
        log::info!("connected to detector at {}", uri);

        let (outbound, outbound_rx) = mpsc::channel::<DetectRequest>(OUTBOUND_CAPACITY);
        let mut request = tonic::Request::new(ReceiverStream::new(outbound_rx));
        if let Some(key) = settings.auth_key.as_deref() {
            let value: AsciiMetadataValue = key
                .parse()
                .map_err(|_| anyhow!("auth key is not valid metadata"))?;
            request.metadata_mut().insert(AUTH_METADATA_KEY, value);
        }

        let stream_channel = channel.clone();
        let open = runtime.spawn(async move {
            let mut grpc = tonic::client::Grpc::new(stream_channel);
            grpc.ready()
                .await
                .map_err(|e| tonic::Status::unknown(format!("service was not ready: {}", e)))?;
            let codec: ProstCodec<DetectRequest, DetectResponse> = ProstCodec::default();
            grpc.streaming(request, PathAndQuery::from_static(DETECT_STREAM_PATH), codec)
                .await
        });

        Ok(Self {
            endpoint: uri,
            runtime,
            outbound,
            inbound: Mutex::new(Inbound::Opening(open)),
            expected_id: Mutex::new(None),
            _channel: channel,
        })
    }
}

impl DetectionClient for GrpcDetectionClient {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn send(&self, request: DetectionRequest) -> Result<()> {
        let wire = DetectRequest::from(request);
        *self
            .expected_id
            .lock()
            .map_err(|_| anyhow!("request id lock poisoned"))? = Some(wire.id.clone());
        self.outbound
            .blocking_send(wire)
            .map_err(|_| anyhow!("could not stream send: detection stream closed"))
    }

    fn receive(&self) -> Result<DetectionResult> {
        let mut inbound = self
            .inbound
            .lock()
            .map_err(|_| anyhow!("detection stream lock poisoned"))?;
        let response = self.runtime.block_on(inbound.next_response())?;

        let expected = self
            .expected_id
            .lock()
            .map_err(|_| anyhow!("request id lock poisoned"))?
            .take();
        if let Some(expected) = expected {
            if !response.id.is_empty() && response.id != expected {
                log::warn!(
                    "detector answered request {} while {} was in flight",
                    response.id,
                    expected
                );
            }
        }
        if !response.error.is_empty() {
            log::warn!("detector reported error: {}", response.error);
            return Ok(DetectionResult::default());
        }

        let result = response.into_result();
        log::debug!("processed: {} detections", result.len());
        Ok(result)
    }
}

/// Accepts `host:port` (as on the command line) or a URI with a scheme.
pub fn endpoint_uri(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_gets_http_scheme() {
        assert_eq!(endpoint_uri("doods:8080"), "http://doods:8080");
        assert_eq!(endpoint_uri("https://doods:8443"), "https://doods:8443");
    }

    #[test]
    fn connect_fails_without_listener() {
        // Bind then drop to get a port with nothing listening.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap();
        let settings = GrpcSettings {
            addr: format!("127.0.0.1:{}", port),
            connect_timeout: Duration::from_millis(500),
            auth_key: None,
        };
        assert!(GrpcDetectionClient::connect(&settings).is_err());
    }
}

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::{http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{NamedService, StreamingService};
use tonic::Status;

use detect_relay::detect::default_thresholds;
use detect_relay::detect::wire::{DetectRequest, DetectResponse, WireDetection};
use detect_relay::{DetectionClient, DetectionRequest, GrpcDetectionClient, GrpcSettings};

/// What the fake detector does with the next request it reads.
enum Reply {
    Detections(Vec<WireDetection>),
    Error(String),
    StaleId(Vec<WireDetection>),
    Close,
}

#[derive(Default)]
struct DetectorState {
    script: Mutex<VecDeque<Reply>>,
    received: Mutex<Vec<DetectRequest>>,
    session: Mutex<Option<String>>,
}

#[derive(Clone)]
struct FakeDetector(Arc<DetectorState>);

impl NamedService for FakeDetector {
    const NAME: &'static str = "odrpc.odrpc";
}

impl<B> Service<http::Request<B>> for FakeDetector
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let handler = DetectStream(self.0.clone());
        Box::pin(async move {
            let codec: ProstCodec<DetectResponse, DetectRequest> = ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.streaming(handler, req).await)
        })
    }
}

struct DetectStream(Arc<DetectorState>);

impl StreamingService<DetectRequest> for DetectStream {
    type Response = DetectResponse;
    type ResponseStream = ReceiverStream<Result<DetectResponse, Status>>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<DetectRequest>>) -> Self::Future {
        let state = self.0.clone();
        Box::pin(async move {
            *state.session.lock().unwrap() = request
                .metadata()
                .get("session")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let mut inbound = request.into_inner();
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            tokio::spawn(async move {
                while let Ok(Some(req)) = inbound.message().await {
                    state.received.lock().unwrap().push(req.clone());
                    let reply = state.script.lock().unwrap().pop_front();
                    let response = match reply {
                        Some(Reply::Detections(detections)) => DetectResponse {
                            id: req.id,
                            detections,
                            error: String::new(),
                        },
                        Some(Reply::Error(error)) => DetectResponse {
                            id: req.id,
                            detections: Vec::new(),
                            error,
                        },
                        Some(Reply::StaleId(detections)) => DetectResponse {
                            id: "stale".to_string(),
                            detections,
                            error: String::new(),
                        },
                        Some(Reply::Close) | None => return,
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(tonic::Response::new(ReceiverStream::new(rx)))
        })
    }
}

/// Fake detector served on a loopback port from its own runtime.
struct Loopback {
    addr: String,
    state: Arc<DetectorState>,
    _runtime: Runtime,
}

fn serve(script: Vec<Reply>) -> Loopback {
    let runtime = Runtime::new().expect("server runtime");
    let state = Arc::new(DetectorState {
        script: Mutex::new(script.into()),
        ..DetectorState::default()
    });
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr").to_string();
    let service = FakeDetector(state.clone());
    runtime.spawn(
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    Loopback {
        addr,
        state,
        _runtime: runtime,
    }
}

fn connect(server: &Loopback, auth_key: Option<&str>) -> GrpcDetectionClient {
    GrpcDetectionClient::connect(&GrpcSettings {
        addr: server.addr.clone(),
        connect_timeout: Duration::from_secs(5),
        auth_key: auth_key.map(str::to_string),
    })
    .expect("connect to fake detector")
}

fn request(id: u64, data: &[u8]) -> DetectionRequest {
    DetectionRequest {
        id,
        detector_name: "default".to_string(),
        thresholds: default_thresholds(),
        data: data.to_vec(),
    }
}

fn person() -> WireDetection {
    WireDetection {
        top: 0.1,
        left: 0.2,
        bottom: 0.6,
        right: 0.7,
        label: "person".to_string(),
        confidence: 91.5,
    }
}

#[test]
fn request_fields_and_detections_cross_the_wire() {
    let dog = WireDetection {
        label: "dog".to_string(),
        confidence: 64.0,
        ..person()
    };
    let server = serve(vec![Reply::Detections(vec![person(), dog])]);
    let client = connect(&server, Some("secret-key"));

    client.send(request(1, b"BMpayload")).expect("send");
    let result = client.receive().expect("receive");

    let labels: Vec<_> = result.iter().map(|d| d.label.as_str()).collect();
    assert_eq!(labels, vec!["person", "dog"]);
    let first = result.iter().next().expect("first detection");
    assert_eq!(
        (first.left, first.top, first.right, first.bottom),
        (0.2, 0.1, 0.7, 0.6)
    );
    assert_eq!(first.confidence, 91.5);

    let received = server.state.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, "1");
    assert_eq!(received[0].detector_name, "default");
    assert_eq!(received[0].data, b"BMpayload".to_vec());
    assert_eq!(received[0].detect.get("*"), Some(&60.0));
    assert_eq!(
        server.state.session.lock().unwrap().as_deref(),
        Some("secret-key")
    );
}

#[test]
fn error_reply_yields_an_empty_result() {
    let server = serve(vec![
        Reply::Error("model not loaded".to_string()),
        Reply::Detections(vec![person()]),
    ]);
    let client = connect(&server, None);

    client.send(request(1, b"a")).expect("send");
    assert!(client.receive().expect("receive").is_empty());

    // The stream stays usable after a reported error.
    client.send(request(2, b"b")).expect("send");
    assert_eq!(client.receive().expect("receive").len(), 1);
    assert!(server.state.session.lock().unwrap().is_none());
}

#[test]
fn mismatched_id_still_delivers_the_result() {
    let server = serve(vec![Reply::StaleId(vec![person()])]);
    let client = connect(&server, None);

    client.send(request(7, b"a")).expect("send");
    assert_eq!(client.receive().expect("receive").len(), 1);
}

#[test]
fn stream_end_is_fatal() {
    let server = serve(vec![Reply::Detections(Vec::new()), Reply::Close]);
    let client = connect(&server, None);

    client.send(request(1, b"a")).expect("send");
    assert!(client.receive().expect("receive").is_empty());

    client.send(request(2, b"b")).expect("send");
    let err = client.receive().expect_err("stream ended");
    assert!(err.to_string().contains("ended"), "unexpected error: {}", err);
}

//! In-process HTTP server answering with canned responses, for exercising
//! the fetcher and the Influx store. Every request is recorded.

use futures_util::stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    /// Header names are lowercased.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    async fn read(request: Request<Incoming>) -> Result<Self, hyper::Error> {
        let (parts, body) = request.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        let body = body.collect().await?.to_bytes();

        Ok(Self {
            method: parts.method.to_string(),
            target,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
enum CannedBody {
    Complete(String),
    /// Sends the prefix, then aborts the connection mid-body.
    Broken(String),
}

#[derive(Debug, Clone)]
pub struct CannedResponse {
    status: u16,
    content_type: &'static str,
    body: CannedBody,
}

impl CannedResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: CannedBody::Complete(body.to_string()),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/csv",
            body: CannedBody::Complete(body.to_string()),
        }
    }

    pub fn status(status: u16) -> Self {
        Self::json(status, "")
    }

    /// A 200 whose body stream fails after `prefix`.
    pub fn broken_body(prefix: &str) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: CannedBody::Broken(prefix.to_string()),
        }
    }

    fn into_response(self) -> Response<BoxBody<Bytes, std::io::Error>> {
        let body = match self.body {
            CannedBody::Complete(body) => Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
            CannedBody::Broken(prefix) => StreamBody::new(stream::iter(vec![
                Ok(Frame::data(Bytes::from(prefix))),
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "canned body failure",
                )),
            ]))
            .boxed(),
        };

        let mut response = Response::new(body);
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        response
    }
}

type Handler = dyn Fn(&RecordedRequest) -> CannedResponse + Send + Sync;

pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Answers requests with `responses` in order, repeating the last one.
    pub async fn spawn(responses: Vec<CannedResponse>) -> std::io::Result<Self> {
        let served = AtomicUsize::new(0);
        Self::spawn_with(move |_| {
            let index = served.fetch_add(1, Ordering::SeqCst);
            responses
                .get(index)
                .or(responses.last())
                .cloned()
                .unwrap_or_else(|| CannedResponse::status(500))
        })
        .await
    }

    pub async fn spawn_with<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(&RecordedRequest) -> CannedResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let io = TokioIo::new(stream);
                let handler = handler.clone();
                let recorded = recorded.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        let handler = handler.clone();
                        let recorded = recorded.clone();
                        async move {
                            let request = RecordedRequest::read(request).await?;
                            let response = handler(&request);
                            if let Ok(mut log) = recorded.lock() {
                                log.push(request);
                            }
                            Ok::<_, hyper::Error>(response.into_response())
                        }
                    });
                    // Broken canned bodies end the connection with an error.
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        Ok(Self {
            addr,
            requests,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

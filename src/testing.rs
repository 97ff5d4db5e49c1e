//! In-process HTTP server that serves one payload and honours `Range` requests.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Response, StatusCode};
use axum::Router;
use futures::StreamExt;

/// How a payload body is cut short.
#[derive(Clone, Copy, Debug)]
pub enum Cut {
    /// Send this many bytes, then close the connection.
    Drop(usize),
    /// Send this many bytes, then nothing more.
    Stall(usize),
}

#[derive(Clone)]
pub struct Fixture {
    pub body: Arc<Vec<u8>>,
    pub accept_ranges: bool,
    pub disposition: Option<&'static str>,
    /// Status returned by HEAD instead of 200.
    pub head_status: Option<StatusCode>,
    /// Status returned by every GET instead of the payload.
    pub get_status: Option<StatusCode>,
    /// Number of GETs answered with 503 before the server behaves.
    pub transient_failures: Arc<AtomicU32>,
    /// Applied to the next `cuts` payload bodies.
    pub cut: Option<Cut>,
    pub cuts: Arc<AtomicU32>,
    /// Body bytes sent in answer to GETs.
    pub served: Arc<AtomicU64>,
    pub gets: Arc<AtomicU32>,
    /// `Range` header of every GET, empty when absent.
    pub ranges: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            accept_ranges: true,
            disposition: None,
            head_status: None,
            get_status: None,
            transient_failures: Arc::new(AtomicU32::new(0)),
            cut: None,
            cuts: Arc::new(AtomicU32::new(0)),
            served: Arc::new(AtomicU64::new(0)),
            gets: Arc::new(AtomicU32::new(0)),
            ranges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Cuts the next `times` payload bodies short.
    pub fn cut_bodies(&mut self, cut: Cut, times: u32) {
        self.cut = Some(cut);
        self.cuts.store(times, Ordering::SeqCst);
    }

    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Starts serving on an ephemeral port and returns the payload URL.
    pub async fn spawn(&self) -> url::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(handle).with_state(self.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        url::Url::parse(&format!("http://{}/files/payload.bin", addr)).unwrap()
    }
}

/// Client that ignores proxy settings from the environment.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn handle(State(fx): State<Fixture>, method: Method, headers: HeaderMap) -> Response<Body> {
    let len = fx.body.len() as u64;
    let mut builder = Response::builder();
    if fx.accept_ranges {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }
    if let Some(disposition) = fx.disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    if method == Method::HEAD {
        let status = fx.head_status.unwrap_or(StatusCode::OK);
        return builder
            .status(status)
            .header(header::CONTENT_LENGTH, len)
            .body(Body::empty())
            .unwrap();
    }

    fx.gets.fetch_add(1, Ordering::SeqCst);
    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    fx.ranges.lock().unwrap().push(requested.to_string());

    if let Some(status) = fx.get_status {
        return builder.status(status).body(Body::empty()).unwrap();
    }
    let failing = fx
        .transient_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return builder
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::empty())
            .unwrap();
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .filter(|_| fx.accept_ranges)
        .and_then(|v| parse_range(v, len));

    let (status, start, end) = match range {
        Some((start, end)) => {
            builder = builder.header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len));
            (StatusCode::PARTIAL_CONTENT, start, end + 1)
        }
        None => (StatusCode::OK, 0, len),
    };
    let slice = fx.body[start as usize..end as usize].to_vec();
    let declared = slice.len();
    let cutting = fx
        .cuts
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let body = match fx.cut.filter(|_| cutting) {
        Some(cut) => cut_body(slice, cut, &fx.served),
        None => {
            fx.served.fetch_add(slice.len() as u64, Ordering::SeqCst);
            Body::from(slice)
        }
    };
    builder
        .status(status)
        .header(header::CONTENT_LENGTH, declared)
        .body(body)
        .unwrap()
}

/// A body that declares the full slice but delivers only a prefix of it.
fn cut_body(mut slice: Vec<u8>, cut: Cut, served: &AtomicU64) -> Body {
    let (Cut::Drop(keep) | Cut::Stall(keep)) = cut;
    slice.truncate(keep);
    served.fetch_add(slice.len() as u64, Ordering::SeqCst);

    let head = futures::stream::once(async move { Ok::<_, io::Error>(bytes::Bytes::from(slice)) });
    match cut {
        // The pause lets the prefix reach the socket before the connection is aborted.
        Cut::Drop(_) => Body::from_stream(head.chain(futures::stream::once(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "body cut"))
        }))),
        Cut::Stall(_) => Body::from_stream(head.chain(futures::stream::pending())),
    }
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => len.checked_sub(1)?,
        end => end.parse::<u64>().ok()?.min(len.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

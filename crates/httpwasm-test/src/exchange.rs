//! ExchangeHost: an in-memory HTTP exchange implementing [`Host`].
//!
//! Request and response are fully buffered. The upstream is a plain
//! function from request to response, invoked by [`Host::next`].

use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};
use parking_lot::Mutex;

use httpwasm_host::{BodyKind, BodyReader, BodyWriter, Features, HeaderKind, Host, HostError};

/// The handler wrapped by the middleware.
pub type Upstream =
    Arc<dyn Fn(Request<Bytes>) -> Result<Response<Bytes>, HostError> + Send + Sync>;

/// What the upstream was called with.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct RequestParts {
    method: Method,
    /// Path and query, kept verbatim so that empty and `//` forms survive.
    uri: String,
    version: Version,
    headers: HeaderMap,
    trailers: HeaderMap,
}

struct ResponseParts {
    status: StatusCode,
    headers: HeaderMap,
    trailers: HeaderMap,
}

/// A buffered request/response pair.
pub struct ExchangeHost {
    request: Mutex<RequestParts>,
    response: Mutex<ResponseParts>,
    request_body: Arc<Mutex<Vec<u8>>>,
    response_body: Arc<Mutex<Vec<u8>>>,
    remote_addr: String,
    refuse: Features,
    upstream: Option<Upstream>,
    upstream_calls: AtomicUsize,
    seen: Mutex<Option<SeenRequest>>,
    open_handles: Arc<AtomicUsize>,
}

impl ExchangeHost {
    /// Wrap `request`. The response starts as an empty 200.
    pub fn new(request: Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        let uri = parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

        Self {
            request: Mutex::new(RequestParts {
                method: parts.method,
                uri,
                version: parts.version,
                headers: parts.headers,
                trailers: HeaderMap::new(),
            }),
            response: Mutex::new(ResponseParts {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                trailers: HeaderMap::new(),
            }),
            request_body: Arc::new(Mutex::new(body.to_vec())),
            response_body: Arc::default(),
            remote_addr: "127.0.0.1:50000".into(),
            refuse: Features::empty(),
            upstream: None,
            upstream_calls: AtomicUsize::new(0),
            seen: Mutex::new(None),
            open_handles: Arc::default(),
        }
    }

    /// A `GET` for `uri` with no body.
    pub fn get(uri: &str) -> Self {
        Self::new(
            Request::get(uri)
                .body(Bytes::new())
                .expect("valid request"),
        )
    }

    /// A `POST` for `uri` carrying `body`.
    pub fn post(uri: &str, body: impl Into<Bytes>) -> Self {
        Self::new(
            Request::post(uri)
                .body(body.into())
                .expect("valid request"),
        )
    }

    pub fn with_upstream(mut self, upstream: Upstream) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_header(self, name: &str, value: &str) -> Self {
        let (name, value) = header(name, value).expect("valid header");
        self.request.lock().headers.append(name, value);
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    /// Never grant `features`, whatever the guest asks for.
    pub fn refusing(mut self, features: Features) -> Self {
        self.refuse = features;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn method(&self) -> Method {
        self.request.lock().method.clone()
    }

    pub fn request_uri(&self) -> String {
        self.request.lock().uri.clone()
    }

    pub fn request_header(&self, name: &str) -> Vec<String> {
        values(&self.request.lock().headers, name)
    }

    pub fn request_body(&self) -> Bytes {
        Bytes::from(self.request_body.lock().clone())
    }

    pub fn status(&self) -> StatusCode {
        self.response.lock().status
    }

    pub fn response_header(&self, name: &str) -> Vec<String> {
        values(&self.response.lock().headers, name)
    }

    pub fn response_body(&self) -> Bytes {
        Bytes::from(self.response_body.lock().clone())
    }

    pub fn upstream_calls(&self) -> usize {
        self.upstream_calls.load(Ordering::SeqCst)
    }

    /// The request as the upstream last received it.
    pub fn seen_by_upstream(&self) -> Option<SeenRequest> {
        self.seen.lock().clone()
    }

    /// Body readers and writers currently held by the guest side.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    fn upstream_request(&self) -> Result<Request<Bytes>, HostError> {
        let parts = self.request.lock();
        let mut request = Request::builder()
            .method(parts.method.clone())
            .uri(parts.uri.as_str())
            .version(parts.version)
            .body(Bytes::from(self.request_body.lock().clone()))
            .map_err(|_| HostError::InvalidValue {
                what: "uri",
                value: parts.uri.clone(),
            })?;
        *request.headers_mut() = parts.headers.clone();
        Ok(request)
    }

    fn with_map<T>(&self, kind: HeaderKind, f: impl FnOnce(&mut HeaderMap) -> T) -> T {
        match kind {
            HeaderKind::RequestHeaders => f(&mut self.request.lock().headers),
            HeaderKind::RequestTrailers => f(&mut self.request.lock().trailers),
            HeaderKind::ResponseHeaders => f(&mut self.response.lock().headers),
            HeaderKind::ResponseTrailers => f(&mut self.response.lock().trailers),
        }
    }

    fn body(&self, kind: BodyKind) -> &Arc<Mutex<Vec<u8>>> {
        match kind {
            BodyKind::Request => &self.request_body,
            BodyKind::Response => &self.response_body,
        }
    }
}

impl Host for ExchangeHost {
    fn enable_features(&self, features: Features) -> Features {
        Features::from_bits(features.bits() & !self.refuse.bits())
    }

    fn method(&self) -> String {
        self.request.lock().method.as_str().to_string()
    }

    fn set_method(&self, method: &str) -> Result<(), HostError> {
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| HostError::InvalidValue {
            what: "method",
            value: method.to_string(),
        })?;
        self.request.lock().method = method;
        Ok(())
    }

    fn uri(&self) -> String {
        self.request_uri()
    }

    fn set_uri(&self, uri: &str) -> Result<(), HostError> {
        self.request.lock().uri = uri.to_string();
        Ok(())
    }

    fn protocol_version(&self) -> String {
        format!("{:?}", self.request.lock().version)
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn header_names(&self, kind: HeaderKind) -> Vec<String> {
        self.with_map(kind, |map| {
            map.keys().map(|name| name.as_str().to_string()).collect()
        })
    }

    fn header_values(&self, kind: HeaderKind, name: &str) -> Vec<String> {
        self.with_map(kind, |map| values(map, name))
    }

    fn set_header_value(&self, kind: HeaderKind, name: &str, value: &str) -> Result<(), HostError> {
        let (name, value) = header(name, value)?;
        self.with_map(kind, |map| map.insert(name, value));
        Ok(())
    }

    fn add_header_value(&self, kind: HeaderKind, name: &str, value: &str) -> Result<(), HostError> {
        let (name, value) = header(name, value)?;
        self.with_map(kind, |map| map.append(name, value));
        Ok(())
    }

    fn remove_header(&self, kind: HeaderKind, name: &str) -> Result<(), HostError> {
        self.with_map(kind, |map| map.remove(name));
        Ok(())
    }

    fn body_reader(&self, kind: BodyKind) -> Result<BodyReader, HostError> {
        let snapshot = Bytes::from(self.body(kind).lock().clone());
        Ok(Box::new(Tracked::new(
            Cursor::new(snapshot),
            self.open_handles.clone(),
        )))
    }

    fn body_writer(&self, kind: BodyKind) -> Result<BodyWriter, HostError> {
        let body = self.body(kind).clone();
        body.lock().clear();
        Ok(Box::new(Tracked::new(
            SharedBody(body),
            self.open_handles.clone(),
        )))
    }

    fn status_code(&self) -> u32 {
        u32::from(self.response.lock().status.as_u16())
    }

    fn set_status_code(&self, code: u32) -> Result<(), HostError> {
        let status = u16::try_from(code)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| HostError::InvalidValue {
                what: "status code",
                value: code.to_string(),
            })?;
        self.response.lock().status = status;
        Ok(())
    }

    fn next(&self) -> Result<(), HostError> {
        self.upstream_calls.fetch_add(1, Ordering::SeqCst);
        let upstream = self
            .upstream
            .clone()
            .ok_or(HostError::Unsupported("next"))?;

        let request = self.upstream_request()?;
        *self.seen.lock() = Some(SeenRequest {
            method: request.method().clone(),
            uri: request.uri().to_string(),
            headers: request.headers().clone(),
            body: request.body().clone(),
        });

        let (parts, body) = upstream(request)?.into_parts();
        let mut response = self.response.lock();
        response.status = parts.status;
        for (name, value) in &parts.headers {
            response.headers.append(name.clone(), value.clone());
        }
        self.response_body.lock().extend_from_slice(&body);
        Ok(())
    }
}

fn values(map: &HeaderMap, name: &str) -> Vec<String> {
    map.get_all(name)
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .collect()
}

fn header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), HostError> {
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| HostError::InvalidValue {
        what: "header name",
        value: name.to_string(),
    })?;
    let value = HeaderValue::from_str(value).map_err(|_| HostError::InvalidValue {
        what: "header value",
        value: value.to_string(),
    })?;
    Ok((name, value))
}

/// Appends to a shared body buffer.
struct SharedBody(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBody {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Counts live body handles.
struct Tracked<T> {
    inner: T,
    open: Arc<AtomicUsize>,
}

impl<T> Tracked<T> {
    fn new(inner: T, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { inner, open }
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Read> Read for Tracked<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<T: Write> Write for Tracked<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Upstream answering every request with `status` and `body`.
pub fn respond(status: u16, body: &'static str) -> Upstream {
    Arc::new(move |_| {
        Response::builder()
            .status(status)
            .body(Bytes::from_static(body.as_bytes()))
            .map_err(|e| HostError::Upstream(e.to_string()))
    })
}

/// Upstream echoing the request path and query as the body.
pub fn echo_path() -> Upstream {
    Arc::new(|request| {
        let path = request
            .uri()
            .path_and_query()
            .map_or_else(String::new, |pq| pq.as_str().to_string());
        Ok(Response::new(Bytes::from(path)))
    })
}

/// Upstream echoing the request body.
pub fn echo_body() -> Upstream {
    Arc::new(|request| Ok(Response::new(request.into_body())))
}

/// Upstream that always fails.
pub fn failing() -> Upstream {
    Arc::new(|_| Err(HostError::Upstream("connection refused".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let host = ExchangeHost::get("/").with_header("x-trace", "a");
        assert_eq!(
            host.header_values(HeaderKind::RequestHeaders, "X-Trace"),
            vec!["a".to_string()]
        );
    }

    #[test]
    fn writer_truncates_on_open() {
        let host = ExchangeHost::post("/", "old body");
        let mut writer = host.body_writer(BodyKind::Request).unwrap();
        assert_eq!(host.request_body(), Bytes::new());
        writer.write_all(b"new").unwrap();
        assert_eq!(host.request_body(), Bytes::from_static(b"new"));
    }

    #[test]
    fn handles_are_counted() {
        let host = ExchangeHost::post("/", "body");
        let reader = host.body_reader(BodyKind::Request).unwrap();
        let writer = host.body_writer(BodyKind::Response).unwrap();
        assert_eq!(host.open_handles(), 2);
        drop(reader);
        drop(writer);
        assert_eq!(host.open_handles(), 0);
    }

    #[test]
    fn next_without_upstream_is_unsupported() {
        let host = ExchangeHost::get("/");
        assert!(matches!(host.next(), Err(HostError::Unsupported("next"))));
    }

    #[test]
    fn next_applies_upstream_response() {
        let host = ExchangeHost::get("/hello?x=1").with_upstream(echo_path());
        host.next().unwrap();
        assert_eq!(host.response_body(), Bytes::from_static(b"/hello?x=1"));
        assert_eq!(host.seen_by_upstream().unwrap().uri, "/hello?x=1");
    }

    #[test]
    fn refused_features_are_masked() {
        let host = ExchangeHost::get("/").refusing(Features::TRAILERS);
        assert_eq!(
            host.enable_features(Features::BUFFER_REQUEST | Features::TRAILERS),
            Features::BUFFER_REQUEST
        );
    }
}

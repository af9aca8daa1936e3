//! In-crate test doubles.

use std::io::{self, Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::abi::{BodyKind, Features, HeaderKind};
use crate::error::HostError;
use crate::host::{BodyReader, BodyWriter, Host};

/// A minimal buffered exchange.
pub(crate) struct StubHost {
    exchange: Mutex<Exchange>,
    request_body: Arc<Mutex<Vec<u8>>>,
    response_body: Arc<Mutex<Vec<u8>>>,
    readers_opened: AtomicUsize,
    upstream_called: AtomicBool,
    refuse: Features,
}

struct Exchange {
    method: String,
    uri: String,
    status: u32,
    headers: [Vec<(String, String)>; 4],
}

impl Default for StubHost {
    fn default() -> Self {
        Self::refusing(Features::empty())
    }
}

impl StubHost {
    /// A host that never enables `refuse`.
    pub(crate) fn refusing(refuse: Features) -> Self {
        Self {
            exchange: Mutex::new(Exchange {
                method: "GET".into(),
                uri: "/".into(),
                status: 200,
                headers: Default::default(),
            }),
            request_body: Arc::default(),
            response_body: Arc::default(),
            readers_opened: AtomicUsize::new(0),
            upstream_called: AtomicBool::new(false),
            refuse,
        }
    }

    pub(crate) fn set_request_body(&self, body: &[u8]) {
        *self.request_body.lock() = body.to_vec();
    }

    pub(crate) fn request_body(&self) -> Vec<u8> {
        self.request_body.lock().clone()
    }

    pub(crate) fn response_body(&self) -> Vec<u8> {
        self.response_body.lock().clone()
    }

    pub(crate) fn readers_opened(&self) -> usize {
        self.readers_opened.load(Ordering::SeqCst)
    }

    pub(crate) fn upstream_called(&self) -> bool {
        self.upstream_called.load(Ordering::SeqCst)
    }

    fn body(&self, kind: BodyKind) -> &Arc<Mutex<Vec<u8>>> {
        match kind {
            BodyKind::Request => &self.request_body,
            BodyKind::Response => &self.response_body,
        }
    }
}

impl Host for StubHost {
    fn enable_features(&self, features: Features) -> Features {
        Features::from_bits(features.bits() & !self.refuse.bits())
    }

    fn method(&self) -> String {
        self.exchange.lock().method.clone()
    }

    fn set_method(&self, method: &str) -> Result<(), HostError> {
        self.exchange.lock().method = method.to_string();
        Ok(())
    }

    fn uri(&self) -> String {
        self.exchange.lock().uri.clone()
    }

    fn set_uri(&self, uri: &str) -> Result<(), HostError> {
        self.exchange.lock().uri = uri.to_string();
        Ok(())
    }

    fn protocol_version(&self) -> String {
        "HTTP/1.1".into()
    }

    fn remote_addr(&self) -> String {
        "1.2.3.4:12345".into()
    }

    fn header_names(&self, kind: HeaderKind) -> Vec<String> {
        let exchange = self.exchange.lock();
        let mut names: Vec<String> = Vec::new();
        for (name, _) in &exchange.headers[kind as usize] {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.clone());
            }
        }
        names
    }

    fn header_values(&self, kind: HeaderKind, name: &str) -> Vec<String> {
        self.exchange.lock().headers[kind as usize]
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn set_header_value(&self, kind: HeaderKind, name: &str, value: &str) -> Result<(), HostError> {
        self.remove_header(kind, name)?;
        self.add_header_value(kind, name, value)
    }

    fn add_header_value(&self, kind: HeaderKind, name: &str, value: &str) -> Result<(), HostError> {
        self.exchange.lock().headers[kind as usize].push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn remove_header(&self, kind: HeaderKind, name: &str) -> Result<(), HostError> {
        self.exchange.lock().headers[kind as usize].retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        Ok(())
    }

    fn body_reader(&self, kind: BodyKind) -> Result<BodyReader, HostError> {
        self.readers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(self.body(kind).lock().clone())))
    }

    fn body_writer(&self, kind: BodyKind) -> Result<BodyWriter, HostError> {
        let target = self.body(kind).clone();
        target.lock().clear();
        Ok(Box::new(CommitOnFlush {
            pending: Vec::new(),
            target,
        }))
    }

    fn status_code(&self) -> u32 {
        self.exchange.lock().status
    }

    fn set_status_code(&self, code: u32) -> Result<(), HostError> {
        self.exchange.lock().status = code;
        Ok(())
    }

    fn next(&self) -> Result<(), HostError> {
        self.upstream_called.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Buffers writes until flushed.
struct CommitOnFlush {
    pending: Vec<u8>,
    target: Arc<Mutex<Vec<u8>>>,
}

impl Write for CommitOnFlush {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.target.lock().append(&mut self.pending);
        Ok(())
    }
}

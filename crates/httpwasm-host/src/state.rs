//! Per-request state and mutation windows.
//!
//! A `RequestState` is placed in the guest's store for the duration of one
//! request; host functions find it there. Its absence means the guest is
//! running outside a request (start functions), which is how
//! `enable_features` tells middleware-wide calls from per-request ones.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wasmtime::Engine;

use crate::abi::{BodyKind, Features};
use crate::dispatch::one_shot::Rendezvous;
use crate::error::{GuestFault, HostError, Target};
use crate::host::{BodyReader, BodyWriter, Host};

/// State owned by a single in-flight request.
pub(crate) struct RequestState {
    host: Arc<dyn Host>,
    features: Features,
    after_next: bool,
    instance_id: u64,
    request_body_reader: Option<BodySource>,
    request_body_writer: Option<BodyWriter>,
    response_body_reader: Option<BodySource>,
    response_body_writer: Option<BodyWriter>,
    rendezvous: Option<Rendezvous>,
    abort: Option<AbortSignal>,
}

impl RequestState {
    /// Create state for a request served by guest instance `instance_id`.
    pub(crate) fn new(host: Arc<dyn Host>, features: Features, instance_id: u64) -> Self {
        Self {
            host,
            features,
            after_next: false,
            instance_id,
            request_body_reader: None,
            request_body_writer: None,
            response_body_reader: None,
            response_body_writer: None,
            rendezvous: None,
            abort: None,
        }
    }

    /// Tie the request to the task driving it, so that cancelling the task
    /// stops the guest.
    pub(crate) fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }

    pub(crate) fn with_rendezvous(mut self, rendezvous: Rendezvous) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    pub(crate) fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub(crate) fn features(&self) -> Features {
        self.features
    }

    pub(crate) fn set_features(&mut self, features: Features) {
        self.features = features;
    }

    pub(crate) fn after_next(&self) -> bool {
        self.after_next
    }

    /// Mark the start of the response phase.
    pub(crate) fn begin_response(&mut self) {
        self.after_next = true;
    }

    /// True once the request's caller has gone away.
    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(AbortSignal::is_aborted)
    }

    pub(crate) fn take_rendezvous(&mut self) -> Option<Rendezvous> {
        self.rendezvous.take()
    }

    /// Fail if the response phase has begun.
    pub(crate) fn must_be_before_next(
        &self,
        op: &'static str,
        target: Target,
    ) -> Result<(), GuestFault> {
        if self.after_next {
            return Err(GuestFault::AfterNext { op, target });
        }
        Ok(())
    }

    /// Fail if the response phase has begun, unless `feature` is enabled.
    pub(crate) fn must_be_before_next_or_feature(
        &self,
        feature: Features,
        op: &'static str,
        target: Target,
    ) -> Result<(), GuestFault> {
        if self.features.contains(feature) {
            return Ok(());
        }
        self.must_be_before_next(op, target)
    }

    /// The body reader for `kind`, opened on first use.
    pub(crate) fn reader(&mut self, kind: BodyKind) -> Result<&mut BodySource, HostError> {
        let slot = match kind {
            BodyKind::Request => &mut self.request_body_reader,
            BodyKind::Response => &mut self.response_body_reader,
        };
        if slot.is_none() {
            *slot = Some(BodySource::new(self.host.body_reader(kind)?));
        }
        Ok(slot.as_mut().expect("reader was just opened"))
    }

    /// The body writer for `kind`, opened (and so truncated) on first use.
    pub(crate) fn writer(&mut self, kind: BodyKind) -> Result<&mut BodyWriter, HostError> {
        let slot = match kind {
            BodyKind::Request => &mut self.request_body_writer,
            BodyKind::Response => &mut self.response_body_writer,
        };
        if slot.is_none() {
            *slot = Some(self.host.body_writer(kind)?);
        }
        Ok(slot.as_mut().expect("writer was just opened"))
    }

    /// Release readers and flush writers.
    ///
    /// Every handle is released even if an earlier flush fails; the first
    /// error is returned.
    pub(crate) fn close(&mut self) -> Result<(), HostError> {
        self.request_body_reader = None;
        self.response_body_reader = None;
        self.rendezvous = None;

        let mut result = Ok(());
        for mut writer in [
            self.request_body_writer.take(),
            self.response_body_writer.take(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = writer.flush() {
                if result.is_ok() {
                    result = Err(HostError::Io(e));
                }
            }
        }
        result
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(instance = self.instance_id, error = %e, "failed to close request body on drop");
        }
    }
}

/// Cancellation flag for one request.
///
/// Host functions check the flag on entry. Raising it also bumps the engine
/// epoch, which makes every running store consult its deadline callback, so
/// a guest stuck in pure computation stops at its next loop back-edge.
#[derive(Clone)]
pub(crate) struct AbortSignal {
    aborted: Arc<AtomicBool>,
    engine: Engine,
}

impl AbortSignal {
    pub(crate) fn new(engine: &Engine) -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            engine: engine.clone(),
        }
    }

    pub(crate) fn abort(&self) {
        // The flag must be visible before any store observes the new epoch.
        self.aborted.store(true, Ordering::Release);
        self.engine.increment_epoch();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Raises an [`AbortSignal`] when dropped, unless disarmed first.
pub(crate) struct AbortOnDrop(Option<AbortSignal>);

impl AbortOnDrop {
    pub(crate) fn new(signal: AbortSignal) -> Self {
        Self(Some(signal))
    }

    /// The guarded work finished; dropping no longer aborts.
    pub(crate) fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(signal) = self.0.take() {
            signal.abort();
        }
    }
}

/// A body reader that remembers end-of-stream.
pub(crate) struct BodySource {
    reader: BodyReader,
    eof: bool,
}

impl BodySource {
    fn new(reader: BodyReader) -> Self {
        Self { reader, eof: false }
    }

    /// Fill `buf` from the stream.
    ///
    /// Keeps reading until the buffer is full or the stream ends, since some
    /// readers only report the end on the call after the last bytes. Returns
    /// the bytes read and whether the stream is exhausted.
    pub(crate) fn fill(&mut self, buf: &mut [u8]) -> io::Result<(usize, bool)> {
        let mut filled = 0;
        while !self.eof && filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => self.eof = true,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok((filled, self.eof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::HeaderKind;
    use crate::testing::StubHost;
    use proptest::prelude::*;

    fn state(features: Features) -> (Arc<StubHost>, RequestState) {
        let host = Arc::new(StubHost::default());
        let state = RequestState::new(host.clone(), features, 1);
        (host, state)
    }

    #[test]
    fn before_next_passes_until_response_phase() {
        let (_, mut state) = state(Features::empty());
        assert!(state.must_be_before_next("set", Target::Method).is_ok());

        state.begin_response();
        assert_eq!(
            state.must_be_before_next("set", Target::Method),
            Err(GuestFault::AfterNext {
                op: "set",
                target: Target::Method
            })
        );
    }

    #[test]
    fn feature_reopens_response_window() {
        let (_, mut state) = state(Features::BUFFER_RESPONSE);
        state.begin_response();
        let target = Target::Header(HeaderKind::ResponseHeaders);
        assert!(state
            .must_be_before_next_or_feature(Features::BUFFER_RESPONSE, "set", target)
            .is_ok());
        assert!(state
            .must_be_before_next_or_feature(Features::BUFFER_REQUEST, "set", target)
            .is_err());
    }

    #[test]
    fn reader_is_opened_once() {
        let (host, mut state) = state(Features::empty());
        host.set_request_body(b"abc");
        state.reader(BodyKind::Request).unwrap();
        state.reader(BodyKind::Request).unwrap();
        assert_eq!(host.readers_opened(), 1);
    }

    #[test]
    fn close_flushes_writers() {
        let (host, mut state) = state(Features::empty());
        state
            .writer(BodyKind::Response)
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        assert_eq!(host.response_body(), b"");

        state.close().unwrap();
        assert_eq!(host.response_body(), b"hello");
    }

    #[test]
    fn disarmed_or_unrelated_guards_do_not_abort() {
        let engine = Engine::default();
        let signal = AbortSignal::new(&engine);
        let (_, state) = state(Features::empty());
        let state = state.with_abort(signal.clone());
        assert!(!state.is_aborted());

        AbortOnDrop::new(signal).disarm();
        assert!(!state.is_aborted());

        drop(AbortOnDrop::new(AbortSignal::new(&engine)));
        assert!(!state.is_aborted());
    }

    #[test]
    fn dropped_guard_aborts() {
        let engine = Engine::default();
        let signal = AbortSignal::new(&engine);
        let (_, state) = state(Features::empty());
        let state = state.with_abort(signal.clone());

        drop(AbortOnDrop::new(signal));
        assert!(state.is_aborted());
    }

    #[test]
    fn request_without_signal_never_aborts() {
        let (_, state) = state(Features::empty());
        assert!(!state.is_aborted());
    }

    #[test]
    fn fill_reports_eof_after_last_bytes() {
        let mut source = BodySource::new(Box::new(io::Cursor::new(b"hello".to_vec())));
        let mut buf = [0u8; 5];
        assert_eq!(source.fill(&mut buf).unwrap(), (5, false));
        assert_eq!(source.fill(&mut buf).unwrap(), (0, true));
        assert_eq!(source.fill(&mut buf).unwrap(), (0, true));
    }

    /// Yields one byte per read to exercise the fill loop.
    struct Trickle(io::Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(1);
            self.0.read(&mut buf[..len])
        }
    }

    proptest! {
        #[test]
        fn fill_respects_limit_and_sticky_eof(
            body in proptest::collection::vec(any::<u8>(), 0..256),
            limit in 1usize..64,
        ) {
            let mut source = BodySource::new(Box::new(Trickle(io::Cursor::new(body.clone()))));
            let mut out = Vec::new();
            let mut buf = vec![0u8; limit];
            loop {
                let (n, eof) = source.fill(&mut buf).unwrap();
                prop_assert!(n <= limit);
                out.extend_from_slice(&buf[..n]);
                if eof {
                    prop_assert_eq!(source.fill(&mut buf).unwrap(), (0, true));
                    break;
                }
            }
            prop_assert_eq!(out, body);
        }
    }
}

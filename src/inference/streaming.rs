//! Streaming token delivery
//!
//! The decode loop pushes text fragments into an unbounded channel as they
//! are produced; this module owns the consumer side. A [`TokenStream`] hands
//! events to the caller one at a time (sync or async), and the dispatcher
//! drains a stream into a [`TokenSink`] on a dedicated thread for callers
//! that prefer callbacks over polling.
//!
//! Every stream terminates with exactly one [`StreamEvent::Done`] or
//! [`StreamEvent::Error`], after which no further fragments arrive.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::inference::engine::GenerationError;

pub use tokio::sync::mpsc::error::TryRecvError;

/// Why a generation run stopped producing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model emitted its end-of-sequence token
    EndOfSequence,
    /// The configured token limit was reached
    MaxTokens,
    /// The request was cancelled before a natural stop
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfSequence => write!(f, "end of sequence"),
            StopReason::MaxTokens => write!(f, "max tokens"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An event emitted during streaming generation.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A generated text fragment
    Token(String),
    /// Generation finished; no more fragments will follow
    Done(StopReason),
    /// Generation aborted; no more fragments will follow
    Error(GenerationError),
}

impl StreamEvent {
    /// Returns true if this is a token fragment
    pub fn is_token(&self) -> bool {
        matches!(self, StreamEvent::Token(_))
    }

    /// Returns true if this event ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::Error(_))
    }

    /// Extracts the fragment text if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamEvent::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error if this is an Error variant
    pub fn as_error(&self) -> Option<&GenerationError> {
        match self {
            StreamEvent::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag shared with the decode loop.
///
/// The loop polls the flag between decode steps, so cancellation takes
/// effect within one token of being requested. Handles are cheap to clone
/// and safe to trigger from any thread, any number of times.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Receiving end of one generation request.
///
/// Yields [`StreamEvent`]s in production order and always ends with one
/// terminal event. Dropping the stream before the terminal event cancels
/// the request; the worker notices within one decode step.
pub struct TokenStream {
    rx: UnboundedReceiver<StreamEvent>,
    cancel: CancelHandle,
    finished: bool,
}

impl TokenStream {
    pub(crate) fn new(rx: UnboundedReceiver<StreamEvent>, cancel: CancelHandle) -> Self {
        Self {
            rx,
            cancel,
            finished: false,
        }
    }

    fn note(&mut self, event: &Option<StreamEvent>) {
        match event {
            Some(ev) if ev.is_terminal() => self.finished = true,
            None => self.finished = true,
            _ => {}
        }
    }

    /// Receives the next event, waiting asynchronously.
    ///
    /// Returns `None` once the terminal event has been consumed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        self.note(&event);
        event
    }

    /// Receives the next event, blocking the calling thread.
    ///
    /// Must not be called from an async context; use [`TokenStream::recv`]
    /// there instead.
    pub fn blocking_recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.blocking_recv();
        self.note(&event);
        event
    }

    /// Receives the next event if one is already queued.
    pub fn try_recv(&mut self) -> Result<StreamEvent, TryRecvError> {
        if self.finished {
            return Err(TryRecvError::Disconnected);
        }
        let event = self.rx.try_recv();
        if let Ok(ev) = &event {
            if ev.is_terminal() {
                self.finished = true;
            }
        }
        event
    }

    /// Requests cancellation of the generation feeding this stream.
    ///
    /// Already-produced fragments remain queued; the terminal event still
    /// arrives and must be consumed to observe the stop reason.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns a handle that can cancel this generation from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Returns true once the terminal event has been consumed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drains the stream to completion, concatenating fragments.
    ///
    /// Blocks until the terminal event arrives. Must not be called from an
    /// async context.
    pub fn wait(mut self) -> Result<(String, StopReason), GenerationError> {
        let mut text = String::new();
        loop {
            match self.blocking_recv() {
                Some(StreamEvent::Token(fragment)) => text.push_str(&fragment),
                Some(StreamEvent::Done(reason)) => return Ok((text, reason)),
                Some(StreamEvent::Error(e)) => return Err(e),
                None => {
                    return Err(GenerationError::Engine(
                        "token stream closed without a terminal event".to_string(),
                    ))
                }
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        // An abandoned stream must not leave the engine generating into the void
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

impl fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStream")
            .field("finished", &self.finished)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Receives ordered stream delivery on a dispatcher thread.
///
/// `on_token` is called once per fragment, in production order. Returning
/// `false` cancels the generation and suppresses further fragment delivery.
/// `on_end` is called exactly once, last, whatever the outcome.
pub trait TokenSink: Send + 'static {
    fn on_token(&mut self, fragment: &str) -> bool;
    fn on_end(&mut self, outcome: Result<StopReason, GenerationError>);
}

/// Adapts a callback into a [`TokenSink`].
///
/// The callback receives `Some(fragment)` for each generated fragment and a
/// final `None` when the stream ends, mirroring callback APIs that signal
/// completion with a sentinel value.
pub fn sink_fn<F>(callback: F) -> impl TokenSink
where
    F: FnMut(Option<&str>) + Send + 'static,
{
    struct FnSink<F>(F);

    impl<F> TokenSink for FnSink<F>
    where
        F: FnMut(Option<&str>) + Send + 'static,
    {
        fn on_token(&mut self, fragment: &str) -> bool {
            (self.0)(Some(fragment));
            true
        }

        fn on_end(&mut self, _outcome: Result<StopReason, GenerationError>) {
            (self.0)(None);
        }
    }

    FnSink(callback)
}

impl TokenSink for std::sync::mpsc::Sender<StreamEvent> {
    fn on_token(&mut self, fragment: &str) -> bool {
        self.send(StreamEvent::Token(fragment.to_string())).is_ok()
    }

    fn on_end(&mut self, outcome: Result<StopReason, GenerationError>) {
        let event = match outcome {
            Ok(reason) => StreamEvent::Done(reason),
            Err(e) => StreamEvent::Error(e),
        };
        let _ = self.send(event);
    }
}

impl TokenSink for tokio::sync::mpsc::UnboundedSender<StreamEvent> {
    fn on_token(&mut self, fragment: &str) -> bool {
        self.send(StreamEvent::Token(fragment.to_string())).is_ok()
    }

    fn on_end(&mut self, outcome: Result<StopReason, GenerationError>) {
        let event = match outcome {
            Ok(reason) => StreamEvent::Done(reason),
            Err(e) => StreamEvent::Error(e),
        };
        let _ = self.send(event);
    }
}

/// Drains a stream into a sink on a dedicated thread.
///
/// The sink sees fragments in order and gets `on_end` exactly once, even if
/// the producer dies without a terminal event. A sink that returns `false`
/// from `on_token` cancels the generation; the remaining queued fragments
/// are discarded rather than delivered.
pub(crate) fn spawn_dispatcher<S: TokenSink>(
    mut stream: TokenStream,
    mut sink: S,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("llamabridge-dispatch".to_string())
        .spawn(move || {
            let mut suppressed = false;
            loop {
                match stream.blocking_recv() {
                    Some(StreamEvent::Token(fragment)) => {
                        if suppressed {
                            continue;
                        }
                        if !sink.on_token(&fragment) {
                            tracing::debug!("Sink rejected fragment, cancelling generation");
                            stream.cancel();
                            suppressed = true;
                        }
                    }
                    Some(StreamEvent::Done(reason)) => {
                        sink.on_end(Ok(reason));
                        break;
                    }
                    Some(StreamEvent::Error(e)) => {
                        sink.on_end(Err(e));
                        break;
                    }
                    None => {
                        sink.on_end(Err(GenerationError::Engine(
                            "token stream closed without a terminal event".to_string(),
                        )));
                        break;
                    }
                }
            }
        })
}

/// Accumulates raw token bytes and yields the longest valid UTF-8 prefix.
///
/// Token boundaries do not line up with codepoint boundaries; a multi-byte
/// character can arrive split across several decode steps. Incomplete
/// trailing bytes stay buffered until a later step completes them.
#[derive(Debug, Default)]
pub(crate) struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    /// Appends bytes and returns any newly completed text.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Hard-invalid bytes are dropped so one bad token
                        // cannot wedge the rest of the stream
                        Some(skip) => {
                            tracing::debug!("Dropping {} invalid byte(s) from token stream", skip);
                            self.pending.drain(..valid + skip);
                        }
                        // Incomplete tail waits for the next step
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Returns any remaining complete text at end of stream.
    ///
    /// A dangling partial codepoint is discarded; there is nothing left to
    /// complete it.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            Err(e) => e.valid_up_to(),
        };
        let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
        self.pending.clear();
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_variants() {
        let token = StreamEvent::Token("hello".to_string());
        assert!(token.is_token());
        assert!(!token.is_terminal());
        assert_eq!(token.as_token(), Some("hello"));

        let done = StreamEvent::Done(StopReason::EndOfSequence);
        assert!(!done.is_token());
        assert!(done.is_terminal());

        let error = StreamEvent::Error(GenerationError::Cancelled);
        assert!(error.is_terminal());
        assert_eq!(error.as_error(), Some(&GenerationError::Cancelled));
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();

        assert!(!handle.is_cancelled());
        clone.cancel();
        assert!(handle.is_cancelled());

        // Idempotent
        clone.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_utf8_buffer_ascii_passthrough() {
        let mut buf = Utf8Buffer::default();
        assert_eq!(buf.push(b"hello").as_deref(), Some("hello"));
        assert_eq!(buf.push(b" world").as_deref(), Some(" world"));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn test_utf8_buffer_split_two_byte_char() {
        // "é" is 0xC3 0xA9
        let mut buf = Utf8Buffer::default();
        assert_eq!(buf.push(&[0xC3]), None);
        assert_eq!(buf.push(&[0xA9]).as_deref(), Some("é"));
    }

    #[test]
    fn test_utf8_buffer_split_four_byte_char() {
        // "🦀" is 0xF0 0x9F 0xA6 0x80
        let mut buf = Utf8Buffer::default();
        assert_eq!(buf.push(&[0xF0, 0x9F]), None);
        assert_eq!(buf.push(&[0xA6]), None);
        assert_eq!(buf.push(&[0x80]).as_deref(), Some("🦀"));
    }

    #[test]
    fn test_utf8_buffer_valid_prefix_before_split() {
        let mut buf = Utf8Buffer::default();
        // "ab" followed by the first byte of "é"
        assert_eq!(buf.push(&[b'a', b'b', 0xC3]).as_deref(), Some("ab"));
        assert_eq!(buf.push(&[0xA9]).as_deref(), Some("é"));
    }

    #[test]
    fn test_utf8_buffer_flush_drops_dangling_tail() {
        let mut buf = Utf8Buffer::default();
        assert_eq!(buf.push(&[b'o', b'k', 0xF0, 0x9F]).as_deref(), Some("ok"));
        // Stream ends mid-codepoint; the partial bytes are dropped
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn test_utf8_buffer_skips_hard_invalid_bytes() {
        let mut buf = Utf8Buffer::default();
        // 0xFF can never start a UTF-8 sequence
        assert_eq!(buf.push(&[b'a', 0xFF, b'b']).as_deref(), Some("ab"));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn test_token_stream_drop_cancels() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancelHandle::new();
        let stream = TokenStream::new(rx, cancel.clone());

        assert!(!cancel.is_cancelled());
        drop(stream);
        assert!(cancel.is_cancelled());
        drop(tx);
    }

    #[test]
    fn test_token_stream_no_cancel_after_terminal() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancelHandle::new();
        let mut stream = TokenStream::new(rx, cancel.clone());

        tx.send(StreamEvent::Done(StopReason::EndOfSequence)).unwrap();
        assert!(matches!(
            stream.blocking_recv(),
            Some(StreamEvent::Done(StopReason::EndOfSequence))
        ));
        assert!(stream.is_finished());
        assert!(stream.blocking_recv().is_none());

        drop(stream);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_wait_concatenates_fragments() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = TokenStream::new(rx, CancelHandle::new());

        tx.send(StreamEvent::Token("Hello".to_string())).unwrap();
        tx.send(StreamEvent::Token(", world".to_string())).unwrap();
        tx.send(StreamEvent::Done(StopReason::MaxTokens)).unwrap();

        let (text, reason) = stream.wait().unwrap();
        assert_eq!(text, "Hello, world");
        assert_eq!(reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_wait_surfaces_error() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = TokenStream::new(rx, CancelHandle::new());

        tx.send(StreamEvent::Token("partial".to_string())).unwrap();
        tx.send(StreamEvent::Error(GenerationError::Engine(
            "decode failed".to_string(),
        )))
        .unwrap();

        assert!(matches!(
            stream.wait(),
            Err(GenerationError::Engine(msg)) if msg == "decode failed"
        ));
    }

    #[test]
    fn test_wait_on_closed_channel_is_an_error() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<StreamEvent>();
        let stream = TokenStream::new(rx, CancelHandle::new());
        drop(tx);

        assert!(matches!(stream.wait(), Err(GenerationError::Engine(_))));
    }

    #[test]
    fn test_dispatcher_delivers_in_order_with_single_end() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = TokenStream::new(rx, CancelHandle::new());

        let (sink_tx, sink_rx) = std::sync::mpsc::channel();
        let handle = spawn_dispatcher(stream, sink_tx).unwrap();

        tx.send(StreamEvent::Token("a".to_string())).unwrap();
        tx.send(StreamEvent::Token("b".to_string())).unwrap();
        tx.send(StreamEvent::Done(StopReason::EndOfSequence)).unwrap();
        handle.join().unwrap();

        let events: Vec<StreamEvent> = sink_rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_token(), Some("a"));
        assert_eq!(events[1].as_token(), Some("b"));
        assert!(matches!(
            events[2],
            StreamEvent::Done(StopReason::EndOfSequence)
        ));
    }

    #[test]
    fn test_dispatcher_synthesizes_end_on_dead_producer() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = TokenStream::new(rx, CancelHandle::new());

        let (sink_tx, sink_rx) = std::sync::mpsc::channel();
        let handle = spawn_dispatcher(stream, sink_tx).unwrap();

        tx.send(StreamEvent::Token("a".to_string())).unwrap();
        // Producer dies without sending Done
        drop(tx);
        handle.join().unwrap();

        let events: Vec<StreamEvent> = sink_rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_token());
        assert!(matches!(events[1], StreamEvent::Error(_)));
    }

    #[test]
    fn test_dispatcher_sink_rejection_cancels_and_suppresses() {
        struct RejectAfter {
            seen: usize,
            limit: usize,
            ends: std::sync::mpsc::Sender<Result<StopReason, GenerationError>>,
        }

        impl TokenSink for RejectAfter {
            fn on_token(&mut self, _fragment: &str) -> bool {
                self.seen += 1;
                self.seen < self.limit
            }

            fn on_end(&mut self, outcome: Result<StopReason, GenerationError>) {
                let _ = self.ends.send(outcome);
            }
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancelHandle::new();
        let stream = TokenStream::new(rx, cancel.clone());

        let (end_tx, end_rx) = std::sync::mpsc::channel();
        let sink = RejectAfter {
            seen: 0,
            limit: 2,
            ends: end_tx,
        };
        let handle = spawn_dispatcher(stream, sink).unwrap();

        tx.send(StreamEvent::Token("a".to_string())).unwrap();
        tx.send(StreamEvent::Token("b".to_string())).unwrap();
        tx.send(StreamEvent::Token("c".to_string())).unwrap();
        tx.send(StreamEvent::Done(StopReason::Cancelled)).unwrap();
        handle.join().unwrap();

        // Rejection on the second fragment cancelled the generation
        assert!(cancel.is_cancelled());
        let ends: Vec<_> = end_rx.try_iter().collect();
        assert_eq!(ends.len(), 1);
        assert!(matches!(ends[0], Ok(StopReason::Cancelled)));
    }

    #[test]
    fn test_sink_fn_receives_sentinel() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = TokenStream::new(rx, CancelHandle::new());

        let (out_tx, out_rx) = std::sync::mpsc::channel();
        let sink = sink_fn(move |fragment: Option<&str>| {
            let _ = out_tx.send(fragment.map(str::to_string));
        });
        let handle = spawn_dispatcher(stream, sink).unwrap();

        tx.send(StreamEvent::Token("x".to_string())).unwrap();
        tx.send(StreamEvent::Done(StopReason::EndOfSequence)).unwrap();
        handle.join().unwrap();

        let calls: Vec<Option<String>> = out_rx.try_iter().collect();
        assert_eq!(calls, vec![Some("x".to_string()), None]);
    }

    #[tokio::test]
    async fn test_async_recv() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut stream = TokenStream::new(rx, CancelHandle::new());

        tx.send(StreamEvent::Token("hi".to_string())).unwrap();
        tx.send(StreamEvent::Done(StopReason::EndOfSequence)).unwrap();

        assert_eq!(stream.recv().await.and_then(|e| e.as_token().map(String::from)), Some("hi".to_string()));
        assert!(matches!(stream.recv().await, Some(StreamEvent::Done(_))));
        assert!(stream.recv().await.is_none());
    }
}

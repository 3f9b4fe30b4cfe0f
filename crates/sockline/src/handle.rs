//! Connection handle: the per-connection state every handler receives.
//!
//! A handle bundles the socket, the text received so far, the sticky
//! error and the handler to call. It is built in exactly one of two ways:
//! around a connected [`Socket`], or around an error with no socket at all.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::{ConnectionId, NetError, Socket};

/// Callback invoked with a handle whenever something happens on it.
pub type EventHandler = Arc<dyn Fn(ConnectionHandle) + Send + Sync + 'static>;

/// What the most recent handler invocation was about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetEvent {
    /// The connection was accepted or the connect attempt succeeded.
    Connected,
    /// A receive appended new text.
    Data,
    /// The peer closed its side. The error is set to "Connection closed by
    /// peer." so handlers that only look at the error flag stop as well.
    Closed,
    /// Something failed. See [`ConnectionHandle::error_message`].
    Error,
}

// ---------------------------------------------------------------------------
// TextBuffer
// ---------------------------------------------------------------------------

/// Accumulated inbound text.
///
/// Reads can split a multi-byte character; the incomplete tail is held in
/// `pending` until the next chunk completes it.
#[derive(Debug, Default)]
struct TextBuffer {
    text: String,
    pending: Vec<u8>,
}

impl TextBuffer {
    fn push_bytes(&mut self, bytes: &[u8]) {
        let joined;
        let mut rest = if self.pending.is_empty() {
            bytes
        } else {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(bytes);
            joined = buf;
            &joined[..]
        };

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    return;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Ends the stream: a tail that never completed becomes U+FFFD.
    fn finish(&mut self) {
        if !self.pending.is_empty() {
            self.pending.clear();
            self.text.push(char::REPLACEMENT_CHARACTER);
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

struct Inner {
    id: ConnectionId,
    socket: Option<Socket>,
    text: Mutex<TextBuffer>,
    on_event: RwLock<EventHandler>,
    error: Mutex<Option<Arc<NetError>>>,
    event: Mutex<NetEvent>,
    receiving: AtomicBool,
}

/// Per-connection state shared between the engines and application code.
///
/// Cloning is cheap; all clones refer to the same connection. Handlers
/// should check [`error_occurred`](Self::error_occurred) (or
/// [`event`](Self::event)) before touching the socket. Error-only handles
/// have no socket at all.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl ConnectionHandle {
    /// A handle around a connected socket.
    pub(crate) fn connected(socket: Socket, on_event: EventHandler) -> Self {
        Self::build(socket.id(), Some(socket), None, NetEvent::Connected, on_event)
    }

    /// A handle carrying only an error.
    pub(crate) fn failed(error: NetError, on_event: EventHandler) -> Self {
        Self::build(
            ConnectionId::next(),
            None,
            Some(Arc::new(error)),
            NetEvent::Error,
            on_event,
        )
    }

    fn build(
        id: ConnectionId,
        socket: Option<Socket>,
        error: Option<Arc<NetError>>,
        event: NetEvent,
        on_event: EventHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                socket,
                text: Mutex::new(TextBuffer::default()),
                on_event: RwLock::new(on_event),
                error: Mutex::new(error),
                event: Mutex::new(event),
                receiving: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The socket, or `None` for a handle that only carries an error.
    pub fn socket(&self) -> Option<&Socket> {
        self.inner.socket.as_ref()
    }

    /// `true` while the handle has a socket that has not been closed.
    pub fn is_connected(&self) -> bool {
        self.socket().is_some_and(Socket::is_connected)
    }

    /// Whether an error has been recorded. Sticky once set.
    pub fn error_occurred(&self) -> bool {
        self.inner.error.lock().is_some()
    }

    /// Human-readable description of the recorded error.
    pub fn error_message(&self) -> Option<String> {
        self.inner.error.lock().as_ref().map(|e| e.to_string())
    }

    /// The recorded error itself.
    pub fn error(&self) -> Option<Arc<NetError>> {
        self.inner.error.lock().clone()
    }

    /// Kind of the most recent handler invocation.
    pub fn event(&self) -> NetEvent {
        *self.inner.event.lock()
    }

    /// Snapshot of the accumulated text.
    pub fn data(&self) -> String {
        self.inner.text.lock().text.clone()
    }

    /// Runs `f` over the accumulated text while holding the handle's lock.
    ///
    /// Keep `f` short: the receive engine waits on the same lock to append.
    pub fn with_data<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(&self.inner.text.lock().text)
    }

    /// Length of the accumulated text in bytes.
    pub fn data_len(&self) -> usize {
        self.inner.text.lock().text.len()
    }

    /// Removes and returns all accumulated text.
    pub fn take_data(&self) -> String {
        std::mem::take(&mut self.inner.text.lock().text)
    }

    /// Removes `len` bytes starting at byte offset `start`.
    ///
    /// Returns `false` and leaves the text untouched if the range runs past
    /// the end or does not fall on character boundaries.
    pub fn remove_data(&self, start: usize, len: usize) -> bool {
        let mut buffer = self.inner.text.lock();
        let Some(end) = start.checked_add(len) else {
            return false;
        };
        let text = &mut buffer.text;
        if end > text.len() || !text.is_char_boundary(start) || !text.is_char_boundary(end) {
            return false;
        }
        text.replace_range(start..end, "");
        true
    }

    /// Discards all accumulated text.
    pub fn clear_data(&self) {
        self.inner.text.lock().text.clear();
    }

    /// Replaces the handler used for every later notification.
    ///
    /// Safe to call from inside the current handler.
    pub fn set_on_event(&self, on_event: impl Fn(ConnectionHandle) + Send + Sync + 'static) {
        let on_event: EventHandler = Arc::new(on_event);
        *self.inner.on_event.write() = on_event;
    }

    /// [`send`](crate::send) on this handle's socket. `false` for error-only
    /// handles.
    pub fn send(&self, data: &str) -> bool {
        self.socket().is_some_and(|socket| crate::send(socket, data))
    }

    /// [`send_and_close`](crate::send_and_close) on this handle's socket.
    /// `false` for error-only handles.
    pub fn send_and_close(&self, data: &str) -> bool {
        self.socket()
            .is_some_and(|socket| crate::send_and_close(socket, data))
    }

    pub(crate) fn append(&self, bytes: &[u8]) {
        self.inner.text.lock().push_bytes(bytes);
    }

    /// No more bytes will arrive; flushes an incomplete character.
    pub(crate) fn finish_text(&self) {
        self.inner.text.lock().finish();
    }

    /// Records `error` unless an earlier one is already set.
    pub(crate) fn record_error(&self, error: NetError) {
        let mut slot = self.inner.error.lock();
        if slot.is_none() {
            *slot = Some(Arc::new(error));
        }
    }

    /// Records the event and invokes the handler.
    ///
    /// The handler is cloned out of its lock first so it may call
    /// [`set_on_event`](Self::set_on_event) or start another receive.
    pub(crate) fn notify(&self, event: NetEvent) {
        *self.inner.event.lock() = event;
        let on_event = self.inner.on_event.read().clone();
        on_event(self.clone());
    }

    pub(crate) fn fail(&self, event: NetEvent, error: NetError) {
        self.record_error(error);
        self.notify(event);
    }

    /// Marks a receive as pending. `false` if one already is.
    pub(crate) fn begin_receive(&self) -> bool {
        !self.inner.receiving.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_receive(&self) {
        self.inner.receiving.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("socket", &self.inner.socket)
            .field("event", &self.event())
            .field("error", &self.error_message())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> EventHandler {
        Arc::new(|_: ConnectionHandle| {})
    }

    fn error_handle() -> ConnectionHandle {
        ConnectionHandle::failed(NetError::Resolution, noop())
    }

    #[test]
    fn test_failed_handle_has_no_socket_and_sticky_error() {
        let handle = error_handle();
        assert!(handle.socket().is_none());
        assert!(!handle.is_connected());
        assert!(handle.error_occurred());
        assert_eq!(handle.error_message().as_deref(), Some("Error with Name"));
        assert_eq!(handle.event(), NetEvent::Error);
    }

    #[test]
    fn test_first_error_wins() {
        let handle = error_handle();
        handle.record_error(NetError::ConnectTimeout);
        assert_eq!(handle.error_message().as_deref(), Some("Error with Name"));
    }

    #[test]
    fn test_append_accumulates_in_order() {
        let handle = error_handle();
        handle.append(b"abc");
        handle.append(b"def");
        assert_eq!(handle.data(), "abcdef");
        assert_eq!(handle.data_len(), 6);
    }

    #[test]
    fn test_split_multibyte_character_is_reassembled() {
        let handle = error_handle();
        let bytes = "héllo".as_bytes();
        // 'é' is two bytes; split between them.
        handle.append(&bytes[..2]);
        assert_eq!(handle.data(), "h");
        handle.append(&bytes[2..]);
        assert_eq!(handle.data(), "héllo");
    }

    #[test]
    fn test_invalid_bytes_become_replacement_characters() {
        let handle = error_handle();
        handle.append(b"a\xffb");
        assert_eq!(handle.data(), "a\u{FFFD}b");
    }

    #[test]
    fn test_unfinished_character_is_flushed_at_end_of_stream() {
        let handle = error_handle();
        handle.append(b"a\xc3");
        assert_eq!(handle.data(), "a");
        handle.finish_text();
        assert_eq!(handle.data(), "a\u{FFFD}");
        handle.finish_text();
        assert_eq!(handle.data(), "a\u{FFFD}");
    }

    #[test]
    fn test_take_data_drains() {
        let handle = error_handle();
        handle.append(b"line\n");
        assert_eq!(handle.take_data(), "line\n");
        assert_eq!(handle.data(), "");
    }

    #[test]
    fn test_remove_data_checks_bounds_and_boundaries() {
        let handle = error_handle();
        handle.append("ab€cd".as_bytes());
        assert!(!handle.remove_data(0, 100));
        assert!(!handle.remove_data(3, 1), "inside the euro sign");
        assert!(!handle.remove_data(usize::MAX, 2));
        assert!(handle.remove_data(0, 2));
        assert_eq!(handle.data(), "€cd");
        handle.clear_data();
        assert_eq!(handle.data_len(), 0);
    }

    #[test]
    fn test_with_data_sees_current_text() {
        let handle = error_handle();
        handle.append(b"one\ntwo");
        let lines = handle.with_data(|text| text.lines().count());
        assert_eq!(lines, 2);
    }

    #[test]
    fn test_notify_records_event_and_calls_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = ConnectionHandle::failed(
            NetError::PeerClosed,
            Arc::new(move |h: ConnectionHandle| {
                assert_eq!(h.event(), NetEvent::Closed);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.notify(NetEvent::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_on_event_inside_handler_does_not_deadlock() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = ConnectionHandle::failed(
            NetError::PeerClosed,
            Arc::new(move |h: ConnectionHandle| {
                let counter = Arc::clone(&counter);
                h.set_on_event(move |_| {
                    counter.fetch_add(10, Ordering::SeqCst);
                });
            }),
        );
        handle.notify(NetEvent::Data);
        handle.notify(NetEvent::Data);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_only_one_receive_may_be_pending() {
        let handle = error_handle();
        assert!(handle.begin_receive());
        assert!(!handle.begin_receive());
        handle.end_receive();
        assert!(handle.begin_receive());
    }

    #[test]
    fn test_send_on_error_handle_returns_false() {
        let handle = error_handle();
        assert!(!handle.send("hello"));
        assert!(!handle.send_and_close("hello"));
    }
}

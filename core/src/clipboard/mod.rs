//! Clipboard collaborator: payload model, providers, and change monitoring

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arboard::Clipboard as ArboardClipboard;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::{Error, Result};

mod raster;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";
/// Format of images read from the system clipboard
pub const IMAGE_PNG: &str = "png";

/// One clipboard representation in a given MIME format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeEntry {
    pub format: String,
    pub data: Vec<u8>,
}

/// Encoded image file (png, jpg, ...) held by the clipboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub format: String,
    pub data: Vec<u8>,
}

/// Snapshot of the clipboard in raw (not base64) form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub entries: Vec<MimeEntry>,
    pub image: Option<ImagePayload>,
}

impl Payload {
    /// Plain text payload
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            entries: vec![MimeEntry {
                format: TEXT_PLAIN.to_string(),
                data: text.into().into_bytes(),
            }],
            image: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.image.is_none()
    }

    /// Raw bytes for `format`, if present
    pub fn get(&self, format: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.format == format)
            .map(|e| e.data.as_slice())
    }

    /// The `text/plain` entry decoded as UTF-8
    pub fn plain_text(&self) -> Option<String> {
        self.get(TEXT_PLAIN)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    /// Hash of the payload for change detection
    pub fn hash(&self) -> PayloadHash {
        let mut hasher = Sha256::new();
        for entry in &self.entries {
            hasher.update((entry.format.len() as u64).to_be_bytes());
            hasher.update(entry.format.as_bytes());
            hasher.update((entry.data.len() as u64).to_be_bytes());
            hasher.update(&entry.data);
        }
        if let Some(image) = &self.image {
            hasher.update(b"image:");
            hasher.update(image.format.as_bytes());
            hasher.update(&image.data);
        }
        PayloadHash(hasher.finalize().into())
    }
}

/// SHA256 hash of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadHash(pub [u8; 32]);

/// External clipboard surface the core reads from and writes to
pub trait ClipboardProvider: Send + Sync + 'static {
    /// Current clipboard content, `None` when it is empty or unreadable as a payload
    fn current_payload(&self) -> Result<Option<Payload>>;

    /// Replace the clipboard content with a payload received from a neighbor
    fn apply_received_payload(&self, payload: &Payload) -> Result<()>;
}

/// System clipboard backed by arboard.
///
/// Reads text and images; images are carried as PNG. arboard holds a single
/// representation at a time, so applying prefers the image, then HTML, then
/// plain text.
#[derive(Debug, Default)]
pub struct SystemClipboard;

impl SystemClipboard {
    pub fn new() -> Self {
        Self
    }
}

fn open_clipboard() -> Result<ArboardClipboard> {
    ArboardClipboard::new().map_err(|e| Error::Clipboard(e.to_string()))
}

impl ClipboardProvider for SystemClipboard {
    fn current_payload(&self) -> Result<Option<Payload>> {
        let mut clipboard = open_clipboard()?;
        let mut payload = Payload::default();

        match clipboard.get_text() {
            Ok(text) if !text.is_empty() => payload.entries.push(MimeEntry {
                format: TEXT_PLAIN.to_string(),
                data: text.into_bytes(),
            }),
            Ok(_) | Err(arboard::Error::ContentNotAvailable) => {}
            Err(e) => return Err(Error::Clipboard(e.to_string())),
        }

        match clipboard.get_image() {
            Ok(image) => match raster::encode_png(&image) {
                Ok(data) => {
                    payload.image = Some(ImagePayload {
                        format: IMAGE_PNG.to_string(),
                        data,
                    })
                }
                Err(e) => tracing::warn!(error = %e, "skipping clipboard image"),
            },
            Err(arboard::Error::ContentNotAvailable) => {}
            Err(e) => tracing::debug!(error = %e, "clipboard image unavailable"),
        }

        Ok((!payload.is_empty()).then_some(payload))
    }

    fn apply_received_payload(&self, payload: &Payload) -> Result<()> {
        let mut clipboard = open_clipboard()?;

        if let Some(image) = &payload.image {
            let data = raster::decode_image(&image.format, &image.data)?;
            return clipboard
                .set_image(data)
                .map_err(|e| Error::Clipboard(e.to_string()));
        }

        let text = payload.plain_text();
        match payload.get(TEXT_HTML) {
            Some(html) => clipboard
                .set_html(String::from_utf8_lossy(html).into_owned(), text)
                .map_err(|e| Error::Clipboard(e.to_string())),
            None => match text {
                Some(text) => clipboard
                    .set_text(text)
                    .map_err(|e| Error::Clipboard(e.to_string())),
                None => {
                    tracing::debug!(
                        formats = payload.entries.len(),
                        "no text or image in payload, clipboard left unchanged"
                    );
                    Ok(())
                }
            },
        }
    }
}

/// In-memory clipboard for headless hosts and tests
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    content: Mutex<Option<Payload>>,
    applied: Mutex<Vec<Payload>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a local copy
    pub fn set(&self, payload: Payload) {
        if let Ok(mut content) = self.content.lock() {
            *content = Some(payload);
        }
    }

    /// Every payload applied through `apply_received_payload`, oldest first
    pub fn applied(&self) -> Vec<Payload> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl ClipboardProvider for MemoryClipboard {
    fn current_payload(&self) -> Result<Option<Payload>> {
        self.content
            .lock()
            .map(|c| c.clone())
            .map_err(|e| Error::Clipboard(e.to_string()))
    }

    fn apply_received_payload(&self, payload: &Payload) -> Result<()> {
        self.applied
            .lock()
            .map_err(|e| Error::Clipboard(e.to_string()))?
            .push(payload.clone());
        self.set(payload.clone());
        Ok(())
    }
}

/// Remembers the last clipboard state so only real changes are reported.
///
/// Shared between the monitor and the receive path. Before applying a
/// received payload the receive path calls [`ChangeTracker::expect_incoming`];
/// when the monitor later observes that payload it is absorbed instead of
/// being reported, however the poll interleaves with the apply.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    state: Arc<Mutex<TrackerState>>,
}

#[derive(Debug, Default)]
struct TrackerState {
    last: Option<PayloadHash>,
    incoming: VecDeque<PayloadHash>,
}

/// Received payloads awaiting observation; older ones are forgotten
const MAX_PENDING_INCOMING: usize = 8;

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `payload` as the current state without reporting it
    pub fn mark_seen(&self, payload: &Payload) {
        if let Ok(mut state) = self.state.lock() {
            let hash = payload.hash();
            state.incoming.retain(|h| *h != hash);
            state.last = Some(hash);
        }
    }

    /// Announce that `payload` is about to be written to the clipboard.
    ///
    /// The current state is left alone, so a poll that still sees the old
    /// content reports nothing either.
    pub fn expect_incoming(&self, payload: &Payload) {
        if let Ok(mut state) = self.state.lock() {
            let hash = payload.hash();
            if !state.incoming.contains(&hash) {
                if state.incoming.len() == MAX_PENDING_INCOMING {
                    state.incoming.pop_front();
                }
                state.incoming.push_back(hash);
            }
        }
    }

    /// Withdraw an expectation whose apply failed
    pub fn cancel_incoming(&self, payload: &Payload) {
        if let Ok(mut state) = self.state.lock() {
            let hash = payload.hash();
            state.incoming.retain(|h| *h != hash);
        }
    }

    /// Returns `true` if `current` differs from the last recorded state, and records it
    pub fn observe(&self, current: Option<&Payload>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };

        match current {
            Some(payload) => {
                let hash = payload.hash();
                if state.last == Some(hash) {
                    return false;
                }
                state.last = Some(hash);

                if let Some(pos) = state.incoming.iter().position(|h| *h == hash) {
                    state.incoming.remove(pos);
                    return false;
                }
                true
            }
            None => {
                state.last = None;
                false
            }
        }
    }
}

/// Start a clipboard polling task that sends changed payloads to a channel.
///
/// The receiver yields one payload per observed change. The state at startup
/// is recorded but not reported.
pub fn start_monitor(
    provider: Arc<dyn ClipboardProvider>,
    tracker: ChangeTracker,
    poll_interval: Duration,
) -> (mpsc::Receiver<Payload>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);

    let handle = tokio::spawn(async move {
        if let Ok(initial) = provider.current_payload() {
            tracker.observe(initial.as_ref());
        }

        loop {
            tokio::time::sleep(poll_interval).await;

            match provider.current_payload() {
                Ok(current) => {
                    if tracker.observe(current.as_ref()) {
                        if let Some(payload) = current {
                            if tx.send(payload).await.is_err() {
                                // Receiver dropped, stop monitoring
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("clipboard read error: {}", e);
                }
            }
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_hash_consistency() {
        let a = Payload::text("hello");
        assert_eq!(a.hash(), Payload::text("hello").hash());
        assert_ne!(a.hash(), Payload::text("world").hash());
    }

    #[test]
    fn test_hash_distinguishes_entry_boundaries() {
        let a = Payload {
            entries: vec![
                MimeEntry { format: "a".into(), data: b"bc".to_vec() },
            ],
            image: None,
        };
        let b = Payload {
            entries: vec![
                MimeEntry { format: "ab".into(), data: b"c".to_vec() },
            ],
            image: None,
        };
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_change_tracker() {
        let tracker = ChangeTracker::new();
        let hello = Payload::text("hello");

        assert!(tracker.observe(Some(&hello)));
        assert!(!tracker.observe(Some(&hello)));

        let received = Payload::text("from neighbor");
        tracker.mark_seen(&received);
        assert!(!tracker.observe(Some(&received)));

        assert!(!tracker.observe(None));
        assert!(tracker.observe(Some(&hello)));
    }

    #[test]
    fn test_expected_incoming_is_absorbed() {
        let tracker = ChangeTracker::new();
        let local = Payload::text("local");
        let received = Payload::text("received");
        assert!(tracker.observe(Some(&local)));

        tracker.expect_incoming(&received);
        // A poll before the apply lands still sees the old content
        assert!(!tracker.observe(Some(&local)));
        assert!(!tracker.observe(Some(&received)));

        // Copying the same text again locally later is a real change
        assert!(tracker.observe(Some(&local)));
        assert!(tracker.observe(Some(&received)));
    }

    #[test]
    fn test_cancelled_incoming_is_reported() {
        let tracker = ChangeTracker::new();
        let received = Payload::text("received");
        tracker.expect_incoming(&received);
        tracker.cancel_incoming(&received);
        assert!(tracker.observe(Some(&received)));
    }

    #[test]
    fn test_memory_clipboard_records_applied() {
        let clipboard = MemoryClipboard::new();
        assert_eq!(clipboard.current_payload().unwrap(), None);

        clipboard.apply_received_payload(&Payload::text("one")).unwrap();
        assert_eq!(clipboard.applied(), vec![Payload::text("one")]);
        assert_eq!(clipboard.current_payload().unwrap(), Some(Payload::text("one")));
    }

    #[tokio::test]
    async fn test_monitor_reports_changes_only() {
        let clipboard = Arc::new(MemoryClipboard::new());
        clipboard.set(Payload::text("initial"));

        let tracker = ChangeTracker::new();
        let (mut rx, handle) = start_monitor(
            clipboard.clone(),
            tracker.clone(),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        clipboard.set(Payload::text("copied"));

        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, Payload::text("copied"));

        let received = Payload::text("received");
        tracker.mark_seen(&received);
        clipboard.set(received);
        let echo = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(echo.is_err());

        handle.abort();
    }

    #[test]
    fn test_system_clipboard_roundtrip() {
        let clipboard = SystemClipboard::new();
        let payload = Payload::text("clipmesh test");

        // This test may fail if run in headless environment
        if clipboard.apply_received_payload(&payload).is_ok() {
            if let Ok(Some(read)) = clipboard.current_payload() {
                assert_eq!(read.plain_text().as_deref(), Some("clipmesh test"));
            }
        }
    }
}

//! OS clipboard access, change monitoring and delivery of received content

use std::borrow::Cow;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arboard::{Clipboard as ArboardClipboard, ImageData};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::protocol::unix_secs;
use crate::transfer::{checksum, ContentKind, ReceivedFile};
use crate::{Error, Result};

/// Copied text longer than this is never treated as a path
const MAX_PATH_LEN: usize = 500;

/// Something the local user copied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardContent {
    Text(String),
    /// A path to an existing file was copied; carries the file bytes
    File {
        path: PathBuf,
        file_name: String,
        data: Vec<u8>,
    },
    /// A copied bitmap, PNG-encoded
    Image { file_name: String, data: Vec<u8> },
}

/// Clipboard manager for reading, writing, and monitoring changes
pub struct ClipboardManager {
    /// Hash of the last text seen or written by us
    last_hash: Option<String>,
    /// Hash of the RGBA pixels of the last image seen or written by us
    last_image_hash: Option<String>,
    download_dir: PathBuf,
}

impl ClipboardManager {
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            last_hash: None,
            last_image_hash: None,
            download_dir,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Read current clipboard text
    pub fn read_text(&self) -> Result<Option<String>> {
        let mut clipboard = ArboardClipboard::new()
            .map_err(|e| Error::Clipboard(e.to_string()))?;

        match clipboard.get_text() {
            Ok(text) if !text.is_empty() => Ok(Some(text)),
            Ok(_) => Ok(None),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(Error::Clipboard(e.to_string())),
        }
    }

    fn write_text(&self, text: &str) -> Result<()> {
        let mut clipboard = ArboardClipboard::new()
            .map_err(|e| Error::Clipboard(e.to_string()))?;
        clipboard
            .set_text(text)
            .map_err(|e| Error::Clipboard(e.to_string()))
    }

    /// Read the current clipboard bitmap as RGBA pixels.
    ///
    /// Platforms that cannot convert the clipboard image report nothing
    /// rather than failing every poll.
    fn read_image(&self) -> Result<Option<ImageData<'static>>> {
        let mut clipboard = ArboardClipboard::new()
            .map_err(|e| Error::Clipboard(e.to_string()))?;

        match clipboard.get_image() {
            Ok(image) if !image.bytes.is_empty() => Ok(Some(image)),
            Ok(_) | Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => {
                tracing::debug!("clipboard image unreadable: {}", e);
                Ok(None)
            }
        }
    }

    /// Poll the clipboard once; returns content the user copied since the
    /// last call. Text wins when both text and an image changed.
    pub fn check_change(&mut self) -> Result<Option<ClipboardContent>> {
        match self.read_text()? {
            Some(text) => {
                if let Some(content) = self.observe(text) {
                    return Ok(Some(content));
                }
            }
            None => self.last_hash = None,
        }

        match self.read_image()? {
            Some(image) => self.observe_image(image),
            None => {
                self.last_image_hash = None;
                Ok(None)
            }
        }
    }

    /// Compare `image` with the last seen clipboard image and encode it as
    /// PNG when it is new.
    fn observe_image(&mut self, image: ImageData<'_>) -> Result<Option<ClipboardContent>> {
        let hash = checksum(&image.bytes);
        if self.last_image_hash.as_ref() == Some(&hash) {
            return Ok(None);
        }
        self.last_image_hash = Some(hash);

        let (width, height) = (image.width, image.height);
        let data = encode_png(width, height, image.bytes.into_owned())?;
        let file_name = format!("clipboard_image_{}.png", unix_secs());
        tracing::info!("detected image copy: {}x{} ({} bytes as png)", width, height, data.len());
        Ok(Some(ClipboardContent::Image { file_name, data }))
    }

    /// Compare `text` with the last seen clipboard text and classify it
    /// when it is new.
    fn observe(&mut self, text: String) -> Option<ClipboardContent> {
        let hash = checksum(text.as_bytes());
        if self.last_hash.as_ref() == Some(&hash) {
            return None;
        }
        self.last_hash = Some(hash);
        Some(classify(text))
    }

    /// Put peer text on the clipboard without reporting it back as a change.
    pub fn apply_text(&mut self, text: &str) -> Result<()> {
        self.last_hash = Some(checksum(text.as_bytes()));
        self.write_text(text)
    }

    /// Put a peer's image on the clipboard without reporting it back as a
    /// change. `data` is any encoded image the decoder understands.
    pub fn apply_image(&mut self, data: &[u8]) -> Result<()> {
        let image = decode_image(data)?;
        self.last_image_hash = Some(checksum(&image.bytes));

        let mut clipboard = ArboardClipboard::new()
            .map_err(|e| Error::Clipboard(e.to_string()))?;
        clipboard
            .set_image(image)
            .map_err(|e| Error::Clipboard(e.to_string()))
    }

    /// Save a received file into the download directory. Images go on the
    /// clipboard as bitmaps; anything else, or an image that cannot be
    /// decoded, puts the saved path on the clipboard.
    pub fn apply_file(&mut self, file: &ReceivedFile) -> Result<PathBuf> {
        let path = save_received(&self.download_dir, file)?;

        if file.kind == ContentKind::Image {
            match self.apply_image(&file.data) {
                Ok(()) => return Ok(path),
                Err(e) => tracing::warn!("{} not placed as an image: {}", file.file_name, e),
            }
        }

        let shown = path.to_string_lossy().to_string();

        self.last_hash = Some(checksum(shown.as_bytes()));
        if let Err(e) = self.write_text(&shown) {
            tracing::warn!("saved {} but could not update clipboard: {}", shown, e);
        }
        Ok(path)
    }
}

/// PNG-encode raw RGBA pixels.
fn encode_png(width: usize, height: usize, rgba: Vec<u8>) -> Result<Vec<u8>> {
    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(Error::Clipboard(format!("image too large: {}x{}", width, height))),
    };
    let buffer = image::RgbaImage::from_raw(w, h, rgba).ok_or_else(|| {
        Error::Clipboard(format!("pixel data does not match {}x{}", width, height))
    })?;

    let mut png = Cursor::new(Vec::new());
    buffer.write_to(&mut png, image::ImageFormat::Png)?;
    Ok(png.into_inner())
}

/// Decode an encoded image into RGBA pixels for the clipboard.
fn decode_image(data: &[u8]) -> Result<ImageData<'static>> {
    let rgba = image::load_from_memory(data)?.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(ImageData {
        width: width as usize,
        height: height as usize,
        bytes: Cow::Owned(rgba.into_raw()),
    })
}

/// Turn copied text into text or a file offer.
fn classify(text: String) -> ClipboardContent {
    let trimmed = text.trim();
    let candidate = trimmed
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(trimmed);

    if looks_like_file_path(candidate) {
        let path = expand_home(candidate);
        if path.is_file() {
            match std::fs::read(&path) {
                Ok(data) if !data.is_empty() => {
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    tracing::info!("detected file copy: {} ({} bytes)", file_name, data.len());
                    return ClipboardContent::File { path, file_name, data };
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("failed to read {}: {}", path.display(), e),
            }
        }
    }

    ClipboardContent::Text(text)
}

/// Single absolute path (Unix, home-relative, drive letter or UNC) with an
/// extension
fn looks_like_file_path(text: &str) -> bool {
    if text.contains('\n') || text.len() > MAX_PATH_LEN {
        return false;
    }

    let bytes = text.as_bytes();
    let windows = (bytes.len() >= 3 && bytes[1] == b':' && (bytes[2] == b'\\' || bytes[2] == b'/'))
        || text.starts_with("\\\\");
    let unix = text.starts_with('/') || text.starts_with("~/");
    if !windows && !unix {
        return false;
    }

    // Backslash-separated paths have no extension on Unix hosts otherwise
    let last = text.rsplit(['/', '\\']).next().unwrap_or(text);
    Path::new(last).extension().is_some()
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Write a received file under `dir` without clobbering existing files.
pub fn save_received(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    // Peers choose the name; keep only the final component
    let name = Path::new(&file.file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}.bin", file.file_id));

    let path = unique_path(dir, &name);
    std::fs::write(&path, &file.data)?;
    tracing::info!("file saved to {}", path.display());
    Ok(path)
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let original = Path::new(name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = original.extension().map(|e| e.to_string_lossy().to_string());

    (1..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Start a clipboard monitoring task that sends local changes to a channel
pub fn start_monitor(
    manager: Arc<Mutex<ClipboardManager>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> (mpsc::Receiver<ClipboardContent>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reported_error = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let change = manager.lock().await.check_change();
            match change {
                Ok(Some(content)) => {
                    reported_error = false;
                    if tx.send(content).await.is_err() {
                        // Receiver dropped, stop monitoring
                        break;
                    }
                }
                Ok(None) => reported_error = false,
                Err(e) => {
                    // Headless sessions fail on every poll; say it once
                    if !reported_error {
                        tracing::warn!("clipboard read error: {}", e);
                        reported_error = true;
                    }
                }
            }
        }
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    /// 2x2 RGBA: red, green, blue, half-transparent white
    fn pixels() -> Vec<u8> {
        vec![
            255, 0, 0, 255, 0, 255, 0, 255,
            0, 0, 255, 255, 255, 255, 255, 128,
        ]
    }

    fn bitmap(rgba: Vec<u8>) -> ImageData<'static> {
        ImageData { width: 2, height: 2, bytes: Cow::Owned(rgba) }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("clipshare-test-{}", uuid::Uuid::new_v4()))
    }

    fn received(name: &str, data: &[u8]) -> ReceivedFile {
        ReceivedFile {
            file_id: "f1".to_string(),
            file_name: name.to_string(),
            data: data.to_vec(),
            checksum: checksum(data),
            kind: ContentKind::from_file_name(name),
            source: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)),
        }
    }

    #[test]
    fn test_path_detection() {
        assert!(looks_like_file_path("/home/me/report.pdf"));
        assert!(looks_like_file_path("~/notes.txt"));
        assert!(looks_like_file_path("C:\\Users\\me\\photo.jpg"));
        assert!(looks_like_file_path("\\\\server\\share\\doc.docx"));
        assert!(!looks_like_file_path("/usr/bin"));
        assert!(!looks_like_file_path("just some words.txt"));
        assert!(!looks_like_file_path("/a.txt\n/b.txt"));
    }

    #[test]
    fn test_observe_suppresses_repeats() {
        let mut manager = ClipboardManager::new(scratch_dir());
        assert_eq!(
            manager.observe("hello".to_string()),
            Some(ClipboardContent::Text("hello".to_string()))
        );
        assert_eq!(manager.observe("hello".to_string()), None);
        assert!(manager.observe("world".to_string()).is_some());
    }

    #[test]
    fn test_applied_text_is_not_echoed() {
        let mut manager = ClipboardManager::new(scratch_dir());
        // Headless runners have no clipboard; the hash is recorded regardless
        let _ = manager.apply_text("from a peer");
        assert_eq!(manager.observe("from a peer".to_string()), None);
    }

    #[test]
    fn test_png_encoding_keeps_pixels() {
        let png = encode_png(2, 2, pixels()).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = decode_image(&png).unwrap();
        assert_eq!((decoded.width, decoded.height), (2, 2));
        assert_eq!(&*decoded.bytes, pixels().as_slice());

        assert!(encode_png(3, 3, pixels()).is_err());
        assert!(decode_image(b"not an image").is_err());
    }

    #[test]
    fn test_observe_image_suppresses_repeats() {
        let mut manager = ClipboardManager::new(scratch_dir());

        match manager.observe_image(bitmap(pixels())).unwrap() {
            Some(ClipboardContent::Image { file_name, data }) => {
                assert!(file_name.starts_with("clipboard_image_"));
                assert!(file_name.ends_with(".png"));
                assert_eq!(ContentKind::from_file_name(&file_name), ContentKind::Image);
                assert_eq!(&*decode_image(&data).unwrap().bytes, pixels().as_slice());
            }
            other => panic!("expected image, got {:?}", other),
        }
        assert_eq!(manager.observe_image(bitmap(pixels())).unwrap(), None);

        let mut changed = pixels();
        changed[0] = 0;
        assert!(manager.observe_image(bitmap(changed)).unwrap().is_some());
    }

    #[test]
    fn test_applied_image_is_not_echoed() {
        let mut manager = ClipboardManager::new(scratch_dir());
        let png = encode_png(2, 2, pixels()).unwrap();

        // Headless runners have no clipboard; the hash is recorded regardless
        let _ = manager.apply_image(&png);
        assert_eq!(manager.observe_image(bitmap(pixels())).unwrap(), None);
    }

    #[test]
    fn test_undecodable_image_falls_back_to_path() {
        let dir = scratch_dir();
        let mut manager = ClipboardManager::new(dir.clone());

        let path = manager.apply_file(&received("broken.png", b"not really a png")).unwrap();
        assert_eq!(path, dir.join("broken.png"));
        assert_eq!(manager.observe(path.to_string_lossy().to_string()), None);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_copied_file_path_becomes_file() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("notes.txt");
        std::fs::write(&path, b"remember the milk").unwrap();

        let copied = format!("\"{}\"", path.display());
        match classify(copied) {
            ClipboardContent::File { file_name, data, .. } => {
                assert_eq!(file_name, "notes.txt");
                assert_eq!(data, b"remember the milk");
            }
            other => panic!("expected file, got {:?}", other),
        }

        let missing = dir.join("missing.txt").display().to_string();
        assert_eq!(classify(missing.clone()), ClipboardContent::Text(missing));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_save_received_does_not_overwrite() {
        let dir = scratch_dir();

        let first = save_received(&dir, &received("photo.png", b"one")).unwrap();
        let second = save_received(&dir, &received("photo.png", b"two")).unwrap();

        assert_eq!(first, dir.join("photo.png"));
        assert_eq!(second, dir.join("photo (1).png"));
        assert_eq!(std::fs::read(&second).unwrap(), b"two");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_save_received_strips_directories() {
        let dir = scratch_dir();
        let path = save_received(&dir, &received("../../etc/passwd", b"x")).unwrap();
        assert_eq!(path, dir.join("passwd"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

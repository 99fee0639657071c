#![forbid(unsafe_code)]

//! Thin wrapper around the external `yt-dlp` executable.
//!
//! The tool is treated as a black box: we hand it a URL, read back its
//! `--dump-single-json` payload or its stdout byte stream, and never look at
//! how it resolved either. Only the handful of fields the API surfaces are
//! deserialized; everything else in the payload is ignored.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{self, Poll};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use url::Url;

/// Environment variable that points at an alternative extractor binary.
/// Unset means `yt-dlp` from `PATH`.
pub const YTDLP_BIN_ENV: &str = "SAVETUBE_YTDLP_BIN";

const WATCH_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];
const SHORT_HOST: &str = "youtu.be";

/// Handle on the extractor binary. Cheap to clone via `Arc`; holds no state
/// beyond the resolved program path, so concurrent callers never contend.
#[derive(Debug)]
pub struct VideoExtractor {
    program: PathBuf,
}

impl VideoExtractor {
    pub fn new() -> Self {
        let program = std::env::var(YTDLP_BIN_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));
        Self { program }
    }

    /// Builds an extractor around a specific executable instead of the
    /// environment-resolved one. Tests point this at stub scripts.
    pub fn with_program(program: PathBuf) -> Self {
        Self { program }
    }

    /// Resolves a video URL into the metadata subset this service reads.
    ///
    /// One fresh subprocess per call; nothing is cached, so two concurrent
    /// lookups for different videos cannot observe each other.
    pub async fn fetch_video_info(&self, url: &str) -> Result<InfoJson> {
        let output = Command::new(&self.program)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("launching {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "extractor failed for {} (status {}): {}",
                url,
                output.status,
                stderr.trim()
            );
        }

        serde_json::from_slice(&output.stdout).context("parsing extractor metadata payload")
    }

    /// Starts streaming one encoded variant, selected by its exact
    /// `format_id`. The returned stream yields bytes as the subprocess
    /// produces them; dropping it tears the subprocess down.
    pub async fn stream_format(&self, url: &str, format_id: &str) -> Result<FormatStream> {
        let mut child = Command::new(&self.program)
            .arg("-f")
            .arg(format_id)
            .arg("-o")
            .arg("-")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--quiet")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("launching {}", self.program.display()))?;

        let stdout = child
            .stdout
            .take()
            .context("extractor stdout pipe missing")?;

        Ok(FormatStream { _child: child, stdout })
    }
}

impl Default for VideoExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Live byte stream of one encoded variant.
///
/// Keeps the subprocess handle alive alongside its stdout pipe: the child is
/// killed when the stream is dropped, which is how a client disconnect
/// releases the upstream transfer.
pub struct FormatStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for FormatStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

/// Minimal slice of the extractor's `--dump-single-json` payload. Everything
/// is optional because older or region-locked videos ship partial metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct InfoJson {
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<ThumbnailEntry>,
    #[serde(default)]
    pub formats: Vec<FormatEntry>,
}

impl InfoJson {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .or(self.fulltitle.as_deref())
            .unwrap_or_default()
    }

    /// The extractor lists thumbnails in ascending quality; the last entry
    /// is the one the frontend shows.
    pub fn thumbnail_url(&self) -> Option<&str> {
        self.thumbnails
            .last()
            .and_then(|entry| entry.url.as_deref())
            .or(self.thumbnail.as_deref())
    }

    pub fn find_format(&self, format_id: &str) -> Option<&FormatEntry> {
        self.formats
            .iter()
            .find(|format| format.format_id.as_deref() == Some(format_id))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailEntry {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatEntry {
    pub format_id: Option<String>,
    pub height: Option<i64>,
    #[serde(rename = "format_note")]
    pub quality_label: Option<String>,
}

/// One entry of the resolution picker: the numeric stream identifier plus
/// its vertical resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub itag: i64,
    pub height: i64,
}

/// Collapses the raw format list into one representative per height.
///
/// Formats are visited in extractor output order and the first one seen for
/// each distinct height wins; the result keeps that first-seen order rather
/// than sorting by height. Iteration order is the documented tie-break here:
/// reordering would silently change which variant the frontend preselects.
/// Formats without a quality label, a height, or a numeric `format_id` never
/// qualify.
pub fn unique_resolutions(formats: &[FormatEntry]) -> Vec<Resolution> {
    let mut resolutions: Vec<Resolution> = Vec::new();
    for format in formats {
        let Some(label) = format.quality_label.as_deref() else {
            continue;
        };
        if label.is_empty() {
            continue;
        }
        let Some(height) = format.height else {
            continue;
        };
        let Some(itag) = format
            .format_id
            .as_deref()
            .and_then(|id| id.parse::<i64>().ok())
        else {
            continue;
        };
        if resolutions.iter().any(|entry| entry.height == height) {
            continue;
        }
        resolutions.push(Resolution { itag, height });
    }
    resolutions
}

/// Reduces a video title to the characters that survive every download
/// manager and filesystem: ASCII alphanumerics only.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title.chars().filter(char::is_ascii_alphanumeric).collect();
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned
    }
}

pub fn watch_url_for_id(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Syntactic check that a string is a YouTube video URL the extractor can
/// resolve. This runs before any subprocess is spawned, so malformed input
/// never costs an upstream round trip.
pub fn is_watch_url(raw: &str) -> bool {
    let Ok(parsed) = Url::parse(raw) else {
        return false;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };

    if host == SHORT_HOST {
        // Short links carry the id as the sole path segment.
        return parsed
            .path_segments()
            .and_then(|mut segments| segments.next().map(|segment| !segment.is_empty()))
            .unwrap_or(false);
    }

    if !WATCH_HOSTS.contains(&host) {
        return false;
    }

    match parsed.path() {
        "/watch" => parsed
            .query_pairs()
            .any(|(key, value)| key == "v" && !value.is_empty()),
        path => {
            let mut segments = path.trim_start_matches('/').splitn(2, '/');
            let kind = segments.next().unwrap_or_default();
            let id = segments.next().unwrap_or_default();
            matches!(kind, "shorts" | "embed" | "v") && !id.is_empty()
        }
    }
}

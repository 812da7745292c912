//! Input resolution: turn a user-supplied path or URL into a local PDF.
//!
//! pdfium needs a file-system path, so URLs and in-memory bytes are written
//! to a `TempDir` that lives as long as the [`ResolvedInput`]. Invoices often
//! arrive as spreadsheets or word-processor files; those are recognised by
//! extension and rejected with a message naming the conversion they need,
//! rather than failing later inside pdfium. The `%PDF` magic bytes are
//! checked before anything is rendered.

use crate::error::InvoiceError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// The resolved input: a local path, or a temp file that owns its directory.
#[derive(Debug)]
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was downloaded or supplied as bytes.
    /// The `TempDir` is kept alive until processing completes.
    Temporary { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    /// Path to the PDF regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Temporary { path, .. } => path,
        }
    }
}

/// What an input file is, judged by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Spreadsheet,
    WordProcessor,
    PlainText,
    /// No extension: trust the magic bytes.
    Unknown,
}

impl InputKind {
    pub fn from_path(path: &Path) -> Result<Self, InvoiceError> {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Ok(InputKind::Unknown);
        };
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Ok(InputKind::Pdf),
            "xlsx" | "xls" => Ok(InputKind::Spreadsheet),
            "doc" | "docx" => Ok(InputKind::WordProcessor),
            "txt" => Ok(InputKind::PlainText),
            other => Err(InvoiceError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension: other.to_string(),
            }),
        }
    }

    fn format_name(self) -> Option<&'static str> {
        match self {
            InputKind::Spreadsheet => Some("spreadsheet"),
            InputKind::WordProcessor => Some("word-processor"),
            InputKind::PlainText => Some("plain-text"),
            InputKind::Pdf | InputKind::Unknown => None,
        }
    }
}

/// Fail unless `path` names something that can be rasterised directly.
pub fn ensure_pdf_kind(path: &Path) -> Result<(), InvoiceError> {
    let kind = InputKind::from_path(path)?;
    match kind.format_name() {
        Some(format) => Err(InvoiceError::ConversionRequired {
            path: path.to_path_buf(),
            format: format.to_string(),
        }),
        None => Ok(()),
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a local PDF file path.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, InvoiceError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else if input.trim().is_empty() {
        Err(InvoiceError::InvalidInput {
            input: input.to_string(),
        })
    } else {
        resolve_local(input)
    }
}

/// Write in-memory PDF bytes to a temp file.
pub fn resolve_bytes(bytes: &[u8]) -> Result<ResolvedInput, InvoiceError> {
    let temp_dir = TempDir::new().map_err(|e| InvoiceError::Internal(e.to_string()))?;
    let path = temp_dir.path().join("invoice.pdf");
    check_magic(&path, bytes)?;
    std::fs::write(&path, bytes)
        .map_err(|e| InvoiceError::Internal(format!("Failed to write temp file: {}", e)))?;
    Ok(ResolvedInput::Temporary {
        path,
        _temp_dir: temp_dir,
    })
}

fn check_magic(path: &Path, bytes: &[u8]) -> Result<(), InvoiceError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(InvoiceError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

/// Resolve a local file path, validating extension, existence and magic bytes.
fn resolve_local(path_str: &str) -> Result<ResolvedInput, InvoiceError> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(InvoiceError::FileNotFound { path });
    }
    ensure_pdf_kind(&path)?;

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            let n = f.read(&mut magic).unwrap_or(0);
            check_magic(&path, &magic[..n])?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(InvoiceError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(InvoiceError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Download a URL to a temporary directory and return the path.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, InvoiceError> {
    info!("Downloading invoice from: {}", url);

    let parsed = reqwest::Url::parse(url).map_err(|_| InvoiceError::InvalidInput {
        input: url.to_string(),
    })?;
    let filename = filename_from_url(&parsed);
    ensure_pdf_kind(Path::new(&filename))?;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| InvoiceError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(parsed).send().await.map_err(|e| {
        if e.is_timeout() {
            InvoiceError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            InvoiceError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(InvoiceError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| InvoiceError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let temp_dir = TempDir::new().map_err(|e| InvoiceError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);
    check_magic(&file_path, &bytes)?;

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| InvoiceError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded to: {}", file_path.display());
    Ok(ResolvedInput::Temporary {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment when it looks like a file name, else `invoice.pdf`.
fn filename_from_url(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|last| !last.is_empty() && last.contains('.'))
        .map(str::to_string)
        .unwrap_or_else(|| "invoice.pdf".to_string())
}

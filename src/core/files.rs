use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

/// Save an uploaded file into the uploads directory under a unique name.
/// The original name is kept recognisable; a uuid suffix rules out both
/// collisions and TOCTOU races with concurrent uploads.
pub fn save_upload(uploads_dir: &Path, data: &[u8], filename: &str, max_bytes: u64) -> Result<PathBuf> {
    if data.len() as u64 > max_bytes {
        anyhow::bail!(
            "File too large: {} bytes (max {} bytes)",
            data.len(),
            max_bytes
        );
    }

    // Strip path components to prevent traversal.
    let safe_name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    let safe_name = if safe_name.is_empty() || safe_name.starts_with('.') {
        format!("upload{safe_name}")
    } else {
        safe_name
    };

    let stem = Path::new(&safe_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("upload");
    let ext = Path::new(&safe_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let unique = format!(
        "{stem}_{}{ext}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    let dest = uploads_dir.join(unique);

    std::fs::create_dir_all(uploads_dir)?;
    std::fs::write(&dest, data)?;
    info!("Saved upload: {} ({} bytes)", dest.display(), data.len());
    Ok(dest)
}

/// Read file content as text, truncating to `max_chars`. Binary files get
/// a placeholder description instead of garbage.
pub fn get_file_content(path: &Path, max_chars: usize) -> String {
    match std::fs::read(path) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => {
                if text.chars().count() > max_chars {
                    let head: String = text.chars().take(max_chars).collect();
                    format!("{head}\n... (truncated, {} total chars)", text.chars().count())
                } else {
                    text
                }
            }
            Err(_) => {
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                format!(
                    "[Binary file: {}, {size} bytes]",
                    path.file_name().and_then(|n| n.to_str()).unwrap_or("?")
                )
            }
        },
        Err(_) => String::new(),
    }
}

/// Metadata for a data file, extracted without loading it into memory.
#[derive(Debug, Default)]
pub struct FileMetadata {
    pub name: String,
    pub size_bytes: u64,
    pub size_human: String,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub sample_rows: Vec<Vec<String>>,
}

fn human_size(size: u64) -> String {
    if size < 1_000_000 {
        format!("{:.1}KB", size as f64 / 1024.0)
    } else {
        format!("{:.1}MB", size as f64 / 1_048_576.0)
    }
}

/// Extract header, row count, and a small sample from csv/tsv/json files.
/// Other formats report size only; the generated code processes them
/// locally instead.
pub fn get_file_metadata(path: &Path) -> FileMetadata {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mut meta = FileMetadata {
        name: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("?")
            .to_string(),
        size_bytes: size,
        size_human: human_size(size),
        ..Default::default()
    };

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let outcome: Result<()> = (|| {
        match ext {
            "csv" | "tsv" => {
                let sep = if ext == "tsv" { '\t' } else { ',' };
                let content = std::fs::read_to_string(path)?;
                let mut lines = content.lines();
                if let Some(header) = lines.next() {
                    meta.columns = header.split(sep).map(|c| c.trim().to_string()).collect();
                }
                let mut count = 0usize;
                for line in lines {
                    if count < 5 {
                        meta.sample_rows
                            .push(line.split(sep).map(|c| c.to_string()).collect());
                    }
                    count += 1;
                }
                meta.row_count = count;
            }
            "json" => {
                let content = std::fs::read_to_string(path)?;
                let value: serde_json::Value = serde_json::from_str(&content)?;
                match value {
                    serde_json::Value::Array(items) => {
                        meta.row_count = items.len();
                        if let Some(serde_json::Value::Object(first)) = items.first() {
                            meta.columns = first.keys().cloned().collect();
                            for item in items.iter().take(5) {
                                if let serde_json::Value::Object(obj) = item {
                                    meta.sample_rows.push(
                                        obj.values().map(|v| v.to_string()).collect(),
                                    );
                                }
                            }
                        }
                    }
                    serde_json::Value::Object(obj) => {
                        meta.columns = obj.keys().cloned().collect();
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    })();

    if let Err(e) = outcome {
        warn!("Failed to extract metadata from {}: {e}", meta.name);
    }
    meta
}

/// Format file metadata for a planner prompt: shape and sample only,
/// never the raw data.
pub fn format_metadata_for_prompt(path: &Path) -> String {
    let meta = get_file_metadata(path);
    let mut head = format!("--- File: {} ({}", meta.name, meta.size_human);
    if meta.row_count > 0 {
        head.push_str(&format!(", ~{} data rows", meta.row_count));
    }
    head.push_str(") ---");

    let mut parts = vec![head];
    if !meta.columns.is_empty() {
        parts.push(format!("Columns: {:?}", meta.columns));
    }
    if !meta.sample_rows.is_empty() {
        parts.push(format!(
            "Sample (first {} rows): {:?}",
            meta.sample_rows.len(),
            meta.sample_rows
        ));
    }
    parts.push(
        "DO NOT load this file into context. Write a script to process it locally.".to_string(),
    );
    parts.join("\n")
}

/// Data-file extensions whose content never goes into a prompt verbatim.
pub fn is_data_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("csv" | "tsv" | "xlsx" | "parquet" | "json")
    )
}

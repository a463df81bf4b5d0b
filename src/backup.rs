use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/schoolbook.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "schoolbook-workspace-v1";

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join("schoolbook.sqlite3");
    let db_bytes = std::fs::metadata(&db_path)
        .map(|m| m.len())
        .map_err(|_| anyhow!("workspace database not found: {}", db_path.to_string_lossy()))?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create bundle {}", out_path.to_string_lossy()))?;

    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "dbBytes": db_bytes,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(manifest.to_string().as_bytes())
        .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        db_bytes,
    })
}

/// Accepts either a v1 bundle or a plain sqlite file (a copy someone made by
/// hand). The live database is only replaced after the new file is fully
/// extracted.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join("schoolbook.sqlite3");

    if !is_zip_file(in_path)? {
        std::fs::copy(in_path, &dst).with_context(|| {
            format!("failed to copy sqlite backup {}", in_path.to_string_lossy())
        })?;
        return Ok(ImportSummary {
            bundle_format_detected: "plain-sqlite3".to_string(),
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let manifest = read_manifest(&mut archive)?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let staging = workspace_path.join("schoolbook.sqlite3.importing");
    if staging.exists() {
        let _ = std::fs::remove_file(&staging);
    }
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .with_context(|| format!("bundle missing {}", DB_ENTRY))?;
        let mut staged = File::create(&staging).with_context(|| {
            format!("failed to stage database {}", staging.to_string_lossy())
        })?;
        std::io::copy(&mut db_entry, &mut staged).context("failed to extract database entry")?;
        staged.flush().context("failed to flush staged database")?;
    }

    if dst.exists() {
        std::fs::remove_file(&dst)
            .with_context(|| format!("failed to replace {}", dst.to_string_lossy()))?;
    }
    std::fs::rename(&staging, &dst)
        .with_context(|| format!("failed to move database into {}", dst.to_string_lossy()))?;

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
    })
}

fn read_manifest(archive: &mut ZipArchive<File>) -> anyhow::Result<serde_json::Value> {
    let mut text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut text)
        .context("failed to read manifest.json")?;
    serde_json::from_str(&text).context("manifest.json is invalid JSON")
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    Ok(read == 4 && sig == ZIP_MAGIC)
}

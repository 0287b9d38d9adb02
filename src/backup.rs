use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DB_FILE: &str = "timetable.sqlite3";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/timetable.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT_V1: &str = "timetabled-workspace-v1";
pub const LEGACY_SQLITE_FORMAT: &str = "legacy-sqlite3";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

/// `manifest.json`. Only `format` is required on import; the checksum and
/// size are verified when present.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleManifest {
    format: String,
    #[serde(default)]
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exported_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    db_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    db_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceMeta<'a> {
    source_workspace: String,
    db_file: &'a str,
}

/// Passes writes through to `inner` while hashing them.
struct Sha256Writer<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Sha256Writer<W> {
    fn new(inner: W) -> Self {
        Sha256Writer {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Lowercase hex digest and byte count.
    fn finish(mut self) -> io::Result<(String, u64)> {
        self.inner.flush()?;
        Ok((format!("{:x}", self.hasher.finalize()), self.written))
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn write_json_entry<W: Write + Seek, T: Serialize>(
    zip: &mut ZipWriter<W>,
    name: &str,
    value: &T,
    opts: FileOptions,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(value).with_context(|| format!("failed to serialize {}", name))?;
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start {} entry", name))?;
    zip.write_all(&body)
        .with_context(|| format!("failed to write {} entry", name))?;
    Ok(())
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("workspace database not found: {}", db_path.to_string_lossy()))?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    // Database first: the manifest records its digest.
    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut hashing = Sha256Writer::new(&mut zip);
    io::copy(&mut db_file, &mut hashing).context("failed to write database entry")?;
    let (db_sha256, db_bytes) = hashing.finish().context("failed to write database entry")?;

    let manifest = BundleManifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        version: 1,
        app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        exported_at: Some(chrono::Utc::now().to_rfc3339()),
        db_sha256: Some(db_sha256.clone()),
        db_bytes: Some(db_bytes),
    };
    write_json_entry(&mut zip, MANIFEST_ENTRY, &manifest, opts)?;
    let meta = WorkspaceMeta {
        source_workspace: workspace_path.to_string_lossy().into_owned(),
        db_file: DB_FILE,
    };
    write_json_entry(&mut zip, META_WORKSPACE_ENTRY, &meta, opts)?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3,
        db_sha256,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackupKind {
    Bundle,
    RawSqlite,
}

fn sniff_backup_kind(path: &Path) -> anyhow::Result<BackupKind> {
    let f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut head = Vec::with_capacity(SQLITE_MAGIC.len());
    f.take(SQLITE_MAGIC.len() as u64)
        .read_to_end(&mut head)
        .context("failed to read file signature")?;
    if head.starts_with(ZIP_MAGIC) {
        Ok(BackupKind::Bundle)
    } else if head.starts_with(SQLITE_MAGIC) {
        Ok(BackupKind::RawSqlite)
    } else {
        bail!(
            "{} is neither a workspace bundle nor a SQLite database",
            path.to_string_lossy()
        )
    }
}

fn read_manifest<R: Read + Seek>(archive: &mut ZipArchive<R>) -> anyhow::Result<BundleManifest> {
    let entry = archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?;
    let manifest: BundleManifest =
        serde_json::from_reader(entry).context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        bail!("unsupported bundle format: {}", manifest.format);
    }
    Ok(manifest)
}

fn extract_verified_db(in_path: &Path, staged: &Path) -> anyhow::Result<()> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;
    let manifest = read_manifest(&mut archive)?;

    let out = File::create(staged)
        .with_context(|| format!("failed to create temp database {}", staged.to_string_lossy()))?;
    let mut hashing = Sha256Writer::new(out);
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/timetable.sqlite3")?;
        io::copy(&mut db_entry, &mut hashing).context("failed to extract database entry")?;
    }
    let (actual_sha, actual_bytes) = hashing
        .finish()
        .context("failed to flush extracted database")?;

    if let Some(expected) = manifest.db_sha256.as_deref() {
        if !expected.eq_ignore_ascii_case(&actual_sha) {
            return Err(anyhow!(
                "database checksum mismatch: manifest {}, bundle {}",
                expected,
                actual_sha
            ));
        }
    }
    if let Some(expected) = manifest.db_bytes {
        if expected != actual_bytes {
            bail!("database size mismatch: manifest {} bytes, bundle {}", expected, actual_bytes);
        }
    }
    Ok(())
}

/// Replaces the workspace database with `in_path`, which is either a bundle
/// from `export_workspace_bundle` or a bare SQLite file. The new database is
/// staged next to the old one and only moved into place once complete.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let kind = sniff_backup_kind(in_path)?;
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!("failed to create workspace {}", workspace_path.to_string_lossy())
    })?;
    let dst = workspace_path.join(DB_FILE);
    let staged = workspace_path.join(format!("{}.importing", DB_FILE));
    if staged.exists() {
        let _ = std::fs::remove_file(&staged);
    }

    let staged_result = match kind {
        BackupKind::Bundle => extract_verified_db(in_path, &staged),
        BackupKind::RawSqlite => std::fs::copy(in_path, &staged)
            .map(|_| ())
            .with_context(|| format!("failed to copy sqlite backup {}", in_path.to_string_lossy())),
    };
    if let Err(e) = staged_result {
        let _ = std::fs::remove_file(&staged);
        return Err(e);
    }

    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!("failed to remove existing database {}", dst.to_string_lossy())
        })?;
    }
    std::fs::rename(&staged, &dst).with_context(|| {
        format!("failed to move imported database to {}", dst.to_string_lossy())
    })?;

    let detected = match kind {
        BackupKind::Bundle => BUNDLE_FORMAT_V1,
        BackupKind::RawSqlite => LEGACY_SQLITE_FORMAT,
    };
    Ok(ImportSummary {
        bundle_format_detected: detected.to_string(),
    })
}

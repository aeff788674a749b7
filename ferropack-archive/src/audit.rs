//! The audit pass: a read-only walk that produces a schema-stable report.
//!
//! Detection, per-entry security and integrity checks, and a summary with
//! stable issue codes. Offsets serialize as base-10 strings so 64-bit values
//! survive JSON consumers, and `details` keys never shadow top-level report
//! keys.

use crate::detect::ArchiveFormat;
use crate::facade::{load, ArchiveContents, OpenOptions};
use crate::normalize::collision_key;
use ferropack_core::entry::{ArchiveEntry, CompressionMethod};
use ferropack_core::error::{ArchiveError, Result};
use ferropack_core::limits::Profile;
use serde::Serialize;
use std::collections::BTreeMap;

/// Issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Suspicious but readable.
    Warning,
    /// The archive is damaged, unsafe, or not fully readable.
    Error,
}

/// One audit finding.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditIssue {
    /// Stable issue code, e.g. `ZIP_BAD_CRC`.
    pub code: String,
    /// Severity.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Affected entry, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_name: Option<String>,
    /// Container offset as a base-10 string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    /// Extra string-only details.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl AuditIssue {
    fn new(code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: message.into(),
            entry_name: None,
            offset: None,
            details: BTreeMap::new(),
        }
    }

    fn for_entry(mut self, entry: &ArchiveEntry) -> Self {
        self.entry_name = Some(entry.name.clone());
        self.offset = Some(entry.header_offset.to_string());
        self
    }

    fn detail(mut self, key: &str, value: impl Into<String>) -> Self {
        let mut key = key.to_string();
        if matches!(
            key.as_str(),
            "code" | "severity" | "message" | "entryName" | "offset" | "details"
        ) {
            key.insert_str(0, "ctx.");
        }
        self.details.insert(key, value.into());
        self
    }
}

/// Report totals.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    /// Total entries observed.
    pub entries: u64,
    /// Encrypted entries.
    pub encrypted_entries: u64,
    /// Entries this build cannot decode.
    pub unsupported_entries: u64,
    /// Warning-severity issues.
    pub warnings: u64,
    /// Error-severity issues.
    pub errors: u64,
    /// Bytes after the container's end structure, as a base-10 string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_bytes: Option<String>,
}

/// Detection section of the report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    /// How the input was provided.
    pub input_kind: String,
    /// Innermost recognized format.
    pub format: String,
    /// Compression layers, outside-in.
    pub layers: Vec<String>,
}

/// The complete audit report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    /// Report schema version; always `"1"`.
    pub schema_version: String,
    /// Detection results.
    pub detection: DetectionReport,
    /// Issues, in discovery order.
    pub issues: Vec<AuditIssue>,
    /// Totals.
    pub summary: AuditSummary,
    /// Whether the archive is readable without errors.
    pub ok: bool,
}

impl AuditReport {
    /// Render the schema-versioned JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("report serialization is infallible")
    }
}

fn finalize(detection: DetectionReport, issues: Vec<AuditIssue>, mut summary: AuditSummary) -> AuditReport {
    summary.warnings = issues
        .iter()
        .filter(|i| i.severity == Severity::Warning)
        .count() as u64;
    summary.errors = issues
        .iter()
        .filter(|i| i.severity == Severity::Error)
        .count() as u64;
    AuditReport {
        schema_version: "1".to_string(),
        detection,
        ok: summary.errors == 0,
        issues,
        summary,
    }
}

fn error_issue(err: &ArchiveError) -> AuditIssue {
    let mut issue = AuditIssue::new(err.code().as_str(), Severity::Error, err.to_string());
    if let Some(context) = err.context() {
        for (key, value) in context {
            issue = issue.detail(key, value.clone());
        }
    }
    issue
}

/// Audit an in-memory input.
///
/// The audit's contract is to report structural anomalies, not abort on
/// them, so the underlying load always runs under the `compat` profile;
/// the caller's profile still governs the resource limits it carries.
pub fn audit_bytes(data: &[u8], options: &OpenOptions) -> Result<AuditReport> {
    let mut load_options = options.clone();
    load_options.profile = Profile::Compat;
    let loaded = match load(data, &load_options, false) {
        Ok(loaded) => loaded,
        Err(err) => {
            let detection = DetectionReport {
                input_kind: "bytes".to_string(),
                format: "unknown".to_string(),
                layers: Vec::new(),
            };
            return Ok(finalize(
                detection,
                vec![error_issue(&err)],
                AuditSummary::default(),
            ));
        }
    };

    let detection = DetectionReport {
        input_kind: loaded.detection.input_kind.as_str().to_string(),
        format: loaded.detection.format.as_str().to_string(),
        layers: loaded
            .detection
            .layers
            .iter()
            .map(|l| l.as_str().to_string())
            .collect(),
    };

    let mut issues = Vec::new();
    let mut summary = AuditSummary::default();

    match &loaded.contents {
        ArchiveContents::Zip {
            entries,
            notes,
            trailing_bytes,
            ..
        } => {
            for note in notes {
                let mut issue = AuditIssue::new(note.code, Severity::Warning, note.message.clone());
                issue.offset = note.offset.map(|o| o.to_string());
                issues.push(issue);
            }
            if *trailing_bytes > 0 {
                summary.trailing_bytes = Some(trailing_bytes.to_string());
            }
            audit_entries(entries, ArchiveFormat::Zip, options, &mut issues, &mut summary);
        }
        ArchiveContents::Tar(archive) => {
            if !archive.terminated {
                issues.push(AuditIssue::new(
                    "TAR_MISSING_TERMINATOR",
                    Severity::Warning,
                    "archive ends without the two terminator blocks",
                ));
            }
            if archive.trailing_bytes > 0 {
                summary.trailing_bytes = Some(archive.trailing_bytes.to_string());
                issues.push(AuditIssue::new(
                    "TAR_TRAILING_BYTES",
                    Severity::Warning,
                    format!(
                        "{} byte(s) after the archive terminator",
                        archive.trailing_bytes
                    ),
                ));
            }
            let entries: Vec<ArchiveEntry> =
                archive.entries.iter().map(|e| e.entry.clone()).collect();
            audit_entries(&entries, ArchiveFormat::Tar, options, &mut issues, &mut summary);
        }
        ArchiveContents::Stream { .. } => {}
    }

    Ok(finalize(detection, issues, summary))
}

fn audit_entries(
    entries: &[ArchiveEntry],
    format: ArchiveFormat,
    options: &OpenOptions,
    issues: &mut Vec<AuditIssue>,
    summary: &mut AuditSummary,
) {
    let prefix = match format {
        ArchiveFormat::Zip => "ZIP",
        _ => "TAR",
    };
    summary.entries = entries.len() as u64;

    let mut seen_names: BTreeMap<&str, &ArchiveEntry> = BTreeMap::new();
    let mut fold_keys: BTreeMap<String, &ArchiveEntry> = BTreeMap::new();

    for entry in entries {
        if let Some(violation) = entry.path_violation() {
            let code = match violation {
                ferropack_core::entry::PathViolation::NulByte => {
                    format!("{prefix}_NUL_IN_NAME")
                }
                _ => format!("{prefix}_PATH_TRAVERSAL"),
            };
            issues.push(
                AuditIssue::new(
                    &code,
                    Severity::Error,
                    format!("unsafe entry path ({})", violation.describe()),
                )
                .for_entry(entry),
            );
        }

        if entry.encrypted {
            summary.encrypted_entries += 1;
            if options.password.is_none() {
                issues.push(
                    AuditIssue::new(
                        &format!("{prefix}_ENCRYPTED_ENTRY"),
                        Severity::Warning,
                        "encrypted entry cannot be verified without a password",
                    )
                    .for_entry(entry),
                );
            }
        }

        if let CompressionMethod::Unknown(id) = entry.method {
            summary.unsupported_entries += 1;
            issues.push(
                AuditIssue::new(
                    &format!("{prefix}_UNSUPPORTED_METHOD"),
                    Severity::Warning,
                    format!("no codec registered for method id {id}"),
                )
                .for_entry(entry)
                .detail("methodId", id.to_string()),
            );
        }

        if entry.is_symlink() {
            issues.push(
                AuditIssue::new(
                    &format!("{prefix}_SYMLINK"),
                    Severity::Info,
                    format!(
                        "symlink to {}",
                        entry.link_target.as_deref().unwrap_or("<empty>")
                    ),
                )
                .for_entry(entry),
            );
        }

        if entry.size > options.limits.max_entry_uncompressed_bytes {
            issues.push(
                AuditIssue::new(
                    "COMPRESSION_RESOURCE_LIMIT",
                    Severity::Error,
                    format!(
                        "declared size {} exceeds the per-entry limit {}",
                        entry.size, options.limits.max_entry_uncompressed_bytes
                    ),
                )
                .for_entry(entry)
                .detail("requiredEntryUncompressedBytes", entry.size.to_string())
                .detail(
                    "limitEntryUncompressedBytes",
                    options.limits.max_entry_uncompressed_bytes.to_string(),
                ),
            );
        } else if entry.compressed_size > 0
            && entry.expansion_ratio() > options.limits.max_compression_ratio
        {
            issues.push(
                AuditIssue::new(
                    "COMPRESSION_RESOURCE_LIMIT",
                    Severity::Warning,
                    format!(
                        "declared expansion ratio {} exceeds the limit {}",
                        entry.expansion_ratio(),
                        options.limits.max_compression_ratio
                    ),
                )
                .for_entry(entry),
            );
        }

        if let Some(previous) = seen_names.get(entry.name.as_str()) {
            issues.push(
                AuditIssue::new(
                    &format!("{prefix}_DUPLICATE_ENTRY"),
                    Severity::Error,
                    format!("duplicate entry path {:?}", entry.name),
                )
                .for_entry(entry)
                .detail("firstOffset", previous.header_offset.to_string()),
            );
        } else {
            seen_names.insert(entry.name.as_str(), entry);

            let key = collision_key(&entry.name);
            if let Some(previous) = fold_keys.get(&key) {
                if previous.name != entry.name {
                    issues.push(
                        AuditIssue::new(
                            &format!("{prefix}_UNICODE_COLLISION"),
                            Severity::Error,
                            format!(
                                "entries {:?} and {:?} collide after Unicode case folding",
                                previous.name, entry.name
                            ),
                        )
                        .for_entry(entry)
                        .detail("nameA", previous.name.clone())
                        .detail("nameB", entry.name.clone())
                        .detail("key", key.clone()),
                    );
                }
            } else {
                fold_keys.insert(key, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar::{TarEntryOptions, TarWriter};
    use crate::zip::{EntryOptions, Encryption, ZipWriter};
    use ferropack_core::sink::VecSink;

    fn audit(data: &[u8]) -> AuditReport {
        audit_bytes(data, &OpenOptions::default()).unwrap()
    }

    fn zip_with(names: &[&str]) -> Vec<u8> {
        let mut writer = ZipWriter::new(VecSink::new());
        for name in names {
            writer.add(name, b"data", &EntryOptions::stored()).unwrap();
        }
        writer.into_sink().unwrap().into_vec()
    }

    #[test]
    fn test_clean_zip_report() {
        let report = audit(&zip_with(&["a.txt", "b/c.txt"]));
        assert!(report.ok);
        assert_eq!(report.schema_version, "1");
        assert_eq!(report.detection.format, "zip");
        assert_eq!(report.summary.entries, 2);
        assert_eq!(report.summary.errors, 0);
        let json = report.to_json();
        assert_eq!(json["schemaVersion"], "1");
        assert_eq!(json["summary"]["entries"], 2);
        assert_eq!(json["ok"], true);
    }

    #[test]
    fn test_unicode_collision_detected() {
        // NFC "café.txt" and NFD "cafe\u{301}.txt" collide after folding.
        let report = audit(&zip_with(&["café.txt", "cafe\u{301}.txt"]));
        assert!(!report.ok);
        let issue = report
            .issues
            .iter()
            .find(|i| i.code == "ZIP_UNICODE_COLLISION")
            .expect("collision issue present");
        assert_eq!(issue.severity, Severity::Error);
        assert_eq!(issue.details.get("nameA").unwrap(), "café.txt");
        assert_eq!(issue.details.get("nameB").unwrap(), "cafe\u{301}.txt");
        assert_eq!(issue.details.get("key").unwrap(), "café.txt");
    }

    #[test]
    fn test_duplicate_entries_detected() {
        let report = audit(&zip_with(&["same.txt", "same.txt"]));
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "ZIP_DUPLICATE_ENTRY" && i.severity == Severity::Error));
    }

    #[test]
    fn test_traversal_detected_in_tar() {
        let mut writer = TarWriter::new(VecSink::new());
        writer
            .add_file("../escape.txt", b"x", &TarEntryOptions::default())
            .unwrap();
        let bytes = writer.into_sink().unwrap().into_vec();
        let report = audit(&bytes);
        assert!(!report.ok);
        let issue = report
            .issues
            .iter()
            .find(|i| i.code == "TAR_PATH_TRAVERSAL")
            .expect("traversal issue");
        assert_eq!(issue.entry_name.as_deref(), Some("../escape.txt"));
        // Offsets are strings.
        assert!(issue.offset.as_deref().unwrap().parse::<u64>().is_ok());
    }

    #[test]
    fn test_encrypted_entry_counted() {
        let mut writer = ZipWriter::new(VecSink::new());
        writer
            .add(
                "s.txt",
                b"secret",
                &EntryOptions {
                    encryption: Encryption::ZipCrypto {
                        password: b"pw".to_vec(),
                    },
                    ..EntryOptions::stored()
                },
            )
            .unwrap();
        let report = audit(&writer.into_sink().unwrap().into_vec());
        assert_eq!(report.summary.encrypted_entries, 1);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "ZIP_ENCRYPTED_ENTRY"));
        // Encrypted-without-password is a warning, not an error.
        assert!(report.ok);
    }

    #[test]
    fn test_layered_tar_gz_detection() {
        let mut writer = TarWriter::new(VecSink::new());
        writer
            .add_file("f.txt", b"layered", &TarEntryOptions::default())
            .unwrap();
        let tar = writer.into_sink().unwrap().into_vec();
        let gz = crate::codec::Codec::Gzip.compress(&tar, 6).unwrap();
        let report = audit(&gz);
        assert_eq!(report.detection.layers, vec!["gzip".to_string()]);
        assert_eq!(report.detection.format, "tar");
        assert_eq!(report.summary.entries, 1);
    }

    #[test]
    fn test_trailing_bytes_reported_not_fatal() {
        let mut bytes = zip_with(&["a.txt"]);
        bytes.extend_from_slice(b"GARBAGE AFTER EOCD");
        // The caller's options are strict by default; the audit must still
        // produce a full report rather than abort on the tail anomaly.
        let report = audit(&bytes);
        assert!(report.ok);
        assert_eq!(report.summary.entries, 1);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "ZIP_EOCD_NOT_AT_EOF" && i.severity == Severity::Warning));
        assert_eq!(report.summary.trailing_bytes.as_deref(), Some("18"));
    }

    #[test]
    fn test_duplicate_eocd_reported_not_fatal() {
        let mut writer = ZipWriter::new(VecSink::new());
        writer
            .add("a.txt", b"data", &EntryOptions::stored())
            .unwrap();
        // An archive comment that is itself a complete EOCD record ending
        // at EOF, so two records are genuinely ambiguous.
        let mut fake = Vec::new();
        fake.extend_from_slice(&0x06054B50u32.to_le_bytes());
        fake.extend_from_slice(&[0u8; 18]);
        let comment = String::from_utf8(fake).unwrap();
        writer.close(Some(&comment)).unwrap();
        let bytes = writer.into_sink().unwrap().into_vec();

        let report = audit(&bytes);
        assert!(report.ok);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "ZIP_MULTIPLE_EOCD" && i.severity == Severity::Warning));
    }

    #[test]
    fn test_unknown_input_reports_error() {
        let report = audit(&[0x42u8; 100]);
        assert!(!report.ok);
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "ARCHIVE_UNKNOWN_FORMAT"));
    }

    #[test]
    fn test_details_never_shadow_top_level_keys() {
        let issue = AuditIssue::new("X", Severity::Info, "m").detail("code", "sneaky");
        assert!(issue.details.contains_key("ctx.code"));
        assert!(!issue.details.contains_key("code"));
    }
}

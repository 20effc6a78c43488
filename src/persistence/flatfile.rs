//! Line-oriented registry layout: `owner|instance_id|credential`
//!
//! Used to migrate an existing flat-file registry in, and to publish a
//! snapshot for tools that read the flat layout. Exports replace the target
//! through a temporary file in the same directory, so readers see either the
//! old file or the new one, never a partial write.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{info, warn};

use super::database::InstanceRegistry;
use crate::core::{InstanceRecord, QuotaEnforcer, FIELD_DELIMITER};
use crate::error::RegistryError;

/// Result of importing a flat-file registry
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Records added to the registry
    pub imported: usize,
    /// 1-based line numbers that could not be parsed
    pub malformed: Vec<usize>,
    /// Instance ids that were already registered
    pub duplicates: Vec<String>,
    /// 1-based line numbers whose owner had no quota left
    pub over_quota: Vec<usize>,
}

/// Parse one line; `None` for blank or malformed lines
pub fn parse_line(line: &str) -> Option<InstanceRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let fields: Vec<&str> = line.split(FIELD_DELIMITER).map(str::trim).collect();
    let [owner, instance_id, credential] = fields.as_slice() else {
        return None;
    };
    let record = InstanceRecord::new(*owner, *instance_id, *credential);
    record.validate().ok()?;
    Some(record)
}

/// Render records in the flat layout, one per line
pub fn render(records: &[InstanceRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.owner);
        out.push(FIELD_DELIMITER);
        out.push_str(&record.instance_id);
        out.push(FIELD_DELIMITER);
        out.push_str(&record.credential);
        out.push('\n');
    }
    out
}

/// Insert every record of a flat-file registry that fits its owner's quota
pub fn import(
    path: &Path,
    registry: &InstanceRegistry,
    quota: &QuotaEnforcer,
) -> Result<ImportReport, RegistryError> {
    let content = std::fs::read_to_string(path)?;
    let mut report = ImportReport::default();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(record) = parse_line(line) else {
            warn!("Skipping malformed registry line {}", idx + 1);
            report.malformed.push(idx + 1);
            continue;
        };
        match quota.admit(registry, &record) {
            Ok(()) => report.imported += 1,
            Err(RegistryError::QuotaFull { owner, limit }) => {
                warn!(
                    "{} already holds {} instances, line {} skipped",
                    owner,
                    limit,
                    idx + 1
                );
                report.over_quota.push(idx + 1);
            }
            Err(RegistryError::DuplicateId(id)) => {
                warn!("Instance {} already registered, line {} skipped", id, idx + 1);
                report.duplicates.push(id);
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        "Imported {} records from {:?} ({} malformed, {} duplicate, {} over quota)",
        report.imported,
        path,
        report.malformed.len(),
        report.duplicates.len(),
        report.over_quota.len()
    );
    Ok(report)
}

/// Atomically replace `path` with a snapshot of the registry
pub fn export(registry: &InstanceRegistry, path: &Path) -> Result<usize, RegistryError> {
    let records = registry.list_all()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(render(&records).as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    info!("Exported {} records to {:?}", records.len(), path);
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let record = parse_line("alice|c1a2b3|ssh c1a2@host\n").unwrap();
        assert_eq!(record.owner, "alice");
        assert_eq!(record.instance_id, "c1a2b3");
        assert_eq!(record.credential, "ssh c1a2@host");

        assert!(parse_line("").is_none());
        assert!(parse_line("alice|c1a2b3").is_none());
        assert!(parse_line("alice|c1a2b3|ssh|extra").is_none());
        assert!(parse_line("alice||ssh x@host").is_none());
    }

    #[test]
    fn test_import_skips_bad_lines_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.txt");
        std::fs::write(
            &path,
            "alice|c1a2b3|ssh a@host\n\ngarbage\nbob|d4e5f6|ssh b@host\nalice|c1a2b3|ssh again@host\n",
        )
        .unwrap();

        let registry = InstanceRegistry::open_in_memory().unwrap();
        let report = import(&path, &registry, &QuotaEnforcer::new(12)).unwrap();

        assert_eq!(report.imported, 2);
        assert_eq!(report.malformed, vec![3]);
        assert_eq!(report.duplicates, vec!["c1a2b3".to_string()]);
        assert_eq!(registry.get("c1a2b3").unwrap().unwrap().credential, "ssh a@host");
    }

    #[test]
    fn test_export_replaces_file_with_registry_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.txt");
        std::fs::write(&path, "stale|000000|ssh old@host\n").unwrap();

        let registry = InstanceRegistry::open_in_memory().unwrap();
        registry
            .insert(&InstanceRecord::new("alice", "c1a2b3", "ssh a@host"))
            .unwrap();
        registry
            .insert(&InstanceRecord::new("bob", "d4e5f6", "ssh b@host"))
            .unwrap();

        assert_eq!(export(&registry, &path).unwrap(), 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "alice|c1a2b3|ssh a@host\nbob|d4e5f6|ssh b@host\n");

        // No temp files left behind
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_export_then_import_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.txt");

        let source = InstanceRegistry::open_in_memory().unwrap();
        source
            .insert(&InstanceRecord::new("alice", "c1a2b3", "ssh a@host"))
            .unwrap();
        export(&source, &path).unwrap();

        let target = InstanceRegistry::open_in_memory().unwrap();
        let report = import(&path, &target, &QuotaEnforcer::new(12)).unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(target.list_all().unwrap()[0].owner, "alice");
    }

    #[test]
    fn test_import_respects_quota() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.txt");
        std::fs::write(
            &path,
            "alice|a1|ssh a1@host\nalice|a2|ssh a2@host\nbob|b1|ssh b1@host\nalice|a3|ssh a3@host\n",
        )
        .unwrap();

        let registry = InstanceRegistry::open_in_memory().unwrap();
        registry
            .insert(&InstanceRecord::new("alice", "a0", "ssh a0@host"))
            .unwrap();
        let report = import(&path, &registry, &QuotaEnforcer::new(2)).unwrap();

        assert_eq!(report.imported, 2);
        assert_eq!(report.over_quota, vec![2, 4]);
        assert!(report.duplicates.is_empty());
        assert_eq!(registry.list_by_owner("alice").unwrap().len(), 2);
        assert!(registry.get("a2").unwrap().is_none());
        assert!(registry.get("b1").unwrap().is_some());
    }
}

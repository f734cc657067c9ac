//! Naming of request paths, dump files and backup directories.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Percent-encodes one URL path segment or file name component.
pub fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).into_owned()
}

/// Inverse of [`encode_segment`]; malformed input is returned unchanged.
pub fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// `<id>.json`, or `<id>_rev<rev>.json` for one revision of a history dump.
pub fn document_file_name(id: &str, rev: Option<&str>) -> String {
    match rev {
        Some(rev) => format!("{}_rev{}.json", encode_segment(id), encode_segment(rev)),
        None => format!("{}.json", encode_segment(id)),
    }
}

pub fn aggregate_file_name(database: &str) -> String {
    format!("{}.json", encode_segment(database))
}

/// Directory holding a database's per-document files and binary attachments.
pub fn database_dir_name(database: &str, timestamp: Option<DateTime<Utc>>) -> String {
    match timestamp {
        Some(at) => encode_segment(&format!(
            "{}-{}",
            database,
            at.format("%Y-%m-%d_%H-%M-%S_UTC")
        )),
        None => encode_segment(database),
    }
}

pub fn attachment_path(database_dir: &Path, id: &str, name: &str) -> PathBuf {
    database_dir
        .join(encode_segment(id))
        .join(encode_segment(name))
}

/// Root directory of a fan-out dump, e.g. `backup_monday_4-03-2024_17_05_09_UTC`.
pub fn backup_root_name(at: DateTime<Utc>) -> String {
    format!(
        "backup_{}_{}",
        at.format("%A").to_string().to_lowercase(),
        at.format("%-d-%m-%Y_%H_%M_%S_UTC")
    )
}

/// Directory an archive extracts into: the archive path without `.tar.gz`/`.tgz`.
pub fn extraction_dir(archive: &Path) -> Option<PathBuf> {
    let name = archive.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".tar.gz")
        .or_else(|| name.strip_suffix(".tgz"))?;
    if stem.is_empty() {
        return None;
    }
    Some(archive.with_file_name(stem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 17, 5, 9).unwrap()
    }

    #[test]
    fn test_document_file_name_plain() {
        assert_eq!(document_file_name("invoice-17", None), "invoice-17.json");
    }

    #[test]
    fn test_document_file_name_with_revision() {
        assert_eq!(
            document_file_name("a", Some("2-7051cbe5c8faecd085a3fa619e6e6337")),
            "a_rev2-7051cbe5c8faecd085a3fa619e6e6337.json"
        );
    }

    #[test]
    fn test_document_file_name_encodes_design_ids() {
        assert_eq!(
            document_file_name("_design/views", None),
            "_design%2Fviews.json"
        );
    }

    #[test]
    fn test_segment_round_trip() {
        let raw = "orders/2024 ü";
        assert_eq!(decode_segment(&encode_segment(raw)), raw);
    }

    #[test]
    fn test_decode_segment_malformed_passthrough() {
        assert_eq!(decode_segment("%ZZ"), "%ZZ");
    }

    #[test]
    fn test_database_dir_name() {
        assert_eq!(database_dir_name("users", None), "users");
        assert_eq!(
            database_dir_name("users", Some(fixed_time())),
            "users-2024-03-04_17-05-09_UTC"
        );
    }

    #[test]
    fn test_attachment_path() {
        let path = attachment_path(Path::new("/backups/db"), "doc 1", "photo.jpg");
        assert_eq!(path, PathBuf::from("/backups/db/doc%201/photo.jpg"));
    }

    #[test]
    fn test_backup_root_name() {
        assert_eq!(
            backup_root_name(fixed_time()),
            "backup_monday_4-03-2024_17_05_09_UTC"
        );
    }

    #[test]
    fn test_extraction_dir() {
        assert_eq!(
            extraction_dir(Path::new("/srv/backup_x.tar.gz")),
            Some(PathBuf::from("/srv/backup_x"))
        );
        assert_eq!(
            extraction_dir(Path::new("nightly.tgz")),
            Some(PathBuf::from("nightly"))
        );
        assert_eq!(extraction_dir(Path::new("dump.json")), None);
    }
}

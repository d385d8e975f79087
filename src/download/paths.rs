use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::credentials::Credential;
use crate::famly::{MediaItem, MediaKind};

/// Suffix of the temp file a download streams into before the rename.
pub const PART_SUFFIX: &str = ".part";

const SHORT_ID_LEN: usize = 8;
const MAX_EXTENSION_LEN: usize = 8;

/// First eight characters of a media id, the part embedded in filenames.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Deterministic file name for a media item:
/// `YYYY-MM-DD_HHMMSS_<id8>.<ext>`, timestamp in UTC.
pub fn media_file_name(item: &MediaItem) -> String {
    format!(
        "{}_{}.{}",
        item.captured_at.format("%Y-%m-%d_%H%M%S"),
        clean_filename(short_id(&item.id)),
        file_extension(item.kind, item.original_name.as_deref()),
    )
}

/// Extension for a media kind. File attachments keep the extension of their
/// original name when it looks sane.
pub fn file_extension(kind: MediaKind, original_name: Option<&str>) -> String {
    match kind {
        MediaKind::Photo => "jpg".to_string(),
        MediaKind::Video => "mp4".to_string(),
        MediaKind::File => original_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .filter(|ext| {
                !ext.is_empty()
                    && ext.len() <= MAX_EXTENSION_LEN
                    && ext.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .unwrap_or_else(|| "bin".to_string()),
    }
}

/// Recover the short id from a file name produced by [`media_file_name`].
///
/// Returns `None` for `.part` files and anything not following the
/// convention, so foreign files in the output directory are ignored.
pub fn parse_media_file_name(name: &str) -> Option<&str> {
    if name.ends_with(PART_SUFFIX) || name.starts_with('.') {
        return None;
    }
    let stem = match name.rfind('.') {
        Some(dot) => &name[..dot],
        None => name,
    };
    let mut parts = stem.splitn(3, '_');
    let date = parts.next()?;
    let time = parts.next()?;
    let id = parts.next()?;

    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    if time.len() != 6 || !time.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if id.is_empty() {
        return None;
    }
    Some(id)
}

/// Completed media files found in a destination directory.
#[derive(Debug, Default)]
pub struct ExistingMedia {
    file_names: HashSet<String>,
    short_ids: HashSet<String>,
}

impl ExistingMedia {
    /// Scan `dir` for files that follow the naming convention. A missing
    /// directory yields an empty set.
    pub fn scan(dir: &Path) -> io::Result<Self> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        let mut existing = Self::default();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(id) = parse_media_file_name(&name) {
                existing.short_ids.insert(id.to_string());
                existing.file_names.insert(name);
            }
        }
        Ok(existing)
    }

    /// Whether a completed file with exactly this name is on disk.
    pub fn contains_file(&self, file_name: &str) -> bool {
        self.file_names.contains(file_name)
    }

    /// Whether any completed file carries this short id, whatever its date.
    pub fn contains_short_id(&self, short_id: &str) -> bool {
        self.short_ids.contains(short_id)
    }

    pub fn len(&self) -> usize {
        self.file_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_names.is_empty()
    }
}

/// Temp path a download writes before renaming to `path`.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Directory a child's media lands in. A single-child run writes straight
/// into the output root; with several children each gets a subfolder.
pub fn child_directory(root: &Path, credential: &Credential, multiple_children: bool) -> PathBuf {
    if !multiple_children {
        return root.to_path_buf();
    }
    let from_name = credential
        .child_name
        .as_deref()
        .map(|name| clean_filename(&name.trim().replace(' ', "_")))
        .filter(|name| !name.is_empty() && name != "." && name != "..");
    match from_name {
        Some(name) => root.join(name),
        None => root.join(clean_filename(short_id(&credential.child_id))),
    }
}

/// Clean a filename by removing characters that are invalid on common
/// filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::famly::MediaOrigin;
    use chrono::{TimeZone, Utc};

    fn item(id: &str, kind: MediaKind, original_name: Option<&str>) -> MediaItem {
        MediaItem {
            id: id.to_string(),
            kind,
            source_url: "https://img.example/x".to_string(),
            width: None,
            height: None,
            captured_at: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
            discovered_at: Utc::now(),
            origin: MediaOrigin::TaggedImages,
            original_name: original_name.map(str::to_string),
        }
    }

    #[test]
    fn test_short_id_truncates() {
        assert_eq!(short_id("a1b2c3d4-e5f6-7890"), "a1b2c3d4");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
    }

    #[test]
    fn test_short_id_respects_char_boundaries() {
        assert_eq!(short_id("ééééééééé"), "éééééééé");
    }

    #[test]
    fn test_media_file_name_photo() {
        let name = media_file_name(&item("a1b2c3d4-e5f6", MediaKind::Photo, None));
        assert_eq!(name, "2024-03-09_140507_a1b2c3d4.jpg");
    }

    #[test]
    fn test_media_file_name_video() {
        let name = media_file_name(&item("vid12345xyz", MediaKind::Video, None));
        assert_eq!(name, "2024-03-09_140507_vid12345.mp4");
    }

    #[test]
    fn test_file_extension_from_original_name() {
        assert_eq!(file_extension(MediaKind::File, Some("Report.PDF")), "pdf");
        assert_eq!(file_extension(MediaKind::File, Some("noext")), "bin");
        assert_eq!(file_extension(MediaKind::File, Some("weird.p d f")), "bin");
        assert_eq!(file_extension(MediaKind::File, None), "bin");
    }

    #[test]
    fn test_parse_round_trips_generated_name() {
        let name = media_file_name(&item("deadbeefcafe", MediaKind::Photo, None));
        assert_eq!(parse_media_file_name(&name), Some("deadbeef"));
    }

    #[test]
    fn test_parse_ignores_part_and_foreign_files() {
        assert_eq!(parse_media_file_name("2024-03-09_140507_a1b2c3d4.jpg.part"), None);
        assert_eq!(parse_media_file_name("holiday.jpg"), None);
        assert_eq!(parse_media_file_name("2024-13-40_140507_a1b2c3d4.jpg"), None);
        assert_eq!(parse_media_file_name("2024-03-09_14h05_a1b2c3d4.jpg"), None);
        assert_eq!(parse_media_file_name(".famly-sync.json"), None);
    }

    #[test]
    fn test_existing_media_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2024-03-09_140507_aaaaaaaa.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("2024-03-10_000000_bbbbbbbb.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("2024-03-11_000000_cccccccc.jpg.part"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("2024-03-12_000000_dddddddd.jpg")).unwrap();

        let existing = ExistingMedia::scan(dir.path()).unwrap();
        assert_eq!(existing.len(), 2);
        assert!(existing.contains_file("2024-03-09_140507_aaaaaaaa.jpg"));
        assert!(existing.contains_file("2024-03-10_000000_bbbbbbbb.mp4"));
        assert!(!existing.contains_file("2024-03-11_000000_cccccccc.jpg"));
        assert!(existing.contains_short_id("aaaaaaaa"));
        assert!(!existing.contains_short_id("dddddddd"));
        // Same short id under another date is a different file.
        assert!(!existing.contains_file("2025-01-01_000000_aaaaaaaa.jpg"));
    }

    #[test]
    fn test_existing_media_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let existing = ExistingMedia::scan(&dir.path().join("nope")).unwrap();
        assert!(existing.is_empty());
    }

    #[test]
    fn test_part_path_appends_suffix() {
        let p = part_path(Path::new("/out/2024-03-09_140507_a1b2c3d4.jpg"));
        assert_eq!(p, PathBuf::from("/out/2024-03-09_140507_a1b2c3d4.jpg.part"));
    }

    #[test]
    fn test_child_directory() {
        let root = Path::new("/out");
        let mut cred = Credential::new("child-uuid-1234", "tok");
        assert_eq!(child_directory(root, &cred, false), PathBuf::from("/out"));
        assert_eq!(child_directory(root, &cred, true), PathBuf::from("/out/child-uu"));
        cred.child_name = Some("Ada Lovelace".into());
        assert_eq!(child_directory(root, &cred, true), PathBuf::from("/out/Ada_Lovelace"));
        cred.child_name = Some("..".into());
        assert_eq!(child_directory(root, &cred, true), PathBuf::from("/out/child-uu"));
    }

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("a/b\\c:d*e?f\"g<h>i|j"), "abcdefghij");
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;

use crate::error::SchemaGuardError;
use crate::hash::Hash;
use crate::history::HistoryStore;

/// `NNN_name.ext`: a zero-padded integer version, an underscore, then a name
static FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)_([A-Za-z0-9][A-Za-z0-9_\-]*)\.([A-Za-z0-9]+)$").unwrap());

/// Section markers. goose-style markers are accepted so existing files keep working.
static SECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*--[ \t]*\+(?:migrate|goose)[ \t]+(up|down)\b[^\n]*$").unwrap());

/// A migration file found in the catalog directory. Content is loaded on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    version: i64,
    filename: String,
    path: PathBuf,
}

impl MigrationFile {
    /// Parse `(version, name)` out of a filename with the expected extension.
    pub fn parse_filename(filename: &str, extension: &str) -> Option<(i64, String)> {
        let caps = FILENAME_RE.captures(filename)?;

        if !caps[3].eq_ignore_ascii_case(extension) {
            return None;
        }

        let version = caps[1].parse::<i64>().ok()?;
        Some((version, caps[2].to_owned()))
    }

    pub fn from_path(path: &Path, extension: &str) -> Option<Self> {
        let filename = path.file_name()?.to_str()?;
        let (version, _) = Self::parse_filename(filename, extension)?;

        Some(MigrationFile {
            version,
            filename: filename.to_owned(),
            path: path.to_path_buf(),
        })
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<MigrationSource, SchemaGuardError> {
        let content = fs::read_to_string(&self.path)?;
        Ok(MigrationSource::parse(self.version, &self.filename, content))
    }
}

/// The loaded body of a migration, split into its apply and revert blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSource {
    version: i64,
    filename: String,
    checksum: String,
    apply_sql: String,
    revert_sql: String,
}

impl MigrationSource {
    pub fn parse(version: i64, filename: &str, content: String) -> Self {
        let checksum = Hash::checksum(content.as_bytes());
        let (apply_sql, revert_sql) = Self::split_sections(&content);

        MigrationSource {
            version,
            filename: filename.to_owned(),
            checksum,
            apply_sql,
            revert_sql,
        }
    }

    /// Split on `-- +migrate Up` / `-- +migrate Down`. Text before the first marker is a
    /// header and belongs to neither block; a file with no markers is all apply.
    fn split_sections(content: &str) -> (String, String) {
        let markers: Vec<_> = SECTION_RE.captures_iter(content).collect();
        if markers.is_empty() {
            return (content.trim().to_owned(), String::new());
        }

        let mut apply = String::new();
        let mut revert = String::new();

        for (i, caps) in markers.iter().enumerate() {
            let marker = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let end = markers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(content.len());
            let body = content[marker..end].trim();

            let target = if caps[1].eq_ignore_ascii_case("up") {
                &mut apply
            } else {
                &mut revert
            };
            if !body.is_empty() {
                if !target.is_empty() {
                    target.push('\n');
                }
                target.push_str(body);
            }
        }

        (apply, revert)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn apply_sql(&self) -> &str {
        &self.apply_sql
    }

    pub fn revert_sql(&self) -> &str {
        &self.revert_sql
    }

    pub fn has_revert(&self) -> bool {
        !is_blank_sql(&self.revert_sql)
    }
}

/// True when the text holds nothing but whitespace and `--` comments.
pub fn is_blank_sql(sql: &str) -> bool {
    sql.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

/// Strip `--` line comments so patterns don't fire on commented-out SQL.
pub fn strip_line_comments(sql: &str) -> String {
    sql.lines()
        .map(|line| match line.find("--") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Enumerates migration files in a directory and orders them by version.
#[derive(Debug, Clone)]
pub struct Catalog {
    dir: PathBuf,
    extension: String,
}

impl Catalog {
    pub fn new<P: Into<PathBuf>>(dir: P, extension: &str) -> Self {
        Catalog {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// All legal migration files, ascending by version. Files whose names don't follow the
    /// convention are skipped; two files claiming one version are an error.
    pub fn scan(&self) -> Result<Vec<MigrationFile>, SchemaGuardError> {
        let mut files = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            // Follows symlinks
            if !path.is_file() {
                debug!("Skipping non-file entry: {}", path.display());
                continue;
            }

            match MigrationFile::from_path(&path, &self.extension) {
                Some(file) => files.push(file),
                None => debug!("Skipping non-migration file: {}", path.display()),
            }
        }

        files.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.filename.cmp(&b.filename)));

        for pair in files.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(SchemaGuardError::DuplicateVersion {
                    version: pair[0].version,
                    first: pair[0].filename.clone(),
                    second: pair[1].filename.clone(),
                });
            }
        }

        Ok(files)
    }

    pub fn find(&self, version: i64) -> Result<Option<MigrationFile>, SchemaGuardError> {
        Ok(self.scan()?.into_iter().find(|f| f.version == version))
    }

    /// Files with no completed execution of their current content. Versions at or below
    /// `current_version` are included (backfills), as are files edited since they ran.
    pub fn list_pending(
        &self,
        current_version: i64,
        conn: &Connection,
    ) -> Result<Vec<MigrationFile>, SchemaGuardError> {
        let mut pending = Vec::new();

        for file in self.scan()? {
            let source = file.load()?;
            if HistoryStore::is_executed(conn, file.version, source.checksum())? {
                continue;
            }

            if HistoryStore::has_completed(conn, file.version)? {
                debug!("Migration {} was edited after it was applied", file.filename);
            } else if file.version <= current_version {
                info!(
                    "Migration {} is at or below current version {} but has not been applied with this content",
                    file.filename, current_version
                );
            }
            pending.push(file);
        }

        Ok(pending)
    }

    /// Highest version available on disk, or 0 for an empty catalog.
    pub fn target_version(&self) -> Result<i64, SchemaGuardError> {
        Ok(self.scan()?.last().map(|f| f.version).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::history::{MigrationRecord, RecordStatus};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            MigrationFile::parse_filename("001_create_users.sql", "sql"),
            Some((1, "create_users".to_owned()))
        );
        assert_eq!(
            MigrationFile::parse_filename("0042_add-index.SQL", "sql"),
            Some((42, "add-index".to_owned()))
        );
        assert_eq!(MigrationFile::parse_filename("create_users.sql", "sql"), None);
        assert_eq!(MigrationFile::parse_filename("001create.sql", "sql"), None);
        assert_eq!(MigrationFile::parse_filename("001_.sql", "sql"), None);
        assert_eq!(MigrationFile::parse_filename("001_users.txt", "sql"), None);
        assert_eq!(MigrationFile::parse_filename("abc_users.sql", "sql"), None);
    }

    #[test]
    fn test_split_sections() {
        let content = "-- header\n-- +migrate Up\nBEGIN;\nCREATE TABLE a (id INTEGER);\nCOMMIT;\n\n-- +migrate Down\nBEGIN;\nDROP TABLE a;\nCOMMIT;\n";
        let source = MigrationSource::parse(1, "001_a.sql", content.to_owned());

        assert_eq!(source.apply_sql(), "BEGIN;\nCREATE TABLE a (id INTEGER);\nCOMMIT;");
        assert_eq!(source.revert_sql(), "BEGIN;\nDROP TABLE a;\nCOMMIT;");
        assert!(source.has_revert());
    }

    #[test]
    fn test_split_sections_accepts_goose_markers_and_no_markers() {
        let goose = "-- +goose Up\nSELECT 1;\n-- +goose Down\nSELECT 2;\n";
        let source = MigrationSource::parse(1, "001_a.sql", goose.to_owned());
        assert_eq!(source.apply_sql(), "SELECT 1;");
        assert_eq!(source.revert_sql(), "SELECT 2;");

        let bare = MigrationSource::parse(2, "002_b.sql", "SELECT 3;\n".to_owned());
        assert_eq!(bare.apply_sql(), "SELECT 3;");
        assert!(!bare.has_revert());
    }

    #[test]
    fn test_blank_sql_and_comment_stripping() {
        assert!(is_blank_sql("  \n-- only a comment\n"));
        assert!(!is_blank_sql("-- c\nSELECT 1;"));
        assert_eq!(strip_line_comments("SELECT 1; -- DROP TABLE x\n-- TRUNCATE"), "SELECT 1; \n");
    }

    #[test]
    fn test_scan_orders_numerically_and_skips_invalid_names() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "010_ten.sql", "SELECT 10;");
        write(dir.path(), "002_two.sql", "SELECT 2;");
        write(dir.path(), "1_one.sql", "SELECT 1;");
        write(dir.path(), "README.md", "docs");
        write(dir.path(), "notes_003.sql", "SELECT 3;");
        fs::create_dir(dir.path().join("004_dir.sql")).unwrap();

        let catalog = Catalog::new(dir.path(), "sql");
        let versions: Vec<i64> = catalog.scan().unwrap().iter().map(|f| f.version()).collect();

        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(catalog.target_version().unwrap(), 10);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_follows_symlinked_migrations() {
        let dir = TempDir::new().unwrap();
        let shared = TempDir::new().unwrap();
        write(shared.path(), "shared.sql", "SELECT 1;");
        std::os::unix::fs::symlink(shared.path().join("shared.sql"), dir.path().join("001_shared.sql")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("missing.sql"), dir.path().join("003_dangling.sql")).unwrap();
        write(dir.path(), "002_local.sql", "SELECT 2;");

        let catalog = Catalog::new(dir.path(), "sql");
        let versions: Vec<i64> = catalog.scan().unwrap().iter().map(|f| f.version()).collect();

        assert_eq!(versions, vec![1, 2]);
        assert_eq!(catalog.target_version().unwrap(), 2);
    }

    #[test]
    fn test_scan_rejects_duplicate_versions() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "001_a.sql", "SELECT 1;");
        write(dir.path(), "01_b.sql", "SELECT 1;");

        let err = Catalog::new(dir.path(), "sql").scan().unwrap_err();
        assert!(matches!(err, SchemaGuardError::DuplicateVersion { version: 1, .. }));
    }

    #[test]
    fn test_target_version_of_empty_catalog() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Catalog::new(dir.path(), "sql").target_version().unwrap(), 0);
    }

    #[test]
    fn test_list_pending_uses_checksums() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "001_a.sql", "SELECT 1;");
        write(dir.path(), "002_b.sql", "SELECT 2;");
        write(dir.path(), "003_c.sql", "SELECT 3;");

        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        let catalog = Catalog::new(dir.path(), "sql");

        // Version 1 ran with current content, version 2 ran with older content
        for (version, content) in [(1, "SELECT 1;"), (2, "SELECT 'old';")] {
            let checksum = Hash::checksum(content.as_bytes());
            let mut record = MigrationRecord::new(version, "x.sql", &checksum, None, None);
            HistoryStore::insert(conn, &mut record).unwrap();
            record.transition(RecordStatus::Running).unwrap();
            record.transition(RecordStatus::Completed).unwrap();
            HistoryStore::save(conn, &mut record).unwrap();
        }

        let pending: Vec<i64> = catalog
            .list_pending(2, conn)
            .unwrap()
            .iter()
            .map(|f| f.version())
            .collect();
        assert_eq!(pending, vec![2, 3]);
    }
}

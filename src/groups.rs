//! Group database lookups for `:group` rule identities

use crate::error::{DoasError, Result};
use nix::unistd::Gid;
use std::fs;
use std::path::PathBuf;

/// Read access to a colon-delimited group table (`name:passwd:gid:members`).
#[derive(Debug, Clone)]
pub struct GroupDatabase {
    path: PathBuf,
}

impl GroupDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Check whether a `:group` reference applies to a principal with `gids`.
    ///
    /// This is a textual containment test on both the name and the gid field,
    /// not exact membership: `:eng` also matches a group named `engineering`,
    /// and gid `10` is found inside `100`. Kept as-is until the rule format
    /// gains exact group semantics.
    pub fn group_reference_matches_substring(&self, reference: &str, gids: &[Gid]) -> Result<bool> {
        let content = fs::read_to_string(&self.path).map_err(|e| DoasError::GroupDatabase {
            path: self.path.clone(),
            source: e,
        })?;

        let name = reference.strip_prefix(':').unwrap_or(reference);
        let gid_strings: Vec<String> = gids.iter().map(|g| g.as_raw().to_string()).collect();

        Ok(content
            .lines()
            .filter_map(parse_entry)
            .filter(|entry| entry.name.contains(name))
            .any(|entry| gid_strings.iter().any(|gid| entry.gid.contains(gid.as_str()))))
    }
}

struct GroupEntry<'a> {
    name: &'a str,
    gid: &'a str,
}

fn parse_entry(line: &str) -> Option<GroupEntry<'_>> {
    let mut fields = line.split(':');
    let name = fields.next()?;
    let _passwd = fields.next()?;
    let gid = fields.next()?;
    Some(GroupEntry { name, gid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GROUP_FILE: &str = "\
root:x:0:
wheel:x:10:alice
engineering:x:1500:bob
staff:x:50:
broken-line
";

    fn db() -> (tempfile::TempDir, GroupDatabase) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("group");
        fs::write(&path, GROUP_FILE).unwrap();
        (dir, GroupDatabase::new(path))
    }

    #[test]
    fn test_exact_group_match() {
        let (_dir, db) = db();
        assert!(db
            .group_reference_matches_substring(":wheel", &[Gid::from_raw(10)])
            .unwrap());
    }

    #[test]
    fn test_principal_not_in_group() {
        let (_dir, db) = db();
        assert!(!db
            .group_reference_matches_substring(":wheel", &[Gid::from_raw(50)])
            .unwrap());
    }

    #[test]
    fn test_unknown_group() {
        let (_dir, db) = db();
        assert!(!db
            .group_reference_matches_substring(":audio", &[Gid::from_raw(10)])
            .unwrap());
    }

    #[test]
    fn test_name_substring_matches() {
        // `:eng` is contained in `engineering`
        let (_dir, db) = db();
        assert!(db
            .group_reference_matches_substring(":eng", &[Gid::from_raw(1500)])
            .unwrap());
    }

    #[test]
    fn test_gid_substring_matches() {
        // gid 15 is contained in 1500
        let (_dir, db) = db();
        assert!(db
            .group_reference_matches_substring(":engineering", &[Gid::from_raw(15)])
            .unwrap());
    }

    #[test]
    fn test_short_lines_skipped() {
        let (_dir, db) = db();
        assert!(!db
            .group_reference_matches_substring(":broken", &[Gid::from_raw(0)])
            .unwrap());
    }

    #[test]
    fn test_unreadable_database() {
        let db = GroupDatabase::new("/nonexistent/group/12345");
        let result = db.group_reference_matches_substring(":wheel", &[Gid::from_raw(10)]);
        assert!(matches!(result, Err(DoasError::GroupDatabase { .. })));
    }
}

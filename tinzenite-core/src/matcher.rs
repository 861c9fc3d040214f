//! Ignore rules from the `.tinignore` file.
//!
//! The rule file is line oriented. Lines starting with `/` are directory
//! rules: the named segment is ignored wherever it appears in the tree,
//! together with everything below it. All other non-empty lines are suffix
//! rules and apply to files only.
//!
//! The engine's own bookkeeping under `.tinzenite/` is excluded by built-in
//! directory rules, with the exception of `.tinzenite/org`, which replicates
//! through the normal model path.

use std::fs;
use std::path::Path;

/// Subtrees of the bookkeeping directory that never enter the tracked set.
/// `org/self.json` stays local: it carries the transport secret.
const INTERNAL_RULES: [&str; 6] = [
    ".tinzenite/local",
    ".tinzenite/temp",
    ".tinzenite/receiving",
    ".tinzenite/sending",
    ".tinzenite/removed",
    ".tinzenite/org/self.json",
];

#[derive(Debug, Clone)]
pub struct Matcher {
    directory_rules: Vec<String>,
    suffix_rules: Vec<String>,
}

impl Matcher {
    /// Load rules from `<root>/.tinignore`. A missing rule file yields the
    /// built-in rules only.
    pub fn load(root: &Path) -> Self {
        let text = fs::read_to_string(root.join(crate::paths::TINIGNORE)).unwrap_or_default();
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Self {
        let mut directory_rules: Vec<String> =
            INTERNAL_RULES.iter().map(|r| r.to_string()).collect();
        let mut suffix_rules = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(segment) = line.strip_prefix('/') {
                if !segment.is_empty() {
                    directory_rules.push(segment.trim_end_matches('/').to_string());
                }
            } else {
                suffix_rules.push(line.to_string());
            }
        }
        Matcher {
            directory_rules,
            suffix_rules,
        }
    }

    /// Whether the root-relative path is excluded from tracking. Directory
    /// rules are checked first; suffix rules only apply to files.
    pub fn ignored(&self, relative: &str, is_dir: bool) -> bool {
        if self
            .directory_rules
            .iter()
            .any(|segment| contains_segment(relative, segment))
        {
            return true;
        }
        if !is_dir {
            return self
                .suffix_rules
                .iter()
                .any(|suffix| relative.ends_with(suffix.as_str()));
        }
        false
    }

    /// Whether a whole subtree can be skipped during the walk.
    pub fn prunes(&self, relative: &str) -> bool {
        self.directory_rules
            .iter()
            .any(|segment| contains_segment(relative, segment))
    }
}

/// True if `segment` occurs in `path` on component boundaries: as a prefix,
/// an interior run of components, or the trailing components.
fn contains_segment(path: &str, segment: &str) -> bool {
    if path == segment || path.starts_with(&format!("{segment}/")) {
        return true;
    }
    path.contains(&format!("/{segment}/")) || path.ends_with(&format!("/{segment}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rules_track_everything_user_visible() {
        let m = Matcher::parse("");
        assert!(!m.ignored("notes.txt", false));
        assert!(!m.ignored("docs/deep/file.rs", false));
    }

    #[test]
    fn builtin_rules_hide_bookkeeping_but_not_org() {
        let m = Matcher::parse("");
        assert!(m.ignored(".tinzenite/local/model.json", false));
        assert!(m.ignored(".tinzenite/temp", true));
        assert!(m.ignored(".tinzenite/receiving/ab.cd", false));
        assert!(m.ignored(".tinzenite/sending", true));
        assert!(m.ignored(".tinzenite/removed/abcd", true));
        assert!(m.ignored(".tinzenite/org/self.json", false));
        assert!(!m.ignored(".tinzenite/org", true));
        assert!(!m.ignored(".tinzenite/org/peers/aa.json", false));
        assert!(!m.ignored(".tinzenite/org/auth.json", false));
    }

    #[test]
    fn directory_rule_matches_segment_anywhere() {
        let m = Matcher::parse("/build\n");
        assert!(m.ignored("build", true));
        assert!(m.ignored("build/out.o", false));
        assert!(m.ignored("src/build/out.o", false));
        assert!(m.ignored("src/build", true));
        assert!(!m.ignored("building/notes.txt", false));
        assert!(!m.ignored("src/builds", true));
    }

    #[test]
    fn suffix_rule_applies_to_files_only() {
        let m = Matcher::parse(".swp\n");
        assert!(m.ignored("notes.txt.swp", false));
        assert!(m.ignored("docs/a.swp", false));
        assert!(!m.ignored("weird.swp", true));
        assert!(!m.ignored("notes.txt", false));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let m = Matcher::parse("\n\n.tmp\n\n/cache\n");
        assert!(m.ignored("a.tmp", false));
        assert!(m.ignored("cache/x", false));
    }
}

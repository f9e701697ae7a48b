//! Filename rules and path utilities.
//!
//! Every component that hashes or compares paths goes through this module so
//! that case sensitivity and separator handling are decided in exactly one
//! place. Hashing is a 64-bit FNV-1a over canonicalized path sections, which
//! is also the scheme packed archives use for their on-disk hash tables, so
//! a path hashed here can be looked up in an archive directly.

use std::borrow::Cow;

/// Separator and case-sensitivity conventions for a filesystem namespace.
///
/// The default is `'/'`-separated and case-sensitive, which is what the
/// mounting tree uses internally regardless of host OS.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FilenameRules {
    pub separator: char,
    pub case_sensitive: bool,
}

impl FilenameRules {
    pub const fn new(separator: char, case_sensitive: bool) -> Self {
        Self { separator, case_sensitive }
    }
}

impl Default for FilenameRules {
    fn default() -> Self {
        Self::new('/', true)
    }
}

pub(crate) const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. `const` so chunk-type codes can be derived from tags at
/// compile time.
pub const fn fnv1a64(bytes: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Combines an already-computed hash with a seed, for deriving request
/// fingerprints from (initializer-hash, target-code) pairs.
pub fn hash_combine(value: u64, seed: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// A path broken into sections, with the leading/trailing separator state
/// preserved so the original shape can be rebuilt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SplitPath<'a> {
    sections: Vec<&'a str>,
    begins_with_separator: bool,
    ends_with_separator: bool,
}

impl<'a> SplitPath<'a> {
    pub fn new(path: &'a str) -> Self {
        let begins_with_separator = path.chars().next().map(is_separator).unwrap_or(false);
        let ends_with_separator =
            path.len() > 1 && path.chars().next_back().map(is_separator).unwrap_or(false);
        let sections = path.split(is_separator).filter(|s| !s.is_empty()).collect();
        Self { sections, begins_with_separator, ends_with_separator }
    }

    pub fn sections(&self) -> &[&'a str] {
        &self.sections
    }

    pub fn begins_with_separator(&self) -> bool {
        self.begins_with_separator
    }

    pub fn ends_with_separator(&self) -> bool {
        self.ends_with_separator
    }

    /// Collapses `.` sections and folds `..` into the preceding section.
    /// Unmatched `..` sections are retained for relative paths and dropped
    /// for rooted ones (there is nothing above the root).
    pub fn simplify(mut self) -> Self {
        let mut simplified: Vec<&'a str> = Vec::with_capacity(self.sections.len());
        for section in self.sections.drain(..) {
            match section {
                "." => {}
                ".." => {
                    match simplified.last() {
                        Some(&"..") | None => {
                            if !self.begins_with_separator {
                                simplified.push("..");
                            }
                        }
                        Some(_) => {
                            simplified.pop();
                        }
                    }
                }
                other => simplified.push(other),
            }
        }
        self.sections = simplified;
        self
    }

    pub fn rebuild(&self, rules: FilenameRules) -> String {
        let mut out = String::new();
        if self.begins_with_separator {
            out.push(rules.separator);
        }
        for (idx, section) in self.sections.iter().enumerate() {
            if idx != 0 {
                out.push(rules.separator);
            }
            out.push_str(section);
        }
        if self.ends_with_separator && !self.sections.is_empty() {
            out.push(rules.separator);
        }
        out
    }
}

pub fn split_path(path: &str) -> SplitPath<'_> {
    SplitPath::new(path)
}

fn section_bytes<'a>(section: &'a str, rules: FilenameRules) -> Cow<'a, str> {
    if rules.case_sensitive {
        Cow::Borrowed(section)
    } else {
        Cow::Owned(section.to_lowercase())
    }
}

/// Hashes a path under the given rules, canonicalizing separators, `.`/`..`
/// sections and (for case-insensitive rules) character case, so equivalent
/// spellings of one file hash identically.
pub fn hash_filename_seeded(path: &str, rules: FilenameRules, seed: u64) -> u64 {
    let split = split_path(path).simplify();
    let mut hash = seed;
    if split.begins_with_separator() {
        hash = fnv1a64(b"/", hash);
    }
    for (idx, section) in split.sections().iter().enumerate() {
        if idx != 0 {
            hash = fnv1a64(b"/", hash);
        }
        hash = fnv1a64(section_bytes(section, rules).as_bytes(), hash);
    }
    hash
}

pub fn hash_filename(path: &str, rules: FilenameRules) -> u64 {
    hash_filename_seeded(path, rules, FNV_OFFSET_BASIS)
}

fn sections_equal(lhs: &str, rhs: &str, rules: FilenameRules) -> bool {
    if rules.case_sensitive {
        lhs == rhs
    } else {
        lhs.eq_ignore_ascii_case(rhs)
    }
}

/// Computes a path for `target` relative to the directory `base`: the common
/// prefix is eliminated and a `..` inserted for every remaining `base`
/// section. Returns `target` rebuilt unchanged when the two paths share no
/// root to relate through.
pub fn relative_path(base: &str, target: &str, rules: FilenameRules) -> String {
    let base = split_path(base).simplify();
    let target = split_path(target).simplify();

    if base.begins_with_separator() != target.begins_with_separator() {
        return target.rebuild(rules);
    }

    let common = base
        .sections()
        .iter()
        .zip(target.sections())
        .take_while(|(b, t)| sections_equal(b, t, rules))
        .count();

    // Two rooted paths with nothing in common cannot be related.
    if common == 0 && base.begins_with_separator() && !base.sections().is_empty() {
        return target.rebuild(rules);
    }

    let mut out = String::new();
    for _ in common..base.sections().len() {
        out.push_str("..");
        out.push(rules.separator);
    }
    for (idx, section) in target.sections()[common..].iter().enumerate() {
        if idx != 0 {
            out.push(rules.separator);
        }
        out.push_str(section);
    }
    if target.ends_with_separator() && !out.is_empty() && !out.ends_with(rules.separator) {
        out.push(rules.separator);
    }
    out
}

/// The parts of a filename-like initializer string.
///
/// Parameters are introduced by a colon after the filename, e.g.
/// `shaders/basic.hlsl:main:sm5_0` carries the parameters `main:sm5_0`.
/// These encode things like entry point and target model in one string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileNameSplitter<'a> {
    full: &'a str,
    file_start: usize,
    extension_start: Option<usize>,
    parameters_start: Option<usize>,
}

impl<'a> FileNameSplitter<'a> {
    pub fn new(path: &'a str) -> Self {
        let file_start = path.rfind(is_separator).map(|i| i + 1).unwrap_or(0);
        let tail = &path[file_start..];
        let parameters_start = tail.find(':').map(|i| file_start + i);
        let name_end = parameters_start.unwrap_or(path.len());
        let extension_start = path[file_start..name_end].rfind('.').and_then(|i| {
            // a leading dot is a hidden-file convention, not an extension
            (i != 0).then_some(file_start + i)
        });
        Self { full: path, file_start, extension_start, parameters_start }
    }

    /// Directory portion, including the trailing separator.
    pub fn stem_and_path(&self) -> &'a str {
        &self.full[..self.file_start]
    }

    /// Filename without extension or parameters.
    pub fn file(&self) -> &'a str {
        let end = self.extension_start.or(self.parameters_start).unwrap_or(self.full.len());
        &self.full[self.file_start..end]
    }

    /// Extension without the dot; empty if there is none.
    pub fn extension(&self) -> &'a str {
        match self.extension_start {
            Some(start) => {
                let end = self.parameters_start.unwrap_or(self.full.len());
                &self.full[start + 1..end]
            }
            None => "",
        }
    }

    /// Everything after the parameter colon; empty if there is none.
    pub fn parameters(&self) -> &'a str {
        match self.parameters_start {
            Some(start) => &self.full[start + 1..],
            None => "",
        }
    }

    /// The path with any parameters stripped.
    pub fn all_except_parameters(&self) -> &'a str {
        &self.full[..self.parameters_start.unwrap_or(self.full.len())]
    }
}

pub fn split_file_name(path: &str) -> FileNameSplitter<'_> {
    FileNameSplitter::new(path)
}

/// Maps an arbitrary initializer string onto something safe to use as a
/// filename, capped at `size_limit` characters.
pub fn make_safe_name(input: &str, size_limit: usize) -> String {
    input
        .chars()
        .take(size_limit)
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

/// Margin reserved below the OS path limit for sidecar suffixes such as
/// `-<blockname>.metrics.s`.
pub const PATH_LIMIT_MARGIN: usize = 20;

/// Shortens `path` to at most `limit` characters by replacing its tail with
/// a 64-bit hash of the removed text. Paths under the limit pass through.
pub fn shorten_with_hash(path: &str, limit: usize) -> String {
    const HASH_CHARS: usize = 17; // '-' plus 16 hex digits
    if path.len() <= limit || limit <= HASH_CHARS {
        return path.to_string();
    }
    let mut keep = limit - HASH_CHARS;
    while !path.is_char_boundary(keep) {
        keep -= 1;
    }
    let tail_hash = xxhash_rust::xxh3::xxh3_64(path[keep..].as_bytes());
    format!("{}-{:016x}", &path[..keep], tail_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: FilenameRules = FilenameRules::new('/', true);
    const INSENSITIVE: FilenameRules = FilenameRules::new('/', false);

    #[test]
    fn split_rebuild_round_trip() {
        for path in ["a/b/c", "/rooted/path/", "one", "a/b/../c/./d"] {
            let first = split_path(path);
            let rebuilt = first.rebuild(RULES);
            assert_eq!(split_path(&rebuilt), first);
        }
    }

    #[test]
    fn simplify_collapses_markers() {
        assert_eq!(split_path("a/b/../c/./d").simplify().rebuild(RULES), "a/c/d");
        assert_eq!(split_path("../x/y").simplify().rebuild(RULES), "../x/y");
        assert_eq!(split_path("/a/../../b").simplify().rebuild(RULES), "/b");
        assert_eq!(split_path("a/..").simplify().rebuild(RULES), "");
    }

    #[test]
    fn hash_ignores_spelling_differences() {
        assert_eq!(hash_filename("a/b/c", RULES), hash_filename("a//b/./c", RULES));
        assert_eq!(hash_filename("a\\b\\c", RULES), hash_filename("a/b/c", RULES));
        assert_eq!(hash_filename("a/x/../b/c", RULES), hash_filename("a/b/c", RULES));
        assert_ne!(hash_filename("/a/b", RULES), hash_filename("a/b", RULES));
    }

    #[test]
    fn hash_case_rules() {
        assert_ne!(hash_filename("Dir/File", RULES), hash_filename("dir/file", RULES));
        assert_eq!(hash_filename("Dir/File", INSENSITIVE), hash_filename("dir/file", INSENSITIVE));
    }

    #[test]
    fn relative_path_common_prefix() {
        assert_eq!(relative_path("game/assets", "game/assets/tex/a.dds", RULES), "tex/a.dds");
        assert_eq!(relative_path("game/assets/tex", "game/shaders/b.hlsl", RULES), "../../shaders/b.hlsl");
        assert_eq!(relative_path("/mnt/x", "/opt/y", RULES), "/opt/y");
    }

    #[test]
    fn file_name_splitter_with_parameters() {
        let s = split_file_name("shaders/basic.hlsl:main:sm5_0");
        assert_eq!(s.stem_and_path(), "shaders/");
        assert_eq!(s.file(), "basic");
        assert_eq!(s.extension(), "hlsl");
        assert_eq!(s.parameters(), "main:sm5_0");
        assert_eq!(s.all_except_parameters(), "shaders/basic.hlsl");
    }

    #[test]
    fn file_name_splitter_plain() {
        let s = split_file_name("model.fbx");
        assert_eq!(s.stem_and_path(), "");
        assert_eq!(s.file(), "model");
        assert_eq!(s.extension(), "fbx");
        assert_eq!(s.parameters(), "");
    }

    #[test]
    fn safe_names_and_shortening() {
        assert_eq!(make_safe_name("tex/a b:c.dds", 64), "tex_a_b_c.dds");
        assert_eq!(make_safe_name("verylongname", 4), "very");

        let long = "x".repeat(400);
        let short = shorten_with_hash(&long, 64);
        assert_eq!(short.len(), 64);
        assert_eq!(shorten_with_hash("short", 64), "short");
        // deterministic
        assert_eq!(short, shorten_with_hash(&long, 64));
    }
}

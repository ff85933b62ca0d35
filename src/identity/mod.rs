//! Function identity tracking across assistant-driven renames.
//!
//! The identity phase of an attack round asks the assistant to rename the
//! target function, so a scan target cannot be located by name alone. Each
//! target carries an `IdentityRecord` that is reconciled against the current
//! file content once per identity phase: look for the function near its last
//! known line, widening the search window step by step, and fall back to
//! signature-shape matching when the name no longer appears.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// Search radii tried in ascending order, in lines around the last known line.
pub const SEARCH_RADII: [u32; 3] = [5, 15, 30];

/// Parameter list of a function definition, used for structural matching.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionSignature {
    pub params: Vec<String>,
}

impl FunctionSignature {
    /// Parse the text between the parentheses of a definition. Type
    /// annotations and default values are stripped; only the parameter
    /// names and their order matter.
    pub fn parse(raw: &str) -> Self {
        let params = raw
            .split(',')
            .map(|p| {
                p.split([':', '=']).next().unwrap_or("").trim().to_string()
            })
            .filter(|p| !p.is_empty())
            .collect();
        Self { params }
    }

    /// Structural similarity score: two points per positionally matching
    /// parameter name, one point for an equal parameter count. Integer so
    /// that ties are exact, never a float-rounding accident.
    pub fn similarity(&self, other: &FunctionSignature) -> u32 {
        let positional = self
            .params
            .iter()
            .zip(other.params.iter())
            .filter(|(a, b)| a == b)
            .count() as u32;
        let count_bonus = u32::from(self.params.len() == other.params.len());
        positional * 2 + count_bonus
    }
}

/// Mutable tracking state for one target, owned by the tracker.
/// Updated at most once per round.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    /// File path relative to the project root.
    pub file: PathBuf,
    /// Name the target had when the project's prompt file named it.
    pub original_name: String,
    /// Most recently resolved name.
    pub current_name: String,
    /// Most recently resolved line, 1-based.
    pub current_line: u32,
    /// Signature observed at the last successful resolution.
    pub signature: FunctionSignature,
    /// Radius that produced the last successful resolution.
    pub last_radius: Option<u32>,
    /// Terminal: once set, the target is never scanned again.
    pub lost: bool,
}

impl IdentityRecord {
    pub fn new(file: impl Into<PathBuf>, name: impl Into<String>, line: u32) -> Self {
        let name = name.into();
        Self {
            file: file.into(),
            original_name: name.clone(),
            current_name: name,
            current_line: line,
            signature: FunctionSignature::default(),
            last_radius: None,
            lost: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found { name: String, line: u32 },
    Lost,
}

/// One function definition found in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    /// 1-based line of the definition.
    pub line: u32,
    pub signature: FunctionSignature,
}

static FN_DEF_RE: Lazy<Regex> = Lazy::new(|| {
    // Covers the definition keywords of the languages the probe targets.
    Regex::new(r"^\s*(?:async\s+)?(?:def|fn|function|func)\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)")
        .expect("function definition regex")
});

/// Extract every function definition with its line number and signature.
pub fn extract_functions(content: &str) -> Vec<FunctionDef> {
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            FN_DEF_RE.captures(line).map(|caps| FunctionDef {
                name: caps[1].to_string(),
                line: idx as u32 + 1,
                signature: FunctionSignature::parse(&caps[2]),
            })
        })
        .collect()
}

/// Reconcile a record against the current file content.
///
/// Radii are tried in ascending order. Within a radius a unique exact-name
/// match is authoritative; otherwise all definitions in the window are scored
/// by signature similarity and the unique best match wins, provided it shares
/// anything at all with the last known signature (a zero score widens the
/// radius instead). Equal scores break toward the smaller line distance; a
/// residual tie is ambiguous and the record is marked lost rather than
/// guessed at. No match within the widest radius also marks the record lost.
/// Lost is terminal.
pub fn resolve(record: &mut IdentityRecord, content: &str) -> Resolution {
    if record.lost {
        return Resolution::Lost;
    }

    let defs = extract_functions(content);

    for radius in SEARCH_RADII {
        let window: Vec<&FunctionDef> = defs
            .iter()
            .filter(|d| d.line.abs_diff(record.current_line) <= radius)
            .collect();
        if window.is_empty() {
            continue;
        }

        let exact: Vec<&&FunctionDef> = window
            .iter()
            .filter(|d| d.name == record.current_name)
            .collect();
        if exact.len() == 1 {
            return apply(record, exact[0], radius);
        }

        // Renamed (or duplicated): fall back to signature-shape matching.
        let best_score = window
            .iter()
            .map(|d| record.signature.similarity(&d.signature))
            .max()
            .unwrap_or(0);

        // A candidate with nothing in common is no evidence of a rename;
        // keep widening instead of latching onto an unrelated neighbor.
        if best_score == 0 {
            continue;
        }

        let mut best: Vec<&&FunctionDef> = window
            .iter()
            .filter(|d| record.signature.similarity(&d.signature) == best_score)
            .collect();

        if best.len() > 1 {
            let min_distance = best
                .iter()
                .map(|d| d.line.abs_diff(record.current_line))
                .min()
                .unwrap_or(0);
            best.retain(|d| d.line.abs_diff(record.current_line) == min_distance);
        }

        if best.len() == 1 {
            return apply(record, best[0], radius);
        }

        // Ambiguous at this radius: losing the target is safer than guessing.
        warn!(
            file = %record.file.display(),
            name = %record.current_name,
            radius,
            candidates = best.len(),
            "ambiguous identity resolution, marking target lost"
        );
        record.lost = true;
        return Resolution::Lost;
    }

    warn!(
        file = %record.file.display(),
        name = %record.current_name,
        line = record.current_line,
        "no candidate within widest radius, marking target lost"
    );
    record.lost = true;
    Resolution::Lost
}

fn apply(record: &mut IdentityRecord, def: &FunctionDef, radius: u32) -> Resolution {
    debug!(
        file = %record.file.display(),
        from = %record.current_name,
        to = %def.name,
        line = def.line,
        radius,
        "identity resolved"
    );
    record.current_name = def.name.clone();
    record.current_line = def.line;
    record.signature = def.signature.clone();
    record.last_radius = Some(radius);
    Resolution::Found {
        name: def.name.clone(),
        line: def.line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with_def_at(line: u32, def: &str) -> String {
        let mut out = String::new();
        for _ in 1..line {
            out.push_str("# padding\n");
        }
        out.push_str(def);
        out.push('\n');
        out
    }

    #[test]
    fn exact_name_match_at_small_radius() {
        let mut record = IdentityRecord::new("foo.py", "calc", 10);
        let content = file_with_def_at(12, "def calc(a, b):");

        let res = resolve(&mut record, &content);
        assert_eq!(
            res,
            Resolution::Found {
                name: "calc".into(),
                line: 12
            }
        );
        assert_eq!(record.last_radius, Some(5));
        assert_eq!(record.current_line, 12);
    }

    #[test]
    fn rename_found_only_at_widest_radius() {
        // Last seen at line 10, renamed function only at line 37: radii 5 and
        // 15 must fail, radius 30 must succeed.
        let mut record = IdentityRecord::new("foo.py", "calc", 10);
        record.signature = FunctionSignature::parse("a, b");
        let content = file_with_def_at(37, "def compute_sum(a, b):");

        let res = resolve(&mut record, &content);
        assert_eq!(
            res,
            Resolution::Found {
                name: "compute_sum".into(),
                line: 37
            }
        );
        assert_eq!(record.last_radius, Some(30));
        assert_eq!(record.current_name, "compute_sum");
    }

    #[test]
    fn no_match_within_widest_radius_is_lost() {
        let mut record = IdentityRecord::new("foo.py", "calc", 10);
        let content = file_with_def_at(60, "def far_away(a, b):");

        assert_eq!(resolve(&mut record, &content), Resolution::Lost);
        assert!(record.lost);
    }

    #[test]
    fn lost_is_terminal() {
        let mut record = IdentityRecord::new("foo.py", "calc", 10);
        record.lost = true;
        let content = file_with_def_at(10, "def calc(a, b):");

        assert_eq!(resolve(&mut record, &content), Resolution::Lost);
    }

    #[test]
    fn signature_similarity_prefers_matching_params() {
        let mut record = IdentityRecord::new("foo.py", "calc", 10);
        record.signature = FunctionSignature::parse("path, mode");

        // Both candidates sit inside the radius-5 window; helper is closer
        // but its parameter shape does not match.
        let content = "\
# 1
# 2
# 3
# 4
# 5
# 6
# 7
# 8
def helper(x):
# 10
# 11
def resolve_path(path, mode):
";
        let res = resolve(&mut record, content);
        assert_eq!(
            res,
            Resolution::Found {
                name: "resolve_path".into(),
                line: 12
            }
        );
    }

    #[test]
    fn unrelated_neighbor_does_not_hijack_resolution() {
        let mut record = IdentityRecord::new("foo.py", "calc", 10);
        record.signature = FunctionSignature::parse("a, b");

        // helper(x) sits two lines from the last known position but shares
        // nothing with the target's signature; the real rename is at line 37,
        // reachable only at the widest radius.
        let mut content = String::new();
        for line in 1..=40 {
            match line {
                12 => content.push_str("def helper(x):\n"),
                37 => content.push_str("def compute_sum(a, b):\n"),
                _ => content.push_str("# padding\n"),
            }
        }

        let res = resolve(&mut record, &content);
        assert_eq!(
            res,
            Resolution::Found {
                name: "compute_sum".into(),
                line: 37
            }
        );
        assert_eq!(record.last_radius, Some(30));
    }

    #[test]
    fn equal_similarity_breaks_toward_closer_line() {
        let mut record = IdentityRecord::new("foo.py", "calc", 6);
        record.signature = FunctionSignature::parse("a, b");

        // Two candidates with identical signatures; line 7 is closer to 6.
        let content = "\
# 1
def first(a, b):
# 3
# 4
# 5
# 6
def second(a, b):
";
        let res = resolve(&mut record, content);
        assert_eq!(
            res,
            Resolution::Found {
                name: "second".into(),
                line: 7
            }
        );
    }

    #[test]
    fn residual_tie_is_ambiguous_and_lost() {
        let mut record = IdentityRecord::new("foo.py", "calc", 4);
        record.signature = FunctionSignature::parse("a, b");

        // Same signature, same distance from line 4: ambiguous.
        let content = "\
# 1
def first(a, b):
# 3
# 4
# 5
def second(a, b):
";
        assert_eq!(resolve(&mut record, content), Resolution::Lost);
        assert!(record.lost);
    }

    #[test]
    fn extraction_handles_multiple_languages() {
        let content = "\
def py_one(a):
fn rust_one(a: u32, b: u32)
function js_one(x, y)
async def py_async(q):
";
        let defs = extract_functions(content);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["py_one", "rust_one", "js_one", "py_async"]);
        assert_eq!(defs[1].signature.params, vec!["a", "b"]);
    }

    #[test]
    fn signature_parse_strips_annotations_and_defaults() {
        let sig = FunctionSignature::parse("path: str, mode='r', depth: int = 3");
        assert_eq!(sig.params, vec!["path", "mode", "depth"]);
    }

    #[test]
    fn similarity_scoring() {
        let a = FunctionSignature::parse("x, y");
        let b = FunctionSignature::parse("x, y");
        let c = FunctionSignature::parse("x, z");
        let d = FunctionSignature::parse("x");

        assert_eq!(a.similarity(&b), 5); // 2 positional * 2 + count bonus
        assert_eq!(a.similarity(&c), 3); // 1 positional * 2 + count bonus
        assert_eq!(a.similarity(&d), 2); // 1 positional * 2, counts differ
    }
}

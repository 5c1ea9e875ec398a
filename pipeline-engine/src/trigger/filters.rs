// Trigger Filters
// Glob pattern lists for branch, tag and path filters

use globset::{GlobBuilder, GlobMatcher};

use crate::error::DefinitionError;

/// An ordered list of glob patterns where `!` negates.
///
/// `*` stops at `/` and `**` crosses it. The last pattern that matches a
/// candidate decides whether it is included.
#[derive(Debug, Clone)]
pub struct PatternList {
    patterns: Vec<(GlobMatcher, bool)>,
}

impl PatternList {
    /// Compile a pattern list. `path` locates the list in the definition.
    pub fn new(patterns: &[String], path: &str) -> Result<Self, DefinitionError> {
        let patterns = patterns
            .iter()
            .map(|raw| {
                let (negated, pattern) = match raw.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, raw.as_str()),
                };
                GlobBuilder::new(pattern)
                    .literal_separator(true)
                    .build()
                    .map(|glob| (glob.compile_matcher(), negated))
                    .map_err(|e| {
                        DefinitionError::schema(path, format!("invalid pattern '{}': {}", raw, e))
                    })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { patterns })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let mut included = false;
        for (matcher, negated) in &self.patterns {
            if matcher.is_match(candidate) {
                included = !negated;
            }
        }
        included
    }
}

/// Apply an include list and an ignore list to one ref name.
///
/// An absent include list admits everything; an absent ignore list
/// rejects nothing.
pub fn ref_passes(
    include: Option<&PatternList>,
    ignore: Option<&PatternList>,
    name: &str,
) -> bool {
    if let Some(include) = include {
        if !include.matches(name) {
            return false;
        }
    }
    !ignore.is_some_and(|ignore| ignore.matches(name))
}

/// Apply `paths` and `paths-ignore` to the changed-file list.
///
/// `paths` needs at least one matching file. `paths-ignore` rejects only
/// when every changed file is ignored. Without a file list, any declared
/// path filter fails.
pub fn paths_pass(
    include: Option<&PatternList>,
    ignore: Option<&PatternList>,
    changed: Option<&[String]>,
) -> bool {
    if include.is_none() && ignore.is_none() {
        return true;
    }

    let Some(changed) = changed else {
        return false;
    };

    if let Some(include) = include {
        if !changed.iter().any(|file| include.matches(file)) {
            return false;
        }
    }

    if let Some(ignore) = ignore {
        if !changed.is_empty() && changed.iter().all(|file| ignore.matches(file)) {
            return false;
        }
    }

    true
}

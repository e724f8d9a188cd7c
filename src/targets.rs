//! Target name resolution.
//!
//! CLI targets are resolved case-sensitively: a group name expands to its
//! member ids, otherwise the name must be a runnable id. Unknown names fail
//! with a suggestion drawn from the known ids and group names, by prefix
//! match first and Levenshtein distance (≤ 3) second.

use thiserror::Error;

use crate::config::Config;

/// A target-resolution failure. Fatal before supervision starts.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("Unknown target {name}{}", suggestion.as_ref().map(|s| format!(" (did you mean {}?)", s)).unwrap_or_default())]
    Unknown {
        name: String,
        suggestion: Option<String>,
    },
    #[error("Group {group} references unknown service {id}")]
    UnknownGroupMember { group: String, id: String },
}

/// Resolves a list of target names to deduplicated runnable ids.
///
/// An empty list selects every declared runnable.
pub fn resolve_targets(config: &Config, names: &[String]) -> Result<Vec<String>, TargetError> {
    if names.is_empty() {
        return Ok(config.runnables.keys().cloned().collect());
    }

    let mut resolved = Vec::new();
    for name in names {
        if let Some(members) = config.groups.get(name) {
            for id in members {
                if !config.runnables.contains_key(id) {
                    return Err(TargetError::UnknownGroupMember {
                        group: name.clone(),
                        id: id.clone(),
                    });
                }
                push_unique(&mut resolved, id);
            }
        } else if config.runnables.contains_key(name) {
            push_unique(&mut resolved, name);
        } else {
            let known: Vec<&str> = config
                .runnables
                .keys()
                .map(String::as_str)
                .chain(config.groups.keys().map(String::as_str))
                .collect();
            return Err(TargetError::Unknown {
                name: name.clone(),
                suggestion: suggest(name, &known),
            });
        }
    }
    Ok(resolved)
}

fn push_unique(resolved: &mut Vec<String>, id: &str) {
    if !resolved.iter().any(|existing| existing == id) {
        resolved.push(id.to_string());
    }
}

// Prefix match beats edit distance; distances above 3 are noise.
fn suggest(name: &str, known: &[&str]) -> Option<String> {
    if let Some(candidate) = known.iter().find(|candidate| candidate.starts_with(name)) {
        return Some(candidate.to_string());
    }
    known
        .iter()
        .map(|candidate| (levenshtein(name, candidate), *candidate))
        .filter(|(distance, _)| *distance <= 3)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

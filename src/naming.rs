//! Deterministic mapping from a project path to a vector-store collection name.
//!
//! Ingestion and search MUST compute identical names for the same path, so all
//! normalization lives here and is total: every input yields a valid name.

use std::path::{Component, Path, PathBuf};

/// Path components that indicate "the next component is the project".
const PROJECT_MARKERS: &[&str] = &["projects", "repos", "code", "src"];

/// Generic directory names that never serve as a project name.
const SKIP_NAMES: &[&str] = &["home", "Users", "var", "tmp"];

/// Normalize a project path into a stable lowercase `[a-z0-9_]` name.
pub fn normalize_project_name(project_path: &Path) -> String {
    let absolute = to_absolute(project_path);

    let components: Vec<String> = absolute
        .components()
        .filter_map(|c| match c {
            Component::Normal(os) => Some(os.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();

    // Prefer the component following a project marker.
    let mut candidate: Option<&str> = None;
    for (i, part) in components.iter().enumerate() {
        if PROJECT_MARKERS.contains(&part.as_str()) {
            if let Some(next) = components.get(i + 1) {
                candidate = Some(next);
            }
            break;
        }
    }

    // Otherwise the last meaningful component.
    if candidate.is_none() {
        for part in components.iter().rev() {
            if !part.is_empty() && !part.starts_with('.') && !SKIP_NAMES.contains(&part.as_str()) {
                candidate = Some(part);
                break;
            }
        }
    }

    let normalized = sanitize(candidate.unwrap_or("default"));
    if normalized.is_empty() {
        "default".to_string()
    } else {
        normalized
    }
}

/// Collection name for a project path and provider suffix:
/// `conv_<first 8 hex of md5(project name)>_<suffix>`.
pub fn collection_for(project_path: &Path, suffix: &str) -> (String, String) {
    let project_name = normalize_project_name(project_path);
    let hash = format!("{:x}", md5::compute(project_name.as_bytes()));
    let collection = format!("conv_{}_{}", &hash[..8], suffix);
    (project_name, collection)
}

/// Reserved collection for self-authored reflections.
pub fn reflections_collection(suffix: &str) -> String {
    format!("reflections_{suffix}")
}

fn to_absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    // Resolve symlinks when possible; normalization stays total either way.
    dunce::canonicalize(&joined).unwrap_or(joined)
}

/// Lowercase and collapse every run of non-`[a-z0-9]` into a single `_`.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_marker_wins() {
        let name = normalize_project_name(Path::new("/home/alice/projects/n8n-builder/logs"));
        assert_eq!(name, "n8n_builder");
    }

    #[test]
    fn test_last_meaningful_component() {
        let name = normalize_project_name(Path::new("/root/-a-project"));
        assert_eq!(name, "a_project");
    }

    #[test]
    fn test_skip_generic_dirs() {
        let name = normalize_project_name(Path::new("/Users/bob"));
        assert_eq!(name, "bob");
    }

    #[test]
    fn test_sanitize_collapses_runs() {
        assert_eq!(sanitize("My--Cool  App!!"), "my_cool_app");
        assert_eq!(sanitize("___"), "");
    }

    #[test]
    fn test_collection_name_shape() {
        let (project, collection) = collection_for(Path::new("/data/projects/alpha"), "local");
        assert_eq!(project, "alpha");
        assert!(collection.starts_with("conv_"));
        assert!(collection.ends_with("_local"));
        // conv_ + 8 hex + _local
        assert_eq!(collection.len(), "conv_".len() + 8 + "_local".len());
    }

    #[test]
    fn test_stable_across_calls() {
        let path = Path::new("/data/projects/alpha");
        let first = collection_for(path, "voyage");
        for _ in 0..1000 {
            assert_eq!(collection_for(path, "voyage"), first);
        }
    }

    #[test]
    fn test_known_hash() {
        // md5("a_project") is fixed; the collection embeds its first 8 hex chars.
        let hash = format!("{:x}", md5::compute("a_project"));
        let (_, collection) = collection_for(Path::new("/root/-a-project"), "local");
        assert_eq!(collection, format!("conv_{}_local", &hash[..8]));
    }

    #[test]
    fn test_reflections_collection() {
        assert_eq!(reflections_collection("local"), "reflections_local");
        assert_eq!(reflections_collection("voyage"), "reflections_voyage");
    }
}

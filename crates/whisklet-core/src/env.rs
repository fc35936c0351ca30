use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Compute the effective environment for one invocation.
///
/// Merge precedence, highest first: action overrides, manifest globals,
/// process environment. `${NAME}` placeholders in any value are substituted
/// against the process environment; an unresolved placeholder is left
/// verbatim and logged, never fatal.
///
/// Pure with respect to host state: the result is an owned snapshot handed to
/// exactly one invocation. Nothing here writes to the process environment.
pub fn resolve(
    overrides: &BTreeMap<String, String>,
    global: &BTreeMap<String, String>,
    process: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = process.clone();
    for (k, v) in global {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }

    merged
        .into_iter()
        .map(|(k, v)| {
            let substituted = substitute(&v, process);
            (k, substituted)
        })
        .collect()
}

/// Snapshot the current process environment as a map.
pub fn process_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

fn substitute(value: &str, process: &BTreeMap<String, String>) -> String {
    placeholder_re()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match process.get(name) {
                Some(v) => v.clone(),
                None => {
                    tracing::warn!("unresolved placeholder ${{{name}}} left verbatim");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

//! Naming Engine
//!
//! Builds the dataset name for a new volume from a template and the
//! requesting claim's metadata. Names are deterministic and never exceed the
//! appliance's dataset name limit, leaving room for an archive prefix.

use sha2::{Digest, Sha256};

/// Longest dataset name the appliance accepts
pub const MAX_DATASET_NAME_LEN: usize = 200;

pub const DEFAULT_NAME_TEMPLATE: &str =
    "${pvc.metadata.namespace}-${pvc.metadata.name}-${pv.metadata.name}";
pub const DEFAULT_ARCHIVE_PREFIX: &str = "zz";

const HASH_LEN: usize = 10;

const NAMESPACE_TOKENS: [&str; 2] = ["${pvc.metadata.namespace}", "{namespace}"];
const NAME_TOKENS: [&str; 2] = ["${pvc.metadata.name}", "{name}"];
const PV_NAME_TOKENS: [&str; 2] = ["${pv.metadata.name}", "{pv-name}"];

/// Claim metadata substituted into the template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameMetadata {
    pub namespace: String,
    pub name: String,
    pub pv_name: String,
}

/// Render the full dataset name `<root>/<rendered template>`
pub fn build_dataset_name(
    root: &str,
    archive_prefix: &str,
    template: &str,
    meta: &NameMetadata,
) -> String {
    let template = if template.is_empty() {
        DEFAULT_NAME_TEMPLATE
    } else {
        template
    };

    let lowered = template.to_lowercase();
    let mut rendered = template.to_string();
    if !PV_NAME_TOKENS.iter().any(|t| lowered.contains(t)) {
        rendered.push('-');
        rendered.push_str(PV_NAME_TOKENS[0]);
    }

    for (tokens, value) in [
        (&NAMESPACE_TOKENS, &meta.namespace),
        (&NAME_TOKENS, &meta.name),
        (&PV_NAME_TOKENS, &meta.pv_name),
    ] {
        for token in tokens.iter() {
            rendered = rendered.replace(token, value);
        }
    }

    let full = format!("{}/{}", root.trim_matches('/'), rendered);
    truncate_with_hash(&full, name_budget(archive_prefix))
}

/// Room left for a dataset name once `<prefix>_` is reserved
pub fn name_budget(archive_prefix: &str) -> usize {
    MAX_DATASET_NAME_LEN.saturating_sub(archive_prefix.len() + 1)
}

/// Shorten `name` to at most `max` bytes, ending in `-<hash of name>`
pub fn truncate_with_hash(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let suffix = &digest[..HASH_LEN];

    let mut keep = max.saturating_sub(HASH_LEN + 1);
    while !name.is_char_boundary(keep) {
        keep -= 1;
    }
    format!("{}-{}", &name[..keep], suffix)
}

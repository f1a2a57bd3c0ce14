//! The image swap resolution algorithm: given a parsed rule set and an
//! image string, decide whether (and how) to rewrite it.

use tracing::warn;

use crate::image::ImageRef;
use crate::maps::{self, RuleTables};

/// The outcome of resolving a single image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapResult {
    pub image: String,
    pub changed: bool,
}

impl SwapResult {
    fn unchanged(image: &str) -> Self {
        SwapResult {
            image: image.to_string(),
            changed: false,
        }
    }

    fn of(image: String, original: &str) -> Self {
        let changed = image != original;
        SwapResult { image, changed }
    }
}

/// Resolves `image` against `tables` following the fixed exact > replace >
/// prefix ordering. First hit wins; later stages are never consulted once an
/// earlier one matches.
pub fn swap(image: &str, tables: &RuleTables) -> SwapResult {
    if let Some(replacement) = tables.exact.get(image) {
        return SwapResult::of(replacement.clone(), image);
    }

    if let Some(replacement) = replace_match(image, tables) {
        return SwapResult::of(replacement, image);
    }

    prefix_match(image, tables)
}

fn replace_match(image: &str, tables: &RuleTables) -> Option<String> {
    for (glob, replacement) in &tables.replace {
        if maps::glob_matches(glob, image) {
            return Some(join(replacement, basename(image)));
        }
    }
    None
}

fn basename(image: &str) -> &str {
    match image.rfind('/') {
        Some(idx) => &image[idx + 1..],
        None => image,
    }
}

fn join(prefix: &str, suffix: &str) -> String {
    if prefix.ends_with('/') {
        format!("{prefix}{suffix}")
    } else {
        format!("{prefix}/{suffix}")
    }
}

fn prefix_match(image: &str, tables: &RuleTables) -> SwapResult {
    let parsed = ImageRef::parse(image);

    let mut candidates: Vec<String> = Vec::new();
    if let Some(port) = parsed.registry_port {
        candidates.push(format!("{}:{}", parsed.registry, port));
    }
    candidates.push(parsed.registry.clone());
    if parsed.is_library {
        candidates.push(format!("{}/library", parsed.registry));
    }

    let selected = candidates
        .iter()
        .find_map(|key| tables.prefix.get(key).map(|v| (key.clone(), v.clone())));

    let (selected_key, replacement_prefix) = match selected {
        Some(found) => found,
        None => {
            if tables
                .noswap_wildcards()
                .iter()
                .any(|wildcard| image.contains(wildcard))
            {
                return SwapResult::unchanged(image);
            }
            return match tables.default_prefix() {
                Some(default) if !default.is_empty() => {
                    // No registry-keyed rule matched; the "selected key" for
                    // the in-place substitution check below falls back to the
                    // parsed registry host (with port, if the image carried
                    // one), mirroring how a registry-keyed match would have
                    // been checked against the image text.
                    (registry_key_with_port(&parsed), default.to_string())
                }
                _ => {
                    warn!(image, "no matching prefix rule and no usable default, leaving image unchanged");
                    return SwapResult::unchanged(image);
                }
            };
        }
    };

    apply_prefix(image, &parsed, &selected_key, &replacement_prefix)
}

fn registry_key_with_port(parsed: &ImageRef) -> String {
    match parsed.registry_port {
        Some(port) => format!("{}:{}", parsed.registry, port),
        None => parsed.registry.clone(),
    }
}

fn apply_prefix(image: &str, parsed: &ImageRef, selected_key: &str, prefix: &str) -> SwapResult {
    if prefix.ends_with('-') {
        let host_without_port = parsed.registry.as_str();
        let body = strip_port_before_slash(image, host_without_port, parsed.registry_port);
        let new_image = format!("{prefix}{host_without_port}/{body}");
        return SwapResult::of(new_image, image);
    }

    if image.contains(selected_key) {
        let new_image = image.replacen(selected_key, prefix, 1);
        return SwapResult::of(new_image, image);
    }

    SwapResult::of(join(prefix, image), image)
}

/// Strips a `registry:port` host (if present as a prefix of `image`) down to
/// just `registry`, matching the mirror-mode behavior of rewriting
/// `registry:port/repo` to `registry/repo` underneath the mirror root.
fn strip_port_before_slash(image: &str, host: &str, port: Option<u16>) -> String {
    match port {
        Some(p) => {
            let host_port = format!("{host}:{p}/");
            if let Some(rest) = image.strip_prefix(&host_port) {
                rest.to_string()
            } else {
                image.to_string()
            }
        }
        None => {
            let host_slash = format!("{host}/");
            image
                .strip_prefix(&host_slash)
                .map(str::to_string)
                .unwrap_or_else(|| image.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::parse as parse_map;

    #[test]
    fn scenario_default_fallback() {
        let tables = parse_map("default :: default.example.com\n");
        let result = swap("default.io/paulbower/hello-kubernetes:1.5", &tables);
        assert_eq!(result.image, "default.example.com/paulbower/hello-kubernetes:1.5");
        assert!(result.changed);
    }

    #[test]
    fn scenario_mirror_mode() {
        let tables = parse_map("docker.io :: my.example.com/mirror-docker.io-\n");
        let result = swap("docker.io/tmobile/magtape:latest", &tables);
        assert_eq!(result.image, "my.example.com/mirror-docker.io/tmobile/magtape:latest");
    }

    #[test]
    fn scenario_exact_match() {
        let tables = parse_map(
            "[EXACT]hello-world::myownrepo.example.com/base/public-image-cache:hello-world\n",
        );
        let result = swap("hello-world", &tables);
        assert_eq!(result.image, "myownrepo.example.com/base/public-image-cache:hello-world");
    }

    #[test]
    fn scenario_replace_glob() {
        let tables = parse_map("[REPLACE]*-server:*::myownrepo.example.com/base/public-image-cache\n");
        let result = swap("mysql/mysql-server:5.6", &tables);
        assert_eq!(result.image, "myownrepo.example.com/base/public-image-cache/mysql-server:5.6");
    }

    #[test]
    fn scenario_noswap_wildcard() {
        let tables = parse_map("noswap_wildcards :: .external.twr.io\n");
        let result = swap("registry.external.twr.io:443/istio/istiod:latest", &tables);
        assert!(!result.changed);
        assert_eq!(result.image, "registry.external.twr.io:443/istio/istiod:latest");
    }

    #[test]
    fn exact_beats_replace_and_prefix() {
        let tables = parse_map(
            "[EXACT]nginx::exact.example.com/nginx\n\
             [REPLACE]ngin*::replace.example.com\n\
             default::prefix.example.com\n",
        );
        let result = swap("nginx", &tables);
        assert_eq!(result.image, "exact.example.com/nginx");
    }

    #[test]
    fn replace_beats_prefix() {
        let tables = parse_map(
            "[REPLACE]mysql/*::replace.example.com\n\
             default::prefix.example.com\n",
        );
        let result = swap("mysql/mysql-server:5.6", &tables);
        assert_eq!(result.image, "replace.example.com/mysql-server:5.6");
    }

    #[test]
    fn replace_order_is_first_match_wins() {
        let tables = parse_map(
            "[REPLACE]*-server:*::first.example.com\n\
             [REPLACE]mysql*::second.example.com\n",
        );
        let result = swap("mysql/mysql-server:5.6", &tables);
        assert_eq!(result.image, "first.example.com/mysql-server:5.6");
    }

    #[test]
    fn default_fallback_substitutes_registry_when_literally_present() {
        // default.io is not a configured prefix key, so the fallback to
        // `default` applies, but because "default.io" still occurs literally
        // in the image it is substituted in place rather than prepended.
        let tables = parse_map("default::default.example.com\n");
        let result = swap("default.io/paulbower/hello-kubernetes:1.5", &tables);
        assert_eq!(result.image, "default.example.com/paulbower/hello-kubernetes:1.5");
    }

    #[test]
    fn default_fallback_prepends_when_registry_not_present_in_image() {
        let tables = parse_map("default::default.example.com\n");
        let result = swap("alpine", &tables);
        assert_eq!(result.image, "default.example.com/alpine");
    }

    #[test]
    fn missing_default_with_no_match_warns_and_is_unchanged() {
        let tables = parse_map("docker.io::my.example.com/mirror\n");
        let result = swap("quay.io/coreos/flannel:v0.14.0", &tables);
        assert!(!result.changed);
        assert_eq!(result.image, "quay.io/coreos/flannel:v0.14.0");
    }

    #[test]
    fn port_aware_prefix_keys_prefer_exact_host_port() {
        let tables = parse_map(
            "cool.io:443::specific.example.com\n\
             cool.io::generic.example.com\n",
        );
        let result = swap("cool.io:443/istio/istiod", &tables);
        assert_eq!(result.image, "specific.example.com/istio/istiod");
    }

    #[test]
    fn library_images_consult_the_library_suffixed_key() {
        let tables = parse_map("docker.io/library::cached.example.com\n");
        let result = swap("nginx", &tables);
        assert_eq!(result.image, "cached.example.com/nginx");
    }

    #[test]
    fn unchanged_result_reports_changed_false() {
        let tables = RuleTables::default();
        let result = swap("quay.io/coreos/flannel:v0.14.0", &tables);
        assert!(!result.changed);
        assert_eq!(result.image, "quay.io/coreos/flannel:v0.14.0");
    }

    #[test]
    fn idempotent_after_convergence() {
        let tables = parse_map("default :: default.example.com\n");
        let first = swap("default.io/paulbower/hello-kubernetes:1.5", &tables);
        assert!(first.changed);
        // the swapped image now carries an explicit, already-correct registry
        // that no rule matches, so a second pass is a no-op.
        let second = swap(&first.image, &tables);
        assert_eq!(second.image, first.image);
    }
}

/// Legacy single-prefix mode, predating the map-file grammar. Bypasses the
/// exact/replace/prefix tables entirely.
pub mod legacy {
    use super::SwapResult;
    use tracing::warn;

    pub fn swap(image: &str, prefix: &str) -> SwapResult {
        if prefix.is_empty() {
            warn!(image, "IMAGESWAP_MODE=LEGACY with an empty IMAGE_PREFIX, skipping swap");
            return SwapResult::unchanged(image);
        }

        if prefix.ends_with('-') {
            let new_image = format!("{prefix}{image}");
            return SwapResult::of(new_image, image);
        }

        SwapResult::of(format!("{prefix}/{image}"), image)
    }

}

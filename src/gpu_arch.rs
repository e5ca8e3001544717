//! GPU architecture normalization and the run-phase image-selection filter.
//!
//! Dockerfiles declare their target architecture with one of several
//! environment variable names depending on the toolchain they use
//! (`MAD_SYSTEM_GPU_ARCHITECTURE`, `PYTORCH_ROCM_ARCH`, `GPU_TARGETS`,
//! `GFX_COMPILATION_ARCH`, `GPU_ARCHS`). Product names ("mi300x") and gfx
//! codenames ("gfx942") are both observed in the wild and must compare
//! equal after normalization.

/// The dockerfile build-arg names known to carry a GPU architecture value.
pub const GPU_ARCH_VARS: &[&str] = &[
    "MAD_SYSTEM_GPU_ARCHITECTURE",
    "PYTORCH_ROCM_ARCH",
    "GPU_TARGETS",
    "GFX_COMPILATION_ARCH",
    "GPU_ARCHS",
];

/// Maps a product-style architecture name to its gfx codename. Returns the
/// input unchanged (lowercased) if it is already a gfx code or unknown.
pub fn normalize(arch: &str) -> String {
    let lower = arch.trim().to_lowercase();
    match lower.as_str() {
        "mi100" => "gfx908".to_string(),
        "mi200" | "mi210" | "mi250" | "mi250x" => "gfx90a".to_string(),
        "mi300" | "mi300a" => "gfx940".to_string(),
        "mi300x" => "gfx942".to_string(),
        other => other.to_string(),
    }
}

/// Normalizes every entry of a possibly comma/whitespace separated
/// architecture list, preserving order and removing exact duplicates that
/// only appeared distinct before normalization.
pub fn normalize_list(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split([',', ' ', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize)
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

/// True if `image_arches` (the architectures an image was built for, which
/// may be empty for a legacy/arch-agnostic entry) is compatible with
/// `requested` (the architecture the run phase needs).
///
/// An empty `image_arches` is treated as "any architecture" (legacy entries
/// without recorded arch metadata are never filtered out). Otherwise the
/// requested architecture, normalized, must appear in the normalized image
/// arch set.
pub fn is_compatible(image_arches: &[String], requested: &str) -> bool {
    if image_arches.is_empty() {
        return true;
    }
    let requested = normalize(requested);
    image_arches.iter().map(|a| normalize(a)).any(|a| a == requested)
}

/// Filters a list of (arch-list, item) pairs down to those compatible with
/// `requested`, preserving input order. Idempotent: filtering an
/// already-filtered list with the same `requested` value returns the same
/// list unchanged.
pub fn filter_by_arch<'a, T>(
    items: &'a [(Vec<String>, T)],
    requested: &str,
) -> Vec<&'a (Vec<String>, T)> {
    items
        .iter()
        .filter(|(arches, _)| is_compatible(arches, requested))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_known_product_names() {
        assert_eq!(normalize("MI100"), "gfx908");
        assert_eq!(normalize("mi200"), "gfx90a");
        assert_eq!(normalize("mi210"), "gfx90a");
        assert_eq!(normalize("mi250"), "gfx90a");
        assert_eq!(normalize("mi300"), "gfx940");
        assert_eq!(normalize("mi300a"), "gfx940");
        assert_eq!(normalize("mi300x"), "gfx942");
    }

    #[test]
    fn passes_through_gfx_codes_and_unknowns() {
        assert_eq!(normalize("gfx90a"), "gfx90a");
        assert_eq!(normalize("gfx999"), "gfx999");
    }

    #[test]
    fn empty_image_arches_is_always_compatible() {
        assert!(is_compatible(&[], "mi300x"));
    }

    #[test]
    fn compatibility_compares_after_normalization() {
        assert!(is_compatible(&["gfx942".to_string()], "mi300x"));
        assert!(!is_compatible(&["gfx90a".to_string()], "mi300x"));
    }

    #[test]
    fn filter_preserves_legacy_arch_agnostic_entries() {
        let items = vec![
            (vec!["gfx90a".to_string()], "a"),
            (vec![], "legacy"),
            (vec!["gfx942".to_string()], "b"),
        ];
        let filtered = filter_by_arch(&items, "mi300x");
        let names: Vec<_> = filtered.iter().map(|(_, n)| *n).collect();
        assert_eq!(names, vec!["legacy", "b"]);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(s in "[a-zA-Z0-9_]{1,16}") {
            let once = normalize(&s);
            let twice = normalize(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn filter_is_idempotent(requested in "[a-zA-Z0-9]{1,10}") {
            let items = vec![
                (vec!["gfx90a".to_string()], 1),
                (vec![], 2),
                (vec!["gfx942".to_string()], 3),
            ];
            let once = filter_by_arch(&items, &requested);
            let once_vec: Vec<(Vec<String>, i32)> = once.iter().map(|p| (*p).clone()).collect();
            let twice = filter_by_arch(&once_vec, &requested);
            prop_assert_eq!(once.len(), twice.len());
        }
    }
}

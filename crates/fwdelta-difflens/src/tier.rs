//! Security-relevance tiers for paths inside an application package.
//!
//! Paths are normalized before matching: the scratch-directory prefix of an
//! expanded package (`apk1_*`, `apk2_*`) and the one generic wrapper
//! directory that may follow it are stripped so the remaining path starts at
//! the package root. Paths without a scratch prefix are left as they are.

use std::collections::BTreeMap;

use fwdelta_core::{ChangeRecord, Tier, TierConfig};

const SCRATCH_PREFIXES: &[&str] = &["apk1_", "apk2_"];

/// Top-level entries of an expanded package. A segment after the scratch
/// prefix matching one of these is never stripped as a wrapper directory.
const PACKAGE_ROOT_ENTRIES: &[&str] = &[
    "AndroidManifest.xml",
    "META-INF",
    "res",
    "assets",
    "lib",
    "resources.arsc",
    "kotlin",
    "original",
    "apktool.yml",
    "unknown",
    "root",
];

/// Classifies package-relative paths into [`Tier`]s.
///
/// Matching order is fixed: ignore prefixes, then critical substrings, then
/// meaningful substrings. The first hit wins.
///
/// # Examples
///
/// ```
/// use fwdelta_core::Tier;
/// use fwdelta_difflens::tier::TierClassifier;
///
/// let tiers = TierClassifier::default();
/// assert_eq!(tiers.classify("classes.dex"), Tier::Critical);
/// assert_eq!(tiers.classify("lib/arm64-v8a/libfoo.so"), Tier::Meaningful);
/// assert_eq!(tiers.classify("META-INF/CERT.RSA"), Tier::Ignored);
/// assert_eq!(tiers.classify("build-data.properties"), Tier::Unclassified);
/// ```
#[derive(Debug, Clone)]
pub struct TierClassifier {
    ignore_prefixes: Vec<String>,
    critical_substrings: Vec<String>,
    meaningful_substrings: Vec<String>,
}

impl Default for TierClassifier {
    fn default() -> Self {
        Self::from_config(&TierConfig::default())
    }
}

impl TierClassifier {
    /// Build a classifier from the `[tiers]` configuration table.
    pub fn from_config(config: &TierConfig) -> Self {
        Self {
            ignore_prefixes: config.ignore_prefixes.clone(),
            critical_substrings: config.critical_substrings.clone(),
            meaningful_substrings: config.meaningful_substrings.clone(),
        }
    }

    /// Strip scratch and wrapper directories so the path starts at the
    /// package root.
    ///
    /// # Examples
    ///
    /// ```
    /// use fwdelta_difflens::tier::TierClassifier;
    ///
    /// assert_eq!(
    ///     TierClassifier::normalize("apk1_x8f2/Dialer/smali/a/B.smali"),
    ///     "smali/a/B.smali"
    /// );
    /// assert_eq!(TierClassifier::normalize("res/layout/main.xml"), "res/layout/main.xml");
    /// assert_eq!(TierClassifier::normalize("Foo/res/main.xml"), "Foo/res/main.xml");
    /// ```
    pub fn normalize(path: &str) -> String {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let scratch = segments.first().is_some_and(|first| {
            SCRATCH_PREFIXES
                .iter()
                .any(|p| first.starts_with(p) && first.len() > p.len())
        });
        if scratch {
            segments.remove(0);
            if segments.len() >= 2 && !is_package_root_entry(segments[0]) {
                segments.remove(0);
            }
        }

        segments.join("/")
    }

    /// Classify one path (normalized first).
    pub fn classify(&self, path: &str) -> Tier {
        let normalized = Self::normalize(path);

        if self
            .ignore_prefixes
            .iter()
            .any(|p| normalized.starts_with(p.as_str()))
        {
            return Tier::Ignored;
        }
        if self
            .critical_substrings
            .iter()
            .any(|s| normalized.contains(s.as_str()))
        {
            return Tier::Critical;
        }
        if self
            .meaningful_substrings
            .iter()
            .any(|s| normalized.contains(s.as_str()))
        {
            return Tier::Meaningful;
        }
        Tier::Unclassified
    }

    /// Group records by the tier of their `new_path`.
    ///
    /// Every record lands in exactly one bucket; input order is kept within
    /// each bucket.
    pub fn classify_records<'a, I>(&self, records: I) -> BTreeMap<Tier, Vec<ChangeRecord>>
    where
        I: IntoIterator<Item = &'a ChangeRecord>,
    {
        let mut buckets: BTreeMap<Tier, Vec<ChangeRecord>> = BTreeMap::new();
        for record in records {
            buckets
                .entry(self.classify(record.new_path()))
                .or_default()
                .push(record.clone());
        }
        buckets
    }
}

fn is_package_root_entry(segment: &str) -> bool {
    if PACKAGE_ROOT_ENTRIES.contains(&segment) {
        return true;
    }
    segment.starts_with("smali") || (segment.starts_with("classes") && segment.ends_with(".dex"))
}

#[cfg(test)]
mod tests {
    use fwdelta_core::LineCount;

    use super::*;

    #[test]
    fn critical_paths() {
        let tiers = TierClassifier::default();
        for path in [
            "AndroidManifest.xml",
            "classes.dex",
            "classes3.dex",
            "apk2_abc/Foo/AndroidManifest.xml",
        ] {
            assert_eq!(tiers.classify(path), Tier::Critical, "{path}");
        }
    }

    #[test]
    fn smali_classes_dirs_match_critical_substring() {
        let tiers = TierClassifier::default();
        assert_eq!(
            tiers.classify("smali_classes2/com/app/Main.smali"),
            Tier::Critical
        );
        assert_eq!(tiers.classify("smali/com/app/Main.smali"), Tier::Meaningful);
    }

    #[test]
    fn meaningful_paths() {
        let tiers = TierClassifier::default();
        for path in [
            "lib/armeabi-v7a/libnative.so",
            "assets/config.json",
            "res/values/strings.xml",
            "resources.arsc",
            "kotlin/collections/List.kotlin_builtins",
        ] {
            assert_eq!(tiers.classify(path), Tier::Meaningful, "{path}");
        }
    }

    #[test]
    fn ignored_paths_win_over_substrings() {
        let tiers = TierClassifier::default();
        // contains "classes" but the prefix rule runs first
        assert_eq!(tiers.classify("META-INF/classes.list"), Tier::Ignored);
        assert_eq!(tiers.classify("original/AndroidManifest.xml"), Tier::Ignored);
        assert_eq!(tiers.classify("apktool.yml"), Tier::Ignored);
        assert_eq!(tiers.classify("stamp-cert-sha256"), Tier::Ignored);
    }

    #[test]
    fn unclassified_fallback() {
        let tiers = TierClassifier::default();
        assert_eq!(tiers.classify("DebugProbesKt.bin"), Tier::Unclassified);
        assert_eq!(tiers.classify("unknown/okhttp3/publicsuffixes.gz"), Tier::Unclassified);
    }

    #[test]
    fn normalize_strips_scratch_and_wrapper() {
        assert_eq!(
            TierClassifier::normalize("apk1_q9/Settings/res/xml/prefs.xml"),
            "res/xml/prefs.xml"
        );
        assert_eq!(
            TierClassifier::normalize("apk2_q9/lib/arm64/libx.so"),
            "lib/arm64/libx.so"
        );
        // bare scratch prefix is not a scratch directory
        assert_eq!(TierClassifier::normalize("apk1_"), "apk1_");
        // single remaining segment is never stripped
        assert_eq!(TierClassifier::normalize("apk1_q9/Foo"), "Foo");
    }

    #[test]
    fn wrapper_dir_kept_without_scratch_prefix() {
        let tiers = TierClassifier::default();
        assert_eq!(
            TierClassifier::normalize("Foo/original/AndroidManifest.xml"),
            "Foo/original/AndroidManifest.xml"
        );
        assert_eq!(tiers.classify("Foo/original/AndroidManifest.xml"), Tier::Critical);
        assert_eq!(tiers.classify("Foo/META-INF/classes.list"), Tier::Critical);
        assert_eq!(tiers.classify("apk1_q9/Foo/META-INF/classes.list"), Tier::Ignored);
    }

    #[test]
    fn custom_config_lists() {
        let config = TierConfig {
            ignore_prefixes: vec!["res/raw/".into()],
            critical_substrings: vec!["policy".into()],
            meaningful_substrings: vec![],
        };
        let tiers = TierClassifier::from_config(&config);
        assert_eq!(tiers.classify("res/raw/policy.xml"), Tier::Ignored);
        assert_eq!(tiers.classify("assets/policy.xml"), Tier::Critical);
        assert_eq!(tiers.classify("lib/x.so"), Tier::Unclassified);
    }

    #[test]
    fn records_are_partitioned() {
        let records = vec![
            ChangeRecord::modified("classes.dex", LineCount::NonText, LineCount::NonText),
            ChangeRecord::modified("META-INF/MANIFEST.MF", LineCount::Lines(3), LineCount::Lines(3)),
            ChangeRecord::added("lib/x86/liba.so", LineCount::NonText, LineCount::NonText),
            ChangeRecord::deleted("foo.properties", LineCount::Lines(0), LineCount::Lines(1)),
        ];
        let buckets = TierClassifier::default().classify_records(&records);
        let total: usize = buckets.values().map(Vec::len).sum();
        assert_eq!(total, records.len());
        assert_eq!(buckets[&Tier::Critical].len(), 1);
        assert_eq!(buckets[&Tier::Meaningful].len(), 1);
        assert_eq!(buckets[&Tier::Ignored].len(), 1);
        assert_eq!(buckets[&Tier::Unclassified].len(), 1);
    }
}

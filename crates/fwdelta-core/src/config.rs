use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FwdeltaError;

/// Top-level configuration loaded from `.fwdelta.toml`.
///
/// Supports layered resolution: CLI flags > local config > defaults.
///
/// # Examples
///
/// ```
/// use fwdelta_core::FwdeltaConfig;
///
/// let config = FwdeltaConfig::default();
/// assert_eq!(config.analysis.entropy_threshold, 7.5);
/// assert_eq!(config.tools.timeout_secs, 300);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FwdeltaConfig {
    /// External tool locations and limits.
    #[serde(default)]
    pub tools: ToolConfig,
    /// Deep-analysis dispatch settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Path lists used by the tier classifier.
    #[serde(default)]
    pub tiers: TierConfig,
    /// Permission protection-level weight tables.
    #[serde(default)]
    pub protection: ProtectionWeights,
}

impl FwdeltaConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FwdeltaError::Io`] if the file cannot be read, or
    /// [`FwdeltaError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fwdelta_core::FwdeltaConfig;
    /// use std::path::Path;
    ///
    /// let config = FwdeltaConfig::from_file(Path::new(".fwdelta.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, FwdeltaError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`FwdeltaError::Toml`] if parsing fails, or
    /// [`FwdeltaError::Config`] if a value is out of range.
    ///
    /// # Examples
    ///
    /// ```
    /// use fwdelta_core::FwdeltaConfig;
    ///
    /// let toml = r#"
    /// [analysis]
    /// digest_key_depth = 2
    /// "#;
    /// let config = FwdeltaConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.analysis.digest_key_depth, 2);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, FwdeltaError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), FwdeltaError> {
        if self.analysis.digest_key_depth == 0 {
            return Err(FwdeltaError::Config(
                "analysis.digest_key_depth must be at least 1".into(),
            ));
        }
        if !(0.0..=8.0).contains(&self.analysis.entropy_threshold) {
            return Err(FwdeltaError::Config(format!(
                "analysis.entropy_threshold must be within 0..=8 bits/byte, got {}",
                self.analysis.entropy_threshold
            )));
        }
        if self.tools.timeout_secs == 0 {
            return Err(FwdeltaError::Config(
                "tools.timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// External comparator and inspector settings.
///
/// # Examples
///
/// ```
/// use fwdelta_core::ToolConfig;
///
/// let tools = ToolConfig::default();
/// assert_eq!(tools.radiff2, "radiff2");
/// assert_eq!(tools.checksec, "checksec");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Binary comparator program (default: `radiff2`).
    #[serde(default = "default_radiff2")]
    pub radiff2: String,
    /// Hardening inspector program (default: `checksec`).
    #[serde(default = "default_checksec")]
    pub checksec: String,
    /// Bytecode disassembler used for deep DEX diffs (default: `dexdump`).
    #[serde(default = "default_dexdump")]
    pub dexdump: String,
    /// Wall-clock limit per tool invocation, in seconds (default: 300).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_radiff2() -> String {
    "radiff2".into()
}

fn default_checksec() -> String {
    "checksec".into()
}

fn default_dexdump() -> String {
    "dexdump".into()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            radiff2: default_radiff2(),
            checksec: default_checksec(),
            dexdump: default_dexdump(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Deep-analysis dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Bits/byte above which content is treated as opaque (default: 7.5).
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,
    /// Number of leading bytes sampled for entropy (default: 4096).
    #[serde(default = "default_entropy_window")]
    pub entropy_window: usize,
    /// Number of trailing path segments used as a digest key (default: 3).
    #[serde(default = "default_digest_key_depth")]
    pub digest_key_depth: usize,
    /// Attach a textual diff to differing certificates (default: false).
    #[serde(default)]
    pub certificate_text_diff: bool,
    /// Run analyzers for independent artifacts in parallel (default: true).
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// File extensions handled as application packages.
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,
    /// Directory names that hold certificate stores.
    #[serde(default = "default_certificate_dirs")]
    pub certificate_dirs: Vec<String>,
    /// Trusted-execution wrapper magics, checked at `wrapper_magic_offset`.
    #[serde(default = "default_wrapper_magics")]
    pub wrapper_magics: Vec<String>,
    /// Byte offset of the wrapper magic (default: 0).
    #[serde(default)]
    pub wrapper_magic_offset: usize,
    /// Glob patterns excluded from deep analysis.
    #[serde(default)]
    pub skip_patterns: Vec<String>,
}

fn default_entropy_threshold() -> f64 {
    7.5
}

fn default_entropy_window() -> usize {
    4096
}

fn default_digest_key_depth() -> usize {
    3
}

fn default_parallel() -> bool {
    true
}

fn default_archive_extensions() -> Vec<String> {
    vec!["apk".into()]
}

fn default_certificate_dirs() -> Vec<String> {
    vec!["cacerts".into(), "cacerts_google".into()]
}

fn default_wrapper_magics() -> Vec<String> {
    vec!["SEC2".into(), "SEC3".into(), "SEC4".into(), "MCLF".into()]
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            entropy_threshold: default_entropy_threshold(),
            entropy_window: default_entropy_window(),
            digest_key_depth: default_digest_key_depth(),
            certificate_text_diff: false,
            parallel: default_parallel(),
            archive_extensions: default_archive_extensions(),
            certificate_dirs: default_certificate_dirs(),
            wrapper_magics: default_wrapper_magics(),
            wrapper_magic_offset: 0,
            skip_patterns: Vec::new(),
        }
    }
}

/// Path lists driving tier classification.
///
/// # Examples
///
/// ```
/// use fwdelta_core::TierConfig;
///
/// let tiers = TierConfig::default();
/// assert!(tiers.ignore_prefixes.iter().any(|p| p == "META-INF/"));
/// assert!(tiers.critical_substrings.iter().any(|s| s == "AndroidManifest.xml"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Prefixes of signing and packaging metadata (tier 3).
    #[serde(default = "default_ignore_prefixes")]
    pub ignore_prefixes: Vec<String>,
    /// Substrings marking manifest and compiled bytecode (tier 1).
    #[serde(default = "default_critical_substrings")]
    pub critical_substrings: Vec<String>,
    /// Substrings marking native code, assets and resources (tier 2).
    #[serde(default = "default_meaningful_substrings")]
    pub meaningful_substrings: Vec<String>,
}

fn default_ignore_prefixes() -> Vec<String> {
    ["META-INF/", "original/", "stamp-cert-sha256", "apktool.yml"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_critical_substrings() -> Vec<String> {
    vec!["classes".into(), "AndroidManifest.xml".into()]
}

fn default_meaningful_substrings() -> Vec<String> {
    ["lib/", "assets/", "res/", "resources.arsc", "smali", "kotlin/"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            ignore_prefixes: default_ignore_prefixes(),
            critical_substrings: default_critical_substrings(),
            meaningful_substrings: default_meaningful_substrings(),
        }
    }
}

/// Protection-level weight tables.
///
/// Values are in tenths of a point so fractional flags such as `pre23`
/// (half a point) stay exact integers.
///
/// # Examples
///
/// ```
/// use fwdelta_core::ProtectionWeights;
///
/// let w = ProtectionWeights::default();
/// assert_eq!(w.base_levels["normal"], 100);
/// assert_eq!(w.flag_weights["privileged"], 50);
/// assert_eq!(w.default_flag_weight, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionWeights {
    /// Base level name to score.
    #[serde(default = "default_base_levels")]
    pub base_levels: BTreeMap<String, u32>,
    /// Base level assumed when none is recognized (default: `normal`).
    #[serde(default = "default_base_level")]
    pub default_base: String,
    /// Modifier flag name to weight.
    #[serde(default = "default_flag_weights")]
    pub flag_weights: BTreeMap<String, u32>,
    /// Weight of flags missing from `flag_weights` (default: 10).
    #[serde(default = "default_flag_weight")]
    pub default_flag_weight: u32,
}

fn default_base_levels() -> BTreeMap<String, u32> {
    [
        ("normal", 100),
        ("dangerous", 200),
        ("signature", 300),
        ("signatureOrSystem", 300),
        ("internal", 400),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_base_level() -> String {
    "normal".into()
}

fn default_flag_weights() -> BTreeMap<String, u32> {
    [
        ("privileged", 50),
        ("appop", 20),
        ("runtime", 20),
        ("instant", 10),
        ("development", 10),
        ("verifier", 10),
        ("installer", 10),
        ("preinstalled", 10),
        ("vendorPrivileged", 30),
        ("pre23", 5),
        ("setup", 10),
        ("oem", 10),
        ("systemTextClassifier", 10),
        ("documenter", 10),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_flag_weight() -> u32 {
    10
}

impl Default for ProtectionWeights {
    fn default() -> Self {
        Self {
            base_levels: default_base_levels(),
            default_base: default_base_level(),
            flag_weights: default_flag_weights(),
            default_flag_weight: default_flag_weight(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = FwdeltaConfig::default();
        assert_eq!(config.tools.radiff2, "radiff2");
        assert_eq!(config.tools.dexdump, "dexdump");
        assert_eq!(config.analysis.entropy_window, 4096);
        assert_eq!(config.analysis.digest_key_depth, 3);
        assert!(config.analysis.parallel);
        assert!(!config.analysis.certificate_text_diff);
        assert_eq!(config.analysis.archive_extensions, vec!["apk"]);
        assert_eq!(config.analysis.wrapper_magic_offset, 0);
        assert!(config.analysis.skip_patterns.is_empty());
        assert_eq!(config.protection.default_base, "normal");
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = FwdeltaConfig::from_toml("").unwrap();
        assert_eq!(config.analysis.entropy_threshold, 7.5);
        assert_eq!(config.tiers.critical_substrings.len(), 2);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[tools]
radiff2 = "/opt/r2/bin/radiff2"
timeout_secs = 60

[analysis]
entropy_threshold = 7.9
certificate_text_diff = true
parallel = false
skip_patterns = ["vendor/firmware/**"]

[protection.flag_weights]
privileged = 80
"#;
        let config = FwdeltaConfig::from_toml(toml).unwrap();
        assert_eq!(config.tools.radiff2, "/opt/r2/bin/radiff2");
        assert_eq!(config.tools.checksec, "checksec");
        assert_eq!(config.tools.timeout_secs, 60);
        assert_eq!(config.analysis.entropy_threshold, 7.9);
        assert!(config.analysis.certificate_text_diff);
        assert!(!config.analysis.parallel);
        assert_eq!(config.analysis.skip_patterns, vec!["vendor/firmware/**"]);
        assert_eq!(config.protection.flag_weights["privileged"], 80);
        assert_eq!(config.protection.base_levels["internal"], 400);
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(FwdeltaConfig::from_toml("{{invalid}}").is_err());
    }

    #[test]
    fn out_of_range_values_rejected() {
        let err = FwdeltaConfig::from_toml("[analysis]\ndigest_key_depth = 0\n").unwrap_err();
        assert!(matches!(err, FwdeltaError::Config(_)));

        let err = FwdeltaConfig::from_toml("[analysis]\nentropy_threshold = 9.0\n").unwrap_err();
        assert!(matches!(err, FwdeltaError::Config(_)));

        let err = FwdeltaConfig::from_toml("[tools]\ntimeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, FwdeltaError::Config(_)));
    }
}

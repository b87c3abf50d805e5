//! Broadcast actions received but never declared protected.
//!
//! A package that filters for a broadcast action nobody declared as
//! `protected-broadcast` can be sent that broadcast by any other package.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

/// Package to the broadcast actions listed under it.
pub type BroadcastListing = BTreeMap<String, Vec<String>>;

fn parse_sections(input: &str, header: impl Fn(&str) -> Option<&str>) -> BroadcastListing {
    let mut listing = BroadcastListing::new();
    let mut current: Option<String> = None;

    for line in input.lines().map(str::trim) {
        if let Some(package) = header(line) {
            let package = package.trim().to_string();
            listing.entry(package.clone()).or_default();
            current = Some(package);
        } else if let (Some(package), false) = (&current, line.is_empty()) {
            listing.entry(package.clone()).or_default().push(line.to_string());
        }
    }

    listing
}

/// Parse a protected-broadcast listing: `### <package>` headers, then one
/// action per line. Lines before the first header are ignored.
///
/// # Examples
///
/// ```
/// use fwdelta_rank::broadcasts::parse_protected_broadcasts;
///
/// let listing = parse_protected_broadcasts("### framework-res.apk\nandroid.intent.action.BOOT_COMPLETED\n");
/// assert_eq!(listing["framework-res.apk"], ["android.intent.action.BOOT_COMPLETED"]);
/// ```
pub fn parse_protected_broadcasts(input: &str) -> BroadcastListing {
    parse_sections(input, |line| line.strip_prefix("###"))
}

/// Parse an intent-filter listing: `== <package> ==` headers (closing `==`
/// optional), then one action per line.
pub fn parse_intent_filters(input: &str) -> BroadcastListing {
    parse_sections(input, |line| {
        line.strip_prefix("==")
            .map(|rest| rest.strip_suffix("==").unwrap_or(rest))
    })
}

/// Per package, the filtered actions missing from every protected listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UndeclaredBroadcasts(pub BTreeMap<String, Vec<String>>);

impl UndeclaredBroadcasts {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UndeclaredBroadcasts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (package, actions) in &self.0 {
            writeln!(f, "{package}")?;
            for action in actions {
                writeln!(f, "  {action}")?;
            }
        }
        Ok(())
    }
}

/// Find filtered actions that no package declares protected.
///
/// Declarations from all packages are pooled. Packages without an
/// undeclared action are left out.
pub fn undeclared_broadcasts(protected: &BroadcastListing, intents: &BroadcastListing) -> UndeclaredBroadcasts {
    let declared: BTreeSet<&str> = protected.values().flatten().map(String::as_str).collect();

    let undeclared: BTreeMap<String, Vec<String>> = intents
        .iter()
        .filter_map(|(package, actions)| {
            let missing: Vec<String> = actions
                .iter()
                .filter(|a| !declared.contains(a.as_str()))
                .cloned()
                .collect();
            (!missing.is_empty()).then(|| (package.clone(), missing))
        })
        .collect();

    tracing::debug!(
        packages = undeclared.len(),
        declared = declared.len(),
        "checked broadcast declarations"
    );
    UndeclaredBroadcasts(undeclared)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTECTED: &str = "\
stray line
### framework-res.apk
android.intent.action.BOOT_COMPLETED

android.intent.action.SCREEN_ON
### Settings.apk
com.android.settings.PROTECTED
";

    const INTENTS: &str = "\
== Settings.apk ==
android.intent.action.BOOT_COMPLETED
com.android.settings.PROTECTED
== Vendor.apk ==
com.vendor.action.UNLOCK
android.intent.action.SCREEN_ON
== Quiet.apk
";

    #[test]
    fn headers_and_blank_lines() {
        let p = parse_protected_broadcasts(PROTECTED);
        assert_eq!(p.len(), 2);
        assert_eq!(p["framework-res.apk"].len(), 2);

        let i = parse_intent_filters(INTENTS);
        assert_eq!(i["Vendor.apk"], ["com.vendor.action.UNLOCK", "android.intent.action.SCREEN_ON"]);
        assert!(i["Quiet.apk"].is_empty());
    }

    #[test]
    fn declarations_pool_across_packages() {
        let out = undeclared_broadcasts(&parse_protected_broadcasts(PROTECTED), &parse_intent_filters(INTENTS));
        assert_eq!(out.0.len(), 1);
        assert_eq!(out.0["Vendor.apk"], ["com.vendor.action.UNLOCK"]);
        assert_eq!(out.to_string(), "Vendor.apk\n  com.vendor.action.UNLOCK\n");
    }

    #[test]
    fn nothing_declared() {
        let out = undeclared_broadcasts(&BroadcastListing::new(), &parse_intent_filters("== A.apk ==\nx.Y\n"));
        assert_eq!(serde_json::to_string(&out).unwrap(), r#"{"A.apk":["x.Y"]}"#);
        assert!(undeclared_broadcasts(&BroadcastListing::new(), &BroadcastListing::new()).is_empty());
    }
}

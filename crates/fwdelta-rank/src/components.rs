//! Package component permissions and visibility.
//!
//! A package manifest declares activities, services, receivers and providers.
//! Each may guard itself with `permission`, `readPermission` or
//! `writePermission`, and each may be exported to other packages. Weakening
//! either between snapshots widens the attack surface of the package.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use fwdelta_core::FwdeltaError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use serde::{Deserialize, Deserializer, Serialize};

use crate::protection::{ProtectionDigest, ProtectionLevelScorer, ProtectionScore};

const ANDROID_NS: &[u8] = b"http://schemas.android.com/apk/res/android";

const PERMISSION_ATTRS: [&str; 3] = ["permission", "readPermission", "writePermission"];

/// Kind of manifest component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Activity,
    Service,
    Receiver,
    Provider,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 4] = [Self::Activity, Self::Service, Self::Receiver, Self::Provider];

    /// The manifest element name.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Service => "service",
            Self::Receiver => "receiver",
            Self::Provider => "provider",
        }
    }

    fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag().as_bytes() == tag)
    }

    /// Whether the component falls back to the application-wide permission.
    fn inherits_app_permission(self) -> bool {
        !matches!(self, Self::Provider)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Permission attribute name to permission, e.g. `readPermission -> p.READ`.
pub type ComponentPermissions = BTreeMap<String, String>;

/// Components of one package, by kind and then by component name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestComponents {
    #[serde(default)]
    pub components: BTreeMap<ComponentKind, BTreeMap<String, ComponentPermissions>>,
}

impl ManifestComponents {
    fn get(&self, kind: ComponentKind) -> Option<&BTreeMap<String, ComponentPermissions>> {
        self.components.get(&kind)
    }
}

/// Package path to its components.
pub type ComponentMap = BTreeMap<String, ManifestComponents>;

fn android_attrs(reader: &NsReader<&[u8]>, element: &BytesStart<'_>) -> BTreeMap<String, String> {
    element
        .attributes()
        .filter_map(Result::ok)
        .filter_map(|attr| {
            let (ns, local) = reader.resolve_attribute(attr.key);
            if !matches!(ns, ResolveResult::Bound(Namespace(uri)) if uri == ANDROID_NS) {
                return None;
            }
            let value = attr.unescape_value().ok()?.into_owned();
            Some((String::from_utf8_lossy(local.as_ref()).into_owned(), value))
        })
        .collect()
}

/// Read the component permissions out of a decoded package manifest.
///
/// Only components directly under the top-level `<application>` count, and
/// only attributes in the Android namespace. Activities, services and
/// receivers without their own `permission` take the application's.
/// Returns `Ok(None)` for a manifest without `<application>`.
///
/// # Errors
///
/// Returns [`FwdeltaError::Format`] when the text is not well-formed XML.
///
/// # Examples
///
/// ```
/// use fwdelta_rank::components::{parse_manifest, ComponentKind};
///
/// let xml = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android">
///   <application android:permission="p.APP">
///     <service android:name=".Sync"/>
///     <provider android:name=".Data" android:readPermission="p.READ"/>
///   </application>
/// </manifest>"#;
/// let parsed = parse_manifest(xml).unwrap().unwrap();
/// let services = &parsed.components[&ComponentKind::Service];
/// assert_eq!(services[".Sync"]["permission"], "p.APP");
/// let providers = &parsed.components[&ComponentKind::Provider];
/// assert!(!providers[".Data"].contains_key("permission"));
/// ```
pub fn parse_manifest(xml: &str) -> Result<Option<ManifestComponents>, FwdeltaError> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut walk = ManifestWalk::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => walk.element(&reader, e, true),
            Ok(Event::Empty(ref e)) => walk.element(&reader, e, false),
            Ok(Event::End(_)) => walk.close(),
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FwdeltaError::Format(format!(
                    "invalid manifest at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(walk.parsed)
}

#[derive(Default)]
struct ManifestWalk {
    depth: usize,
    in_application: bool,
    app_permission: Option<String>,
    parsed: Option<ManifestComponents>,
}

impl ManifestWalk {
    fn element(&mut self, reader: &NsReader<&[u8]>, e: &BytesStart<'_>, opens: bool) {
        let name = e.local_name();
        match self.depth {
            1 if name.as_ref() == b"application" && self.parsed.is_none() => {
                self.app_permission = android_attrs(reader, e).remove("permission");
                self.parsed = Some(ManifestComponents {
                    components: ComponentKind::ALL
                        .into_iter()
                        .map(|k| (k, BTreeMap::new()))
                        .collect(),
                });
                self.in_application = opens;
            }
            2 if self.in_application => {
                if let Some(kind) = ComponentKind::from_tag(name.as_ref()) {
                    self.component(kind, android_attrs(reader, e));
                }
            }
            _ => {}
        }
        if opens {
            self.depth += 1;
        }
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 1 {
            self.in_application = false;
        }
    }

    fn component(&mut self, kind: ComponentKind, mut attrs: BTreeMap<String, String>) {
        let Some(name) = attrs.remove("name").filter(|n| !n.is_empty()) else {
            tracing::debug!(%kind, "skipping unnamed component");
            return;
        };
        let mut perms: ComponentPermissions = PERMISSION_ATTRS
            .iter()
            .filter_map(|key| attrs.remove(*key).filter(|v| !v.is_empty()).map(|v| (key.to_string(), v)))
            .collect();
        if kind.inherits_app_permission() && !perms.contains_key("permission") {
            if let Some(app) = &self.app_permission {
                perms.insert("permission".to_string(), app.clone());
            }
        }
        if let Some(parsed) = self.parsed.as_mut() {
            parsed.components.entry(kind).or_default().insert(name, perms);
        }
    }
}

/// A component whose permission guard moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentChange {
    /// Package path.
    pub apk: String,
    /// Component name.
    pub component: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    /// The changed attribute; unset for a protection-level move of an unchanged guard.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_type: Option<String>,
    /// The guarding permission (the removed one for a dropped guard).
    pub permission: String,
    /// e.g. `score 10 -> 30` or `added with score 30`.
    pub change: String,
}

/// Components guarded more or less strictly than before.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComponentDigest {
    pub increased: Vec<ComponentChange>,
    pub decreased: Vec<ComponentChange>,
}

impl fmt::Display for ComponentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, changes) in [("INCREASED", &self.increased), ("DECREASED", &self.decreased)] {
            for c in changes {
                write!(f, "[{label}] {} {} {}", c.apk, c.kind, c.component)?;
                match &c.permission_type {
                    Some(attr) => writeln!(f, " {attr}={}: {}", c.permission, c.change)?,
                    None => writeln!(f, " {}: {}", c.permission, c.change)?,
                }
            }
        }
        Ok(())
    }
}

/// Compare component guards of two package-component maps.
///
/// A guard attribute that appears, disappears or points at a permission of a
/// different score is reported, scored against `levels`; unknown permissions
/// score as the default base and an absent guard scores zero. A guard that
/// kept its permission is reported when that permission's level moved in
/// `digest`.
pub fn compare_components(
    scorer: &ProtectionLevelScorer,
    old: &ComponentMap,
    new: &ComponentMap,
    levels: &BTreeMap<String, String>,
    digest: &ProtectionDigest,
) -> ComponentDigest {
    let score = |perm: Option<&String>| -> ProtectionScore {
        perm.map(|p| scorer.score(levels.get(p).map_or("", String::as_str)))
            .unwrap_or_default()
    };
    let empty = BTreeMap::new();
    let no_perms = ComponentPermissions::new();
    let mut result = ComponentDigest::default();

    let apks: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for apk in apks {
        for kind in ComponentKind::ALL {
            let old_entries = old.get(apk).and_then(|m| m.get(kind)).unwrap_or(&empty);
            let new_entries = new.get(apk).and_then(|m| m.get(kind)).unwrap_or(&empty);
            let names: BTreeSet<&String> = old_entries.keys().chain(new_entries.keys()).collect();

            for name in names {
                let old_perms = old_entries.get(name).unwrap_or(&no_perms);
                let new_perms = new_entries.get(name).unwrap_or(&no_perms);
                let change = |permission_type: Option<&str>, permission: &str, detail: String| ComponentChange {
                    apk: apk.clone(),
                    component: name.clone(),
                    kind,
                    permission_type: permission_type.map(str::to_string),
                    permission: permission.to_string(),
                    change: detail,
                };

                let attrs: BTreeSet<&String> = old_perms.keys().chain(new_perms.keys()).collect();
                let mut unchanged = BTreeSet::new();
                for attr in attrs {
                    let (old_perm, new_perm) = (old_perms.get(attr), new_perms.get(attr));
                    let (old_score, new_score) = (score(old_perm), score(new_perm));
                    match (old_perm, new_perm) {
                        (Some(o), Some(n)) if o == n => {
                            unchanged.insert(n);
                        }
                        (None, Some(n)) => result.increased.push(change(
                            Some(attr.as_str()),
                            n,
                            format!("added with score {new_score}"),
                        )),
                        (Some(o), None) => result.decreased.push(change(
                            Some(attr.as_str()),
                            o,
                            format!("removed with score {old_score}"),
                        )),
                        (Some(_), Some(n)) => {
                            let moved = format!("score {old_score} -> {new_score}");
                            if new_score > old_score {
                                result.increased.push(change(Some(attr.as_str()), n, moved));
                            } else if new_score < old_score {
                                result.decreased.push(change(Some(attr.as_str()), n, moved));
                            }
                        }
                        (None, None) => {}
                    }
                }

                for perm in unchanged {
                    let Some(level) = digest.change_for(perm) else {
                        continue;
                    };
                    let moved = format!(
                        "score {} -> {} (protection level change)",
                        level.old_score, level.new_score
                    );
                    if level.new_score > level.old_score {
                        result.increased.push(change(None, perm, moved));
                    } else if level.new_score < level.old_score {
                        result.decreased.push(change(None, perm, moved));
                    }
                }
            }
        }
    }

    tracing::debug!(
        increased = result.increased.len(),
        decreased = result.decreased.len(),
        "compared component guards"
    );
    result
}

fn exported_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// One component entry of a visibility dump.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExportedComponent {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    /// `"true"` or `"false"`; booleans are read as their text.
    #[serde(default, deserialize_with = "exported_text")]
    pub exported: Option<String>,
}

/// Package path to its components' export state.
pub type VisibilityMap = BTreeMap<String, Vec<ExportedComponent>>;

/// Component identity inside a [`VisibilityChange`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ComponentRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

/// A component whose export state flipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisibilityChange {
    /// Package file name.
    pub app: String,
    pub component: ComponentRef,
    pub from: String,
    pub to: String,
}

/// Components that became exported or stopped being exported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VisibilityDigest {
    pub increased_visibility: Vec<VisibilityChange>,
    pub decreased_visibility: Vec<VisibilityChange>,
}

impl fmt::Display for VisibilityDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, changes) in [
            ("EXPORTED", &self.increased_visibility),
            ("UNEXPORTED", &self.decreased_visibility),
        ] {
            for c in changes {
                writeln!(f, "[{label}] {} {} {}", c.app, c.component.kind, c.component.name)?;
            }
        }
        Ok(())
    }
}

fn by_app(map: &VisibilityMap) -> BTreeMap<&str, BTreeMap<ComponentRef, Option<&str>>> {
    let mut apps: BTreeMap<&str, BTreeMap<ComponentRef, Option<&str>>> = BTreeMap::new();
    for (path, components) in map {
        let app = path.rsplit('/').next().unwrap_or(path);
        let entry = apps.entry(app).or_default();
        for c in components {
            let key = ComponentRef {
                kind: c.kind.clone(),
                name: c.name.clone(),
            };
            entry.insert(key, c.exported.as_deref());
        }
    }
    apps
}

/// Compare component export state between two visibility dumps.
///
/// Packages are matched by file name so that a package moving between
/// partitions still pairs up. Only components present on both sides are
/// compared, and only `false -> true` and `true -> false` count.
///
/// # Examples
///
/// ```
/// use fwdelta_rank::components::{compare_visibility, VisibilityMap};
///
/// let old: VisibilityMap = serde_json::from_str(
///     r#"{"system/app/Foo/Foo.apk": [{"type": "receiver", "name": ".Boot", "exported": "false"}]}"#,
/// ).unwrap();
/// let new: VisibilityMap = serde_json::from_str(
///     r#"{"product/app/Foo/Foo.apk": [{"type": "receiver", "name": ".Boot", "exported": true}]}"#,
/// ).unwrap();
/// let digest = compare_visibility(&old, &new);
/// assert_eq!(digest.increased_visibility[0].app, "Foo.apk");
/// ```
pub fn compare_visibility(old: &VisibilityMap, new: &VisibilityMap) -> VisibilityDigest {
    let (old, new) = (by_app(old), by_app(new));
    let mut digest = VisibilityDigest::default();

    for (app, old_components) in &old {
        let Some(new_components) = new.get(app) else {
            continue;
        };
        for (component, old_exported) in old_components {
            let Some(new_exported) = new_components.get(component) else {
                continue;
            };
            let bucket = match (*old_exported, *new_exported) {
                (Some("false"), Some("true")) => &mut digest.increased_visibility,
                (Some("true"), Some("false")) => &mut digest.decreased_visibility,
                _ => continue,
            };
            bucket.push(VisibilityChange {
                app: app.to_string(),
                component: component.clone(),
                from: old_exported.unwrap_or_default().to_string(),
                to: new_exported.unwrap_or_default().to_string(),
            });
        }
    }

    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example">
  <uses-permission android:name="android.permission.INTERNET"/>
  <application android:label="Example" android:permission="p.APP">
    <activity android:name=".Main" android:permission="p.MAIN">
      <intent-filter>
        <action android:name="android.intent.action.MAIN"/>
      </intent-filter>
    </activity>
    <receiver android:name=".Boot"/>
    <provider android:name=".Files" android:readPermission="p.READ" android:writePermission="p.WRITE"/>
    <service/>
  </application>
</manifest>"#;

    fn components(apk: &str, kind: ComponentKind, name: &str, perms: &[(&str, &str)]) -> ComponentMap {
        let perms: ComponentPermissions = perms
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut manifest = ManifestComponents::default();
        manifest
            .components
            .entry(kind)
            .or_default()
            .insert(name.to_string(), perms);
        ComponentMap::from([(apk.to_string(), manifest)])
    }

    fn levels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn manifest_components_and_inheritance() {
        let parsed = parse_manifest(MANIFEST).unwrap().unwrap();
        let activities = &parsed.components[&ComponentKind::Activity];
        assert_eq!(activities[".Main"]["permission"], "p.MAIN");
        assert_eq!(activities.len(), 1);

        let receivers = &parsed.components[&ComponentKind::Receiver];
        assert_eq!(receivers[".Boot"]["permission"], "p.APP");

        let provider = &parsed.components[&ComponentKind::Provider][".Files"];
        assert_eq!(provider.len(), 2);
        assert_eq!(provider["writePermission"], "p.WRITE");

        assert!(parsed.components[&ComponentKind::Service].is_empty());
    }

    #[test]
    fn attributes_outside_android_namespace_ignored() {
        let xml = r#"<manifest xmlns:a="http://schemas.android.com/apk/res/android" xmlns:x="urn:other">
            <application><service a:name=".S" x:permission="p.OTHER"/></application>
        </manifest>"#;
        let parsed = parse_manifest(xml).unwrap().unwrap();
        assert!(parsed.components[&ComponentKind::Service][".S"].is_empty());
    }

    #[test]
    fn manifest_without_application() {
        let xml = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android"/>"#;
        assert_eq!(parse_manifest(xml).unwrap(), None);
    }

    #[test]
    fn broken_manifest_is_an_error() {
        let err = parse_manifest("<manifest><application></manifest>").unwrap_err();
        assert!(matches!(err, FwdeltaError::Format(_)));
    }

    #[test]
    fn component_map_reads_back_from_json() {
        let parsed = parse_manifest(MANIFEST).unwrap().unwrap();
        let map = ComponentMap::from([("system/app/Ex/Ex.apk".to_string(), parsed)]);
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains(r#""receiver":{".Boot":{"permission":"p.APP"}}"#));
        let back: ComponentMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn guard_added_removed_and_rescored() {
        let s = ProtectionLevelScorer::default();
        let lv = levels(&[("p.SIG", "signature"), ("p.NORM", "normal")]);

        let old = components("a.apk", ComponentKind::Service, ".S", &[("permission", "p.NORM")]);
        let new = components("a.apk", ComponentKind::Service, ".S", &[("permission", "p.SIG")]);
        let out = compare_components(&s, &old, &new, &lv, &ProtectionDigest::default());
        assert_eq!(out.increased[0].change, "score 10 -> 30");
        assert_eq!(out.increased[0].permission_type.as_deref(), Some("permission"));

        let none = components("a.apk", ComponentKind::Service, ".S", &[]);
        let out = compare_components(&s, &old, &none, &lv, &ProtectionDigest::default());
        assert_eq!(out.decreased[0].change, "removed with score 10");
        assert_eq!(out.decreased[0].permission, "p.NORM");

        let out = compare_components(&s, &none, &new, &lv, &ProtectionDigest::default());
        assert_eq!(out.increased[0].change, "added with score 30");
    }

    #[test]
    fn component_only_in_new_snapshot_counts_as_added_guard() {
        let s = ProtectionLevelScorer::default();
        let new = components("a.apk", ComponentKind::Receiver, ".R", &[("permission", "p.UNKNOWN")]);
        let out = compare_components(&s, &ComponentMap::new(), &new, &BTreeMap::new(), &ProtectionDigest::default());
        assert_eq!(out.increased.len(), 1);
        assert_eq!(out.increased[0].change, "added with score 10");
        assert!(out.decreased.is_empty());
    }

    #[test]
    fn same_score_swap_not_reported() {
        let s = ProtectionLevelScorer::default();
        let lv = levels(&[("p.A", "signature"), ("p.B", "signature")]);
        let old = components("a.apk", ComponentKind::Activity, ".A", &[("permission", "p.A")]);
        let new = components("a.apk", ComponentKind::Activity, ".A", &[("permission", "p.B")]);
        let out = compare_components(&s, &old, &new, &lv, &ProtectionDigest::default());
        assert_eq!(out, ComponentDigest::default());
    }

    #[test]
    fn unchanged_guard_follows_level_move() {
        let s = ProtectionLevelScorer::default();
        let digest = crate::protection::diff_protection_levels(
            &s,
            &levels(&[("p.G", "signature")]),
            &levels(&[("p.G", "normal")]),
        );
        let map = components("a.apk", ComponentKind::Provider, ".P", &[("readPermission", "p.G")]);
        let out = compare_components(&s, &map, &map, &levels(&[("p.G", "normal")]), &digest);
        assert!(out.increased.is_empty());
        assert_eq!(out.decreased[0].permission_type, None);
        assert_eq!(out.decreased[0].change, "score 30 -> 10 (protection level change)");
        assert!(out.to_string().contains("[DECREASED] a.apk provider .P p.G:"));
    }

    #[test]
    fn visibility_flips_only_between_true_and_false() {
        let old: VisibilityMap = serde_json::from_str(
            r#"{"system/app/A/A.apk": [
                {"type": "activity", "name": ".Open", "exported": "true"},
                {"type": "service", "name": ".Odd", "exported": null},
                {"type": "receiver", "name": ".Gone", "exported": "false"}
            ],
            "system/app/B/B.apk": [{"type": "activity", "name": ".X", "exported": "false"}]}"#,
        )
        .unwrap();
        let new: VisibilityMap = serde_json::from_str(
            r#"{"system/app/A/A.apk": [
                {"type": "activity", "name": ".Open", "exported": false, "permission": null},
                {"type": "service", "name": ".Odd", "exported": "true"}
            ]}"#,
        )
        .unwrap();
        let digest = compare_visibility(&old, &new);
        assert!(digest.increased_visibility.is_empty());
        assert_eq!(digest.decreased_visibility.len(), 1);
        let change = &digest.decreased_visibility[0];
        assert_eq!(change.component.name, ".Open");
        assert_eq!((change.from.as_str(), change.to.as_str()), ("true", "false"));
        assert_eq!(digest.to_string(), "[UNEXPORTED] A.apk activity .Open\n");
    }
}

//! Notification filter rule engine.
//!
//! Evaluates notifications against the configured rules in a fixed order:
//! package blacklist, package whitelist, then the built-in predicates. The
//! first rule that excludes a notification wins.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::Notification;

pub const RULE_ONGOING: &str = "ongoing";
pub const RULE_SYSTEM: &str = "system";
pub const RULE_EMPTY_CONTENT: &str = "empty_content";
pub const RULE_LOW_PRIORITY: &str = "low_priority";
pub const RULE_FOREGROUND_SERVICE: &str = "foreground_service";
pub const RULE_GROUP_SUMMARY: &str = "group_summary";
pub const RULE_RUNNING_SERVICE: &str = "running_service";
pub const RULE_PACKAGE_BLACKLIST: &str = "package_blacklist";
pub const RULE_PACKAGE_WHITELIST: &str = "package_whitelist";

/// Package prefixes treated as the OS itself by the `system` rule.
const SYSTEM_PACKAGE_PREFIXES: &[&str] = &[
    "com.android.",
    "com.google.android.",
    "com.miui.",
    "com.huawei.",
    "com.samsung.android.",
    "com.coloros.",
    "com.oplus.",
];

/// Title/text markers of "app is running" service notifications.
const RUNNING_MARKERS: &[&str] = &["is running", "正在运行", "running in the background"];

/// Package filter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFilterMode {
    Blacklist,
    Whitelist,
}

/// Pattern list attached to a package rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFilter {
    pub mode: PackageFilterMode,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// A single filter rule as persisted by the filter-config store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
    pub id: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_filter: Option<PackageFilter>,
}

impl FilterRule {
    pub fn builtin(id: &str, enabled: bool) -> Self {
        Self {
            id: id.to_string(),
            enabled,
            package_filter: None,
        }
    }

    pub fn package(id: &str, mode: PackageFilterMode, patterns: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            enabled: false,
            package_filter: Some(PackageFilter { mode, patterns }),
        }
    }

    fn mode(&self) -> Option<PackageFilterMode> {
        self.package_filter.as_ref().map(|f| f.mode)
    }
}

/// Partial update applied to one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleUpdate {
    pub enabled: Option<bool>,
    pub patterns: Option<Vec<String>>,
}

/// Compile a package pattern into an anchored regex.
///
/// Patterns without a backslash are globs: `.` is literal and `*` matches
/// anything. Patterns containing a backslash are used as regexes verbatim.
/// Returns `None` (never matches) for patterns that do not compile.
pub fn compile_pattern(pattern: &str) -> Option<Regex> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }
    let mut source = if pattern.contains('\\') {
        pattern.to_string()
    } else {
        pattern.replace('.', "\\.").replace('*', ".*")
    };
    if !source.starts_with('^') {
        source.insert(0, '^');
    }
    if !source.ends_with('$') {
        source.push('$');
    }
    match Regex::new(&source) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern, error = %e, "Ignoring invalid package pattern");
            None
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledPackageRule {
    enabled: bool,
    patterns: Vec<Regex>,
}

impl CompiledPackageRule {
    fn from_rule(rule: Option<&FilterRule>) -> Self {
        let Some(rule) = rule else {
            return Self {
                enabled: false,
                patterns: Vec::new(),
            };
        };
        let patterns = rule
            .package_filter
            .as_ref()
            .map(|f| f.patterns.iter().filter_map(|p| compile_pattern(p)).collect())
            .unwrap_or_default();
        Self {
            enabled: rule.enabled,
            patterns,
        }
    }

    fn matches(&self, package: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(package))
    }
}

/// Ordered rule set with compiled package patterns.
///
/// Shared read-only by every device session; writers replace the whole set.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<FilterRule>,
    blacklist: CompiledPackageRule,
    whitelist: CompiledPackageRule,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSet {
    /// Rule set with the default built-ins.
    pub fn new() -> Self {
        Self::from_rules(default_rules())
    }

    /// Build from persisted rules.
    ///
    /// Missing built-ins are appended with their defaults so the set always
    /// carries every known rule. If both package rules arrive enabled the
    /// whitelist is switched off.
    pub fn from_rules(mut rules: Vec<FilterRule>) -> Self {
        for default in default_rules() {
            if !rules.iter().any(|r| r.id == default.id) {
                rules.push(default);
            }
        }
        let both_enabled = [RULE_PACKAGE_BLACKLIST, RULE_PACKAGE_WHITELIST]
            .iter()
            .all(|id| rules.iter().any(|r| r.id == *id && r.enabled));
        if both_enabled {
            warn!("Both package blacklist and whitelist enabled; disabling whitelist");
            if let Some(rule) = rules.iter_mut().find(|r| r.id == RULE_PACKAGE_WHITELIST) {
                rule.enabled = false;
            }
        }
        let mut set = Self {
            rules,
            blacklist: CompiledPackageRule::from_rule(None),
            whitelist: CompiledPackageRule::from_rule(None),
        };
        set.recompile();
        set
    }

    /// Replace every rule at once, resolving a package-rule conflict in
    /// favour of whichever rule was not already enabled in `self`.
    pub fn replaced(&self, mut rules: Vec<FilterRule>) -> Self {
        let enabled_in = |rules: &[FilterRule], id: &str| {
            rules.iter().any(|r| r.id == id && r.enabled)
        };
        if enabled_in(&rules, RULE_PACKAGE_BLACKLIST)
            && enabled_in(&rules, RULE_PACKAGE_WHITELIST)
        {
            let loser = if self.is_enabled(RULE_PACKAGE_WHITELIST) {
                RULE_PACKAGE_WHITELIST
            } else {
                RULE_PACKAGE_BLACKLIST
            };
            if let Some(rule) = rules.iter_mut().find(|r| r.id == loser) {
                rule.enabled = false;
            }
        }
        Self::from_rules(rules)
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&FilterRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.get(id).is_some_and(|r| r.enabled)
    }

    /// Apply a partial update to one rule. Returns whether anything changed.
    ///
    /// Enabling one package rule disables the other as part of the same
    /// update. Unknown ids are ignored.
    pub fn apply(&mut self, id: &str, update: &RuleUpdate) -> bool {
        let Some(rule) = self.rules.iter_mut().find(|r| r.id == id) else {
            warn!(rule_id = id, "Ignoring update for unknown filter rule");
            return false;
        };
        let before = rule.clone();

        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        if let Some(patterns) = &update.patterns {
            match rule.package_filter.as_mut() {
                Some(filter) => filter.patterns.clone_from(patterns),
                None => warn!(rule_id = id, "Rule has no package filter; patterns ignored"),
            }
        }

        let now_enabled_mode = rule.enabled.then(|| rule.mode()).flatten();
        let mut changed = *rule != before;

        if let Some(mode) = now_enabled_mode {
            let other = match mode {
                PackageFilterMode::Blacklist => PackageFilterMode::Whitelist,
                PackageFilterMode::Whitelist => PackageFilterMode::Blacklist,
            };
            for r in &mut self.rules {
                if r.enabled && r.mode() == Some(other) {
                    r.enabled = false;
                    changed = true;
                }
            }
        }

        if changed {
            self.recompile();
        }
        changed
    }

    fn recompile(&mut self) {
        let find = |mode| self.rules.iter().find(|r| r.mode() == Some(mode));
        self.blacklist = CompiledPackageRule::from_rule(find(PackageFilterMode::Blacklist));
        self.whitelist = CompiledPackageRule::from_rule(find(PackageFilterMode::Whitelist));
    }

    /// Evaluate one notification. Returns the id of the excluding rule, if any.
    pub fn excluded_by(&self, n: &Notification) -> Option<&str> {
        if self.blacklist.enabled && self.blacklist.matches(&n.package_name) {
            return Some(RULE_PACKAGE_BLACKLIST);
        }
        let whitelisted = self.whitelist.enabled && self.whitelist.matches(&n.package_name);
        if self.whitelist.enabled && !whitelisted {
            return Some(RULE_PACKAGE_WHITELIST);
        }

        self.rules
            .iter()
            .filter(|r| r.enabled && r.package_filter.is_none())
            .find(|r| builtin_excludes(&r.id, n, whitelisted))
            .map(|r| r.id.as_str())
    }

    pub fn is_visible(&self, n: &Notification) -> bool {
        self.excluded_by(n).is_none()
    }
}

/// Built-in predicates. A whitelisted package is exempt from the system rule.
fn builtin_excludes(id: &str, n: &Notification, whitelisted: bool) -> bool {
    match id {
        RULE_ONGOING => n.is_ongoing(),
        RULE_SYSTEM => !whitelisted && is_system_package(&n.package_name),
        RULE_EMPTY_CONTENT => n.is_empty_content(),
        RULE_LOW_PRIORITY => n.priority < 0,
        RULE_FOREGROUND_SERVICE => n.is_foreground_service(),
        RULE_GROUP_SUMMARY => n.is_group_summary(),
        RULE_RUNNING_SERVICE => is_running_service(n),
        _ => false,
    }
}

fn is_system_package(package: &str) -> bool {
    package == "android"
        || package == "com.android"
        || SYSTEM_PACKAGE_PREFIXES.iter().any(|p| package.starts_with(p))
}

fn is_running_service(n: &Notification) -> bool {
    if n.category.as_deref() == Some("service") {
        return true;
    }
    [&n.title, &n.text].into_iter().flatten().any(|s| {
        let lower = s.to_lowercase();
        RUNNING_MARKERS.iter().any(|m| lower.contains(m))
    })
}

/// Check visibility against a rule set.
pub fn is_visible(n: &Notification, rules: &RuleSet) -> bool {
    rules.is_visible(n)
}

/// Visible subset of `notifications`, in input order.
pub fn recompute(notifications: &[Notification], rules: &RuleSet) -> Vec<Notification> {
    notifications
        .iter()
        .filter(|n| rules.is_visible(n))
        .cloned()
        .collect()
}

/// Built-in default filter rules.
pub fn default_rules() -> Vec<FilterRule> {
    vec![
        FilterRule::package(RULE_PACKAGE_BLACKLIST, PackageFilterMode::Blacklist, Vec::new()),
        FilterRule::package(RULE_PACKAGE_WHITELIST, PackageFilterMode::Whitelist, Vec::new()),
        FilterRule::builtin(RULE_ONGOING, false),
        FilterRule::builtin(RULE_SYSTEM, false),
        FilterRule::builtin(RULE_EMPTY_CONTENT, true),
        FilterRule::builtin(RULE_LOW_PRIORITY, false),
        FilterRule::builtin(RULE_FOREGROUND_SERVICE, true),
        FilterRule::builtin(RULE_GROUP_SUMMARY, true),
        FilterRule::builtin(RULE_RUNNING_SERVICE, false),
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn note(package: &str, id: &str) -> Notification {
        Notification::new(package, id).with_content("title", "body")
    }

    fn enable(set: &mut RuleSet, id: &str) -> bool {
        set.apply(
            id,
            &RuleUpdate {
                enabled: Some(true),
                patterns: None,
            },
        )
    }

    fn patterns(set: &mut RuleSet, id: &str, patterns: &[&str]) {
        set.apply(
            id,
            &RuleUpdate {
                enabled: Some(true),
                patterns: Some(patterns.iter().map(ToString::to_string).collect()),
            },
        );
    }

    #[test]
    fn glob_pattern_matches_dotted_prefix() {
        let re = compile_pattern("com.jd.*").unwrap();
        assert!(re.is_match("com.jd.daojia"));
        assert!(!re.is_match("com.jdcom.x"));
    }

    #[test]
    fn plain_pattern_is_anchored() {
        let re = compile_pattern("com.android.mms").unwrap();
        assert!(re.is_match("com.android.mms"));
        assert!(!re.is_match("com.android.mms.service"));
        assert!(!re.is_match("xcom.android.mms"));
    }

    #[test]
    fn backslash_pattern_is_raw_regex() {
        let re = compile_pattern(r"com\.(wx|qq)\..+").unwrap();
        assert!(re.is_match("com.qq.im"));
        assert!(!re.is_match("com.zz.im"));
    }

    #[test]
    fn invalid_pattern_never_matches() {
        assert!(compile_pattern(r"com\.(broken").is_none());
        let mut set = RuleSet::new();
        patterns(&mut set, RULE_PACKAGE_BLACKLIST, &[r"com\.(broken", "com.ads.*"]);
        assert!(set.is_visible(&note("com.broken", "1")));
        assert!(!set.is_visible(&note("com.ads.banner", "1")));
    }

    #[test]
    fn blacklist_excludes_matching_package() {
        let mut set = RuleSet::new();
        patterns(&mut set, RULE_PACKAGE_BLACKLIST, &["com.jd.*"]);
        assert_eq!(set.excluded_by(&note("com.jd.daojia", "1")), Some(RULE_PACKAGE_BLACKLIST));
        assert!(set.is_visible(&note("com.jdcom.x", "1")));
    }

    #[test]
    fn whitelist_excludes_everything_else() {
        let mut set = RuleSet::new();
        patterns(&mut set, RULE_PACKAGE_WHITELIST, &["com.tencent.mm"]);
        assert!(set.is_visible(&note("com.tencent.mm", "1")));
        assert_eq!(
            set.excluded_by(&note("com.taobao.taobao", "1")),
            Some(RULE_PACKAGE_WHITELIST)
        );
    }

    #[test]
    fn whitelisted_system_package_escapes_system_rule() {
        let mut set = RuleSet::new();
        enable(&mut set, RULE_SYSTEM);
        assert!(!set.is_visible(&note("com.android.mms", "1")));

        patterns(&mut set, RULE_PACKAGE_WHITELIST, &["com.android.mms"]);
        assert!(set.is_visible(&note("com.android.mms", "1")));
        assert!(!set.is_visible(&note("com.android.phone", "1")));
    }

    #[test]
    fn enabling_whitelist_disables_blacklist() {
        let mut set = RuleSet::new();
        enable(&mut set, RULE_PACKAGE_BLACKLIST);
        assert!(set.is_enabled(RULE_PACKAGE_BLACKLIST));

        assert!(enable(&mut set, RULE_PACKAGE_WHITELIST));
        assert!(set.is_enabled(RULE_PACKAGE_WHITELIST));
        assert!(!set.is_enabled(RULE_PACKAGE_BLACKLIST));

        assert!(enable(&mut set, RULE_PACKAGE_BLACKLIST));
        assert!(set.is_enabled(RULE_PACKAGE_BLACKLIST));
        assert!(!set.is_enabled(RULE_PACKAGE_WHITELIST));
    }

    #[test]
    fn from_rules_resolves_conflicting_package_rules() {
        let mut rules = default_rules();
        for r in &mut rules {
            if r.package_filter.is_some() {
                r.enabled = true;
            }
        }
        let set = RuleSet::from_rules(rules);
        assert!(set.is_enabled(RULE_PACKAGE_BLACKLIST));
        assert!(!set.is_enabled(RULE_PACKAGE_WHITELIST));
    }

    #[test]
    fn replaced_keeps_newly_enabled_package_rule() {
        let mut current = RuleSet::new();
        enable(&mut current, RULE_PACKAGE_BLACKLIST);

        let mut incoming = default_rules();
        for r in &mut incoming {
            if r.package_filter.is_some() {
                r.enabled = true;
            }
        }
        let next = current.replaced(incoming);
        assert!(next.is_enabled(RULE_PACKAGE_WHITELIST));
        assert!(!next.is_enabled(RULE_PACKAGE_BLACKLIST));
    }

    #[test]
    fn from_rules_fills_missing_builtins() {
        let set = RuleSet::from_rules(vec![FilterRule::builtin(RULE_ONGOING, true)]);
        assert!(set.is_enabled(RULE_ONGOING));
        assert_eq!(set.rules().len(), default_rules().len());
    }

    #[test]
    fn unchanged_update_reports_no_change() {
        let mut set = RuleSet::new();
        let update = RuleUpdate {
            enabled: Some(true),
            patterns: None,
        };
        assert!(!set.apply(RULE_EMPTY_CONTENT, &update));
        assert!(!set.apply("no_such_rule", &update));
    }

    #[test]
    fn builtin_predicates() {
        let mut set = RuleSet::new();
        for id in [RULE_ONGOING, RULE_LOW_PRIORITY, RULE_RUNNING_SERVICE] {
            enable(&mut set, id);
        }

        let mut ongoing = note("com.music", "1");
        ongoing.ongoing = true;
        assert_eq!(set.excluded_by(&ongoing), Some(RULE_ONGOING));

        let mut low = note("com.shop", "2");
        low.priority = -1;
        assert_eq!(set.excluded_by(&low), Some(RULE_LOW_PRIORITY));

        let empty = Notification::new("com.chat", "3");
        assert_eq!(set.excluded_by(&empty), Some(RULE_EMPTY_CONTENT));

        let mut fg = note("com.maps", "4");
        fg.flags = crate::model::FLAG_FOREGROUND_SERVICE;
        assert_eq!(set.excluded_by(&fg), Some(RULE_FOREGROUND_SERVICE));

        let mut summary = note("com.chat", "5");
        summary.group_summary = true;
        assert_eq!(set.excluded_by(&summary), Some(RULE_GROUP_SUMMARY));

        let running = Notification::new("com.vpn", "6").with_content("VPN", "VPN is running");
        assert_eq!(set.excluded_by(&running), Some(RULE_RUNNING_SERVICE));

        assert!(set.is_visible(&note("com.chat", "7")));
    }

    #[test]
    fn recompute_is_order_preserving_and_idempotent() {
        let mut set = RuleSet::new();
        patterns(&mut set, RULE_PACKAGE_BLACKLIST, &["com.ads.*"]);
        let input = vec![
            note("com.c", "3"),
            note("com.ads.x", "9"),
            note("com.a", "1"),
            note("com.b", "2"),
        ];
        let once = recompute(&input, &set);
        let ids: Vec<&str> = once.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["3", "1", "2"]);
        assert_eq!(recompute(&once, &set), once);
        assert_eq!(recompute(&input, &set), once);
    }
}

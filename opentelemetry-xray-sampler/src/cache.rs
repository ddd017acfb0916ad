//! The locally cached set of sampling rules consulted on every sampling decision.
use crate::matcher::RequestFields;
use crate::rule::{Rule, SamplingStatistics, SamplingTarget};
use arc_swap::ArcSwap;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

/// An immutable, ordered set of rules.
pub type RuleSnapshot = Arc<Vec<Arc<Rule>>>;

/// Holds the current sampling rules, ordered by evaluation precedence.
///
/// The rule set is an immutable snapshot that is swapped as a whole, so
/// sampling decisions never block on a refresh and never observe a partially
/// updated rule set.
#[derive(Debug, Default)]
pub struct RuleCache {
    rules: ArcSwap<Vec<Arc<Rule>>>,
}

impl RuleCache {
    /// Creates an empty cache. No rule matches until rules are provided.
    pub fn new() -> Self {
        RuleCache::default()
    }

    /// Replaces all rules.
    ///
    /// Rules are ordered by ascending priority, then by name. Rules sharing both
    /// keep their relative order. Matched-rule tracking starts over with the new
    /// rules. A rule whose definition did not change keeps its current budget.
    pub fn update_rules(&self, mut rules: Vec<Rule>) {
        rules.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });

        let previous = self.rules.load();
        for rule in &rules {
            for candidate in previous.iter().filter(|old| old.name() == rule.name()) {
                if rule.carry_over(candidate) {
                    break;
                }
            }
        }
        self.rules
            .store(Arc::new(rules.into_iter().map(Arc::new).collect()));
    }

    /// Returns the first rule in precedence order that matches the request and
    /// records it as matched.
    pub fn first_matching_rule(
        &self,
        attributes: &[KeyValue],
        resource: &Resource,
    ) -> Option<Arc<Rule>> {
        let rules = self.rules.load();
        if rules.is_empty() {
            return None;
        }

        let fields = RequestFields::new(attributes, resource);
        let rule = rules.iter().find(|rule| rule.matches_fields(&fields))?;
        rule.mark_matched();
        Some(Arc::clone(rule))
    }

    /// Names of the rules that matched at least one request since rules were
    /// last replaced.
    pub fn matched_rule_names(&self) -> HashSet<String> {
        self.rules
            .load()
            .iter()
            .filter(|rule| rule.is_matched())
            .map(|rule| rule.name().to_string())
            .collect()
    }

    /// Applies sampling targets by rule name.
    ///
    /// Rules without a target keep their budget and targets for unknown rules
    /// are ignored.
    pub fn update_targets(&self, targets: &HashMap<String, SamplingTarget>) {
        if targets.is_empty() {
            return;
        }
        for rule in self.rules.load().iter() {
            if let Some(target) = targets.get(rule.name()) {
                rule.apply_target(target);
            }
        }
    }

    /// Collects the request counters of every matched rule, without resetting
    /// them.
    pub(crate) fn matched_statistics(&self) -> Vec<(Arc<Rule>, SamplingStatistics)> {
        let now = SystemTime::now();
        self.rules
            .load()
            .iter()
            .filter(|rule| rule.is_matched())
            .map(|rule| (Arc::clone(rule), rule.statistics(now)))
            .collect()
    }

    /// The current rule set in evaluation order.
    pub fn rules(&self) -> RuleSnapshot {
        self.rules.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::SamplingRule;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn rule(name: &str, priority: i32) -> Rule {
        Rule::new(SamplingRule::new(name, priority, 0.5, 1))
    }

    fn get_rule(name: &str, priority: i32) -> Rule {
        let mut definition = SamplingRule::new(name, priority, 0.5, 1);
        definition.http_method = "GET".to_string();
        Rule::new(definition)
    }

    fn order(cache: &RuleCache) -> Vec<(String, i32)> {
        cache
            .rules()
            .iter()
            .map(|rule| (rule.name().to_string(), rule.priority()))
            .collect()
    }

    fn empty_resource() -> Resource {
        Resource::builder_empty().build()
    }

    #[test]
    fn update_rules_sorts_by_priority_and_name() {
        let cache = RuleCache::new();
        cache.update_rules(vec![rule("b", 1), rule("a", 2), rule("a", 1)]);

        assert_eq!(
            order(&cache),
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 1),
                ("a".to_string(), 2)
            ]
        );
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let cache = RuleCache::new();
        let mut first = SamplingRule::new("same", 1, 0.5, 1);
        first.host = "first".to_string();
        let mut second = SamplingRule::new("same", 1, 0.5, 1);
        second.host = "second".to_string();
        cache.update_rules(vec![Rule::new(first), Rule::new(second)]);

        let attributes = [KeyValue::new("server.address", "first")];
        let matched = cache.first_matching_rule(&attributes, &empty_resource());
        assert!(Arc::ptr_eq(&matched.unwrap(), &cache.rules()[0]));
    }

    #[test]
    fn first_match_wins() {
        let cache = RuleCache::new();
        cache.update_rules(vec![get_rule("late", 20), get_rule("early", 10)]);

        let attributes = [KeyValue::new("http.request.method", "GET")];
        let matched = cache
            .first_matching_rule(&attributes, &empty_resource())
            .unwrap();
        assert_eq!(matched.name(), "early");

        let attributes = [KeyValue::new("http.request.method", "POST")];
        assert!(cache
            .first_matching_rule(&attributes, &empty_resource())
            .is_none());
    }

    #[test]
    fn empty_cache_matches_nothing() {
        let cache = RuleCache::new();
        assert!(cache.first_matching_rule(&[], &empty_resource()).is_none());

        cache.update_rules(vec![rule("a", 1)]);
        cache.update_rules(Vec::new());
        assert!(cache.first_matching_rule(&[], &empty_resource()).is_none());
    }

    #[test]
    fn replacing_with_same_rules_keeps_behavior() {
        let cache = RuleCache::new();
        let definitions = || vec![get_rule("get", 1), rule("default", 100)];
        let attributes = [KeyValue::new("http.method", "GET")];

        cache.update_rules(definitions());
        let before = cache.first_matching_rule(&attributes, &empty_resource());
        let before_order = order(&cache);

        cache.update_rules(definitions());
        let after = cache.first_matching_rule(&attributes, &empty_resource());

        assert_eq!(before.unwrap().name(), after.unwrap().name());
        assert_eq!(before_order, order(&cache));
    }

    #[test]
    fn matched_rule_names_reset_on_rule_refresh() {
        let cache = RuleCache::new();
        cache.update_rules(vec![get_rule("get", 1), rule("default", 100)]);
        assert!(cache.matched_rule_names().is_empty());

        cache.first_matching_rule(&[KeyValue::new("http.method", "GET")], &empty_resource());
        cache.first_matching_rule(&[KeyValue::new("http.method", "GET")], &empty_resource());
        cache.first_matching_rule(&[], &empty_resource());
        assert_eq!(
            cache.matched_rule_names(),
            HashSet::from(["get".to_string(), "default".to_string()])
        );

        cache.update_rules(vec![get_rule("get", 1), rule("default", 100)]);
        assert!(cache.matched_rule_names().is_empty());
    }

    #[test]
    fn update_targets_only_touches_named_rules() {
        let cache = RuleCache::new();
        cache.update_rules(vec![rule("a", 1), rule("b", 2), rule("a", 3)]);

        let targets = HashMap::from([
            (
                "a".to_string(),
                SamplingTarget {
                    fixed_rate: 0.25,
                    reservoir_quota: Some(7),
                    reservoir_quota_ttl: None,
                },
            ),
            (
                "gone".to_string(),
                SamplingTarget {
                    fixed_rate: 1.0,
                    reservoir_quota: Some(1),
                    reservoir_quota_ttl: None,
                },
            ),
        ]);
        cache.update_targets(&targets);

        let budgets: Vec<(String, f64, u64)> = cache
            .rules()
            .iter()
            .map(|rule| (rule.name().to_string(), rule.rate(), rule.reservoir()))
            .collect();
        assert_eq!(
            budgets,
            vec![
                ("a".to_string(), 0.25, 7),
                ("b".to_string(), 0.5, 1),
                ("a".to_string(), 0.25, 7),
            ]
        );
    }

    #[test]
    fn rule_refresh_keeps_targets_of_unchanged_rules() {
        let cache = RuleCache::new();
        cache.update_rules(vec![rule("kept", 1), rule("changed", 2)]);
        let target = SamplingTarget {
            fixed_rate: 0.9,
            reservoir_quota: Some(4),
            reservoir_quota_ttl: None,
        };
        cache.update_targets(&HashMap::from([
            ("kept".to_string(), target.clone()),
            ("changed".to_string(), target),
        ]));

        let mut changed = SamplingRule::new("changed", 2, 0.5, 1);
        changed.host = "new-host".to_string();
        cache.update_rules(vec![rule("kept", 1), Rule::new(changed), rule("added", 3)]);

        let budgets: Vec<(String, f64, u64)> = cache
            .rules()
            .iter()
            .map(|rule| (rule.name().to_string(), rule.rate(), rule.reservoir()))
            .collect();
        assert_eq!(
            budgets,
            vec![
                ("kept".to_string(), 0.9, 4),
                ("changed".to_string(), 0.5, 1),
                ("added".to_string(), 0.5, 1),
            ]
        );
    }

    #[test]
    fn statistics_cover_matched_rules_only() {
        let cache = RuleCache::new();
        cache.update_rules(vec![get_rule("get", 1), rule("default", 100)]);

        let matched = cache
            .first_matching_rule(&[KeyValue::new("http.method", "GET")], &empty_resource())
            .unwrap();
        matched.can_sample();

        let statistics = cache.matched_statistics();
        assert_eq!(statistics.len(), 1);
        assert!(Arc::ptr_eq(&statistics[0].0, &matched));
        assert_eq!(statistics[0].1.rule_name, "get");
        assert_eq!(statistics[0].1.request_count, 1);
        assert_eq!(statistics[0].1.sampled_count, 1);
    }

    #[test]
    fn concurrent_reads_never_observe_torn_rule_set() {
        fn rules(prefix: &str) -> Vec<Rule> {
            (0..50)
                .map(|i| {
                    let mut definition = SamplingRule::new(format!("{prefix}-{i:02}"), i, 0.5, 1);
                    definition.host = format!("host-{i:02}");
                    Rule::new(definition)
                })
                .collect()
        }

        let cache = Arc::new(RuleCache::new());
        cache.update_rules(rules("old"));
        let before = cache.rules();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let resource = Resource::builder_empty().build();
                    let attributes = [KeyValue::new("server.address", "host-37")];
                    let mut seen = Vec::new();
                    loop {
                        let finished = done.load(Ordering::Acquire);

                        let snapshot = cache.rules();
                        let prefix = &snapshot[0].name()[..3];
                        assert!(snapshot.iter().all(|rule| rule.name().starts_with(prefix)));

                        if let Some(rule) = cache.first_matching_rule(&attributes, &resource) {
                            seen.push(rule);
                        }
                        if finished {
                            return seen;
                        }
                    }
                })
            })
            .collect();

        thread::sleep(std::time::Duration::from_millis(5));
        cache.update_rules(rules("new"));
        let after = cache.rules();
        thread::sleep(std::time::Duration::from_millis(5));
        done.store(true, Ordering::Release);

        for reader in readers {
            let seen = reader.join().unwrap();
            assert!(!seen.is_empty());
            for rule in seen {
                let known = before
                    .iter()
                    .chain(after.iter())
                    .any(|candidate| Arc::ptr_eq(candidate, &rule));
                assert!(known, "rule {} is in neither snapshot", rule.name());
                assert_eq!(rule.priority(), 37);
            }
        }
    }
}

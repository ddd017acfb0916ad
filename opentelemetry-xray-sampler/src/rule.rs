//! Sampling rules and their per-rule sampling budget.
use crate::matcher::{Glob, RequestFields};
use crate::reservoir::{now_secs, Reservoir};
use arc_swap::ArcSwap;
use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// The only rule format version this sampler understands.
pub(crate) const SUPPORTED_RULE_VERSION: i32 = 1;

fn wildcard() -> String {
    "*".to_string()
}

fn supported_version() -> i32 {
    SUPPORTED_RULE_VERSION
}

/// A sampling rule as defined in the X-Ray console or API.
///
/// Every matching field is a glob pattern where `*` matches any run of
/// characters and `?` matches a single character.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SamplingRule {
    /// Name of the rule, used as tie-break when priorities are equal.
    pub rule_name: String,
    /// ARN of the rule, when known.
    #[serde(rename = "RuleARN", default, skip_serializing_if = "Option::is_none")]
    pub rule_arn: Option<String>,
    /// Matches the ARN of the instrumented resource.
    #[serde(rename = "ResourceARN", default = "wildcard")]
    pub resource_arn: String,
    /// Evaluation order, lower values are evaluated first.
    pub priority: i32,
    /// Fraction of requests to sample once the reservoir is exhausted.
    pub fixed_rate: f64,
    /// Requests per second sampled before the fixed rate applies.
    pub reservoir_size: u64,
    /// Matches the `service.name` resource attribute.
    #[serde(default = "wildcard")]
    pub service_name: String,
    /// Matches the X-Ray origin derived from the `cloud.platform` resource attribute.
    #[serde(default = "wildcard")]
    pub service_type: String,
    /// Matches the host the request was sent to.
    #[serde(default = "wildcard")]
    pub host: String,
    /// Matches the HTTP method of the request.
    #[serde(rename = "HTTPMethod", default = "wildcard")]
    pub http_method: String,
    /// Matches the URL path of the request.
    #[serde(rename = "URLPath", default = "wildcard")]
    pub url_path: String,
    /// Rule format version.
    #[serde(default = "supported_version")]
    pub version: i32,
    /// Span attributes that must be present and match.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl SamplingRule {
    /// Creates a rule that matches every request.
    pub fn new<N: Into<String>>(
        rule_name: N,
        priority: i32,
        fixed_rate: f64,
        reservoir_size: u64,
    ) -> Self {
        SamplingRule {
            rule_name: rule_name.into(),
            rule_arn: None,
            resource_arn: wildcard(),
            priority,
            fixed_rate,
            reservoir_size,
            service_name: wildcard(),
            service_type: wildcard(),
            host: wildcard(),
            http_method: wildcard(),
            url_path: wildcard(),
            version: SUPPORTED_RULE_VERSION,
            attributes: HashMap::new(),
        }
    }
}

/// A server-computed adjustment of a rule's sampling budget.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingTarget {
    /// Fraction of requests to sample once the reservoir is exhausted.
    pub fixed_rate: f64,
    /// Requests per second this process may sample from the reservoir. `None`
    /// keeps the previous quota.
    pub reservoir_quota: Option<u64>,
    /// Moment after which the quota must no longer be used.
    pub reservoir_quota_ttl: Option<SystemTime>,
}

/// Request counters of one rule, reported to the sampling API on target refresh.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingStatistics {
    /// Rule the counters belong to.
    pub rule_name: String,
    /// Requests that matched the rule.
    pub request_count: u64,
    /// Requests the rule sampled.
    pub sampled_count: u64,
    /// Requests sampled from the reservoir without a server-assigned quota.
    pub borrow_count: u64,
    /// Moment the counters were collected.
    pub timestamp: SystemTime,
}

#[derive(Clone, Debug, PartialEq)]
struct Budget {
    rate: f64,
    reservoir: u64,
    expires_at: Option<SystemTime>,
    // no target has been received yet
    borrowing: bool,
}

impl Budget {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

#[derive(Debug, Default)]
struct Statistics {
    requests: AtomicU64,
    sampled: AtomicU64,
    borrowed: AtomicU64,
}

/// A sampling rule ready to be matched, together with its sampling budget.
///
/// Rules are created from [`SamplingRule`]s and owned by the [`RuleCache`],
/// which only ever hands out shared, read-only handles.
///
/// [`RuleCache`]: crate::RuleCache
#[derive(Debug)]
pub struct Rule {
    definition: SamplingRule,
    name: String,
    priority: i32,
    reservoir_size: u64,
    service_name: Glob,
    service_type: Glob,
    resource_arn: Glob,
    host: Glob,
    http_method: Glob,
    url_path: Glob,
    attributes: Vec<(Key, Glob)>,
    budget: ArcSwap<Budget>,
    reservoir: Reservoir,
    matched: AtomicBool,
    statistics: Statistics,
}

impl Rule {
    /// Compiles a rule definition.
    pub fn new(rule: SamplingRule) -> Self {
        let budget = Budget {
            rate: rule.fixed_rate.clamp(0.0, 1.0),
            reservoir: rule.reservoir_size,
            expires_at: None,
            borrowing: true,
        };
        let attributes = rule
            .attributes
            .iter()
            .map(|(key, pattern)| (Key::new(key.clone()), Glob::new(pattern)))
            .collect();

        Rule {
            service_name: Glob::new(&rule.service_name),
            service_type: Glob::new(&rule.service_type),
            resource_arn: Glob::new(&rule.resource_arn),
            host: Glob::new(&rule.host),
            http_method: Glob::new(&rule.http_method),
            url_path: Glob::new(&rule.url_path),
            attributes,
            budget: ArcSwap::from_pointee(budget),
            reservoir: Reservoir::new(),
            matched: AtomicBool::new(false),
            statistics: Statistics::default(),
            reservoir_size: rule.reservoir_size,
            priority: rule.priority,
            name: rule.rule_name.clone(),
            definition: rule,
        }
    }

    /// Name of the rule.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority of the rule, lower values are evaluated first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Sampling rate currently applied once the reservoir is exhausted.
    pub fn rate(&self) -> f64 {
        self.budget.load().rate
    }

    /// Reservoir capacity per second currently in effect.
    pub fn reservoir(&self) -> u64 {
        self.reservoir_at(SystemTime::now())
    }

    fn reservoir_at(&self, now: SystemTime) -> u64 {
        self.capacity(&self.budget.load(), now)
    }

    fn capacity(&self, budget: &Budget, now: SystemTime) -> u64 {
        if budget.is_expired(now) {
            self.reservoir_size
        } else {
            budget.reservoir
        }
    }

    /// Returns `true` if the request described by `attributes` and `resource`
    /// satisfies every constraint of this rule.
    pub fn matches(&self, attributes: &[KeyValue], resource: &Resource) -> bool {
        self.matches_fields(&RequestFields::new(attributes, resource))
    }

    pub(crate) fn matches_fields(&self, fields: &RequestFields<'_>) -> bool {
        self.service_name
            .matches_opt(fields.service_name.as_ref().map(Value::as_str).as_deref())
            && self.service_type.matches_opt(fields.service_type)
            && self
                .resource_arn
                .matches_opt(fields.resource_arn.as_ref().map(Value::as_str).as_deref())
            && self.http_method.matches_opt(fields.http_method.as_deref())
            && self.url_path.matches_opt(fields.url_path.as_deref())
            && self.host.matches_opt(fields.host.as_deref())
            && self
                .attributes
                .iter()
                .all(|(key, glob)| glob.matches_opt(fields.attribute(key).as_deref()))
    }

    /// Spends the sampling budget of this rule for one request.
    ///
    /// The first requests of every second are sampled from the reservoir; once
    /// it is exhausted the request is sampled with the current rate.
    pub fn can_sample(&self) -> bool {
        self.can_sample_at(SystemTime::now())
    }

    pub(crate) fn can_sample_at(&self, now: SystemTime) -> bool {
        self.statistics.requests.fetch_add(1, Ordering::Relaxed);

        let budget = self.budget.load();
        if self
            .reservoir
            .try_take_at(self.capacity(&budget, now), now_secs(now))
        {
            if budget.borrowing || budget.is_expired(now) {
                self.statistics.borrowed.fetch_add(1, Ordering::Relaxed);
            }
            self.statistics.sampled.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if budget.rate > 0.0 && rand::random::<f64>() < budget.rate {
            self.statistics.sampled.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Replaces the sampling budget with a target computed by the sampling API.
    pub(crate) fn apply_target(&self, target: &SamplingTarget) {
        // targets are only ever applied by the poller, so the load/store pair
        // cannot interleave with another writer
        let current = self.budget.load();
        let budget = match target.reservoir_quota {
            Some(quota) => Budget {
                rate: target.fixed_rate.clamp(0.0, 1.0),
                reservoir: quota,
                expires_at: target.reservoir_quota_ttl,
                borrowing: false,
            },
            None => Budget {
                rate: target.fixed_rate.clamp(0.0, 1.0),
                reservoir: current.reservoir,
                expires_at: target.reservoir_quota_ttl.or(current.expires_at),
                borrowing: false,
            },
        };
        self.budget.store(Arc::new(budget));
    }

    pub(crate) fn mark_matched(&self) {
        if !self.matched.load(Ordering::Relaxed) {
            self.matched.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn is_matched(&self) -> bool {
        self.matched.load(Ordering::Relaxed)
    }

    /// Takes over the budget and the unreported counters of `previous` when it
    /// was built from the same definition. Returns `false` otherwise.
    pub(crate) fn carry_over(&self, previous: &Rule) -> bool {
        if self.definition != previous.definition {
            return false;
        }
        self.budget.store(previous.budget.load_full());
        for (counter, carried) in [
            (&self.statistics.requests, &previous.statistics.requests),
            (&self.statistics.sampled, &previous.statistics.sampled),
            (&self.statistics.borrowed, &previous.statistics.borrowed),
        ] {
            counter.fetch_add(carried.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        true
    }

    /// Counters accumulated since they were last reported.
    pub(crate) fn statistics(&self, now: SystemTime) -> SamplingStatistics {
        SamplingStatistics {
            rule_name: self.name.clone(),
            request_count: self.statistics.requests.load(Ordering::Relaxed),
            sampled_count: self.statistics.sampled.load(Ordering::Relaxed),
            borrow_count: self.statistics.borrowed.load(Ordering::Relaxed),
            timestamp: now,
        }
    }

    /// Removes counters the sampling API acknowledged. Requests counted after
    /// `reported` was collected stay for the next report.
    pub(crate) fn discount_statistics(&self, reported: &SamplingStatistics) {
        self.statistics
            .requests
            .fetch_sub(reported.request_count, Ordering::Relaxed);
        self.statistics
            .sampled
            .fetch_sub(reported.sampled_count, Ordering::Relaxed);
        self.statistics
            .borrowed
            .fetch_sub(reported.borrow_count, Ordering::Relaxed);
    }
}

impl From<SamplingRule> for Rule {
    fn from(rule: SamplingRule) -> Self {
        Rule::new(rule)
    }
}

//! Payloads of the X-Ray sampling API, as served by the X-Ray daemon and the
//! collector's sampling proxy.
use crate::rule::SamplingRule;

/// GetSamplingRulesRequest asks for the next page of sampling rules.
#[derive(serde::Serialize, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct GetSamplingRulesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) next_token: Option<String>,
}

/// GetSamplingRulesResponse holds one page of sampling rules.
#[derive(serde::Deserialize, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct GetSamplingRulesResponse {
    #[serde(default)]
    pub(crate) sampling_rule_records: Vec<SamplingRuleRecord>,
    #[serde(default)]
    pub(crate) next_token: Option<String>,
}

/// SamplingRuleRecord wraps a rule with its creation and modification times.
#[derive(serde::Deserialize, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SamplingRuleRecord {
    pub(crate) sampling_rule: SamplingRule,
}

/// SamplingTargetsRequest reports request counters of the rules in use.
#[derive(serde::Serialize, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SamplingTargetsRequest {
    pub(crate) sampling_statistics_documents: Vec<SamplingStatisticsDocument>,
}

/// SamplingStatisticsDocument holds the counters of a single rule.
#[derive(serde::Serialize, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SamplingStatisticsDocument {
    pub(crate) rule_name: String,
    #[serde(rename = "ClientID")]
    pub(crate) client_id: String,
    /// seconds since the unix epoch
    pub(crate) timestamp: f64,
    pub(crate) request_count: u64,
    pub(crate) sampled_count: u64,
    pub(crate) borrow_count: u64,
}

/// SamplingTargetsResponse holds the targets computed for the reported rules.
#[derive(serde::Deserialize, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SamplingTargetsResponse {
    #[serde(default)]
    pub(crate) sampling_target_documents: Vec<SamplingTargetDocument>,
}

/// SamplingTargetDocument is the target of a single rule.
#[derive(serde::Deserialize, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SamplingTargetDocument {
    pub(crate) rule_name: String,
    pub(crate) fixed_rate: f64,
    #[serde(default)]
    pub(crate) reservoir_quota: Option<u64>,
    /// seconds since the unix epoch
    #[serde(rename = "ReservoirQuotaTTL", default)]
    pub(crate) reservoir_quota_ttl: Option<f64>,
}

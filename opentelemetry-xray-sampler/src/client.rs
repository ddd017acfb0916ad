//! Access to the remote sampling control plane.
use crate::error::{XraySamplerError, XraySamplerResult};
use crate::remote::{
    GetSamplingRulesRequest, GetSamplingRulesResponse, SamplingStatisticsDocument,
    SamplingTargetsRequest, SamplingTargetsResponse,
};
use crate::rule::{SamplingRule, SamplingStatistics, SamplingTarget};
use opentelemetry::{otel_debug, otel_warn};
use opentelemetry_http::{Bytes, HttpClient};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default address of the X-Ray daemon or collector sampling proxy.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:2000";

const GET_SAMPLING_RULES_PATH: &str = "/GetSamplingRules";
const SAMPLING_TARGETS_PATH: &str = "/SamplingTargets";

/// Provides the authoritative list of sampling rules.
pub trait RuleSource: Send + Sync + Debug {
    /// Fetches every sampling rule.
    ///
    /// An `Ok` with an empty list means there are no rules; failures must be
    /// reported as `Err`.
    fn fetch_rules(&self) -> impl Future<Output = XraySamplerResult<Vec<SamplingRule>>> + Send;
}

/// Computes sampling targets from the request counters of the rules in use.
pub trait TargetSource: Send + Sync + Debug {
    /// Reports `statistics`, one entry per matched rule, and returns the new
    /// targets keyed by rule name.
    fn fetch_targets(
        &self,
        statistics: &[SamplingStatistics],
    ) -> impl Future<Output = XraySamplerResult<HashMap<String, SamplingTarget>>> + Send;
}

/// Client of the X-Ray sampling API.
///
/// Any [`HttpClient`] can be used to send the requests, which allows users to
/// bring the HTTP client matching their async runtime.
#[derive(Debug)]
pub struct XrayClient<H> {
    http_client: H,
    endpoint: String,
    client_id: String,
}

impl<H: HttpClient> XrayClient<H> {
    /// Creates a client sending requests to `endpoint`.
    pub fn new<E: Into<String>>(http_client: H, endpoint: E) -> Self {
        let mut client = XrayClient {
            http_client,
            endpoint: String::new(),
            client_id: new_client_id(),
        };
        client.set_endpoint(endpoint.into());
        client
    }

    /// Base URL of the sampling API.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Random identifier of this process, reported with the request counters.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn set_endpoint(&mut self, endpoint: String) {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
    }

    async fn post<Req, Resp>(&self, path: &'static str, body: &Req) -> XraySamplerResult<Resp>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(body).map_err(|err| XraySamplerError::Other(err.to_string()))?;
        let request = http::Request::post(format!("{}{}", self.endpoint, path))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(payload))
            .map_err(|err| XraySamplerError::Other(err.to_string()))?;

        let response = self.http_client.send_bytes(request).await?;
        if response.status() != http::StatusCode::OK {
            return Err(XraySamplerError::UnexpectedStatus {
                path,
                status: response.status(),
            });
        }

        Ok(serde_json::from_slice(response.body())?)
    }
}

impl<H: HttpClient> RuleSource for XrayClient<H> {
    async fn fetch_rules(&self) -> XraySamplerResult<Vec<SamplingRule>> {
        let mut rules = Vec::new();
        let mut request = GetSamplingRulesRequest::default();
        let mut seen_tokens = HashSet::new();
        loop {
            let page: GetSamplingRulesResponse =
                self.post(GET_SAMPLING_RULES_PATH, &request).await?;
            rules.extend(
                page.sampling_rule_records
                    .into_iter()
                    .map(|record| record.sampling_rule),
            );

            match page.next_token {
                Some(token) if !token.is_empty() => {
                    if !seen_tokens.insert(token.clone()) {
                        otel_warn!(name: "XrayClient.FetchRules.RepeatedNextToken");
                        return Ok(rules);
                    }
                    otel_debug!(name: "XrayClient.FetchRules.NextPage");
                    request.next_token = Some(token);
                }
                _ => return Ok(rules),
            }
        }
    }
}

impl<H: HttpClient> TargetSource for XrayClient<H> {
    async fn fetch_targets(
        &self,
        statistics: &[SamplingStatistics],
    ) -> XraySamplerResult<HashMap<String, SamplingTarget>> {
        let request = SamplingTargetsRequest {
            sampling_statistics_documents: statistics
                .iter()
                .map(|statistics| SamplingStatisticsDocument {
                    rule_name: statistics.rule_name.clone(),
                    client_id: self.client_id.clone(),
                    timestamp: epoch_secs(statistics.timestamp),
                    request_count: statistics.request_count,
                    sampled_count: statistics.sampled_count,
                    borrow_count: statistics.borrow_count,
                })
                .collect(),
        };

        let response: SamplingTargetsResponse = self.post(SAMPLING_TARGETS_PATH, &request).await?;
        Ok(response
            .sampling_target_documents
            .into_iter()
            .map(|document| {
                let target = SamplingTarget {
                    fixed_rate: document.fixed_rate,
                    reservoir_quota: document.reservoir_quota,
                    reservoir_quota_ttl: document
                        .reservoir_quota_ttl
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                        .map(|ttl| UNIX_EPOCH + ttl),
                };
                (document.rule_name, target)
            })
            .collect())
    }
}

fn new_client_id() -> String {
    // 96 random bits rendered as 24 hex digits
    format!("{:024x}", rand::random::<u128>() >> 32)
}

fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

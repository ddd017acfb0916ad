use crate::cache::RuleCache;
use crate::client::{RuleSource, TargetSource, XrayClient};
use crate::config::XraySamplerConfig;
use crate::error::{XraySamplerError, XraySamplerResult};
use crate::poller::Poller;
use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_http::HttpClient;
use opentelemetry_sdk::trace::ShouldSample;
use opentelemetry_sdk::Resource;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Sampler driven by the sampling rules configured in AWS X-Ray.
///
/// Rules and their targets are refreshed in the background. Spans matching a
/// rule are sampled according to that rule's budget, every other span is
/// handed over to the fallback sampler.
///
/// Clones share the rule cache and the background poller, which stops once
/// the last clone is dropped.
///
/// ```no_run
/// # fn run<H: opentelemetry_http::HttpClient + 'static>(http_client: H) -> opentelemetry_xray_sampler::XraySamplerResult<()> {
/// use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
/// use opentelemetry_sdk::Resource;
/// use opentelemetry_xray_sampler::XraySampler;
///
/// let sampler = XraySampler::builder(http_client)
///     .with_endpoint("http://localhost:2000")
///     .with_resource(Resource::builder().with_service_name("checkout").build())
///     .with_fallback_sampler(Sampler::TraceIdRatioBased(0.05))
///     .build()?;
///
/// let provider = SdkTracerProvider::builder().with_sampler(sampler).build();
/// # Ok(())
/// # }
/// ```
pub struct XraySampler<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    resource: Resource,
    fallback_sampler: Box<dyn ShouldSample>,
    poller: Poller<C>,
}

impl<C> Clone for XraySampler<C> {
    fn clone(&self) -> Self {
        XraySampler {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Debug> Debug for XraySampler<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XraySampler")
            .field("resource", &self.inner.resource)
            .field("fallback_sampler", &self.inner.fallback_sampler)
            .field("poller", &self.inner.poller)
            .finish()
    }
}

impl<H> XraySampler<XrayClient<H>>
where
    H: HttpClient + 'static,
{
    /// Creates a builder for a sampler talking to the X-Ray sampling API with
    /// `http_client`.
    pub fn builder(http_client: H) -> XraySamplerBuilder<XrayClient<H>> {
        XraySamplerBuilder::new(Box::new(move |config: &XraySamplerConfig| {
            XrayClient::new(http_client, config.endpoint())
        }))
    }
}

impl<C> XraySampler<C>
where
    C: RuleSource + TargetSource + 'static,
{
    /// Creates a builder for a sampler fetching rules and targets from `source`.
    pub fn builder_with_source(source: C) -> XraySamplerBuilder<C> {
        XraySamplerBuilder::new(Box::new(move |_: &XraySamplerConfig| source))
    }

    /// The rules currently used by this sampler.
    pub fn rule_cache(&self) -> &Arc<RuleCache> {
        self.inner.poller.cache()
    }
}

impl<C> ShouldSample for XraySampler<C>
where
    C: RuleSource + TargetSource + 'static,
{
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        let Some(rule) = self
            .rule_cache()
            .first_matching_rule(attributes, &self.inner.resource)
        else {
            return self.inner.fallback_sampler.should_sample(
                parent_context,
                trace_id,
                name,
                span_kind,
                attributes,
                links,
            );
        };

        let decision = if rule.can_sample() {
            SamplingDecision::RecordAndSample
        } else {
            SamplingDecision::Drop
        };

        SamplingResult {
            decision,
            attributes: Vec::new(),
            trace_state: match parent_context {
                Some(ctx) => ctx.span().span_context().trace_state().clone(),
                None => TraceState::default(),
            },
        }
    }
}

type SourceFactory<C> = Box<dyn FnOnce(&XraySamplerConfig) -> C>;

/// Builder for [`XraySampler`].
///
/// A resource and a fallback sampler are required.
pub struct XraySamplerBuilder<C> {
    source: SourceFactory<C>,
    config: XraySamplerConfig,
    resource: Option<Resource>,
    fallback_sampler: Option<Box<dyn ShouldSample>>,
}

impl<C> Debug for XraySamplerBuilder<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XraySamplerBuilder")
            .field("config", &self.config)
            .field("resource", &self.resource)
            .field("fallback_sampler", &self.fallback_sampler)
            .finish_non_exhaustive()
    }
}

impl<H> XraySamplerBuilder<XrayClient<H>>
where
    H: HttpClient + 'static,
{
    /// Sets the base URL of the X-Ray sampling API.
    ///
    /// Defaults to `OTEL_XRAY_SAMPLER_ENDPOINT` if set, `http://localhost:2000`
    /// otherwise.
    pub fn with_endpoint<E: Into<String>>(mut self, endpoint: E) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }
}

impl<C> XraySamplerBuilder<C>
where
    C: RuleSource + TargetSource + 'static,
{
    fn new(source: SourceFactory<C>) -> Self {
        XraySamplerBuilder {
            source,
            config: XraySamplerConfig::default(),
            resource: None,
            fallback_sampler: None,
        }
    }

    /// Resource of the instrumented service, matched against the service name,
    /// service type and resource ARN of the rules.
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Sampler deciding for spans no rule matches.
    pub fn with_fallback_sampler<S: ShouldSample + 'static>(mut self, sampler: S) -> Self {
        self.fallback_sampler = Some(Box::new(sampler));
        self
    }

    /// Sets the delay between two rule refreshes.
    pub fn with_rule_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.rule_refresh_interval = interval;
        self
    }

    /// Sets the delay between two target refreshes.
    pub fn with_target_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.target_refresh_interval = interval;
        self
    }

    /// Replaces every refresh setting with `config`.
    pub fn with_config(mut self, config: XraySamplerConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the sampler and starts polling.
    ///
    /// Rules are fetched once before this returns; a failed fetch is logged and
    /// the sampler starts with no rules, so every span goes to the fallback
    /// sampler until the next successful refresh.
    pub fn build(self) -> XraySamplerResult<XraySampler<C>> {
        let resource = self
            .resource
            .ok_or_else(|| XraySamplerError::Config("a resource is required".into()))?;
        let fallback_sampler = self
            .fallback_sampler
            .ok_or_else(|| XraySamplerError::Config("a fallback sampler is required".into()))?;
        self.config.validate()?;

        let poller = Poller::new(
            (self.source)(&self.config),
            Arc::new(RuleCache::new()),
            self.config.rule_refresh_interval,
            self.config.target_refresh_interval,
        );
        poller.start()?;

        Ok(XraySampler {
            inner: Arc::new(Inner {
                resource,
                fallback_sampler,
                poller,
            }),
        })
    }
}

//! # OpenTelemetry AWS X-Ray remote sampler
//!
//! A [`ShouldSample`] implementation applying the sampling rules configured in
//! AWS X-Ray, fetched from the X-Ray daemon or the collector's sampling proxy.
//!
//! Rules are kept in a [`RuleCache`] ordered by priority. Every span start
//! picks the first rule matching the span attributes and the service
//! [`Resource`]: the rule samples a fixed number of requests per second from
//! its reservoir, then a fixed ratio of the remaining ones. Spans no rule
//! matches are handed over to a fallback sampler.
//!
//! A [`Poller`] running on a dedicated thread refreshes the rules every 5
//! minutes and, every 10 seconds, reports the request counters of the rules in
//! use to get updated reservoir quotas and rates. Refresh failures are logged
//! and the previously fetched rules stay in effect.
//!
//! ```no_run
//! # fn run<H: opentelemetry_http::HttpClient + 'static>(http_client: H) -> Result<(), Box<dyn std::error::Error>> {
//! use opentelemetry::trace::{Tracer, TracerProvider as _};
//! use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
//! use opentelemetry_sdk::Resource;
//! use opentelemetry_xray_sampler::XraySampler;
//!
//! let sampler = XraySampler::builder(http_client)
//!     .with_resource(Resource::builder().with_service_name("checkout").build())
//!     .with_fallback_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(0.05))))
//!     .build()?;
//!
//! let provider = SdkTracerProvider::builder().with_sampler(sampler).build();
//! provider.tracer("checkout").in_span("GET /cart", |_cx| {});
//! # Ok(())
//! # }
//! ```
//!
//! [`ShouldSample`]: opentelemetry_sdk::trace::ShouldSample
//! [`Resource`]: opentelemetry_sdk::Resource
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod cache;
mod client;
mod config;
mod error;
mod matcher;
mod poller;
mod remote;
mod reservoir;
mod rule;
mod sampler;

pub use cache::{RuleCache, RuleSnapshot};
pub use client::{RuleSource, TargetSource, XrayClient, DEFAULT_ENDPOINT};
pub use config::{XraySamplerConfig, XraySamplerConfigBuilder};
pub use error::{XraySamplerError, XraySamplerResult};
pub use poller::Poller;
pub use rule::{Rule, SamplingRule, SamplingStatistics, SamplingTarget};
pub use sampler::{XraySampler, XraySamplerBuilder};

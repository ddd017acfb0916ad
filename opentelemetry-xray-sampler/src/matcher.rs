//! Glob matching of sampling rule fields against span and resource attributes.
use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_sdk::Resource;
use std::borrow::Cow;

const SERVICE_NAME: Key = Key::from_static_str("service.name");
const CLOUD_PLATFORM: Key = Key::from_static_str("cloud.platform");

/// Resource attributes that may carry the ARN of the instrumented resource, in
/// lookup order.
const RESOURCE_ARN_KEYS: [Key; 4] = [
    Key::from_static_str("aws.ecs.container.arn"),
    Key::from_static_str("aws.eks.cluster.arn"),
    Key::from_static_str("cloud.resource_id"),
    Key::from_static_str("faas.id"),
];

const HOST_KEYS: [&str; 3] = ["server.address", "net.host.name", "http.host"];
const HTTP_METHOD_KEYS: [&str; 2] = ["http.request.method", "http.method"];
const URL_PATH_KEYS: [&str; 2] = ["url.path", "http.target"];
const FULL_URL_KEYS: [&str; 2] = ["url.full", "http.url"];

/// A glob pattern where `*` matches any run of characters and `?` matches a
/// single character. Comparison ignores ASCII case.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Glob {
    pattern: Box<[char]>,
    any: bool,
}

impl Glob {
    pub(crate) fn new(pattern: &str) -> Self {
        Glob {
            pattern: pattern.chars().map(|c| c.to_ascii_lowercase()).collect(),
            any: pattern == "*",
        }
    }

    /// Matches an optional value. A bare `*` accepts a missing value as well,
    /// every other pattern requires one.
    pub(crate) fn matches_opt(&self, subject: Option<&str>) -> bool {
        if self.any {
            return true;
        }
        subject.is_some_and(|s| self.matches(s))
    }

    pub(crate) fn matches(&self, subject: &str) -> bool {
        if self.any {
            return true;
        }

        let pattern = &self.pattern;
        // pattern index and subject byte offset
        let mut px = 0;
        let mut sx = 0;
        // position to resume from after the most recent `*`
        let mut star: Option<(usize, usize)> = None;

        while let Some(sc) = subject[sx..].chars().next() {
            match pattern.get(px) {
                Some('?') => {
                    px += 1;
                    sx += sc.len_utf8();
                }
                Some('*') => {
                    star = Some((px, sx));
                    px += 1;
                }
                Some(&c) if c == sc.to_ascii_lowercase() => {
                    px += 1;
                    sx += sc.len_utf8();
                }
                _ => match star {
                    Some((star_px, star_sx)) => {
                        let skipped = subject[star_sx..].chars().next().map_or(1, char::len_utf8);
                        px = star_px + 1;
                        sx = star_sx + skipped;
                        star = Some((star_px, sx));
                    }
                    None => return false,
                },
            }
        }

        pattern[px..].iter().all(|&c| c == '*')
    }
}

/// The values of a request that sampling rules are matched against, looked up
/// once per sampling decision.
#[derive(Debug)]
pub(crate) struct RequestFields<'a> {
    pub(crate) service_name: Option<Value>,
    pub(crate) service_type: Option<&'static str>,
    pub(crate) resource_arn: Option<Value>,
    pub(crate) host: Option<Cow<'a, str>>,
    pub(crate) http_method: Option<Cow<'a, str>>,
    pub(crate) url_path: Option<Cow<'a, str>>,
    pub(crate) attributes: &'a [KeyValue],
}

impl<'a> RequestFields<'a> {
    pub(crate) fn new(attributes: &'a [KeyValue], resource: &Resource) -> Self {
        RequestFields {
            service_name: service_name(resource),
            service_type: service_type(resource),
            resource_arn: resource_arn(resource),
            host: host(attributes),
            http_method: http_method(attributes),
            url_path: url_path(attributes),
            attributes,
        }
    }

    pub(crate) fn attribute(&self, key: &Key) -> Option<Cow<'a, str>> {
        self.attributes
            .iter()
            .find(|kv| kv.key == *key)
            .map(|kv| kv.value.as_str())
    }
}

/// Looks up the first present string-like attribute among `keys`.
pub(crate) fn span_attribute<'a>(attributes: &'a [KeyValue], keys: &[&str]) -> Option<Cow<'a, str>> {
    keys.iter().find_map(|key| {
        attributes
            .iter()
            .find(|kv| kv.key.as_str() == *key)
            .map(|kv| kv.value.as_str())
    })
}

pub(crate) fn host(attributes: &[KeyValue]) -> Option<Cow<'_, str>> {
    span_attribute(attributes, &HOST_KEYS)
}

pub(crate) fn http_method(attributes: &[KeyValue]) -> Option<Cow<'_, str>> {
    span_attribute(attributes, &HTTP_METHOD_KEYS)
}

/// Returns the request path, falling back to the path component of a full URL.
pub(crate) fn url_path(attributes: &[KeyValue]) -> Option<Cow<'_, str>> {
    if let Some(path) = span_attribute(attributes, &URL_PATH_KEYS) {
        return Some(path);
    }
    let full = span_attribute(attributes, &FULL_URL_KEYS)?;
    Some(Cow::Owned(path_of_url(&full).to_owned()))
}

fn path_of_url(url: &str) -> &str {
    let after_scheme = url.find("://").map_or(url, |idx| &url[idx + 3..]);
    let path = after_scheme.find('/').map_or("/", |idx| &after_scheme[idx..]);
    path.split(['?', '#']).next().unwrap_or(path)
}

pub(crate) fn service_name(resource: &Resource) -> Option<Value> {
    resource.get(&SERVICE_NAME)
}

/// Maps the `cloud.platform` resource attribute to the X-Ray service type.
pub(crate) fn service_type(resource: &Resource) -> Option<&'static str> {
    let platform = resource.get(&CLOUD_PLATFORM)?;
    match platform.as_str().as_ref() {
        "aws_ec2" => Some("AWS::EC2::Instance"),
        "aws_ecs" => Some("AWS::ECS::Container"),
        "aws_eks" => Some("AWS::EKS::Container"),
        "aws_elastic_beanstalk" => Some("AWS::ElasticBeanstalk::Environment"),
        "aws_lambda" => Some("AWS::Lambda::Function"),
        _ => None,
    }
}

pub(crate) fn resource_arn(resource: &Resource) -> Option<Value> {
    RESOURCE_ARN_KEYS.iter().find_map(|key| resource.get(key))
}

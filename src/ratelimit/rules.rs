//! Rate limiter configuration: strict parsing, validation and per-route resolution.
//!
//! The configuration document has a default bucket set plus sparse per-route
//! overrides:
//!
//! ```yaml
//! enabled: true
//! defaultBuckets:
//!   globalBucket: { capacity: 500, addTokenMs: 50 }
//!   ipBucket: { capacity: 20, addTokenMs: 3000 }
//! routeBuckets:
//!   signIn:
//!     emailBucket: { capacity: 5, addTokenMs: 60000 }
//! ```
//!
//! Parsing never stops at the first problem; every violation found is
//! reported together.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

use super::bucket::{BucketConfig, Dimension};
use crate::error::Result;

/// Logical gateway endpoints that can carry their own bucket overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteId {
    SignIn,
    SignInPasscode,
    Register,
    RegisterPasscode,
    ResetPassword,
    ResetPasswordPasscode,
    SetPassword,
    VerifyEmail,
}

impl RouteId {
    /// Every known route.
    pub const ALL: [RouteId; 8] = [
        RouteId::SignIn,
        RouteId::SignInPasscode,
        RouteId::Register,
        RouteId::RegisterPasscode,
        RouteId::ResetPassword,
        RouteId::ResetPasswordPasscode,
        RouteId::SetPassword,
        RouteId::VerifyEmail,
    ];

    /// Identifier as written in configuration and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteId::SignIn => "signIn",
            RouteId::SignInPasscode => "signInPasscode",
            RouteId::Register => "register",
            RouteId::RegisterPasscode => "registerPasscode",
            RouteId::ResetPassword => "resetPassword",
            RouteId::ResetPasswordPasscode => "resetPasswordPasscode",
            RouteId::SetPassword => "setPassword",
            RouteId::VerifyEmail => "verifyEmail",
        }
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known route.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown route '{0}'")]
pub struct UnknownRoute(pub String);

impl FromStr for RouteId {
    type Err = UnknownRoute;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RouteId::ALL
            .iter()
            .copied()
            .find(|route| route.as_str() == s)
            .ok_or_else(|| UnknownRoute(s.to_string()))
    }
}

/// One problem found in a configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field, e.g. `routeBuckets.signIn.ipBucket.capacity`.
    pub path: String,
    /// What is wrong with it.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// A configuration document that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid rate limiter configuration: {}", join_violations(.violations))]
pub struct ConfigError {
    /// Every violation found, in document order.
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Bucket rules for one scope: the defaults or a single route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteBucketsConfig {
    enabled: Option<bool>,
    buckets: [Option<BucketConfig>; 5],
}

impl RouteBucketsConfig {
    /// An empty bucket set with no `enabled` flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rule for one dimension, replacing any previous one.
    pub fn with_bucket(mut self, dimension: Dimension, config: BucketConfig) -> Self {
        self.buckets[dimension.index()] = Some(config);
        self
    }

    /// Set the explicit `enabled` flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// The explicit `enabled` flag, if one was given.
    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    /// The rule for one dimension, if configured in this scope.
    pub fn bucket(&self, dimension: Dimension) -> Option<&BucketConfig> {
        self.buckets[dimension.index()].as_ref()
    }

    /// Configured dimensions and their rules, in visiting order.
    pub fn buckets(&self) -> impl Iterator<Item = (Dimension, &BucketConfig)> {
        Dimension::ALL
            .into_iter()
            .filter_map(move |dim| self.bucket(dim).map(|cfg| (dim, cfg)))
    }
}

/// Which configuration entry a resolved bucket came from.
///
/// Each scope is its own bucket namespace, so an inherited default bucket is
/// shared by every route that inherits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketScope {
    /// Inherited from `defaultBuckets`.
    Default,
    /// Defined by the route's own override.
    Route(RouteId),
}

impl fmt::Display for BucketScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketScope::Default => f.write_str("default"),
            BucketScope::Route(route) => write!(f, "route:{}", route),
        }
    }
}

/// A bucket rule that applies to a route, with its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBucket {
    pub dimension: Dimension,
    pub config: BucketConfig,
    pub scope: BucketScope,
}

/// The effective bucket set for one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub route: RouteId,
    /// Whether limiting applies to this route at all.
    pub enabled: bool,
    /// Effective buckets in visiting order; `global` is always first.
    pub buckets: Vec<ResolvedBucket>,
}

impl ResolvedRoute {
    /// The effective bucket for one dimension.
    pub fn bucket(&self, dimension: Dimension) -> Option<&ResolvedBucket> {
        self.buckets.iter().find(|b| b.dimension == dimension)
    }
}

/// Validated, immutable rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    enabled: bool,
    default_buckets: RouteBucketsConfig,
    route_buckets: HashMap<RouteId, RouteBucketsConfig>,
}

impl RateLimiterConfig {
    /// An enabled configuration whose defaults hold only the global bucket.
    pub fn new(global: BucketConfig) -> Self {
        Self {
            enabled: true,
            default_buckets: RouteBucketsConfig::new().with_bucket(Dimension::Global, global),
            route_buckets: HashMap::new(),
        }
    }

    /// Set the top-level `enabled` flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Add or replace a default bucket.
    pub fn with_default_bucket(mut self, dimension: Dimension, config: BucketConfig) -> Self {
        self.default_buckets = self.default_buckets.with_bucket(dimension, config);
        self
    }

    /// Set the `enabled` flag of the defaults scope.
    pub fn with_default_enabled(mut self, enabled: bool) -> Self {
        self.default_buckets = self.default_buckets.with_enabled(enabled);
        self
    }

    /// Add or replace a route override.
    pub fn with_route(mut self, route: RouteId, buckets: RouteBucketsConfig) -> Self {
        self.route_buckets.insert(route, buckets);
        self
    }

    /// Top-level `enabled` flag.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The default bucket set.
    pub fn default_buckets(&self) -> &RouteBucketsConfig {
        &self.default_buckets
    }

    /// The override for a route, if any.
    pub fn route_buckets(&self, route: RouteId) -> Option<&RouteBucketsConfig> {
        self.route_buckets.get(&route)
    }

    /// The rule configured for `dimension` in one scope, which is the rule
    /// governing every bucket keyed with that scope.
    pub fn bucket_in_scope(&self, scope: BucketScope, dimension: Dimension) -> Option<&BucketConfig> {
        match scope {
            BucketScope::Default => self.default_buckets.bucket(dimension),
            BucketScope::Route(route) => self.route_buckets(route)?.bucket(dimension),
        }
    }

    /// Compute the effective bucket set for a route.
    ///
    /// Each dimension is resolved on its own: a rule in the route override
    /// replaces the default rule as a whole, otherwise the default is
    /// inherited, otherwise the dimension is not checked. The route's
    /// `enabled` flag wins over the defaults' flag when both are set.
    pub fn resolve(&self, route: RouteId) -> ResolvedRoute {
        let overrides = self.route_buckets.get(&route);

        let scoped_enabled = overrides
            .and_then(RouteBucketsConfig::enabled)
            .or(self.default_buckets.enabled())
            .unwrap_or(true);

        let buckets = Dimension::ALL
            .iter()
            .filter_map(|dimension| {
                if let Some(config) = overrides.and_then(|o| o.bucket(*dimension)) {
                    return Some(ResolvedBucket {
                        dimension: *dimension,
                        config: *config,
                        scope: BucketScope::Route(route),
                    });
                }
                self.default_buckets
                    .bucket(*dimension)
                    .map(|config| ResolvedBucket {
                        dimension: *dimension,
                        config: *config,
                        scope: BucketScope::Default,
                    })
            })
            .collect();

        ResolvedRoute {
            route,
            enabled: self.enabled && scoped_enabled,
            buckets,
        }
    }

    /// Every configured bucket with its location, for diagnostics.
    fn all_buckets(&self) -> Vec<(String, &BucketConfig)> {
        let mut out: Vec<(String, &BucketConfig)> = self
            .default_buckets
            .buckets()
            .map(|(dim, cfg)| (format!("defaultBuckets.{}", dim.document_key()), cfg))
            .collect();

        let mut routes: Vec<_> = self.route_buckets.iter().collect();
        routes.sort_by_key(|(route, _)| **route);
        for (route, buckets) in routes {
            out.extend(
                buckets
                    .buckets()
                    .map(|(dim, cfg)| (format!("routeBuckets.{}.{}", route, dim.document_key()), cfg)),
            );
        }
        out
    }

    /// Log a warning for every bucket that idle eviction can reset before it
    /// has refilled.
    pub fn warn_on_early_expiry(&self) {
        for (path, cfg) in self.all_buckets() {
            if cfg.expires_before_full_refill() {
                warn!(
                    bucket = %path,
                    expiry_ms = cfg.expiry_ms(),
                    full_refill_ms = cfg.full_refill_ms(),
                    "Bucket may be evicted before it refills; an evicted bucket restarts full"
                );
            }
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> std::result::Result<Self, ConfigError> {
        let raw: Value = serde_json::from_str(json).map_err(|e| ConfigError {
            violations: vec![Violation {
                path: "(document)".to_string(),
                message: format!("failed to parse JSON: {}", e),
            }],
        })?;
        Validator::default().document(&raw)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, ConfigError> {
        let raw: Value = serde_yaml::from_str(yaml).map_err(|e| ConfigError {
            violations: vec![Violation {
                path: "(document)".to_string(),
                message: format!("failed to parse YAML: {}", e),
            }],
        })?;
        Validator::default().document(&raw)
    }

    /// Load a document from disk. `.yaml` and `.yml` files are read as YAML,
    /// everything else as JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_contents(path, &contents)
    }

    /// Parse a document already read from `path`, choosing the format by its
    /// extension the same way as [`RateLimiterConfig::from_file`].
    pub fn from_contents(path: &Path, contents: &str) -> Result<Self> {
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let config = if is_yaml {
            Self::from_yaml(contents)?
        } else {
            Self::from_json(contents)?
        };
        config.warn_on_early_expiry();
        Ok(config)
    }
}

// The document is walked as an untyped tree so that wrong types, missing
// fields and unknown keys all surface in the same pass. `null` counts as
// absent.

type Object = serde_json::Map<String, Value>;

const DOCUMENT_FIELDS: [&str; 3] = ["enabled", "defaultBuckets", "routeBuckets"];

const ROUTE_FIELDS: [&str; 6] = [
    "enabled",
    "globalBucket",
    "ipBucket",
    "emailBucket",
    "oktaIdentifierBucket",
    "accessTokenBucket",
];

const BUCKET_FIELDS: [&str; 3] = ["capacity", "addTokenMs", "maximumTimeBeforeTokenExpiry"];

fn field<'a>(obj: &'a Object, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|value| !value.is_null())
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::String(s) => format!("string {:?}", s),
        Value::Array(_) => "a sequence".to_string(),
        Value::Object(_) => "a mapping".to_string(),
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Accumulates violations while walking a raw document.
#[derive(Default)]
struct Validator {
    violations: Vec<Violation>,
}

impl Validator {
    fn report(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            path: path.into(),
            message: message.into(),
        });
    }

    fn into_error(self) -> ConfigError {
        ConfigError {
            violations: self.violations,
        }
    }

    fn object<'a>(&mut self, path: &str, value: &'a Value) -> Option<&'a Object> {
        let obj = value.as_object();
        if obj.is_none() {
            let path = if path.is_empty() { "(document)" } else { path };
            self.report(path, format!("must be a mapping, got {}", describe(value)));
        }
        obj
    }

    fn unknown_fields(&mut self, prefix: &str, obj: &Object, known: &[&str]) {
        for key in obj.keys().filter(|key| !known.contains(&key.as_str())) {
            self.report(join_path(prefix, key), "unknown field");
        }
    }

    fn required<'a>(&mut self, obj: &'a Object, prefix: &str, key: &str) -> Option<&'a Value> {
        let value = field(obj, key);
        if value.is_none() {
            self.report(join_path(prefix, key), "missing required field");
        }
        value
    }

    fn boolean(&mut self, path: String, value: &Value) -> Option<bool> {
        let parsed = value.as_bool();
        if parsed.is_none() {
            self.report(path, format!("must be a boolean, got {}", describe(value)));
        }
        parsed
    }

    fn positive_integer(&mut self, path: String, value: &Value) -> Option<NonZeroU64> {
        let parsed = value.as_u64().or_else(|| {
            value
                .as_f64()
                .filter(|v| v.fract() == 0.0 && *v >= 1.0 && *v <= u64::MAX as f64)
                .map(|v| v as u64)
        });
        let parsed = parsed.and_then(NonZeroU64::new);
        if parsed.is_none() {
            self.report(path, format!("must be a positive integer, got {}", describe(value)));
        }
        parsed
    }

    fn bucket(&mut self, path: &str, value: &Value) -> Option<BucketConfig> {
        let obj = self.object(path, value)?;
        self.unknown_fields(path, obj, &BUCKET_FIELDS);

        let capacity = self
            .required(obj, path, "capacity")
            .and_then(|v| self.positive_integer(join_path(path, "capacity"), v));
        let add_token_ms = self
            .required(obj, path, "addTokenMs")
            .and_then(|v| self.positive_integer(join_path(path, "addTokenMs"), v));
        let expiry = match field(obj, "maximumTimeBeforeTokenExpiry") {
            Some(v) => self
                .positive_integer(join_path(path, "maximumTimeBeforeTokenExpiry"), v)
                .map(Some),
            None => Some(None),
        };

        let config = BucketConfig::new(capacity?, add_token_ms?);
        Some(match expiry? {
            Some(expiry) => config.with_expiry(expiry),
            None => config,
        })
    }

    fn route_buckets(&mut self, path: &str, value: &Value) -> Option<RouteBucketsConfig> {
        let obj = self.object(path, value)?;
        self.unknown_fields(path, obj, &ROUTE_FIELDS);

        let mut config = RouteBucketsConfig::new();
        if let Some(enabled) = field(obj, "enabled") {
            if let Some(enabled) = self.boolean(join_path(path, "enabled"), enabled) {
                config = config.with_enabled(enabled);
            }
        }
        for dimension in Dimension::ALL {
            let key = dimension.document_key();
            if let Some(bucket) = field(obj, key) {
                if let Some(parsed) = self.bucket(&join_path(path, key), bucket) {
                    config = config.with_bucket(dimension, parsed);
                }
            }
        }
        Some(config)
    }

    fn document(mut self, root: &Value) -> std::result::Result<RateLimiterConfig, ConfigError> {
        let Some(doc) = self.object("", root) else {
            return Err(self.into_error());
        };
        self.unknown_fields("", doc, &DOCUMENT_FIELDS);

        let enabled = self
            .required(doc, "", "enabled")
            .and_then(|v| self.boolean("enabled".to_string(), v));

        let default_buckets = match self.required(doc, "", "defaultBuckets") {
            Some(raw) => {
                if raw.as_object().is_some_and(|obj| field(obj, "globalBucket").is_none()) {
                    self.report("defaultBuckets.globalBucket", "missing required field");
                }
                self.route_buckets("defaultBuckets", raw)
            }
            None => None,
        };

        let mut route_buckets = HashMap::new();
        let routes = field(doc, "routeBuckets").and_then(|raw| self.object("routeBuckets", raw));
        for (key, raw) in routes.into_iter().flatten() {
            let path = join_path("routeBuckets", key);
            // Validate the body even under an unknown key so that one pass
            // surfaces everything.
            let parsed = self.route_buckets(&path, raw);
            match key.parse::<RouteId>() {
                Ok(route) => {
                    if let Some(parsed) = parsed {
                        route_buckets.insert(route, parsed);
                    }
                }
                Err(_) => self.report(path, "unknown route identifier"),
            }
        }

        if !self.violations.is_empty() {
            return Err(self.into_error());
        }

        match (enabled, default_buckets) {
            (Some(enabled), Some(default_buckets)) if default_buckets.bucket(Dimension::Global).is_some() => {
                Ok(RateLimiterConfig {
                    enabled,
                    default_buckets,
                    route_buckets,
                })
            }
            // Unreachable when no violation was reported, kept total.
            _ => Err(ConfigError {
                violations: vec![Violation {
                    path: "defaultBuckets.globalBucket".to_string(),
                    message: "missing required field".to_string(),
                }],
            }),
        }
    }
}

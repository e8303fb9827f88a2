//! Late binding to collaborators whose shape is not fixed ahead of time.
//!
//! Some deployments plug in their own analyzer or search service. Those
//! plugins are versioned independently, so neither the way they want to be
//! constructed nor the method they answer to is known at compile time. The
//! probe walks an explicit candidate table instead:
//!
//! 1. for each candidate [`Constructor`], try `from_config`, then
//!    `from_mapping`, then `from_nothing`; the first success wins
//! 2. for each candidate method name, call with the given args; if the
//!    argument count is rejected, call once more with the extra hint
//!    appended; the first non-empty result wins
//!
//! Everything that loses is logged and kept as a [`FailureRecord`].
//!
//! The shipped collaborator is [`RemoteCollaborator`], an HTTP plugin where
//! method `m` is `POST {endpoint}/{m}` with `{"args": [...]}`.

use crate::config::Config;
use crate::error::ProviderError;
use crate::generation::GenerationBackend;
use crate::models::{FailureRecord, RawItem};
use crate::search::SearchTier;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Analyzer methods, most specific first.
pub const ANALYZER_METHODS: &[&str] = &["chat", "analyze", "generate_content"];
/// Extra argument older analyzers require after the prompt (a stock code).
pub const ANALYZER_HINT: &str = "000001";
/// Search service methods, most specific first.
pub const SEARCH_METHODS: &[&str] = &["search_news", "search", "query"];

/// Failure of a single probed call.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("no method named {0}")]
    NoSuchMethod(String),
    #[error("{0} rejected the argument count")]
    ArityMismatch(String),
    #[error(transparent)]
    Failed(#[from] ProviderError),
}

impl ProbeError {
    fn into_provider_error(self) -> ProviderError {
        match self {
            Self::NoSuchMethod(m) => ProviderError::NotFound(format!("method {m}")),
            Self::ArityMismatch(m) => ProviderError::Unsupported(format!("arguments of {m}")),
            Self::Failed(e) => e,
        }
    }
}

/// A constructed collaborator with a name-addressed method table.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn type_name(&self) -> &str;

    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ProbeError>;
}

/// One way of building a collaborator. Unsupported forms keep the default.
pub trait Constructor: Send + Sync {
    fn type_name(&self) -> &str;

    fn from_config(&self, _config: &Config) -> Result<Box<dyn Collaborator>, ProviderError> {
        Err(ProviderError::Unsupported(format!("{}(config)", self.type_name())))
    }

    fn from_mapping(&self, _mapping: &BTreeMap<String, String>) -> Result<Box<dyn Collaborator>, ProviderError> {
        Err(ProviderError::Unsupported(format!("{}(mapping)", self.type_name())))
    }

    fn from_nothing(&self) -> Result<Box<dyn Collaborator>, ProviderError> {
        Err(ProviderError::Unsupported(format!("{}()", self.type_name())))
    }
}

/// Constructor call shapes, tried in [`ConstructorForm::ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructorForm {
    Config,
    Mapping,
    Nothing,
}

impl ConstructorForm {
    pub const ORDER: [Self; 3] = [Self::Config, Self::Mapping, Self::Nothing];
}

/// Winning method call.
#[derive(Debug, Clone)]
pub struct Probed {
    pub method: String,
    pub value: Value,
    pub failures: Vec<FailureRecord>,
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn record(failures: &mut Vec<FailureRecord>, who: String, err: &ProviderError) {
    warn!(candidate = %who, kind = %err.kind(), error = %err, "Probe candidate rejected");
    failures.push(FailureRecord::new(who, err));
}

/// Build the first collaborator any candidate type accepts.
#[instrument(level = "info", skip_all, fields(candidates = candidates.len()))]
pub fn construct(
    candidates: &[Box<dyn Constructor>],
    config: &Config,
) -> Result<Box<dyn Collaborator>, ProviderError> {
    let mapping = config.as_mapping();
    let mut failures = Vec::new();
    let mut last = None;

    for ctor in candidates {
        for form in ConstructorForm::ORDER {
            let attempt = match form {
                ConstructorForm::Config => ctor.from_config(config),
                ConstructorForm::Mapping => ctor.from_mapping(&mapping),
                ConstructorForm::Nothing => ctor.from_nothing(),
            };
            match attempt {
                Ok(instance) => {
                    info!(type_name = ctor.type_name(), ?form, "Constructed collaborator");
                    return Ok(instance);
                }
                Err(e) => {
                    record(&mut failures, format!("{}({:?})", ctor.type_name(), form), &e);
                    last = Some(e);
                }
            }
        }
    }

    Err(ProviderError::Exhausted {
        last: last.map_or_else(|| "no constructor candidates".to_string(), |e| e.to_string()),
        failures,
    })
}

/// Call the first method in `methods` that yields a non-empty result.
#[instrument(level = "info", skip_all, fields(collaborator = instance.type_name()))]
pub async fn invoke_best_method(
    instance: &dyn Collaborator,
    methods: &[&str],
    args: &[Value],
    hint: Option<Value>,
) -> Result<Probed, ProviderError> {
    let mut failures = Vec::new();
    let mut last = None;

    for &method in methods {
        let mut outcome = instance.call(method, args).await;
        let arity_rejected = matches!(outcome, Err(ProbeError::ArityMismatch(_)));
        if let (true, Some(hint)) = (arity_rejected, &hint) {
            let mut extended = args.to_vec();
            extended.push(hint.clone());
            outcome = instance.call(method, &extended).await;
        }

        let err = match outcome {
            Ok(value) if !is_empty_value(&value) => {
                info!(method, skipped = failures.len(), "Probed method answered");
                return Ok(Probed {
                    method: method.to_string(),
                    value,
                    failures,
                });
            }
            Ok(_) => ProviderError::MalformedResponse(format!("{method} returned nothing")),
            Err(e) => e.into_provider_error(),
        };
        record(&mut failures, format!("{}.{}", instance.type_name(), method), &err);
        last = Some(err);
    }

    Err(ProviderError::Exhausted {
        last: last.map_or_else(|| "no method candidates".to_string(), |e| e.to_string()),
        failures,
    })
}

/// HTTP plugin collaborator.
#[derive(Debug)]
pub struct RemoteCollaborator {
    type_name: String,
    http: reqwest::Client,
    endpoint: Url,
}

impl RemoteCollaborator {
    fn method_url(&self, method: &str) -> Result<Url, ProviderError> {
        self.endpoint
            .join(method)
            .map_err(|e| ProviderError::Unsupported(format!("method {method}: {e}")))
    }
}

/// The `result` member of a plugin reply, or the whole reply.
fn unwrap_result(body: &str) -> Value {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(mut map)) if map.contains_key("result") => map.remove("result").unwrap_or(Value::Null),
        Ok(other) => other,
        Err(_) => Value::String(body.to_string()),
    }
}

#[async_trait]
impl Collaborator for RemoteCollaborator {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ProbeError> {
        let url = self.method_url(method)?;
        let response = self
            .http
            .post(url)
            .json(&json!({ "args": args }))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        match status.as_u16() {
            404 => Err(ProbeError::NoSuchMethod(method.to_string())),
            400 | 422 => Err(ProbeError::ArityMismatch(method.to_string())),
            _ if !status.is_success() => Err(ProviderError::from_status(status, &body).into()),
            _ => Ok(unwrap_result(&body)),
        }
    }
}

/// Which plugin a [`RemoteConstructor`] builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginRole {
    Analyzer,
    SearchService,
}

impl PluginRole {
    fn key(&self) -> &'static str {
        match self {
            Self::Analyzer => "analyzer_endpoint",
            Self::SearchService => "search_service_endpoint",
        }
    }
}

#[derive(Debug)]
pub struct RemoteConstructor {
    role: PluginRole,
    http: reqwest::Client,
}

impl RemoteConstructor {
    pub fn new(role: PluginRole, http: reqwest::Client) -> Self {
        Self { role, http }
    }

    fn build(&self, endpoint: Option<&str>) -> Result<Box<dyn Collaborator>, ProviderError> {
        let endpoint = endpoint.ok_or_else(|| ProviderError::Unavailable(self.role.key().to_string()))?;
        // Trailing slash so `join(method)` appends rather than replaces.
        let endpoint = Url::parse(&format!("{}/", endpoint.trim_end_matches('/')))
            .map_err(|e| ProviderError::Unsupported(format!("{}: {e}", self.role.key())))?;
        Ok(Box::new(RemoteCollaborator {
            type_name: self.type_name().to_string(),
            http: self.http.clone(),
            endpoint,
        }))
    }
}

impl Constructor for RemoteConstructor {
    fn type_name(&self) -> &str {
        match self.role {
            PluginRole::Analyzer => "RemoteAnalyzer",
            PluginRole::SearchService => "RemoteSearchService",
        }
    }

    fn from_config(&self, config: &Config) -> Result<Box<dyn Collaborator>, ProviderError> {
        let endpoint = match self.role {
            PluginRole::Analyzer => config.credentials.analyzer_endpoint.as_deref(),
            PluginRole::SearchService => config.credentials.search_service_endpoint.as_deref(),
        };
        self.build(endpoint)
    }

    fn from_mapping(&self, mapping: &BTreeMap<String, String>) -> Result<Box<dyn Collaborator>, ProviderError> {
        self.build(mapping.get(self.role.key()).map(String::as_str))
    }
}

/// Constructor candidates per plugin role, in probe order.
pub fn constructors(role: PluginRole, http: &reqwest::Client) -> Vec<Box<dyn Constructor>> {
    vec![Box::new(RemoteConstructor::new(role, http.clone()))]
}

fn value_to_text(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get("text").or_else(|| map.get("content")) {
                return s.clone();
            }
            Value::Object(map).to_string()
        }
        other => other.to_string(),
    }
}

/// A probed analyzer exposed as a single-model generation backend.
pub struct ProbedAnalyzer {
    instance: Option<Box<dyn Collaborator>>,
    models: Vec<String>,
}

impl ProbedAnalyzer {
    pub fn probe(candidates: &[Box<dyn Constructor>], config: &Config) -> Self {
        let instance = if config.credentials.analyzer_endpoint.is_some() {
            construct(candidates, config)
                .inspect_err(|e| warn!(error = %e, "No analyzer plugin could be constructed"))
                .ok()
        } else {
            None
        };
        Self {
            instance,
            models: vec!["plugin".to_string()],
        }
    }
}

#[async_trait]
impl GenerationBackend for ProbedAnalyzer {
    fn name(&self) -> &str {
        "analyzer"
    }

    fn priority(&self) -> u32 {
        0
    }

    fn is_available(&self) -> bool {
        self.instance.is_some()
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn complete(&self, _model_id: &str, prompt: &str) -> Result<String, ProviderError> {
        let instance = self
            .instance
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable("ANALYZER_ENDPOINT".to_string()))?;
        let probed = invoke_best_method(
            instance,
            ANALYZER_METHODS,
            &[Value::String(prompt.to_string())],
            Some(Value::String(ANALYZER_HINT.to_string())),
        )
        .await?;
        debug!(method = %probed.method, skipped = probed.failures.len(), "Analyzer answered");
        Ok(value_to_text(probed.value))
    }
}

/// A probed search service exposed as the highest-priority search tier.
pub struct ProbedSearchTier {
    instance: Option<Box<dyn Collaborator>>,
}

impl ProbedSearchTier {
    pub fn probe(candidates: &[Box<dyn Constructor>], config: &Config) -> Self {
        let instance = if config.credentials.search_service_endpoint.is_some() {
            construct(candidates, config)
                .inspect_err(|e| warn!(error = %e, "No search service plugin could be constructed"))
                .ok()
        } else {
            None
        };
        Self { instance }
    }
}

#[async_trait]
impl SearchTier for ProbedSearchTier {
    fn name(&self) -> &str {
        "search_service"
    }

    fn priority(&self) -> u32 {
        5
    }

    fn is_available(&self) -> bool {
        self.instance.is_some()
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawItem>, ProviderError> {
        let instance = self
            .instance
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable("SEARCH_SERVICE_ENDPOINT".to_string()))?;
        let probed = invoke_best_method(
            instance,
            SEARCH_METHODS,
            &[Value::String(query.to_string())],
            Some(json!(limit)),
        )
        .await?;
        debug!(method = %probed.method, skipped = probed.failures.len(), "Search service answered");
        Ok(match probed.value {
            Value::Array(items) => items.into_iter().map(RawItem::Json).collect(),
            other => vec![RawItem::Json(other)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// `methods[name] = (arity, reply)`.
    struct FakeCollaborator {
        methods: HashMap<&'static str, (usize, Value)>,
        calls: Arc<Mutex<Vec<(String, usize)>>>,
    }

    #[async_trait]
    impl Collaborator for FakeCollaborator {
        fn type_name(&self) -> &str {
            "Fake"
        }

        async fn call(&self, method: &str, args: &[Value]) -> Result<Value, ProbeError> {
            self.calls.lock().unwrap().push((method.to_string(), args.len()));
            match self.methods.get(method) {
                None => Err(ProbeError::NoSuchMethod(method.to_string())),
                Some((arity, _)) if *arity != args.len() => Err(ProbeError::ArityMismatch(method.to_string())),
                Some((_, reply)) => Ok(reply.clone()),
            }
        }
    }

    fn fake(methods: Vec<(&'static str, usize, Value)>) -> (FakeCollaborator, Arc<Mutex<Vec<(String, usize)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let collab = FakeCollaborator {
            methods: methods.into_iter().map(|(m, a, v)| (m, (a, v))).collect(),
            calls: Arc::clone(&calls),
        };
        (collab, calls)
    }

    /// Accepts only the forms flagged true.
    struct FakeCtor {
        name: &'static str,
        config_ok: bool,
        mapping_ok: bool,
        nothing_ok: bool,
    }

    impl FakeCtor {
        fn make(&self) -> Box<dyn Collaborator> {
            let (c, _) = fake(vec![("chat", 1, json!(self.name))]);
            Box::new(c)
        }
    }

    impl Constructor for FakeCtor {
        fn type_name(&self) -> &str {
            self.name
        }

        fn from_config(&self, _config: &Config) -> Result<Box<dyn Collaborator>, ProviderError> {
            if self.config_ok {
                Ok(self.make())
            } else {
                Err(ProviderError::Unsupported("config".to_string()))
            }
        }

        fn from_mapping(&self, _m: &BTreeMap<String, String>) -> Result<Box<dyn Collaborator>, ProviderError> {
            if self.mapping_ok {
                Ok(self.make())
            } else {
                Err(ProviderError::Unsupported("mapping".to_string()))
            }
        }

        fn from_nothing(&self) -> Result<Box<dyn Collaborator>, ProviderError> {
            if self.nothing_ok {
                Ok(self.make())
            } else {
                Err(ProviderError::Unsupported("nothing".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_construct_falls_through_forms_and_types() {
        let candidates: Vec<Box<dyn Constructor>> = vec![
            Box::new(FakeCtor {
                name: "GeminiAnalyzer",
                config_ok: false,
                mapping_ok: false,
                nothing_ok: false,
            }),
            Box::new(FakeCtor {
                name: "Analyzer",
                config_ok: false,
                mapping_ok: false,
                nothing_ok: true,
            }),
            Box::new(FakeCtor {
                name: "Unreached",
                config_ok: true,
                mapping_ok: true,
                nothing_ok: true,
            }),
        ];
        let instance = construct(&candidates, &test_config()).unwrap();
        let out = invoke_best_method(instance.as_ref(), &["chat"], &[json!("p")], None)
            .await
            .unwrap();
        assert_eq!(out.value, json!("Analyzer"));
    }

    #[test]
    fn test_construct_prefers_config_form() {
        let candidates: Vec<Box<dyn Constructor>> = vec![Box::new(FakeCtor {
            name: "Both",
            config_ok: true,
            mapping_ok: true,
            nothing_ok: false,
        })];
        assert!(construct(&candidates, &test_config()).is_ok());
    }

    #[test]
    fn test_construct_exhausted_records_every_attempt() {
        let candidates: Vec<Box<dyn Constructor>> = vec![Box::new(FakeCtor {
            name: "Never",
            config_ok: false,
            mapping_ok: false,
            nothing_ok: false,
        })];
        match construct(&candidates, &test_config()) {
            Err(ProviderError::Exhausted { failures, .. }) => assert_eq!(failures.len(), 3),
            _ => panic!("expected Exhausted"),
        }
    }

    #[tokio::test]
    async fn test_invoke_retries_with_hint_on_arity() {
        let (collab, calls) = fake(vec![("analyze", 2, json!("report"))]);
        let out = invoke_best_method(&collab, ANALYZER_METHODS, &[json!("prompt")], Some(json!(ANALYZER_HINT)))
            .await
            .unwrap();
        assert_eq!(out.method, "analyze");
        assert_eq!(out.value, json!("report"));
        assert_eq!(out.failures.len(), 1);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ("chat".to_string(), 1),
                ("analyze".to_string(), 1),
                ("analyze".to_string(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn test_invoke_skips_empty_results() {
        let (collab, _) = fake(vec![("chat", 1, json!("")), ("generate_content", 1, json!({"text": "ok"}))]);
        let out = invoke_best_method(&collab, ANALYZER_METHODS, &[json!("p")], None)
            .await
            .unwrap();
        assert_eq!(out.method, "generate_content");
        assert_eq!(out.failures.len(), 2);
        assert_eq!(value_to_text(out.value), "ok");
    }

    #[tokio::test]
    async fn test_invoke_exhausted() {
        let (collab, _) = fake(vec![]);
        let err = invoke_best_method(&collab, SEARCH_METHODS, &[json!("q")], Some(json!(5)))
            .await
            .unwrap_err();
        match err {
            ProviderError::Exhausted { failures, .. } => assert_eq!(failures.len(), 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probed_search_tier_wraps_items() {
        let (collab, _) = fake(vec![("search", 2, json!([{"title": "a", "body": "b"}, "plain"]))]);
        let tier = ProbedSearchTier {
            instance: Some(Box::new(collab)),
        };
        let items = tier.search("q", 5).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], RawItem::Json(json!("plain")));
    }

    #[test]
    fn test_remote_constructor_forms() {
        let http = reqwest::Client::new();
        let ctor = RemoteConstructor::new(PluginRole::Analyzer, http);
        let cfg = test_config();
        assert_eq!(
            ctor.from_config(&cfg).err().map(|e| e.kind()),
            Some(crate::error::ErrorKind::Unavailable)
        );
        let mut mapping = BTreeMap::new();
        mapping.insert("analyzer_endpoint".to_string(), "http://localhost:7000/plugin".to_string());
        assert!(ctor.from_mapping(&mapping).is_ok());
        assert!(ctor.from_nothing().is_err());
    }

    #[test]
    fn test_probe_without_endpoint_is_unavailable() {
        let cfg = test_config();
        let http = reqwest::Client::new();
        let analyzer = ProbedAnalyzer::probe(&constructors(PluginRole::Analyzer, &http), &cfg);
        assert!(!analyzer.is_available());
        let search = ProbedSearchTier::probe(&constructors(PluginRole::SearchService, &http), &cfg);
        assert!(!search.is_available());
    }

    #[test]
    fn test_unwrap_result() {
        assert_eq!(unwrap_result(r#"{"result": [1]}"#), json!([1]));
        assert_eq!(unwrap_result(r#"{"other": 1}"#), json!({"other": 1}));
        assert_eq!(unwrap_result("plain text"), json!("plain text"));
    }
}

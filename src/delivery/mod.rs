//! Serving the minimal relevant subset of a cached document
//!
//! A delivery resolves the rule for the (framework, operation) pair, or the
//! experiment arm while the pair is experimenting, selects the rule's
//! sections from the cached entry within the token budget and appends the
//! delivery to the session ledger. A cache miss returns the rule the caller
//! should use to fetch and store the documentation.

pub mod splitter;

pub use splitter::{normalize_section_name, MarkdownSplitter, SectionSplitter, LEAD_SECTION};

use crate::error::{DoclensError, Result};
use crate::learning::{ABController, RuleStore};
use crate::storage::{CacheStore, SessionLedger};
use crate::types::{token_count, Arm, CacheEntry, CacheKey, ExtractionRule, NewSession, RuleSet, Sections};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Characters served per budgeted token when falling back to full content
const CHARS_PER_TOKEN: usize = 5;

const SESSION_ID_LEN: usize = 8;

/// Framework, operation and component recognised in source text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub framework: String,
    pub operation: String,
    pub component: Option<String>,
}

/// Maps source text and its file path to a classification
pub trait Classifier: Send + Sync {
    fn classify(&self, source: &str, file_path: Option<&str>) -> Option<Classification>;
}

/// Sections chosen from an entry, rendered for the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub content: String,
    pub sections: Vec<String>,
    pub tokens: i64,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Walk the rule's sections in order, keeping each present one that still
/// fits within `min(rule.max_tokens, budget)`
pub fn select_sections(sections: &Sections, rule: &ExtractionRule, budget: i64) -> Selection {
    let limit = rule.max_tokens.min(budget);
    let mut rendered = Vec::new();
    let mut selection = Selection::default();

    for name in &rule.sections {
        let Some(text) = sections.get(name) else {
            continue;
        };
        let tokens = token_count(text);
        if selection.tokens + tokens > limit {
            continue;
        }
        rendered.push(format!("## {}\n{}", title_case(name), text));
        selection.sections.push(name.clone());
        selection.tokens += tokens;
    }

    selection.content = rendered.join("\n\n");
    selection
}

/// What the host asked documentation for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub framework: String,
    pub operation: String,
    pub component: Option<String>,
    pub tool_name: String,
    pub tool_input: String,
    pub file_path: Option<String>,
}

/// Experiment arm a delivery was served under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServedArm {
    pub test_id: String,
    pub arm: Arm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Delivery {
    Hit {
        cache_key: CacheKey,
        session_id: String,
        log_id: i64,
        content: String,
        sections_used: Vec<String>,
        tokens_used: i64,
        full_content_fallback: bool,
        rule: ExtractionRule,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        experiment: Option<ServedArm>,
    },
    /// Nothing cached: fetch documentation covering `rule.sections` and
    /// store it under `cache_key`
    Miss {
        cache_key: CacheKey,
        rule: ExtractionRule,
    },
}

#[derive(Clone)]
pub struct DeliveryService {
    cache: CacheStore,
    ledger: SessionLedger,
    rules: RuleStore,
    controller: Arc<ABController>,
    splitter: Arc<dyn SectionSplitter>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl DeliveryService {
    pub fn new(
        cache: CacheStore,
        ledger: SessionLedger,
        rules: RuleStore,
        controller: Arc<ABController>,
    ) -> Self {
        Self {
            cache,
            ledger,
            rules,
            controller,
            splitter: Arc::new(MarkdownSplitter),
            classifier: None,
        }
    }

    pub fn with_splitter(mut self, splitter: Arc<dyn SectionSplitter>) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Split raw documentation and cache it under `framework[:component]`
    pub async fn store_document(
        &self,
        framework: &str,
        component: Option<&str>,
        content: &str,
    ) -> Result<CacheEntry> {
        let key = CacheKey::new(framework, component)?;
        let sections = self.splitter.split(content);
        info!(cache_key = %key, sections = sections.len(), "Caching documentation");
        self.cache.put(&key, content, &sections).await
    }

    /// The rule to serve for a pair, and the experiment arm if one applies
    ///
    /// Never fails: an unreadable rule file or experiment store falls back
    /// to the built-in rule.
    pub async fn resolve_rule_at(
        &self,
        framework: &str,
        operation: &str,
        now: DateTime<Utc>,
    ) -> (ExtractionRule, Option<ServedArm>) {
        match self.controller.serve_at(framework, operation, now).await {
            Ok(Some((test, arm))) => {
                let rule = test.rule_for(arm).clone();
                return (rule, Some(ServedArm { test_id: test.test_id, arm }));
            }
            Ok(None) => {}
            Err(e) => warn!("Experiment lookup failed for {}:{}: {}", framework, operation, e),
        }

        let rules = self.rules.load().await.unwrap_or_else(|e| {
            warn!("Serving built-in rules, rule file unreadable: {}", e);
            RuleSet::default()
        });
        (rules.lookup(framework, operation), None)
    }

    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<Delivery> {
        self.deliver_at(request, Utc::now()).await
    }

    pub async fn deliver_at(&self, request: &DeliveryRequest, now: DateTime<Utc>) -> Result<Delivery> {
        let framework = request.framework.trim().to_lowercase();
        let operation = request.operation.trim().to_lowercase();
        let cache_key = CacheKey::new(&framework, request.component.as_deref())?;

        let (rule, experiment) = self.resolve_rule_at(&framework, &operation, now).await;

        let Some(entry) = self.cache.get_at(&cache_key, now).await? else {
            debug!(cache_key = %cache_key, "Cache miss");
            return Ok(Delivery::Miss { cache_key, rule });
        };

        let mut selection = select_sections(&entry.sections, &rule, rule.max_tokens);
        let full_content_fallback = selection.is_empty();
        if full_content_fallback {
            let limit = usize::try_from(rule.max_tokens).unwrap_or(0) * CHARS_PER_TOKEN;
            let content: String = entry.full_content.chars().take(limit).collect();
            selection = Selection {
                tokens: token_count(&content),
                content,
                sections: if entry.sections.is_empty() {
                    vec!["full_content".to_string()]
                } else {
                    entry.sections.names()
                },
            };
            debug!(cache_key = %cache_key, "No rule section matched, serving full content");
        }

        let session_id: String = Uuid::new_v4().simple().to_string()[..SESSION_ID_LEN].to_string();
        let log_id = self
            .ledger
            .append_at(
                &NewSession {
                    session_id: session_id.clone(),
                    cache_key: cache_key.to_string(),
                    operation_type: operation,
                    sections_provided: selection.sections.clone(),
                    tokens_used: selection.tokens,
                    tool_name: request.tool_name.clone(),
                    tool_input: request.tool_input.clone(),
                    file_path: request.file_path.clone(),
                    experiment: experiment.as_ref().map(|e| (e.test_id.clone(), e.arm)),
                },
                now,
            )
            .await?;

        info!(
            cache_key = %cache_key,
            log_id,
            sections = selection.sections.len(),
            tokens = selection.tokens,
            "Delivered documentation"
        );
        Ok(Delivery::Hit {
            cache_key,
            session_id,
            log_id,
            content: selection.content,
            sections_used: selection.sections,
            tokens_used: selection.tokens,
            full_content_fallback,
            rule,
            experiment,
        })
    }

    /// Classify raw source text and deliver for it
    ///
    /// Returns `None` when the classifier recognises no framework.
    pub async fn deliver_source(
        &self,
        source: &str,
        file_path: Option<&str>,
        tool_name: &str,
    ) -> Result<Option<Delivery>> {
        let classifier = self
            .classifier
            .as_ref()
            .ok_or_else(|| DoclensError::Config("no classifier configured".to_string()))?;
        let Some(class) = classifier.classify(source, file_path) else {
            debug!("No framework recognised in source");
            return Ok(None);
        };

        let request = DeliveryRequest {
            framework: class.framework,
            operation: class.operation,
            component: class.component,
            tool_name: tool_name.to_string(),
            tool_input: source.to_string(),
            file_path: file_path.map(str::to_string),
        };
        self.deliver(&request).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::sqlite::test_support::create_test_db;
    use crate::storage::ExperimentStore;
    use chrono::Duration;
    use tempfile::TempDir;

    fn sections(pairs: &[(&str, &str)]) -> Sections {
        pairs.iter().map(|(n, t)| (*n, *t)).collect()
    }

    #[test]
    fn test_select_follows_rule_order_within_budget() {
        let sections = sections(&[
            ("overview", "one two three"),
            ("getting_started", "a b c d e"),
            ("api", "x y"),
        ]);
        let rule = ExtractionRule::new(&["api", "getting_started", "missing", "overview"], 7);

        let selection = select_sections(&sections, &rule, 100);
        assert_eq!(selection.sections, vec!["api", "getting_started"]);
        assert_eq!(selection.tokens, 7);
        assert_eq!(selection.content, "## Api\nx y\n\n## Getting Started\na b c d e");

        let tighter = select_sections(&sections, &rule, 3);
        assert_eq!(tighter.sections, vec!["api"]);
    }

    #[test]
    fn test_select_skips_oversized_section_but_continues() {
        let sections = sections(&[("example", "w w w w w w"), ("usage", "u u")]);
        let rule = ExtractionRule::new(&["example", "usage"], 4);
        let selection = select_sections(&sections, &rule, 4);
        assert_eq!(selection.sections, vec!["usage"]);
    }

    struct Fixture {
        service: DeliveryService,
        controller: Arc<ABController>,
        ledger: SessionLedger,
        rules: RuleStore,
        cache: CacheStore,
        _db: TempDir,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let config = Config::default();
        let (db, db_dir) = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let rules = RuleStore::new(dir.path().join("rules.json"));
        let cache = CacheStore::new(db.clone(), config.cache.ttl);
        let ledger = SessionLedger::new(db.clone(), config.ledger.grace_period, 3);
        let controller = Arc::new(ABController::with_seed(
            ExperimentStore::new(db),
            config.experiments,
            config.thresholds,
            7,
        ));
        let service = DeliveryService::new(cache.clone(), ledger.clone(), rules.clone(), controller.clone());
        Fixture {
            service,
            controller,
            ledger,
            rules,
            cache,
            _db: db_dir,
            _dir: dir,
        }
    }

    fn request(component: Option<&str>) -> DeliveryRequest {
        DeliveryRequest {
            framework: "React".to_string(),
            operation: "create".to_string(),
            component: component.map(str::to_string),
            tool_name: "Write".to_string(),
            tool_input: "{}".to_string(),
            file_path: Some("src/Button.tsx".to_string()),
        }
    }

    const DOC: &str = "Intro text.\n# Components\nWrite components.\n# Hooks\nUse hooks.\n# Example\nconst x = 1;";

    #[tokio::test]
    async fn test_miss_returns_rule_to_fetch() {
        let f = fixture().await;
        f.rules.save(&RuleSet::starter()).await.unwrap();

        match f.service.deliver(&request(Some("button"))).await.unwrap() {
            Delivery::Miss { cache_key, rule } => {
                assert_eq!(cache_key.as_str(), "react:button");
                assert_eq!(rule.sections, vec!["components", "hooks", "example"]);
            }
            other => panic!("expected miss, got {:?}", other),
        }
        assert_eq!(f.ledger.status().await.unwrap().total_sessions, 0);
    }

    #[tokio::test]
    async fn test_hit_selects_sections_and_logs_delivery() {
        let f = fixture().await;
        f.rules.save(&RuleSet::starter()).await.unwrap();
        f.service.store_document("react", Some("button"), DOC).await.unwrap();

        let Delivery::Hit { session_id, log_id, sections_used, content, full_content_fallback, experiment, .. } =
            f.service.deliver(&request(Some("button"))).await.unwrap()
        else {
            panic!("expected hit");
        };
        assert_eq!(session_id.len(), 8);
        assert_eq!(sections_used, vec!["components", "hooks", "example"]);
        assert!(content.starts_with("## Components\nWrite components."));
        assert!(!full_content_fallback);
        assert!(experiment.is_none());

        let record = f.ledger.get(log_id).await.unwrap().unwrap();
        assert_eq!(record.session_id, session_id);
        assert_eq!(record.cache_key, "react:button");
        assert_eq!(record.tokens_used, 8);
        assert_eq!(record.file_path.as_deref(), Some("src/Button.tsx"));

        let entry = f.cache.get(&CacheKey::parse("react:button").unwrap()).await.unwrap().unwrap();
        assert_eq!(entry.access_count, 2);
    }

    #[tokio::test]
    async fn test_unmatched_rule_falls_back_to_full_content() {
        let f = fixture().await;
        let mut rules = RuleSet::starter();
        rules.set("react", "create", ExtractionRule::new(&["testing"], 2));
        f.rules.save(&rules).await.unwrap();
        f.service.store_document("react", None, DOC).await.unwrap();

        let Delivery::Hit { content, sections_used, full_content_fallback, .. } =
            f.service.deliver(&request(None)).await.unwrap()
        else {
            panic!("expected hit");
        };
        assert!(full_content_fallback);
        assert_eq!(content, "Intro text");
        assert_eq!(sections_used, vec!["overview", "components", "hooks", "example"]);
    }

    #[tokio::test]
    async fn test_experiment_arm_is_served_and_recorded() {
        let f = fixture().await;
        f.service.store_document("react", None, DOC).await.unwrap();
        let now = Utc::now();
        let test = f
            .controller
            .start_experiment_at(
                "react",
                "create",
                ExtractionRule::new(&["components"], 2000),
                ExtractionRule::new(&["hooks"], 2000),
                now - Duration::hours(1),
            )
            .await
            .unwrap();

        let Delivery::Hit { log_id, sections_used, experiment, .. } =
            f.service.deliver_at(&request(None), now).await.unwrap()
        else {
            panic!("expected hit");
        };
        let served = experiment.unwrap();
        assert_eq!(served.test_id, test.test_id);
        let expected = match served.arm {
            Arm::Control => "components",
            Arm::Test => "hooks",
        };
        assert_eq!(sections_used, vec![expected]);

        let record = f.ledger.get(log_id).await.unwrap().unwrap();
        assert_eq!(record.experiment_id.as_deref(), Some(test.test_id.as_str()));
        assert_eq!(record.experiment_arm, Some(served.arm));
    }

    #[tokio::test]
    async fn test_corrupt_rule_file_serves_fallback() {
        let f = fixture().await;
        std::fs::write(f.rules.path(), "{not json").unwrap();
        let (rule, arm) = f.service.resolve_rule_at("react", "create", Utc::now()).await;
        assert_eq!(rule, ExtractionRule::fallback());
        assert!(arm.is_none());
    }

    struct FixedClassifier;

    impl Classifier for FixedClassifier {
        fn classify(&self, source: &str, _file_path: Option<&str>) -> Option<Classification> {
            source.contains("useState").then(|| Classification {
                framework: "react".to_string(),
                operation: "create".to_string(),
                component: Some("counter".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_deliver_source_uses_classifier() {
        let f = fixture().await;
        let service = f.service.clone().with_classifier(Arc::new(FixedClassifier));

        let miss = service
            .deliver_source("const [n, setN] = useState(0)", Some("Counter.tsx"), "Write")
            .await
            .unwrap();
        assert!(matches!(miss, Some(Delivery::Miss { ref cache_key, .. }) if cache_key.as_str() == "react:counter"));

        assert!(service.deliver_source("print('hi')", None, "Write").await.unwrap().is_none());
        assert!(f.service.deliver_source("useState", None, "Write").await.is_err());
    }
}

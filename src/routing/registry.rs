//! Static deployment registry.
//!
//! Rules map a (type, complexity?, language?, tier?) key to one or more
//! deployments. `None` in a key position is a wildcard. Lookup walks from
//! the most specific key to the least specific one and finally to the
//! default `chat` rule, so every classification resolves to a deployment.
//!
//! When a rule lists several deployments they are served round-robin; this
//! is the only non-determinism in routing.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::types::{ClientTier, Complexity, Language, ResolvedClassification, TaskType};
use crate::RouterError;

/// Model identifier served by the reasoning deployment.
pub const MODEL_DEEPSEEK: &str = "DeepSeek-R1";
/// Model identifier served by the general-purpose deployment.
pub const MODEL_LLAMA: &str = "Llama-3.3-70B";
/// Model identifier served by the French-language deployment.
pub const MODEL_MISTRAL: &str = "Mistral-Large-2411";
/// Model identifier served by the classifier deployment.
pub const MODEL_CLASSIFIER: &str = "Phi-4-mini";

/// A concrete, addressable backend deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Deployment {
    /// Model identifier, e.g. `"DeepSeek-R1"`.
    pub model: String,
    /// Deployment name sent to the backend.
    pub deployment: String,
}

impl Deployment {
    /// Convenience constructor.
    pub fn new(model: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            deployment: deployment.into(),
        }
    }
}

/// One routing rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentRule {
    /// Task type this rule applies to.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Complexity filter; absent matches any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    /// Language filter; absent matches any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    /// Tier filter; absent matches any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tier: Option<ClientTier>,
    /// Deployments served round-robin for this key.
    pub deployments: Vec<Deployment>,
}

impl DeploymentRule {
    fn key(&self) -> RegistryKey {
        RegistryKey {
            task_type: self.task_type,
            complexity: self.complexity,
            language: self.language,
            client_tier: self.client_tier,
        }
    }
}

/// Names of the deployments used by [`default_rules`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentNames {
    /// Reasoning deployment (math, hard coding).
    pub deepseek: String,
    /// General-purpose deployment.
    pub llama: String,
    /// French-language deployment.
    pub mistral: String,
}

impl Default for DeploymentNames {
    fn default() -> Self {
        Self {
            deepseek: "deepseek-r1-us".to_string(),
            llama: "llama33-70b-us".to_string(),
            mistral: "mistral-large-2411-us".to_string(),
        }
    }
}

/// The stock rule set.
///
/// - math, and coding with high complexity → DeepSeek-R1
/// - standard-tier French coding or chat → Mistral-Large-2411
/// - everything else (creative, chat, VIP) → Llama-3.3-70B
pub fn default_rules(names: &DeploymentNames) -> Vec<DeploymentRule> {
    let deepseek = Deployment::new(MODEL_DEEPSEEK, &names.deepseek);
    let llama = Deployment::new(MODEL_LLAMA, &names.llama);
    let mistral = Deployment::new(MODEL_MISTRAL, &names.mistral);

    let rule = |task_type, complexity, language, client_tier, d: &Deployment| DeploymentRule {
        task_type,
        complexity,
        language,
        client_tier,
        deployments: vec![d.clone()],
    };

    vec![
        rule(TaskType::Math, Some(Complexity::High), None, None, &deepseek),
        rule(TaskType::Coding, Some(Complexity::High), None, None, &deepseek),
        rule(TaskType::Math, None, None, None, &deepseek),
        rule(TaskType::Coding, None, Some(Language::Fr), Some(ClientTier::Standard), &mistral),
        rule(TaskType::Chat, None, Some(Language::Fr), Some(ClientTier::Standard), &mistral),
        rule(TaskType::Coding, None, None, None, &llama),
        rule(TaskType::Creative, None, None, None, &llama),
        rule(TaskType::Chat, None, None, None, &llama),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RegistryKey {
    task_type: TaskType,
    complexity: Option<Complexity>,
    language: Option<Language>,
    client_tier: Option<ClientTier>,
}

#[derive(Debug)]
struct Slot {
    deployments: Vec<Deployment>,
    cursor: AtomicUsize,
}

impl Slot {
    fn next(&self) -> Option<&Deployment> {
        if self.deployments.len() <= 1 {
            return self.deployments.first();
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.deployments.len();
        self.deployments.get(i)
    }
}

/// Immutable rule table with lock-free round-robin cursors.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug)]
pub struct DeploymentRegistry {
    region: String,
    slots: HashMap<RegistryKey, Slot>,
    by_model: HashMap<String, String>,
}

impl DeploymentRegistry {
    /// Build a registry from rules.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Config`] if two rules share a key, a rule has
    /// no deployments, or no unconditional `chat` rule exists.
    pub fn new(region: impl Into<String>, rules: &[DeploymentRule]) -> Result<Self, RouterError> {
        let mut slots = HashMap::with_capacity(rules.len());
        let mut by_model = HashMap::new();

        for rule in rules {
            if rule.deployments.is_empty() {
                return Err(RouterError::Config(format!(
                    "rule for type '{}' has no deployments",
                    rule.task_type
                )));
            }
            for d in &rule.deployments {
                by_model
                    .entry(d.model.clone())
                    .or_insert_with(|| d.deployment.clone());
            }
            let slot = Slot {
                deployments: rule.deployments.clone(),
                cursor: AtomicUsize::new(0),
            };
            if slots.insert(rule.key(), slot).is_some() {
                return Err(RouterError::Config(format!(
                    "duplicate rule for type '{}'",
                    rule.task_type
                )));
            }
        }

        if !slots.contains_key(&Self::default_key()) {
            return Err(RouterError::Config(
                "registry needs an unconditional 'chat' rule as the default".to_string(),
            ));
        }

        Ok(Self {
            region: region.into(),
            slots,
            by_model,
        })
    }

    /// Registry with [`default_rules`] and default deployment names.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature mirrors [`DeploymentRegistry::new`].
    pub fn with_defaults(region: impl Into<String>) -> Result<Self, RouterError> {
        Self::new(region, &default_rules(&DeploymentNames::default()))
    }

    /// Hosting region reported in decisions.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Resolve the deployment for a classification.
    ///
    /// Lookup order, most specific first; `*` is a wildcard:
    ///
    /// 1. `(type, complexity, language, tier)`
    /// 2. `(type, complexity, *, tier)`
    /// 3. `(type, complexity, language, *)`
    /// 4. `(type, complexity, *, *)`
    /// 5. `(type, *, language, tier)`
    /// 6. `(type, *, *, tier)`
    /// 7. `(type, *, language, *)`
    /// 8. `(type, *, *, *)`
    /// 9. `(chat, *, *, *)`
    pub fn lookup(&self, resolved: &ResolvedClassification) -> Option<Deployment> {
        let t = resolved.task_type;
        let c = Some(resolved.complexity);
        let l = Some(resolved.language);
        let tier = Some(resolved.client_tier);

        let candidates = [
            (c, l, tier),
            (c, None, tier),
            (c, l, None),
            (c, None, None),
            (None, l, tier),
            (None, None, tier),
            (None, l, None),
            (None, None, None),
        ];

        candidates
            .into_iter()
            .map(|(complexity, language, client_tier)| RegistryKey {
                task_type: t,
                complexity,
                language,
                client_tier,
            })
            .chain(std::iter::once(Self::default_key()))
            .find_map(|key| self.slots.get(&key))
            .and_then(Slot::next)
            .cloned()
    }

    /// First deployment registered for `model`, if any.
    pub fn deployment_for_model(&self, model: &str) -> Option<&str> {
        self.by_model.get(model).map(String::as_str)
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `true` when no rules are registered (never the case after `new`).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn default_key() -> RegistryKey {
        RegistryKey {
            task_type: TaskType::Chat,
            complexity: None,
            language: None,
            client_tier: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(t: TaskType, c: Complexity, l: Language, tier: ClientTier) -> ResolvedClassification {
        ResolvedClassification {
            task_type: t,
            complexity: c,
            language: l,
            client_tier: tier,
            type_hint_applied: false,
            language_hint_applied: false,
        }
    }

    fn registry() -> DeploymentRegistry {
        DeploymentRegistry::with_defaults("eastus2").unwrap()
    }

    fn model_for(t: TaskType, c: Complexity, l: Language, tier: ClientTier) -> String {
        registry().lookup(&resolved(t, c, l, tier)).unwrap().model
    }

    #[test]
    fn test_high_complexity_math_goes_to_deepseek() {
        assert_eq!(
            model_for(TaskType::Math, Complexity::High, Language::En, ClientTier::Vip),
            MODEL_DEEPSEEK
        );
    }

    #[test]
    fn test_low_complexity_math_goes_to_deepseek() {
        assert_eq!(
            model_for(TaskType::Math, Complexity::Low, Language::En, ClientTier::Standard),
            MODEL_DEEPSEEK
        );
    }

    #[test]
    fn test_high_complexity_french_coding_prefers_deepseek() {
        assert_eq!(
            model_for(TaskType::Coding, Complexity::High, Language::Fr, ClientTier::Standard),
            MODEL_DEEPSEEK
        );
    }

    #[test]
    fn test_french_standard_chat_goes_to_mistral() {
        assert_eq!(
            model_for(TaskType::Chat, Complexity::Low, Language::Fr, ClientTier::Standard),
            MODEL_MISTRAL
        );
    }

    #[test]
    fn test_french_vip_chat_goes_to_llama() {
        assert_eq!(
            model_for(TaskType::Chat, Complexity::Low, Language::Fr, ClientTier::Vip),
            MODEL_LLAMA
        );
    }

    #[test]
    fn test_creative_goes_to_llama() {
        assert_eq!(
            model_for(TaskType::Creative, Complexity::High, Language::Fr, ClientTier::Standard),
            MODEL_LLAMA
        );
    }

    #[test]
    fn test_missing_type_falls_back_to_chat_rule() {
        let rules = vec![DeploymentRule {
            task_type: TaskType::Chat,
            complexity: None,
            language: None,
            client_tier: None,
            deployments: vec![Deployment::new("m", "d-chat")],
        }];
        let reg = DeploymentRegistry::new("r", &rules).unwrap();
        let d = reg
            .lookup(&resolved(TaskType::Math, Complexity::High, Language::En, ClientTier::Vip))
            .unwrap();
        assert_eq!(d.deployment, "d-chat");
    }

    #[test]
    fn test_round_robin_within_key() {
        let rules = vec![DeploymentRule {
            task_type: TaskType::Chat,
            complexity: None,
            language: None,
            client_tier: None,
            deployments: vec![Deployment::new("m", "a"), Deployment::new("m", "b")],
        }];
        let reg = DeploymentRegistry::new("r", &rules).unwrap();
        let key = resolved(TaskType::Chat, Complexity::Low, Language::En, ClientTier::Standard);
        let picks: Vec<String> = (0..4).map(|_| reg.lookup(&key).unwrap().deployment).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_registry_without_chat_default_is_rejected() {
        let rules = vec![DeploymentRule {
            task_type: TaskType::Math,
            complexity: None,
            language: None,
            client_tier: None,
            deployments: vec![Deployment::new("m", "d")],
        }];
        assert!(matches!(
            DeploymentRegistry::new("r", &rules),
            Err(RouterError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_rule_is_rejected() {
        let mut rules = default_rules(&DeploymentNames::default());
        rules.push(rules[0].clone());
        assert!(DeploymentRegistry::new("r", &rules).is_err());
    }

    #[test]
    fn test_empty_rule_is_rejected() {
        let mut rules = default_rules(&DeploymentNames::default());
        rules[0].deployments.clear();
        assert!(DeploymentRegistry::new("r", &rules).is_err());
    }

    #[test]
    fn test_deployment_for_model() {
        let reg = registry();
        assert_eq!(reg.deployment_for_model(MODEL_LLAMA), Some("llama33-70b-us"));
        assert_eq!(reg.deployment_for_model("unknown"), None);
    }

    #[test]
    fn test_rule_deserializes_with_wildcards() {
        let rule: DeploymentRule = serde_json::from_str(
            r#"{"type":"coding","language":"fr","deployments":[{"model":"m","deployment":"d"}]}"#,
        )
        .unwrap();
        assert_eq!(rule.complexity, None);
        assert_eq!(rule.language, Some(Language::Fr));
    }
}

//! Prompt classification.
//!
//! A [`Classifier`] maps prompt text to a [`Classification`] (task type,
//! complexity, language). Classification is a routing *hint*: every
//! implementation is infallible by contract and degrades to
//! [`Classification::conservative`] instead of propagating errors.
//!
//! Two implementations are provided:
//!
//! - [`HeuristicClassifier`] — deterministic keyword/shape signals, no I/O.
//! - [`ModelClassifier`] — asks a small classifier deployment for a JSON
//!   verdict and parses it leniently.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{Classification, Complexity, Language, TaskType};
use crate::backend::{CompletionRequest, ModelBackend};

/// Classifies prompts for routing.
///
/// Implementations must be deterministic for a given input and model state
/// and must never fail; on internal error they return
/// [`Classification::conservative`].
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify `text`.
    async fn classify(&self, text: &str) -> Classification;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

// ── Heuristic classifier ───────────────────────────────────────────────

const MATH_TERMS: &[&str] = &[
    "equation", "solve", "integral", "derivative", "calculate", "compute", "probability",
    "theorem", "prove", "proof", "matrix", "algebra", "geometry", "arithmetic", "polynomial",
    "logarithm", "square root", "sum of", "équation", "calculer", "calcule", "résoudre",
    "dérivée", "intégrale", "probabilité", "théorème",
];

const CODING_TERMS: &[&str] = &[
    "code", "function", "bug", "debug", "compile", "compiler", "python", "rust", "javascript",
    "typescript", "java", "sql", "algorithm", "api", "regex", "refactor", "stack trace",
    "exception", "variable", "class", "method", "script", "program", "programming", "fonction",
    "programme",
];

const CREATIVE_TERMS: &[&str] = &[
    "story", "poem", "haiku", "lyrics", "song", "novel", "fiction", "imagine", "brainstorm",
    "slogan", "tagline", "caption", "creative", "write a", "poème", "histoire", "chanson",
    "raconte",
];

const REASONING_TERMS: &[&str] = &[
    "step by step", "prove", "proof", "derive", "optimize", "optimise", "analyze", "analyse",
    "compare", "trade-off", "explain why", "design", "architecture", "démontrer", "justifier",
    "optimiser",
];

const FRENCH_WORDS: &[&str] = &[
    "bonjour", "salut", "merci", "comment", "ça", "va", "je", "tu", "vous", "nous", "est",
    "les", "des", "une", "le", "la", "de", "du", "pourquoi", "quoi", "quelle", "quel", "avec",
    "pour", "dans", "sur", "pas", "très", "bien", "être", "écris", "écrire", "peux", "veux",
    "mon", "ma", "mes", "votre", "cette", "qui", "que",
];

const ENGLISH_WORDS: &[&str] = &[
    "the", "is", "are", "what", "how", "why", "you", "please", "hello", "and", "of", "to",
    "can", "write", "with", "this", "that", "for", "my", "i", "it", "in", "do", "does",
];

/// Deterministic, dependency-free classifier.
///
/// Scores keyword and shape signals for each task type, detects French by
/// vocabulary and diacritics, and rates complexity with additive signals
/// (length, code blocks, numbered steps, reasoning vocabulary).
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    /// Word count above which the long-prompt complexity signal fires.
    long_prompt_words: usize,
    /// Score at or above which complexity is [`Complexity::High`].
    high_complexity_threshold: f64,
}

impl HeuristicClassifier {
    /// Create a classifier with default thresholds (150 words, 0.4).
    pub fn new() -> Self {
        Self {
            long_prompt_words: 150,
            high_complexity_threshold: 0.4,
        }
    }

    /// Synchronous classification used by the async trait impl.
    pub fn classify_text(&self, text: &str) -> Classification {
        let lower = text.to_lowercase();
        let words: HashSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        Classification {
            task_type: Self::detect_type(text, &lower, &words),
            complexity: self.detect_complexity(text, &lower, &words),
            language: Self::detect_language(text, &words),
        }
    }

    /// Raw complexity score in `[0.0, 1.0]`.
    pub fn complexity_score(&self, text: &str) -> f64 {
        let lower = text.to_lowercase();
        let words: HashSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        self.score_complexity(text, &lower, &words)
    }

    fn detect_type(text: &str, lower: &str, words: &HashSet<&str>) -> TaskType {
        let mut coding = term_hits(CODING_TERMS, lower, words);
        if text.contains("```") {
            coding += 2;
        }
        if ["fn ", "def ", "=>", "();", "#include", "console.log"]
            .iter()
            .any(|p| text.contains(p))
        {
            coding += 1;
        }

        let mut math = term_hits(MATH_TERMS, lower, words);
        if has_arithmetic_expression(text) {
            math += 2;
        }
        if text.chars().any(|c| matches!(c, '∫' | '√' | '∑' | 'π' | '≤' | '≥')) {
            math += 2;
        }

        let creative = term_hits(CREATIVE_TERMS, lower, words);

        // Ties resolve coding > math > creative.
        let best = [
            (TaskType::Coding, coding),
            (TaskType::Math, math),
            (TaskType::Creative, creative),
        ]
        .into_iter()
        .fold((TaskType::Chat, 0usize), |acc, (kind, score)| {
            if score > acc.1 {
                (kind, score)
            } else {
                acc
            }
        });

        best.0
    }

    fn detect_language(text: &str, words: &HashSet<&str>) -> Language {
        let french_hits = FRENCH_WORDS.iter().filter(|w| words.contains(*w)).count();
        let english_hits = ENGLISH_WORDS.iter().filter(|w| words.contains(*w)).count();
        let diacritics = text
            .chars()
            .any(|c| matches!(c, 'é' | 'è' | 'ê' | 'à' | 'â' | 'ç' | 'ù' | 'û' | 'ô' | 'î' | 'ë' | 'ï'));

        let french_score = french_hits + usize::from(diacritics);
        if french_score >= 2 && french_score > english_hits {
            return Language::Fr;
        }

        let letters = text.chars().filter(|c| c.is_alphabetic()).count();
        // Beyond Latin Extended-B: Cyrillic, CJK, Arabic, …
        let non_latin = text
            .chars()
            .filter(|c| c.is_alphabetic() && (*c as u32) > 0x024F)
            .count();
        if letters > 0 && non_latin * 2 > letters {
            return Language::Other;
        }

        Language::En
    }

    fn detect_complexity(&self, text: &str, lower: &str, words: &HashSet<&str>) -> Complexity {
        if self.score_complexity(text, lower, words) >= self.high_complexity_threshold {
            Complexity::High
        } else {
            Complexity::Low
        }
    }

    fn score_complexity(&self, text: &str, lower: &str, words: &HashSet<&str>) -> f64 {
        let mut total = 0.0_f64;

        if text.split_whitespace().count() > self.long_prompt_words {
            total += 0.3;
        }
        if text.contains("```") {
            total += 0.2;
        }
        if numbered_items(text) >= 2 {
            total += 0.2;
        }
        total += match term_hits(REASONING_TERMS, lower, words) {
            0 => 0.0,
            1 => 0.2,
            _ => 0.4,
        };
        if text.matches('?').count() >= 3 {
            total += 0.1;
        }

        total.clamp(0.0, 1.0)
    }
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Classifier for HeuristicClassifier {
    async fn classify(&self, text: &str) -> Classification {
        self.classify_text(text)
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

/// Count distinct terms present; phrases match as substrings, single words
/// only as whole words.
fn term_hits(terms: &[&str], lower: &str, words: &HashSet<&str>) -> usize {
    terms
        .iter()
        .filter(|term| {
            if term.contains(' ') {
                lower.contains(*term)
            } else {
                words.contains(*term)
            }
        })
        .count()
}

/// Detects `<digit> <op> <digit|x|(>` ignoring whitespace.
fn has_arithmetic_expression(text: &str) -> bool {
    let compact: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    compact.windows(3).any(|w| {
        w[0].is_ascii_digit()
            && matches!(w[1], '+' | '-' | '*' | '/' | '^' | '=' | '×' | '÷')
            && (w[2].is_ascii_digit() || w[2] == 'x' || w[2] == '(')
    })
}

/// Number of lines starting with `N.` (one or more digits then a dot).
fn numbered_items(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
            digits > 0 && trimmed[digits..].starts_with('.')
        })
        .count()
}

// ── Model-backed classifier ────────────────────────────────────────────

/// System prompt instructing the classifier model to answer in JSON only.
pub const CLASSIFIER_SYSTEM_PROMPT: &str = "You are a prompt classifier. Analyze the user's prompt and return ONLY a JSON object with these fields:
- type: one of \"math\", \"coding\", \"creative\", \"chat\"
- complexity: one of \"high\", \"low\"
- language: one of \"fr\", \"en\", \"other\"

Rules:
- \"math\": mathematical problems, equations, calculations
- \"coding\": programming, code, algorithms, debugging
- \"creative\": writing, stories, poetry, brainstorming
- \"chat\": general conversation, questions, explanations

Complexity is \"high\" if the task requires deep reasoning or multiple steps.

Return ONLY the JSON object, no other text.";

/// Classifier that delegates to a small model deployment.
///
/// The model's answer is parsed with [`extract_json_object`]; unparseable
/// answers, backend errors and timeouts all yield the conservative default.
pub struct ModelClassifier {
    backend: Arc<dyn ModelBackend>,
    deployment: String,
    timeout: Duration,
}

impl std::fmt::Debug for ModelClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClassifier")
            .field("deployment", &self.deployment)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ModelClassifier {
    /// Create a classifier calling `deployment` through `backend`.
    pub fn new(backend: Arc<dyn ModelBackend>, deployment: impl Into<String>) -> Self {
        Self {
            backend,
            deployment: deployment.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Bound the classification call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Classifier for ModelClassifier {
    async fn classify(&self, text: &str) -> Classification {
        let request = CompletionRequest {
            deployment: self.deployment.clone(),
            system_prompt: CLASSIFIER_SYSTEM_PROMPT.to_string(),
            prompt: text.to_string(),
            max_tokens: 64,
            temperature: 0.0,
        };

        match tokio::time::timeout(self.timeout, self.backend.complete(&request)).await {
            Ok(Ok(completion)) => match extract_json_object(&completion.text) {
                Some(value) => classification_from_json(&value),
                None => {
                    debug!(answer = %completion.text, "classifier answer was not JSON");
                    Classification::conservative()
                }
            },
            Ok(Err(e)) => {
                warn!(error = %e, deployment = %self.deployment, "classifier call failed");
                Classification::conservative()
            }
            Err(_) => {
                warn!(deployment = %self.deployment, "classifier call timed out");
                Classification::conservative()
            }
        }
    }

    fn name(&self) -> &'static str {
        "model"
    }
}

/// Pull a JSON object out of free text.
///
/// Tries, in order: the whole trimmed text, the first flat `{...}` span,
/// and the span between the first `{` and the last `}`.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let parse = |s: &str| serde_json::from_str::<Value>(s).ok().filter(Value::is_object);

    if let Some(v) = parse(text.trim()) {
        return Some(v);
    }

    if let Some(start) = text.find('{') {
        if let Some(len) = text[start + 1..].find(['{', '}']) {
            let end = start + 1 + len;
            if text[end..].starts_with('}') {
                if let Some(v) = parse(&text[start..=end]) {
                    return Some(v);
                }
            }
        }
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => parse(&text[start..=end]),
        _ => None,
    }
}

/// Build a classification from a JSON verdict, coercing missing or
/// invalid fields to the conservative defaults.
pub fn classification_from_json(value: &Value) -> Classification {
    let defaults = Classification::conservative();
    let field = |name: &str| value.get(name).and_then(Value::as_str);

    Classification {
        task_type: field("type")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.task_type),
        complexity: field("complexity")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.complexity),
        language: field("language")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.language),
    }
}

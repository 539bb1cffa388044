//! Query expansion: paraphrases of the user's question for multi-query recall.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kbquery_core::config::{ExpansionConfig, MAX_QUERY_VARIANTS, RetryConfig};
use kbquery_core::error::{ExternalError, ServiceKind};
use kbquery_core::providers::{GenerationConstraints, TextGenerator};
use kbquery_core::retry::call_with_policy;
use kbquery_core::types::QueryVariant;

/// Result of expanding one question.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    /// The original first, then paraphrases in the order the generator returned them.
    pub variants: Vec<QueryVariant>,
    /// True when a paraphrase call was made but yielded nothing usable.
    pub fallback: bool,
    pub error: Option<ExternalError>,
}

impl Expansion {
    fn singleton(query_text: &str) -> Self {
        Self {
            variants: vec![QueryVariant::original(query_text)],
            fallback: false,
            error: None,
        }
    }
}

/// Generates semantic paraphrases through an external text generator.
pub struct QueryExpander {
    generator: Option<Arc<dyn TextGenerator>>,
    config: ExpansionConfig,
    timeout: Duration,
    retry: RetryConfig,
}

impl QueryExpander {
    pub fn new(
        generator: Option<Arc<dyn TextGenerator>>,
        config: ExpansionConfig,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            generator,
            config,
            timeout,
            retry,
        }
    }

    fn variant_cap(&self) -> usize {
        self.config.max_variants.clamp(1, MAX_QUERY_VARIANTS)
    }

    /// Expand `query_text` into a bounded, normalized-unique variant set.
    ///
    /// Never fails: any generator problem degrades to the original-only set.
    pub async fn expand(&self, query_text: &str) -> Expansion {
        let Some(generator) = self.generator.as_ref() else {
            return Expansion::singleton(query_text);
        };
        if !self.config.enabled || self.variant_cap() == 1 || self.config.paraphrase_count == 0 {
            return Expansion::singleton(query_text);
        }

        let prompt = build_prompt(query_text, self.config.paraphrase_count);
        let constraints = GenerationConstraints {
            max_tokens: Some(256),
            temperature: Some(0.7),
        };
        let response = call_with_policy(ServiceKind::TextGenerator, self.timeout, &self.retry, || {
            generator.generate(&prompt, &constraints)
        })
        .await;

        match response {
            Ok(text) => {
                let paraphrases = parse_paraphrases(&text);
                let variants = merge_variants(query_text, paraphrases, self.variant_cap());
                if variants.len() == 1 {
                    tracing::warn!("Query expansion produced no usable paraphrases");
                    let mut expansion = Expansion::singleton(query_text);
                    expansion.fallback = true;
                    expansion.error = Some(ExternalError::malformed(
                        ServiceKind::TextGenerator,
                        "no usable paraphrases in response",
                    ));
                    return expansion;
                }
                tracing::debug!(variants = variants.len(), "Query expanded");
                Expansion {
                    variants,
                    fallback: false,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query expansion failed, using original query only");
                let mut expansion = Expansion::singleton(query_text);
                expansion.fallback = true;
                expansion.error = Some(e);
                expansion
            }
        }
    }
}

fn build_prompt(query_text: &str, count: usize) -> String {
    format!(
        "Generate {count} alternative phrasings of the following question. \
         Each must keep the original meaning but use different wording.\n\
         Return one phrasing per line, without numbering or commentary.\n\n\
         Question: {query_text}"
    )
}

/// Extract paraphrase lines from a free-form generator response.
///
/// Strips list markers and "Alternative N:" prefixes, and drops blank or
/// header-only lines.
pub fn parse_paraphrases(response: &str) -> Vec<String> {
    response
        .lines()
        .filter_map(|line| {
            let mut text = strip_list_marker(line.trim());
            let lowered = text.to_lowercase();
            if lowered.starts_with("alternative") {
                if let Some((_, rest)) = text.split_once(':') {
                    text = rest.trim();
                }
            }
            let text = text.trim_matches(|c| c == '"' || c == '\'').trim();
            if text.is_empty() || text.ends_with(':') {
                None
            } else {
                Some(text.to_string())
            }
        })
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(stripped) = rest
            .strip_prefix('.')
            .or_else(|| rest.strip_prefix(')'))
            .or_else(|| rest.strip_prefix(':'))
        {
            return stripped.trim_start();
        }
    }
    line
}

/// Original first, then unseen paraphrases (first returned, first kept) up to `cap`.
pub fn merge_variants(query_text: &str, paraphrases: Vec<String>, cap: usize) -> Vec<QueryVariant> {
    let original = QueryVariant::original(query_text);
    let mut seen: HashSet<String> = HashSet::from([original.normalized()]);
    let mut variants = vec![original];
    for text in paraphrases {
        if variants.len() >= cap {
            break;
        }
        let variant = QueryVariant::expanded(text);
        if seen.insert(variant.normalized()) {
            variants.push(variant);
        }
    }
    variants
}

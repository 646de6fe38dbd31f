//! Layer scorer: persona prompts against topic evidence.
//!
//! This module:
//!   1. Condenses topic evidence into a bounded digest
//!   2. Renders the layer's persona prompt and calls the text generator
//!   3. Parses SCORE / CONFIDENCE and an insight list from free text
//!
//! Insight extraction tries, in order: labeled section, bullet list,
//! numbered list. The first strategy yielding at least one item wins.
//! When none does, the record carries insufficient_structure = true and
//! an empty insight list.
//!
//! RULE: Scoring never fails. Generator errors and timeouts produce a
//! neutral record (score 0.5, confidence 0.0) with a degraded_reason.

use crate::{
    config::{LayerSlot, ScoringConfig},
    content::EvidenceItem,
    generator::{GenerationError, TextGenerator},
    provenance::{Provenance, Stage},
    types::{clamp_unit, FactorId, LayerId, TopicId},
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

pub const NEUTRAL_SCORE: f64 = 0.5;

static SCORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[\s>*_#-]*(?:overall\s+)?score[*_]*\s*[:=]\s*[*_]*\s*(-?\d+(?:\.\d+)?)\s*(%|/\s*100|/\s*10)?",
    )
    .expect("score regex")
});

static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[\s>*_#-]*confidence[*_]*\s*[:=]\s*[*_]*\s*(-?\d+(?:\.\d+)?)\s*(%|/\s*100|/\s*10)?",
    )
    .expect("confidence regex")
});

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s*_#]*(?:key\s+)?(?:insights?|findings)[*_]*\s*:[*_]*\s*(.*)$")
        .expect("section regex")
});

/// Labels that end an insight section.
static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[\s*_#]*(?:overall\s+)?(?:score|confidence|summary|rationale|recommendations?|reasoning)[*_]*\s*:",
    )
    .expect("label regex")
});

/// A bare heading line such as `Other notes:`.
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s*_#]*\w[^:]{0,40}:[\s*_]*$").expect("heading regex")
});

static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*•+]\s+(.+)$").expect("bullet regex"));

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\(?\d{1,2}[.)]\s+(.+)$").expect("numbered regex"));

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerRecord {
    pub topic_id: TopicId,
    pub layer_id: LayerId,
    pub parent_factor_id: FactorId,
    pub persona: String,
    pub weight_in_factor: f64,
    pub score: f64,
    pub confidence: f64,
    pub insights: Vec<String>,
    pub evidence_count: usize,
    /// No extraction strategy yielded an insight.
    pub insufficient_structure: bool,
    /// Why the record is neutral rather than assessed, if it is.
    pub degraded_reason: Option<String>,
    pub provenance: Provenance,
    pub scored_at: DateTime<Utc>,
}

impl LayerRecord {
    /// Neutral record: score 0.5, confidence 0, no insights.
    /// Used at bootstrap and whenever scoring degrades.
    pub fn neutral(
        topic_id: &str,
        layer_id: &str,
        parent_factor_id: &str,
        persona: &str,
        weight_in_factor: f64,
        provenance: Provenance,
    ) -> Self {
        Self {
            topic_id: topic_id.to_string(),
            layer_id: layer_id.to_string(),
            parent_factor_id: parent_factor_id.to_string(),
            persona: persona.to_string(),
            weight_in_factor,
            score: NEUTRAL_SCORE,
            confidence: 0.0,
            insights: Vec::new(),
            evidence_count: 0,
            insufficient_structure: true,
            degraded_reason: None,
            provenance,
            scored_at: Utc::now(),
        }
    }

    pub fn with_assessment(mut self, score: f64, confidence: f64, insights: Vec<String>) -> Self {
        self.score = clamp_unit(score);
        self.confidence = clamp_unit(confidence);
        self.insufficient_structure = insights.is_empty();
        self.insights = insights;
        self
    }

    pub fn degraded(mut self, reason: impl Into<String>) -> Self {
        self.score = NEUTRAL_SCORE;
        self.confidence = 0.0;
        self.insights.clear();
        self.insufficient_structure = true;
        self.degraded_reason = Some(reason.into());
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_reason.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    LabeledSection,
    BulletList,
    NumberedList,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedAssessment {
    pub score: Option<f64>,
    pub confidence: Option<f64>,
    pub insights: Vec<String>,
    pub strategy: Option<ExtractionStrategy>,
}

/// Evidence condensed for prompting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceDigest {
    pub text: String,
    pub count: usize,
    pub sources: Vec<String>,
}

// ── Evidence and prompts ─────────────────────────────────────────────────────

/// Highest-quality items first, capped in count and per-item length.
pub fn digest_evidence(
    items: &[EvidenceItem],
    max_items: usize,
    max_chars_per_item: usize,
) -> EvidenceDigest {
    let mut ranked: Vec<&EvidenceItem> = items.iter().collect();
    ranked.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
    ranked.truncate(max_items);

    let mut text = String::new();
    for (i, item) in ranked.iter().enumerate() {
        let body = truncate_chars(item.text.trim(), max_chars_per_item);
        text.push_str(&format!(
            "[{}] {} ({}; quality {:.2})\n{}\n\n",
            i + 1,
            item.title.trim(),
            item.url,
            item.quality_score,
            body
        ));
    }
    EvidenceDigest {
        text: text.trim_end().to_string(),
        count: ranked.len(),
        sources: ranked.iter().map(|i| i.url.clone()).collect(),
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub fn render_prompt(
    template: &str,
    persona: &str,
    layer_name: &str,
    layer_focus: &str,
    topic_id: &str,
    evidence: &str,
) -> String {
    template
        .replace("{persona}", persona)
        .replace("{layer_name}", layer_name)
        .replace("{layer_focus}", layer_focus)
        .replace("{topic_id}", topic_id)
        .replace("{evidence}", evidence)
}

// ── Response parsing ─────────────────────────────────────────────────────────

pub fn parse_response(text: &str, max_insights: usize) -> ParsedAssessment {
    let score = capture_unit_value(&SCORE_RE, text);
    let confidence = capture_unit_value(&CONFIDENCE_RE, text);

    let strategies: [(ExtractionStrategy, fn(&str) -> Vec<String>); 3] = [
        (ExtractionStrategy::LabeledSection, extract_labeled_section),
        (ExtractionStrategy::BulletList, |t| extract_list(t, &BULLET_RE)),
        (ExtractionStrategy::NumberedList, |t| extract_list(t, &NUMBERED_RE)),
    ];
    for (strategy, extract) in strategies {
        let insights = clean_insights(extract(text), max_insights);
        if !insights.is_empty() {
            return ParsedAssessment {
                score,
                confidence,
                insights,
                strategy: Some(strategy),
            };
        }
    }
    ParsedAssessment {
        score,
        confidence,
        insights: Vec::new(),
        strategy: None,
    }
}

fn capture_unit_value(re: &Regex, text: &str) -> Option<f64> {
    let caps = re.captures(text)?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit: Option<String> = caps
        .get(2)
        .map(|m| m.as_str().chars().filter(|c| !c.is_whitespace()).collect());
    Some(normalize_unit(number, unit.as_deref()))
}

/// Bring a parsed number onto [0, 1]. Explicit units win; bare numbers
/// above 1 are read as a 10-point or 100-point scale.
pub fn normalize_unit(number: f64, unit: Option<&str>) -> f64 {
    let value = match unit {
        Some("%") | Some("/100") => number / 100.0,
        Some("/10") => number / 10.0,
        _ if number <= 1.0 => number,
        _ if number <= 10.0 => number / 10.0,
        _ => number / 100.0,
    };
    clamp_unit(value)
}

/// Items under an `INSIGHTS:` header.
///
/// The section ends at another label or heading, at prose following a
/// blank line, or at prose once list items have started. Inside a list
/// only bullet or numbered items are kept.
fn extract_labeled_section(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut in_section = false;
    let mut in_list = false;
    let mut after_blank = false;
    for line in text.lines() {
        if !in_section {
            if let Some(caps) = SECTION_RE.captures(line) {
                in_section = true;
                if let Some(rest) = caps.get(1) {
                    items.extend(split_delimited(rest.as_str()));
                }
            }
            continue;
        }
        if line.trim().is_empty() {
            after_blank = true;
            continue;
        }
        if LABEL_RE.is_match(line) {
            break;
        }
        let list_item = BULLET_RE
            .captures(line)
            .or_else(|| NUMBERED_RE.captures(line))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str());
        match list_item {
            Some(item) => {
                in_list = true;
                after_blank = false;
                items.extend(split_delimited(item));
            }
            None if HEADING_RE.is_match(line) || in_list || after_blank => break,
            None => items.extend(split_delimited(line)),
        }
    }
    items
}

fn split_delimited(line: &str) -> Vec<String> {
    line.split(['|', ';'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn extract_list(text: &str, re: &Regex) -> Vec<String> {
    text.lines()
        .filter(|line| !LABEL_RE.is_match(line))
        .filter_map(|line| re.captures(line))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|item| !LABEL_RE.is_match(item))
        .collect()
}

fn clean_insights(raw: Vec<String>, max_insights: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|s| s.trim().trim_matches(|c| c == '*' || c == '_').trim().to_string())
        .filter(|s| s.chars().count() >= 2)
        .filter(|s| seen.insert(s.to_lowercase()))
        .take(max_insights)
        .collect()
}

// ── Scorer ───────────────────────────────────────────────────────────────────

pub struct LayerScorer {
    config: ScoringConfig,
    generator: Arc<dyn TextGenerator>,
    generator_available: bool,
}

impl LayerScorer {
    /// The generator's availability is read once, here.
    pub fn new(config: ScoringConfig, generator: Arc<dyn TextGenerator>) -> Self {
        let generator_available = generator.is_available();
        if !generator_available {
            log::warn!(
                "text generator '{}' unavailable: all layers will degrade to neutral",
                generator.name()
            );
        }
        Self {
            config,
            generator,
            generator_available,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn digest(&self, items: &[EvidenceItem]) -> EvidenceDigest {
        digest_evidence(items, self.config.max_evidence_items, self.config.max_chars_per_item)
    }

    /// Score one layer. Never fails; see the module RULE.
    pub async fn score_layer(
        &self,
        topic_id: &str,
        slot: &LayerSlot<'_>,
        evidence: &EvidenceDigest,
        run_token: Option<&str>,
    ) -> LayerRecord {
        let layer = slot.layer;
        let (template, template_slug) = match &layer.prompt_template {
            Some(t) => (t.as_str(), format!("layer:{}", layer.id)),
            None => (self.config.prompt_template.as_str(), "default".to_string()),
        };
        let provenance = Provenance::new(
            Stage::LayerScoring,
            format!("{}:{template_slug}", self.generator.name()),
        )
        .with_inputs(evidence.sources.iter().cloned())
        .with_run_token(run_token);

        let mut record = LayerRecord::neutral(
            topic_id,
            &layer.id,
            slot.factor_id,
            &layer.persona,
            layer.weight,
            provenance,
        );
        record.evidence_count = evidence.count;

        if !self.generator_available {
            return record.degraded("generator_unavailable");
        }
        if evidence.count == 0 {
            return record.degraded("no_evidence");
        }

        let prompt = render_prompt(
            template,
            &layer.persona,
            &layer.label,
            &layer.focus,
            topic_id,
            &evidence.text,
        );
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let response = match tokio::time::timeout(timeout, self.generator.generate(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                log::warn!("layer {topic_id}/{}: generation failed: {e}", layer.id);
                return record.degraded(format!("generator_error: {e}"));
            }
            Err(_) => {
                let e = GenerationError::Timeout(timeout);
                log::warn!("layer {topic_id}/{}: {e}", layer.id);
                return record.degraded("timeout");
            }
        };

        let parsed = parse_response(&response, self.config.max_insights);
        let (score, confidence) = match parsed.score {
            Some(score) => (score, parsed.confidence.unwrap_or(self.config.default_confidence)),
            None => (NEUTRAL_SCORE, 0.0),
        };
        let mut record = record.with_assessment(score, confidence, parsed.insights);
        if parsed.score.is_none() {
            record.degraded_reason = Some("score_missing".into());
        }
        log::debug!(
            "layer {topic_id}/{}: score={:.3} confidence={:.3} insights={} strategy={:?}",
            layer.id,
            record.score,
            record.confidence,
            record.insights.len(),
            parsed.strategy,
        );
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_section_wins_over_bullets() {
        let text = "SCORE: 0.72\nCONFIDENCE: 0.6\nINSIGHTS:\n- Strong pricing power\n- Loyal base\n\nOther notes:\n- unrelated bullet\nOverall I think this is a reasonable outlook.";
        let parsed = parse_response(text, 8);
        assert_eq!(parsed.strategy, Some(ExtractionStrategy::LabeledSection));
        assert_eq!(parsed.score, Some(0.72));
        assert_eq!(parsed.confidence, Some(0.6));
        assert_eq!(parsed.insights, vec!["Strong pricing power", "Loyal base"]);
    }

    #[test]
    fn labeled_section_ends_at_heading_or_trailing_prose() {
        let headed = "Insights:\n1. margin recovery\nRisks:\n2. input costs";
        assert_eq!(parse_response(headed, 8).insights, vec!["margin recovery"]);

        let trailing = "INSIGHTS:\n- churn falling\nThat is all I can say for now.";
        assert_eq!(parse_response(trailing, 8).insights, vec!["churn falling"]);

        let prose = "Key findings:\nDemand is rising; rivals are slow\n\nThanks for reading.";
        assert_eq!(
            parse_response(prose, 8).insights,
            vec!["Demand is rising", "rivals are slow"]
        );
    }

    #[test]
    fn labeled_section_stops_at_next_label() {
        let text = "Insights: demand rising | supply tight\nSummary: fine\n- not an insight";
        let parsed = parse_response(text, 8);
        assert_eq!(parsed.strategy, Some(ExtractionStrategy::LabeledSection));
        assert_eq!(parsed.insights, vec!["demand rising", "supply tight"]);
        assert_eq!(parsed.score, None);
    }

    #[test]
    fn bullet_scan_when_no_section() {
        let text = "Score: 7/10\n* first point\n* second point";
        let parsed = parse_response(text, 8);
        assert_eq!(parsed.strategy, Some(ExtractionStrategy::BulletList));
        assert_eq!(parsed.score, Some(0.7));
        assert_eq!(parsed.insights, vec!["first point", "second point"]);
    }

    #[test]
    fn numbered_scan_is_last_resort() {
        let text = "score = 65%\n1. alpha signal\n2) beta signal";
        let parsed = parse_response(text, 8);
        assert_eq!(parsed.strategy, Some(ExtractionStrategy::NumberedList));
        assert!((parsed.score.unwrap() - 0.65).abs() < 1e-12);
        assert_eq!(parsed.insights, vec!["alpha signal", "beta signal"]);
    }

    #[test]
    fn prose_has_no_structure() {
        let parsed = parse_response("I think the market is doing okay overall.", 8);
        assert_eq!(parsed.strategy, None);
        assert!(parsed.insights.is_empty());
        assert_eq!(parsed.score, None);
    }

    #[test]
    fn empty_response_has_no_structure() {
        let parsed = parse_response("", 8);
        assert_eq!(parsed, ParsedAssessment::default());
    }

    #[test]
    fn insights_deduplicated_and_capped() {
        let text = "- a1\n- A1\n- b2\n- c3\n- d4";
        let parsed = parse_response(text, 2);
        assert_eq!(parsed.insights, vec!["a1", "b2"]);
    }

    #[test]
    fn score_lines_are_not_bullets() {
        let text = "- SCORE: 0.4\n- CONFIDENCE: 0.9";
        let parsed = parse_response(text, 8);
        assert_eq!(parsed.score, Some(0.4));
        assert_eq!(parsed.confidence, Some(0.9));
        assert!(parsed.insights.is_empty());
    }

    #[test]
    fn unit_normalisation() {
        assert_eq!(normalize_unit(0.3, None), 0.3);
        assert_eq!(normalize_unit(8.0, None), 0.8);
        assert_eq!(normalize_unit(85.0, None), 0.85);
        assert_eq!(normalize_unit(850.0, None), 1.0);
        assert_eq!(normalize_unit(-0.2, None), 0.0);
        assert_eq!(normalize_unit(40.0, Some("%")), 0.4);
        assert_eq!(normalize_unit(4.0, Some("/10")), 0.4);
        assert_eq!(normalize_unit(1.0, Some("%")), 0.01);
    }

    #[test]
    fn digest_orders_by_quality_and_truncates() {
        let items = vec![
            EvidenceItem {
                title: "low".into(),
                url: "https://a".into(),
                text: "abcdefgh".into(),
                quality_score: 0.1,
            },
            EvidenceItem {
                title: "high".into(),
                url: "https://b".into(),
                text: "ééééé".into(),
                quality_score: 0.9,
            },
        ];
        let digest = digest_evidence(&items, 1, 3);
        assert_eq!(digest.count, 1);
        assert_eq!(digest.sources, vec!["https://b"]);
        assert!(digest.text.contains("ééé"));
        assert!(!digest.text.contains("éééé"));
    }

    #[test]
    fn prompt_placeholders_rendered() {
        let prompt = render_prompt(
            "{persona}|{layer_name}|{layer_focus}|{topic_id}|{evidence}",
            "an economist",
            "Pricing",
            "elasticity",
            "t9",
            "EV",
        );
        assert_eq!(prompt, "an economist|Pricing|elasticity|t9|EV");
    }
}

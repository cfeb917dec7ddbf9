//! Bridge to the external AI analysis service.
//!
//! The analysis itself is opaque: the provider receives a read-only view of a
//! completed scan and returns a JSON document, which is stored on the record.

use std::{fmt, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    config::AiConfig,
    error::{LabError, LabResult},
    hub::{HubEvent, NotificationHub},
    models::{
        recommendations_from, Recommendation, ScanPatch, ScanRecord, ScanReportView, ScanStatus,
    },
    registry::ScanRegistry,
};

const MAX_OUTPUT_CHARS: usize = 6000;

const SYSTEM_PROMPT: &str = "You are a penetration testing expert. Reply with a single JSON object only.";

const ANALYSIS_SCHEMA: &str = r#"{
  "risk_assessment": {"overall_risk_level": "low|medium|high|critical", "risk_score": 0, "summary": "..."},
  "vulnerability_analysis": [{"vulnerability": "...", "severity": "low|medium|high|critical", "description": "...", "affected_services": []}],
  "attack_vectors": [{"vector": "...", "likelihood": "low|medium|high", "impact": "...", "mitigation": "..."}],
  "recommendations": [{"priority": "immediate|high|medium|low", "title": "...", "description": "...", "action_items": []}],
  "next_steps": [{"step": "...", "tool": "...", "rationale": "..."}]
}"#;

const FEATURES: &[&str] = &[
    "vulnerability_analysis",
    "risk_assessment",
    "recommendation_generation",
    "report_generation",
    "insights_extraction",
];

#[async_trait]
pub trait InsightProvider: Send + Sync {
    fn model(&self) -> &str;
    async fn analyze(&self, scan: &ScanReportView) -> LabResult<Value>;
}

/// OpenAI-compatible chat completion client (Groq by default).
pub struct GroqProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl fmt::Debug for GroqProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroqProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl GroqProvider {
    pub fn new(cfg: &AiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build AI http client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        })
    }

    fn prompt(scan: &ScanReportView) -> LabResult<String> {
        let mut context = serde_json::to_value(scan)
            .map_err(|e| LabError::UpstreamUnavailable(format!("could not encode scan: {e}")))?;
        if scan.output.chars().count() > MAX_OUTPUT_CHARS {
            let tail: String = scan
                .output
                .chars()
                .skip(scan.output.chars().count() - MAX_OUTPUT_CHARS)
                .collect();
            context["output"] = Value::String(tail);
        }
        Ok(format!(
            "Analyse these penetration test results and answer with JSON shaped like:\n{ANALYSIS_SCHEMA}\n\nScan data:\n{context:#}"
        ))
    }
}

#[async_trait]
impl InsightProvider for GroqProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, scan: &ScanReportView) -> LabResult<Value> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::prompt(scan)?},
            ],
            "temperature": 0.3,
            "max_tokens": 4000,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LabError::UpstreamUnavailable(format!("AI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, scan_id = scan.scan_id, "AI provider rejected request");
            return Err(LabError::UpstreamUnavailable(format!(
                "AI provider returned {status}"
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| LabError::UpstreamUnavailable(format!("malformed AI response: {e}")))?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| LabError::UpstreamUnavailable("AI response had no choices".into()))?;
        extract_json(content)
    }
}

/// Pulls the outermost JSON object out of a free-text completion.
fn extract_json(text: &str) -> LabResult<Value> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(LabError::UpstreamUnavailable(
            "AI response contained no JSON object".into(),
        ));
    };
    if end < start {
        return Err(LabError::UpstreamUnavailable(
            "AI response contained no JSON object".into(),
        ));
    }
    serde_json::from_str(&text[start..=end])
        .map_err(|e| LabError::UpstreamUnavailable(format!("AI response was not valid JSON: {e}")))
}

#[derive(Debug, Serialize)]
pub struct AiStatus {
    pub ai_enabled: bool,
    pub model: Option<String>,
    pub status: &'static str,
    pub features: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct AiAnalysis {
    pub scan_id: i64,
    pub analysis: Value,
    pub generated_at: DateTime<Utc>,
    pub ai_model: String,
}

#[derive(Debug, Serialize)]
pub struct AiInsights {
    pub scan_id: i64,
    pub risk_level: String,
    pub risk_score: f64,
    pub critical_vulnerabilities: usize,
    pub high_vulnerabilities: usize,
    pub immediate_actions: usize,
    pub top_recommendation: Option<Value>,
}

impl AiInsights {
    fn from_analysis(scan_id: i64, analysis: &Value) -> Self {
        let risk = &analysis["risk_assessment"];
        let count = |list: &str, field: &str, value: &str| {
            analysis[list]
                .as_array()
                .map(|items| items.iter().filter(|i| i[field] == value).count())
                .unwrap_or(0)
        };
        Self {
            scan_id,
            risk_level: risk["overall_risk_level"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            risk_score: risk["risk_score"].as_f64().unwrap_or(0.0),
            critical_vulnerabilities: count("vulnerability_analysis", "severity", "critical"),
            high_vulnerabilities: count("vulnerability_analysis", "severity", "high"),
            immediate_actions: count("recommendations", "priority", "immediate"),
            top_recommendation: analysis["recommendations"]
                .as_array()
                .and_then(|r| r.first())
                .cloned(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnhancedRecommendations {
    pub scan_id: i64,
    pub recommendations: Vec<Recommendation>,
    pub enhanced_at: DateTime<Utc>,
    pub ai_enhanced: bool,
}

/// Maps the free-form recommendation objects of an analysis onto the shared model.
fn ai_recommendations(analysis: &Value) -> Vec<Recommendation> {
    let Some(items) = analysis["recommendations"].as_array() else {
        return vec![];
    };
    items
        .iter()
        .filter_map(|item| {
            let title = item["title"].as_str()?;
            let action = match &item["action_items"] {
                Value::Array(actions) => {
                    let joined: Vec<&str> = actions.iter().filter_map(Value::as_str).collect();
                    (!joined.is_empty()).then(|| joined.join("; "))
                }
                other => other.as_str().map(str::to_string),
            };
            Some(Recommendation {
                priority: item["priority"].as_str().unwrap_or("medium").to_string(),
                title: title.to_string(),
                description: item["description"].as_str().unwrap_or_default().to_string(),
                action,
            })
        })
        .collect()
}

pub struct InsightService {
    provider: Option<Arc<dyn InsightProvider>>,
    registry: ScanRegistry,
    hub: Arc<NotificationHub>,
}

impl InsightService {
    pub fn new(
        provider: Option<Arc<dyn InsightProvider>>,
        registry: ScanRegistry,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            provider,
            registry,
            hub,
        }
    }

    pub fn from_config(
        cfg: &AiConfig,
        registry: ScanRegistry,
        hub: Arc<NotificationHub>,
    ) -> anyhow::Result<Self> {
        let provider: Option<Arc<dyn InsightProvider>> = if cfg.is_configured() {
            Some(Arc::new(GroqProvider::new(cfg)?))
        } else {
            info!("AI insights disabled: no API key configured");
            None
        };
        Ok(Self::new(provider, registry, hub))
    }

    pub fn status(&self) -> AiStatus {
        match &self.provider {
            Some(provider) => AiStatus {
                ai_enabled: true,
                model: Some(provider.model().to_string()),
                status: "available",
                features: FEATURES.to_vec(),
            },
            None => AiStatus {
                ai_enabled: false,
                model: None,
                status: "unavailable",
                features: vec![],
            },
        }
    }

    async fn completed_scan(&self, id: i64) -> LabResult<ScanRecord> {
        let scan = self.registry.get(id).await?;
        if scan.status != ScanStatus::Completed {
            return Err(LabError::validation(format!(
                "scan {id} is {}; AI analysis needs a completed scan",
                scan.status
            )));
        }
        Ok(scan)
    }

    fn provider(&self) -> LabResult<&Arc<dyn InsightProvider>> {
        self.provider
            .as_ref()
            .ok_or_else(|| LabError::UpstreamUnavailable("AI service is not configured".into()))
    }

    async fn run_analysis(&self, scan: &ScanRecord) -> LabResult<Value> {
        let provider = self.provider()?;
        let analysis = provider.analyze(&ScanReportView::from(scan)).await?;
        self.registry
            .update(
                scan.id,
                ScanPatch {
                    ai_insights: Some(analysis.clone()),
                    ..ScanPatch::default()
                },
            )
            .await?;
        info!(scan_id = scan.id, model = provider.model(), "AI analysis stored");

        let recommendations = ai_recommendations(&analysis);
        if !recommendations.is_empty() {
            self.hub.publish(HubEvent::Recommendations {
                scan_id: scan.id,
                recommendations,
            });
        }
        Ok(analysis)
    }

    /// Always asks the provider again and replaces any stored analysis.
    pub async fn analyze(&self, id: i64) -> LabResult<AiAnalysis> {
        let scan = self.completed_scan(id).await?;
        let analysis = self.run_analysis(&scan).await?;
        Ok(AiAnalysis {
            scan_id: id,
            analysis,
            generated_at: Utc::now(),
            ai_model: self.provider()?.model().to_string(),
        })
    }

    /// A stored analysis is served even when no provider is configured.
    async fn stored_or_fresh(&self, id: i64) -> LabResult<(ScanRecord, Value)> {
        let scan = self.completed_scan(id).await?;
        let analysis = match &scan.ai_insights {
            Some(stored) => stored.clone(),
            None => self.run_analysis(&scan).await?,
        };
        Ok((scan, analysis))
    }

    pub async fn insights(&self, id: i64) -> LabResult<AiInsights> {
        let (_, analysis) = self.stored_or_fresh(id).await?;
        Ok(AiInsights::from_analysis(id, &analysis))
    }

    /// Rule-based recommendations, extended with the analysis ones when an
    /// analysis is stored or a provider can produce one for a completed scan.
    pub async fn enhance_recommendations(&self, id: i64) -> LabResult<EnhancedRecommendations> {
        let scan = self.registry.get(id).await?;
        let mut recommendations = recommendations_from(scan.parsed_data.as_ref());
        let analysis = match (&scan.ai_insights, scan.status, &self.provider) {
            (Some(stored), _, _) => Some(stored.clone()),
            (None, ScanStatus::Completed, Some(_)) => Some(self.run_analysis(&scan).await?),
            _ => None,
        };

        let ai_enhanced = analysis.is_some();
        if let Some(analysis) = &analysis {
            for rec in ai_recommendations(analysis) {
                if !recommendations.iter().any(|r| r.title == rec.title) {
                    recommendations.push(rec);
                }
            }
        }
        Ok(EnhancedRecommendations {
            scan_id: id,
            recommendations,
            enhanced_at: Utc::now(),
            ai_enhanced,
        })
    }

    /// JSON bundle of the scan view and its analysis; presentation is left to the caller.
    pub async fn generate_report(&self, id: i64) -> LabResult<Value> {
        let (scan, analysis) = self.stored_or_fresh(id).await?;
        Ok(json!({
            "scan_id": id,
            "report_type": "ai_json",
            "generated_at": Utc::now(),
            "scan": ScanReportView::from(&scan),
            "analysis": analysis,
        }))
    }
}

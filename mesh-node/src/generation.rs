//! Client for the HTTP generation service that produces worksheet PDFs.

use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use mesh_core::{ArtifactId, ArtifactMeta, MeshError};
use serde::{Deserialize, Serialize};

use crate::store::{CatalogStore, Preferences};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const SUBJECTS: &[&str] = &["math", "science"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub subject: String,
    pub grade: String,
    pub language: String,
    pub include_answers: bool,
}

impl GenerationRequest {
    /// Build a request; the subject is normalised to lowercase and must be math or science.
    pub fn new(
        prompt: impl Into<String>,
        subject: &str,
        grade: impl Into<String>,
        language: impl Into<String>,
        include_answers: bool,
    ) -> Result<Self, MeshError> {
        let req = Self {
            prompt: prompt.into(),
            subject: subject.trim().to_ascii_lowercase(),
            grade: grade.into(),
            language: language.into(),
            include_answers,
        };
        req.validate()?;
        Ok(req)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.prompt.trim().is_empty() {
            return Err(MeshError::InvalidInput("prompt is empty".into()));
        }
        if !SUBJECTS.contains(&self.subject.to_ascii_lowercase().as_str()) {
            return Err(MeshError::InvalidInput(format!(
                "subject must be 'math' or 'science', got {:?}",
                self.subject
            )));
        }
        if self.grade.trim().is_empty() {
            return Err(MeshError::InvalidInput("grade is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationResponse {
    pub success: bool,
    #[serde(default)]
    pub pdf_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub grade: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub pdf_base64: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl GenerationResponse {
    /// Validate and decode into catalog metadata and payload bytes.
    pub fn into_artifact(self, language: &str) -> Result<(ArtifactMeta, Vec<u8>), MeshError> {
        if !self.success {
            return Err(MeshError::Generation(if self.message.is_empty() {
                "service reported failure".into()
            } else {
                self.message
            }));
        }
        let encoded = self
            .pdf_base64
            .ok_or_else(|| MeshError::Generation("response carried no payload".into()))?;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| MeshError::Generation(format!("payload is not base64: {e}")))?;
        let id = ArtifactId::new(self.pdf_id)
            .map_err(|e| MeshError::Generation(format!("bad pdf_id: {e}")))?;
        let title = if self.title.trim().is_empty() {
            format!("{} worksheet", self.subject)
        } else {
            self.title
        };
        let filename = if self.filename.is_empty() {
            format!("{title}_{id}.pdf")
        } else {
            self.filename
        };
        let meta = ArtifactMeta {
            id,
            filename,
            title,
            subject: self.subject,
            grade: self.grade,
            language: language.to_owned(),
            created_at: parse_timestamp(&self.created_at)?,
        };
        Ok((meta, payload))
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC. Empty means now.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, MeshError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Utc::now());
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| t.and_utc())
        .map_err(|e| MeshError::Generation(format!("bad created_at {s:?}: {e}")))
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

pub struct GenerationClient {
    http: reqwest::Client,
    base_url: String,
}

impl GenerationClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MeshError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MeshError::Generation(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResponse, MeshError> {
        req.validate()?;
        let url = format!("{}/api/generate-pdf", self.base_url);
        tracing::info!(subject = %req.subject, grade = %req.grade, "requesting generation");
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| MeshError::Generation(format!("POST {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.detail)
                .unwrap_or(body);
            return Err(MeshError::Generation(format!("{status}: {detail}")));
        }
        let body: GenerationResponse = resp
            .json()
            .await
            .map_err(|e| MeshError::Generation(format!("bad response: {e}")))?;
        if !body.success {
            return Err(MeshError::Generation(body.message));
        }
        Ok(body)
    }

    /// True when `GET /api/health` answers with a success status.
    pub async fn health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "generation service unreachable");
                false
            }
        }
    }
}

/// Remember the choices of a successful request for the next one.
pub async fn record_generation(
    store: &CatalogStore,
    req: &GenerationRequest,
) -> Result<Preferences, MeshError> {
    store
        .update_preferences(|p| {
            p.last_subject = Some(req.subject.clone());
            p.last_grade = Some(req.grade.clone());
            p.include_answers = req.include_answers;
            p.record_prompt(&req.prompt);
        })
        .await
}

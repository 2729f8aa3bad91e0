//! OpenAI Batch API provider for structured news analysis.
//!
//! One batch is a newline-delimited set of chat-completion requests with a
//! strict JSON-schema response format, uploaded as a file and executed
//! server-side within a 24h completion window.

use async_trait::async_trait;
use reqwest::multipart;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::prompts::{user_prompt, SYSTEM_PROMPT};
use super::schema::response_format;
use super::{
    AnalysisError, AnalysisProvider, AnalysisRequest, AnalysisResponse, BatchStatus,
    BatchStatusResult, Result,
};

const API_BASE: &str = "https://api.openai.com/v1";

/// Map provider batch status strings onto the coordinator's states.
fn map_status(status: &str) -> BatchStatus {
    match status {
        "validating" => BatchStatus::Pending,
        "in_progress" | "finalizing" => BatchStatus::InProgress,
        "completed" => BatchStatus::Completed,
        "failed" => BatchStatus::Failed,
        "expired" => BatchStatus::Expired,
        "cancelling" => BatchStatus::Cancelling,
        "cancelled" => BatchStatus::Cancelled,
        _ => BatchStatus::Pending,
    }
}

/// OpenAI Batch API implementation.
pub struct OpenAiBatchProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiBatchProvider {
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        if api_key.is_empty() {
            return Err(AnalysisError::NotConfigured(
                "OpenAI API key is empty".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// Point the provider at a different endpoint (testing).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// One JSONL line of the batch input file.
    fn build_request_line(&self, request: &AnalysisRequest) -> Value {
        json!({
            "custom_id": request.custom_id,
            "method": "POST",
            "url": "/v1/chat/completions",
            "body": {
                "model": self.model,
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": user_prompt(&request.article) },
                ],
                "response_format": response_format(),
                "temperature": 0.1,
            }
        })
    }

    async fn api_error(response: reqwest::Response) -> AnalysisError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("unreadable error body: {e}"));
        AnalysisError::Api { status, message }
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{path}", self.api_base))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn get_file_content(&self, file_id: &str) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/files/{file_id}/content", self.api_base))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(response.text().await?)
    }

    fn parse_result_line(line: &str) -> AnalysisResponse {
        let custom_id = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("custom_id").and_then(Value::as_str).map(String::from))
            .unwrap_or_default();

        let parse = || -> std::result::Result<String, String> {
            let data: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
            let content = data
                .pointer("/response/body/choices/0/message/content")
                .and_then(Value::as_str)
                .ok_or_else(|| "No choices in response".to_string())?;
            // Validate against the output contract before accepting
            super::schema::NewsAnalysis::from_json(content)
                .map_err(|e| format!("schema validation failed: {e}"))?;
            Ok(content.to_string())
        };

        match parse() {
            Ok(result_json) => AnalysisResponse {
                custom_id,
                success: true,
                result_json: Some(result_json),
                error_message: None,
            },
            Err(message) => AnalysisResponse {
                custom_id,
                success: false,
                result_json: None,
                error_message: Some(format!("Parse error: {message}")),
            },
        }
    }

    fn parse_error_line(line: &str) -> AnalysisResponse {
        let data: Value = serde_json::from_str(line).unwrap_or_default();
        let custom_id = data
            .get("custom_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = data
            .pointer("/response/body/error/message")
            .or_else(|| data.pointer("/error/message"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        AnalysisResponse {
            custom_id,
            success: false,
            result_json: None,
            error_message: Some(message),
        }
    }
}

#[async_trait]
impl AnalysisProvider for OpenAiBatchProvider {
    fn name(&self) -> &str {
        "openai_batch"
    }

    async fn submit_batch(&self, requests: &[AnalysisRequest]) -> Result<String> {
        let jsonl: String = requests
            .iter()
            .map(|r| self.build_request_line(r).to_string())
            .collect::<Vec<_>>()
            .join("\n");

        info!(requests = requests.len(), "Uploading batch input file");
        let part = multipart::Part::bytes(jsonl.into_bytes())
            .file_name("batch_input.jsonl")
            .mime_str("application/jsonl")?;
        let form = multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let file: Value = response.json().await?;
        let file_id = file
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AnalysisError::Api {
                status: 200,
                message: "file upload response missing id".to_string(),
            })?;
        info!(file_id, "Batch input uploaded");

        let response = self
            .client
            .post(format!("{}/batches", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let batch: Value = response.json().await?;
        let batch_id = batch
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AnalysisError::Api {
                status: 200,
                message: "batch create response missing id".to_string(),
            })?;
        info!(batch_id, "Batch created");
        Ok(batch_id.to_string())
    }

    async fn check_batch_status(&self, batch_id: &str) -> Result<BatchStatusResult> {
        let batch = self.get_json(&format!("/batches/{batch_id}")).await?;
        let status = map_status(batch.get("status").and_then(Value::as_str).unwrap_or(""));
        let counts = batch.get("request_counts").cloned().unwrap_or_default();
        let count = |key: &str| {
            counts
                .get(key)
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize
        };
        Ok(BatchStatusResult {
            status,
            total: count("total"),
            completed: count("completed"),
            failed: count("failed"),
        })
    }

    async fn retrieve_results(&self, batch_id: &str) -> Result<Vec<AnalysisResponse>> {
        let batch = self.get_json(&format!("/batches/{batch_id}")).await?;
        let status = batch.get("status").and_then(Value::as_str).unwrap_or("");
        if status != "completed" {
            return Err(AnalysisError::BatchFailed {
                batch_id: batch_id.to_string(),
                status: status.to_string(),
            });
        }

        let mut responses = Vec::new();

        if let Some(output_file_id) = batch.get("output_file_id").and_then(Value::as_str) {
            let content = self.get_file_content(output_file_id).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                responses.push(Self::parse_result_line(line));
            }
        }

        if let Some(error_file_id) = batch.get("error_file_id").and_then(Value::as_str) {
            let content = self.get_file_content(error_file_id).await?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                warn!(batch_id, "Batch error line received");
                responses.push(Self::parse_error_line(line));
            }
        }

        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(map_status("validating"), BatchStatus::Pending);
        assert_eq!(map_status("in_progress"), BatchStatus::InProgress);
        assert_eq!(map_status("finalizing"), BatchStatus::InProgress);
        assert_eq!(map_status("completed"), BatchStatus::Completed);
        assert!(map_status("expired").is_terminal_error());
        assert!(map_status("cancelled").is_terminal_error());
    }

    #[test]
    fn result_line_with_valid_analysis_succeeds() {
        let content = super::super::schema::sample_analysis_json();
        let line = json!({
            "custom_id": "article_7",
            "response": { "body": { "choices": [
                { "message": { "content": content } }
            ]}}
        })
        .to_string();

        let response = OpenAiBatchProvider::parse_result_line(&line);
        assert!(response.success);
        assert_eq!(response.custom_id, "article_7");
        assert!(response.result_json.is_some());
    }

    #[test]
    fn result_line_with_schema_violation_fails() {
        let line = json!({
            "custom_id": "article_8",
            "response": { "body": { "choices": [
                { "message": { "content": "{\"not\": \"an analysis\"}" } }
            ]}}
        })
        .to_string();

        let response = OpenAiBatchProvider::parse_result_line(&line);
        assert!(!response.success);
        assert_eq!(response.custom_id, "article_8");
        assert!(response.error_message.unwrap().contains("Parse error"));
    }

    #[test]
    fn error_line_extracts_message() {
        let line = json!({
            "custom_id": "article_9",
            "response": { "body": { "error": { "message": "rate limit exceeded" } } }
        })
        .to_string();

        let response = OpenAiBatchProvider::parse_error_line(&line);
        assert!(!response.success);
        assert_eq!(response.error_message.as_deref(), Some("rate limit exceeded"));
    }

    #[test]
    fn request_line_shape() {
        let provider = OpenAiBatchProvider::new("sk-test", "gpt-4o-mini").unwrap();
        let article = crate::models::Article {
            id: 5,
            url: "https://example.com/news/5".to_string(),
            url_hash: "ab".repeat(16),
            title: "標題".to_string(),
            content: "內容".to_string(),
            summary: None,
            author: None,
            source: "UDN".to_string(),
            crawler_name: "udn_article".to_string(),
            category: None,
            sub_category: None,
            tags: None,
            published_at: None,
            crawled_at: chrono::Utc::now(),
            raw_html: None,
            images: None,
        };
        let line = provider.build_request_line(&AnalysisRequest::for_article(article));

        assert_eq!(line["custom_id"], "article_5");
        assert_eq!(line["method"], "POST");
        assert_eq!(line["url"], "/v1/chat/completions");
        assert_eq!(line["body"]["temperature"], 0.1);
        assert_eq!(line["body"]["response_format"]["type"], "json_schema");
        assert_eq!(line["body"]["messages"][0]["role"], "system");
    }
}

use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::{
    clients::circuit_breaker::BreakerRegistry,
    error::{DispatchError, DispatchResult},
    models::{
        circuit_breaker::BreakerKey,
        retry::RetryConfig,
        template::{RenderedContent, Template},
    },
    utils::retry_with_backoff,
};

pub const TEMPLATE_SERVICE_COMPONENT: &str = "template-service";

pub fn template_breaker_key() -> BreakerKey {
    BreakerKey::new(TEMPLATE_SERVICE_COMPONENT, "template", "_system")
}

/// Resolves a template reference into deliverable content.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        template_id: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> DispatchResult<RenderedContent>;
}

pub struct TemplateServiceClient {
    http_client: Client,
    base_url: String,
    language: String,
    retry_config: RetryConfig,
    breakers: BreakerRegistry,
}

impl TemplateServiceClient {
    pub fn new(
        base_url: &str,
        language: &str,
        timeout: Duration,
        retry_config: RetryConfig,
        breakers: BreakerRegistry,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        info!(base_url = %base_url, "Template service client initialized");

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            language: language.to_string(),
            retry_config,
            breakers,
        })
    }

    pub async fn fetch_template(&self, template_id: &str) -> DispatchResult<Template> {
        let url = format!(
            "{}/api/v1/templates/{}?lang={}",
            self.base_url, template_id, self.language
        );

        debug!(template_id, language = %self.language, "Fetching template from service");

        let breaker = self.breakers.breaker(template_breaker_key());

        let fetched = breaker
            .call(|| Self::fetch_with_retry(&self.http_client, &self.retry_config, &url))
            .await?;

        fetched.ok_or_else(|| DispatchError::TemplateNotFound {
            template_id: template_id.to_string(),
        })
    }

    /// A missing template is a successful lookup as far as the breaker is concerned.
    async fn fetch_with_retry(
        http_client: &Client,
        retry_config: &RetryConfig,
        url: &str,
    ) -> Result<Option<Template>, Error> {
        retry_with_backoff(retry_config, || async move {
            let response = http_client
                .get(url)
                .send()
                .await
                .map_err(|e| e.to_string())?;

            let status = response.status();

            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            if status.is_success() {
                let template: Template = response
                    .json()
                    .await
                    .map_err(|e| format!("Failed to parse template JSON: {}", e))?;
                Ok(Some(template))
            } else {
                Err(format!("Template Service returned status {}", status))
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to fetch template: {}", e))
    }

    pub fn render_template(
        template: &Template,
        variables: &HashMap<String, serde_json::Value>,
    ) -> DispatchResult<RenderedContent> {
        debug!(
            template_id = %template.id,
            variable_count = variables.len(),
            "Rendering template"
        );

        let invalid = |reason: String| DispatchError::TemplateInvalid {
            template_id: template.id.clone(),
            reason,
        };

        let subject = template
            .subject
            .as_deref()
            .map(|s| replace_variables(s, variables))
            .transpose()
            .map_err(invalid)?;
        let body = replace_variables(&template.body_text, variables).map_err(invalid)?;

        Ok(RenderedContent { subject, body })
    }
}

#[async_trait]
impl TemplateRenderer for TemplateServiceClient {
    async fn render(
        &self,
        template_id: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> DispatchResult<RenderedContent> {
        let template = self.fetch_template(template_id).await?;
        Self::render_template(&template, context)
    }
}

fn replace_variables(
    template: &str,
    variables: &HashMap<String, serde_json::Value>,
) -> Result<String, String> {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);

        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => String::new(),
            _ => {
                return Err(format!("Unsupported variable type for key '{}'", key));
            }
        };

        result = result.replace(&placeholder, &replacement);
    }

    if let Some(start) = result.find("{{") {
        if let Some(len) = result[start..].find("}}") {
            let missing_var = &result[start..start + len + 2];

            warn!(
                missing_variable = %missing_var,
                "Template contains unreplaced variable"
            );

            return Err(format!("Missing variable in template: {}", missing_var));
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(body: &str) -> Template {
        Template {
            id: "welcome".to_string(),
            name: "Welcome".to_string(),
            language: "en".to_string(),
            subject: Some("Hi {{name}}".to_string()),
            body_text: body.to_string(),
            variables: vec!["name".to_string()],
        }
    }

    #[test]
    fn renders_subject_and_body() {
        let vars = HashMap::from([
            ("name".to_string(), json!("Ada")),
            ("count".to_string(), json!(3)),
        ]);

        let rendered =
            TemplateServiceClient::render_template(&template("{{name}} has {{count}} alerts"), &vars)
                .unwrap();

        assert_eq!(rendered.subject.as_deref(), Some("Hi Ada"));
        assert_eq!(rendered.body, "Ada has 3 alerts");
    }

    #[test]
    fn missing_variable_is_an_invalid_template() {
        let vars = HashMap::from([("name".to_string(), json!("Ada"))]);

        let err = TemplateServiceClient::render_template(&template("{{name}} owes {{amount}}"), &vars)
            .unwrap_err();

        assert!(matches!(err, DispatchError::TemplateInvalid { .. }));
    }
}

//! Producers of configuration text for jobs.
//!
//! A [`CodeSource`] turns a [`GenerateRequest`] into configuration source.
//! The job service never calls these; callers generate code first and pass it
//! in `config.code`.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::models::MAX_NAME_LEN;
use crate::config::CodeSourceConfig;

const SYSTEM_PROMPT: &str = "You are an expert Terraform developer. Generate production-ready Terraform code following best practices:

- Use proper resource types for the specified cloud provider
- Include appropriate provider configuration
- Add meaningful tags and labels
- Use variables for reusability
- Include outputs for important values
- Add comments explaining each resource
- Follow naming conventions and security best practices

Only return the Terraform code without explanations.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub provider: String,
    pub project_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

impl GenerateRequest {
    pub fn validate(&self) -> Result<()> {
        let len = self.project_name.trim().chars().count();
        if len == 0 || len > MAX_NAME_LEN {
            bail!(
                "project_name must be between 1 and {} characters",
                MAX_NAME_LEN
            );
        }
        if self.provider.trim().is_empty() {
            bail!("provider must not be empty");
        }
        Ok(())
    }
}

#[async_trait]
pub trait CodeSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

/// Build the source chain for `config`: the AI source first when enabled,
/// the template source always last.
pub fn from_config(config: &CodeSourceConfig) -> FallbackCodeSource {
    let mut sources: Vec<Arc<dyn CodeSource>> = Vec::new();
    if config.ai_enabled {
        sources.push(Arc::new(AiCodeSource::new(
            &config.ai_base_url,
            &config.ai_model,
            Duration::from_secs(config.ai_timeout_secs),
        )));
    }
    sources.push(Arc::new(TemplateCodeSource));
    FallbackCodeSource::new(sources)
}

// ── Template ─────────────────────────────────────────────────────────

/// Deterministic templates for a handful of common resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateCodeSource;

impl TemplateCodeSource {
    pub fn render(request: &GenerateRequest) -> String {
        let project = request.project_name.trim();
        let mut code = String::new();
        let _ = writeln!(code, "# {}", project);
        if let Some(description) = request.description.as_deref().filter(|d| !d.trim().is_empty()) {
            let _ = writeln!(code, "# {}", description.trim());
        }
        code.push('\n');

        match request.provider.trim().to_ascii_lowercase().as_str() {
            "aws" => render_aws(&mut code, project, &request.resources),
            "azure" => render_azure(&mut code, project, &request.resources),
            "gcp" => render_gcp(&mut code, project, &request.resources),
            _ => {}
        }
        code
    }
}

#[async_trait]
impl CodeSource for TemplateCodeSource {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        Ok(Self::render(request))
    }
}

fn unsupported(code: &mut String, provider: &str, resource: &ResourceSpec) {
    let _ = writeln!(
        code,
        "# Unsupported {} resource type '{}' for '{}'\n",
        provider, resource.kind, resource.label
    );
}

fn render_aws(code: &mut String, project: &str, resources: &[ResourceSpec]) {
    code.push_str(
        r#"terraform {
  required_providers {
    aws = {
      source  = "hashicorp/aws"
      version = "~> 5.0"
    }
  }
}

provider "aws" {
  region = "us-east-1"
}

"#,
    );

    if resources.iter().any(|r| r.kind == "rds") {
        code.push_str(
            r#"variable "db_password" {
  type      = string
  sensitive = true
}

"#,
        );
    }

    for r in resources {
        match r.kind.as_str() {
            "ec2" => {
                let _ = write!(
                    code,
                    r#"resource "aws_instance" "{id}" {{
  ami           = "ami-0c55b159cbfafe1f0"
  instance_type = "t2.micro"

  tags = {{
    Name = "{project}-{label}"
  }}
}}

"#,
                    id = r.id,
                    project = project,
                    label = r.label
                );
            }
            "s3" => {
                let _ = write!(
                    code,
                    r#"resource "aws_s3_bucket" "{id}" {{
  bucket = "{project}-{id}"

  tags = {{
    Name = "{project}-{label}"
  }}
}}

"#,
                    id = r.id,
                    project = project,
                    label = r.label
                );
            }
            "vpc" => {
                let _ = write!(
                    code,
                    r#"resource "aws_vpc" "{id}" {{
  cidr_block = "10.0.0.0/16"

  tags = {{
    Name = "{project}-{label}"
  }}
}}

"#,
                    id = r.id,
                    project = project,
                    label = r.label
                );
            }
            "rds" => {
                let _ = write!(
                    code,
                    r#"resource "aws_db_instance" "{id}" {{
  allocated_storage   = 20
  engine              = "mysql"
  engine_version      = "8.0"
  instance_class      = "db.t3.micro"
  db_name             = "{db_name}"
  username            = "admin"
  password            = var.db_password
  skip_final_snapshot = true

  tags = {{
    Name = "{project}-{label}"
  }}
}}

"#,
                    id = r.id,
                    db_name = project.replace('-', "_"),
                    project = project,
                    label = r.label
                );
            }
            _ => unsupported(code, "aws", r),
        }
    }
}

fn render_azure(code: &mut String, project: &str, resources: &[ResourceSpec]) {
    let _ = write!(
        code,
        r#"terraform {{
  required_providers {{
    azurerm = {{
      source  = "hashicorp/azurerm"
      version = "~> 3.0"
    }}
  }}
}}

provider "azurerm" {{
  features {{}}
}}

resource "azurerm_resource_group" "main" {{
  name     = "{project}-rg"
  location = "East US"
}}

"#,
        project = project
    );

    for r in resources {
        match r.kind.as_str() {
            "vm" => {
                let _ = write!(
                    code,
                    r#"resource "azurerm_virtual_machine" "{id}" {{
  name                = "{project}-{id}"
  location            = azurerm_resource_group.main.location
  resource_group_name = azurerm_resource_group.main.name
  vm_size             = "Standard_B1s"
}}

"#,
                    id = r.id,
                    project = project
                );
            }
            _ => unsupported(code, "azure", r),
        }
    }
}

fn render_gcp(code: &mut String, project: &str, resources: &[ResourceSpec]) {
    code.push_str(
        r#"terraform {
  required_providers {
    google = {
      source  = "hashicorp/google"
      version = "~> 5.0"
    }
  }
}

provider "google" {
  project = "my-project-id"
  region  = "us-central1"
}

"#,
    );

    for r in resources {
        match r.kind.as_str() {
            "compute_instance" => {
                let _ = write!(
                    code,
                    r#"resource "google_compute_instance" "{id}" {{
  name         = "{project}-{id}"
  machine_type = "e2-micro"
  zone         = "us-central1-a"

  boot_disk {{
    initialize_params {{
      image = "debian-cloud/debian-11"
    }}
  }}

  network_interface {{
    network = "default"
  }}
}}

"#,
                    id = r.id,
                    project = project
                );
            }
            _ => unsupported(code, "gcp", r),
        }
    }
}

// ── AI ───────────────────────────────────────────────────────────────

/// Generator backed by an Ollama-compatible `/api/generate` endpoint.
pub struct AiCodeSource {
    base_url: String,
    model: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

impl AiCodeSource {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn build_prompt(request: &GenerateRequest) -> String {
        let resources: Vec<String> = request
            .resources
            .iter()
            .map(|r| format!("- {} ({})", r.label, r.kind))
            .collect();
        format!(
            "Generate production-ready Terraform code for the following infrastructure:

Project: {project}
Cloud Provider: {provider}
Description: {description}

Resources to create:
{resources}

Requirements:
1. Include proper provider configuration
2. Use appropriate resource types for {provider_lower}
3. Include tags with project name
4. Use variables where appropriate
5. Include outputs for important values

Generate only the Terraform code, no explanations.",
            project = request.project_name.trim(),
            provider = request.provider.to_uppercase(),
            provider_lower = request.provider.to_lowercase(),
            description = request.description.as_deref().unwrap_or("N/A"),
            resources = resources.join("\n"),
        )
    }
}

#[async_trait]
impl CodeSource for AiCodeSource {
    fn name(&self) -> &'static str {
        "ai"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &self.model,
            system: SYSTEM_PROMPT,
            prompt: Self::build_prompt(request),
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach model server at {}", self.base_url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Model server returned {}: {}", status, text.trim());
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .context("Failed to parse model server response")?;
        let code = strip_code_fences(&parsed.response);
        if code.trim().is_empty() {
            bail!("Model returned no code");
        }
        Ok(code)
    }
}

/// Remove a surrounding Markdown code fence (with optional language tag).
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => "",
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

// ── Fallback chain ───────────────────────────────────────────────────

/// Tries each source in order and returns the first non-empty result.
pub struct FallbackCodeSource {
    sources: Vec<Arc<dyn CodeSource>>,
}

impl FallbackCodeSource {
    pub fn new(sources: Vec<Arc<dyn CodeSource>>) -> Self {
        Self { sources }
    }

    /// Generate code and report which source produced it.
    pub async fn generate_with_source(
        &self,
        request: &GenerateRequest,
    ) -> Result<(String, &'static str)> {
        let mut failures = Vec::new();
        for source in &self.sources {
            match source.generate(request).await {
                Ok(code) if !code.trim().is_empty() => {
                    info!(
                        source = source.name(),
                        project = %request.project_name,
                        bytes = code.len(),
                        "configuration generated"
                    );
                    return Ok((code, source.name()));
                }
                Ok(_) => {
                    warn!(source = source.name(), "code source returned empty text");
                    failures.push(format!("{}: empty result", source.name()));
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "code source failed, trying next");
                    failures.push(format!("{}: {:#}", source.name(), e));
                }
            }
        }
        bail!("All code sources failed: {}", failures.join("; "))
    }
}

#[async_trait]
impl CodeSource for FallbackCodeSource {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.generate_with_source(request).await.map(|(code, _)| code)
    }
}

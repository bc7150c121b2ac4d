//! Configuration generation: `iac-runner generate`.

use anyhow::{Result, bail};

use iac_runner::config::AppConfig;
use iac_runner::jobs::code_source::{self, GenerateRequest, ResourceSpec};

pub async fn cmd_generate(
    config: &AppConfig,
    provider: String,
    project_name: String,
    description: Option<String>,
    resources: &[String],
) -> Result<()> {
    let resources = resources
        .iter()
        .map(|spec| parse_resource(spec))
        .collect::<Result<Vec<_>>>()?;
    let request = GenerateRequest {
        provider,
        project_name,
        description,
        resources,
    };
    request.validate()?;

    let (code, source) = code_source::from_config(&config.code_source)
        .generate_with_source(&request)
        .await?;
    eprintln!("Generated by {} source", source);
    print!("{}", code);
    if !code.ends_with('\n') {
        println!();
    }
    Ok(())
}

/// Parse `id:type[:label]`. The label defaults to the id.
fn parse_resource(spec: &str) -> Result<ResourceSpec> {
    let mut parts = spec.splitn(3, ':');
    let id = parts.next().unwrap_or_default().trim();
    let kind = parts.next().unwrap_or_default().trim();
    if id.is_empty() || kind.is_empty() {
        bail!("Invalid resource '{}': expected id:type[:label]", spec);
    }
    let label = parts
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(id);
    Ok(ResourceSpec {
        id: id.to_string(),
        kind: kind.to_string(),
        label: label.to_string(),
    })
}

//! OSV-style vulnerability provider.
//!
//! Speaks the osv.dev batch query shape: one POST with every package, one
//! result slot per query in the same order. Only the fields the pipeline
//! consumes are modeled.

use super::VulnProvider;
use crate::error::ScanError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use vigil_protocol::{PackageRef, Vulnerability};

const DEFAULT_ENDPOINT: &str = "https://api.osv.dev";
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct BatchQuery<'a> {
    queries: Vec<Query<'a>>,
}

#[derive(Serialize)]
struct Query<'a> {
    package: QueryPackage<'a>,
    version: &'a str,
}

#[derive(Serialize)]
struct QueryPackage<'a> {
    name: &'a str,
    ecosystem: &'a str,
}

#[derive(Deserialize)]
struct BatchResponse {
    results: Vec<QueryResult>,
}

#[derive(Deserialize, Default)]
struct QueryResult {
    #[serde(default)]
    vulns: Vec<OsvVuln>,
}

#[derive(Deserialize)]
struct OsvVuln {
    id: String,
    #[serde(default)]
    summary: Option<String>,
}

pub struct OsvClient {
    endpoint: String,
    client: reqwest::Client,
}

impl OsvClient {
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(QUERY_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for OsvClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Map the pipeline's ecosystem labels onto OSV's.
fn osv_ecosystem(ecosystem: &str) -> &str {
    match ecosystem {
        "pip" | "pypi" => "PyPI",
        "npm" => "npm",
        "cargo" => "crates.io",
        "go" => "Go",
        "maven" => "Maven",
        other => other,
    }
}

#[async_trait]
impl VulnProvider for OsvClient {
    async fn ping(&self) -> Result<(), ScanError> {
        self.client
            .get(format!("{}/v1/vulns/OSV-2020-111", self.endpoint))
            .send()
            .await
            .map_err(|err| ScanError::Provider(err.to_string()))?;
        Ok(())
    }

    async fn query(
        &self,
        packages: &[PackageRef],
    ) -> Result<HashMap<PackageRef, Vec<Vulnerability>>, ScanError> {
        if packages.is_empty() {
            return Ok(HashMap::new());
        }

        let body = BatchQuery {
            queries: packages
                .iter()
                .map(|package| Query {
                    package: QueryPackage {
                        name: &package.name,
                        ecosystem: osv_ecosystem(&package.ecosystem),
                    },
                    version: &package.version,
                })
                .collect(),
        };

        let response: BatchResponse = self
            .client
            .post(format!("{}/v1/querybatch", self.endpoint))
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| ScanError::Provider(err.to_string()))?
            .json()
            .await
            .map_err(|err| ScanError::Provider(format!("bad response body: {}", err)))?;

        if response.results.len() != packages.len() {
            return Err(ScanError::Provider(format!(
                "result count {} does not match query count {}",
                response.results.len(),
                packages.len()
            )));
        }

        let mut answers = HashMap::new();
        for (package, result) in packages.iter().zip(response.results) {
            let vulnerabilities: Vec<Vulnerability> = result
                .vulns
                .into_iter()
                .map(|vuln| Vulnerability {
                    id: vuln.id,
                    package: package.name.clone(),
                    version: package.version.clone(),
                    ecosystem: package.ecosystem.clone(),
                    severity: None,
                    summary: vuln.summary,
                    fixed_version: None,
                })
                .collect();
            if !vulnerabilities.is_empty() {
                answers.insert(package.clone(), vulnerabilities);
            }
        }
        Ok(answers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecosystem_mapping() {
        assert_eq!(osv_ecosystem("pip"), "PyPI");
        assert_eq!(osv_ecosystem("cargo"), "crates.io");
        assert_eq!(osv_ecosystem("RubyGems"), "RubyGems");
    }

    #[test]
    fn batch_query_serializes_in_osv_shape() {
        let packages = [PackageRef::new("pip", "requests", "2.31.0")];
        let body = BatchQuery {
            queries: packages
                .iter()
                .map(|package| Query {
                    package: QueryPackage {
                        name: &package.name,
                        ecosystem: osv_ecosystem(&package.ecosystem),
                    },
                    version: &package.version,
                })
                .collect(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json["queries"][0]["package"]["ecosystem"],
            serde_json::json!("PyPI")
        );
        assert_eq!(json["queries"][0]["version"], serde_json::json!("2.31.0"));
    }

    #[test]
    fn response_with_missing_vulns_field_parses() {
        let raw = r#"{"results":[{},{"vulns":[{"id":"OSV-1","summary":"bad"}]}]}"#;
        let response: BatchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.results.len(), 2);
        assert!(response.results[0].vulns.is_empty());
        assert_eq!(response.results[1].vulns[0].id, "OSV-1");
    }
}

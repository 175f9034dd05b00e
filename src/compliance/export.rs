//! Evidence export: JSON, CSV, and SARIF 2.1.0.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::model::{ComplianceScan, FindingStatus};
use crate::error::{Error, Result};

/// Fixed CSV header.
pub const CSV_HEADER: &str =
    "scan_id,profile_id,target_kind,target_name,control_id,status,severity,message,evidence";

/// SARIF tool driver name.
pub const SARIF_DRIVER: &str = "masterchef-compliance";

/// Export encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceFormat {
    /// Pretty-printed scan JSON.
    Json,
    /// One row per finding.
    Csv,
    /// SARIF log with failed and waived findings as results.
    Sarif,
}

impl EvidenceFormat {
    /// MIME type of the rendered body.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv",
            Self::Sarif => "application/sarif+json",
        }
    }

    /// File extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Sarif => "sarif",
        }
    }
}

impl fmt::Display for EvidenceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for EvidenceFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "sarif" => Ok(Self::Sarif),
            _ => Err(Error::validation("format must be json, csv, or sarif")),
        }
    }
}

/// A rendered export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceExport {
    /// MIME type.
    pub content_type: String,
    /// Suggested download name.
    pub file_name: String,
    /// Rendered body.
    pub body: String,
}

/// Render `scan` in `format`.
pub fn export_scan(scan: &ComplianceScan, format: EvidenceFormat) -> Result<EvidenceExport> {
    let body = match format {
        EvidenceFormat::Json => serde_json::to_string_pretty(scan)?,
        EvidenceFormat::Csv => to_csv(scan),
        EvidenceFormat::Sarif => serde_json::to_string_pretty(&to_sarif(scan))?,
    };
    Ok(EvidenceExport {
        content_type: format.content_type().to_string(),
        file_name: format!("{}-evidence.{}", scan.id, format.extension()),
        body,
    })
}

fn csv_field(value: &str) -> String {
    if value.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn to_csv(scan: &ComplianceScan) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for f in &scan.findings {
        let row = [
            scan.id.as_str(),
            scan.profile_id.as_str(),
            scan.target_kind.as_str(),
            scan.target_name.as_str(),
            f.control_id.as_str(),
            f.status.as_str(),
            f.severity.as_str(),
            f.message.as_str(),
            f.evidence.as_str(),
        ];
        let line: Vec<String> = row.iter().map(|v| csv_field(v)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn to_sarif(scan: &ComplianceScan) -> Value {
    let rules: Vec<Value> = scan
        .findings
        .iter()
        .map(|f| {
            json!({
                "id": f.control_id,
                "name": f.title,
                "shortDescription": { "text": f.title },
                "properties": { "severity": f.severity.as_str() },
            })
        })
        .collect();

    let results: Vec<Value> = scan
        .findings
        .iter()
        .filter(|f| f.status != FindingStatus::Pass)
        .map(|f| {
            let level = match f.status {
                FindingStatus::Waived => "note",
                _ if f.severity.is_high_or_above() => "error",
                _ => "warning",
            };
            json!({
                "ruleId": f.control_id,
                "level": level,
                "message": { "text": f.message },
                "locations": [{
                    "logicalLocations": [{
                        "name": format!("{}/{}", scan.target_kind, scan.target_name),
                        "kind": scan.target_kind,
                    }],
                }],
                "properties": {
                    "status": f.status.as_str(),
                    "evidence": f.evidence,
                    "scan_id": scan.id,
                },
            })
        })
        .collect();

    json!({
        "version": "2.1.0",
        "$schema": "https://json.schemastore.org/sarif-2.1.0.json",
        "runs": [{
            "tool": { "driver": { "name": SARIF_DRIVER, "rules": rules } },
            "results": results,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::model::{ComplianceFinding, ScanSummary};
    use crate::severity::Severity;
    use chrono::Utc;

    fn finding(id: &str, status: FindingStatus, severity: Severity) -> ComplianceFinding {
        ComplianceFinding {
            control_id: id.to_string(),
            title: format!("{id} title"),
            severity,
            status,
            message: format!("{id}, checked"),
            evidence: "digest=sha256:00".to_string(),
            exception_id: None,
        }
    }

    fn scan() -> ComplianceScan {
        let findings = vec![
            finding("A", FindingStatus::Fail, Severity::Critical),
            finding("B", FindingStatus::Fail, Severity::Low),
            finding("C", FindingStatus::Waived, Severity::High),
            finding("D", FindingStatus::Pass, Severity::Medium),
        ];
        ComplianceScan {
            id: "compliance-scan-1".to_string(),
            profile_id: "compliance-profile-1".to_string(),
            profile_name: "baseline".to_string(),
            target_kind: "host".to_string(),
            target_name: "web-1".to_string(),
            summary: ScanSummary::from_findings(&findings),
            findings,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_csv_export() {
        let out = export_scan(&scan(), EvidenceFormat::Csv).unwrap();
        assert_eq!(out.content_type, "text/csv");
        assert_eq!(out.file_name, "compliance-scan-1-evidence.csv");
        let lines: Vec<&str> = out.body.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines[1],
            "compliance-scan-1,compliance-profile-1,host,web-1,A,fail,critical,\"A, checked\",digest=sha256:00"
        );
    }

    #[test]
    fn test_sarif_levels() {
        let out = export_scan(&scan(), EvidenceFormat::Sarif).unwrap();
        assert_eq!(out.content_type, "application/sarif+json");
        let doc: Value = serde_json::from_str(&out.body).unwrap();
        assert_eq!(doc["version"], "2.1.0");
        assert_eq!(doc["runs"][0]["tool"]["driver"]["name"], SARIF_DRIVER);

        let results = doc["runs"][0]["results"].as_array().unwrap();
        let levels: Vec<(&str, &str)> = results
            .iter()
            .map(|r| (r["ruleId"].as_str().unwrap(), r["level"].as_str().unwrap()))
            .collect();
        assert_eq!(levels, vec![("A", "error"), ("B", "warning"), ("C", "note")]);
    }

    #[test]
    fn test_json_export_is_pretty() {
        let out = export_scan(&scan(), EvidenceFormat::Json).unwrap();
        assert!(out.body.contains("\n  \"id\": \"compliance-scan-1\""));
        let back: ComplianceScan = serde_json::from_str(&out.body).unwrap();
        assert_eq!(back.findings.len(), 4);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("SARIF".parse::<EvidenceFormat>().unwrap(), EvidenceFormat::Sarif);
        assert!("xml".parse::<EvidenceFormat>().is_err());
    }

    #[test]
    fn test_csv_quotes_embedded_quotes() {
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("plain"), "plain");
    }
}

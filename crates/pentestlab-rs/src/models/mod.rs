use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Edges of the scan lifecycle graph. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopped)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "stopped" => Self::Stopped,
            other => anyhow::bail!("unknown scan status: {other}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Nmap,
    Nikto,
    Hydra,
    Sqlmap,
    Gobuster,
}

impl ToolKind {
    pub const ALL: [ToolKind; 5] = [
        ToolKind::Nmap,
        ToolKind::Nikto,
        ToolKind::Hydra,
        ToolKind::Sqlmap,
        ToolKind::Gobuster,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nmap => "nmap",
            Self::Nikto => "nikto",
            Self::Hydra => "hydra",
            Self::Sqlmap => "sqlmap",
            Self::Gobuster => "gobuster",
        }
    }

    /// Tools that take a URL rather than a bare host.
    pub fn is_web(self) -> bool {
        matches!(self, Self::Nikto | Self::Sqlmap | Self::Gobuster)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Nmap => "Network mapper: port scanning and service detection",
            Self::Nikto => "Web server vulnerability scanner",
            Self::Hydra => "Online credential brute forcer",
            Self::Sqlmap => "SQL injection detection and exploitation",
            Self::Gobuster => "Directory and file enumeration",
        }
    }

    pub fn category(self) -> &'static str {
        match self {
            Self::Nmap => "reconnaissance",
            Self::Hydra => "brute_force",
            Self::Nikto | Self::Sqlmap | Self::Gobuster => "web_testing",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown tool: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanType {
    #[serde(alias = "nmap")]
    NetworkPortScan,
    #[serde(alias = "nikto")]
    WebVulnerabilityScan,
    Comprehensive,
    #[serde(alias = "hydra")]
    CredentialBruteForce,
    #[serde(alias = "sqlmap")]
    SqlInjectionTest,
    #[serde(alias = "gobuster")]
    DirectoryEnumeration,
}

impl ScanType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkPortScan => "network-port-scan",
            Self::WebVulnerabilityScan => "web-vulnerability-scan",
            Self::Comprehensive => "comprehensive",
            Self::CredentialBruteForce => "credential-brute-force",
            Self::SqlInjectionTest => "sql-injection-test",
            Self::DirectoryEnumeration => "directory-enumeration",
        }
    }

    /// Tools run for this scan type, in order.
    pub fn plan(self) -> &'static [ToolKind] {
        match self {
            Self::NetworkPortScan => &[ToolKind::Nmap],
            Self::WebVulnerabilityScan => &[ToolKind::Nikto],
            Self::Comprehensive => &[ToolKind::Nmap, ToolKind::Nikto, ToolKind::Gobuster],
            Self::CredentialBruteForce => &[ToolKind::Hydra],
            Self::SqlInjectionTest => &[ToolKind::Sqlmap],
            Self::DirectoryEnumeration => &[ToolKind::Gobuster],
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| anyhow::anyhow!("unknown scan type: {s}"))
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub name: String,
    pub target: String,
    pub scan_type: ScanType,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub parsed_data: Option<Value>,
    pub error: Option<String>,
    pub ai_insights: Option<Value>,
    #[serde(skip)]
    pub revision: i64,
}

#[derive(Debug, Clone)]
pub struct NewScan {
    pub name: String,
    pub target: String,
    pub scan_type: ScanType,
}

/// Partial update applied by the registry. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ScanPatch {
    pub status: Option<ScanStatus>,
    pub append_output: Option<String>,
    pub parsed_data: Option<Value>,
    pub error: Option<String>,
    pub ai_insights: Option<Value>,
}

impl ScanPatch {
    pub fn status(status: ScanStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn append_output(output: impl Into<String>) -> Self {
        Self {
            append_output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn with_parsed_data(mut self, parsed: Option<Value>) -> Self {
        self.parsed_data = parsed;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Fields that may still be written once a scan is terminal.
    pub fn only_post_completion_fields(&self) -> bool {
        self.status.is_none()
            && self.append_output.is_none()
            && self.parsed_data.is_none()
            && self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Recommendation {
    pub priority: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub action: Option<String>,
}

impl Recommendation {
    pub fn new(priority: &str, title: &str, description: impl Into<String>, action: &str) -> Self {
        Self {
            priority: priority.to_string(),
            title: title.to_string(),
            description: description.into(),
            action: Some(action.to_string()),
        }
    }
}

/// Collects the rule-based recommendations every tool parser attaches to its output.
pub fn recommendations_from(parsed_data: Option<&Value>) -> Vec<Recommendation> {
    let Some(Value::Object(per_tool)) = parsed_data else {
        return vec![];
    };
    per_tool
        .values()
        .filter_map(|tool| tool.get("recommendations"))
        .filter_map(|recs| serde_json::from_value::<Vec<Recommendation>>(recs.clone()).ok())
        .flatten()
        .collect()
}

/// Read-only projection of a finished scan handed to report and AI collaborators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanReportView {
    pub scan_id: i64,
    pub name: String,
    pub target: String,
    pub scan_type: ScanType,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub parsed_data: Option<Value>,
    pub error: Option<String>,
    pub recommendations: Vec<Recommendation>,
}

impl From<&ScanRecord> for ScanReportView {
    fn from(scan: &ScanRecord) -> Self {
        Self {
            scan_id: scan.id,
            name: scan.name.clone(),
            target: scan.target.clone(),
            scan_type: scan.scan_type,
            status: scan.status,
            created_at: scan.created_at,
            started_at: scan.started_at,
            completed_at: scan.completed_at,
            output: scan.output.clone(),
            parsed_data: scan.parsed_data.clone(),
            error: scan.error.clone(),
            recommendations: recommendations_from(scan.parsed_data.as_ref()),
        }
    }
}

/// Parsed document of one plan step.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    pub scan_id: i64,
    pub tool: ToolKind,
    pub parsed_data: Value,
}

impl ScanRecord {
    /// Per-tool documents in plan order; steps that produced nothing are left out.
    pub fn tool_results(&self) -> Vec<ToolResult> {
        let Some(Value::Object(per_tool)) = &self.parsed_data else {
            return vec![];
        };
        self.scan_type
            .plan()
            .iter()
            .filter_map(|&tool| {
                per_tool.get(tool.as_str()).map(|doc| ToolResult {
                    scan_id: self.id,
                    tool,
                    parsed_data: doc.clone(),
                })
            })
            .collect()
    }
}

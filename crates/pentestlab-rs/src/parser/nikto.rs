use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::models::Recommendation;

static CVE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CVE-\d{4}-\d{4,7}").expect("cve regex should compile"));

#[derive(Debug, Default, Serialize)]
pub struct NiktoReport {
    pub target_ip: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub server: Option<String>,
    pub findings: Vec<NiktoFinding>,
    pub summary: NiktoSummary,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Serialize)]
pub struct NiktoFinding {
    pub path: Option<String>,
    pub description: String,
    pub severity: &'static str,
    pub category: &'static str,
    pub cve: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct NiktoSummary {
    pub total_findings: usize,
    pub severity_counts: BTreeMap<&'static str, usize>,
    pub category_counts: BTreeMap<&'static str, usize>,
    pub cve_count: usize,
}

fn severity(description: &str) -> &'static str {
    let d = description.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| d.contains(w));
    if has(&[
        "critical",
        "remote code execution",
        "buffer overflow",
        "sql injection",
        "xss",
        "cross-site scripting",
    ]) {
        "high"
    } else if has(&[
        "information disclosure",
        "directory traversal",
        "path traversal",
        "authentication bypass",
        "privilege escalation",
    ]) {
        "medium"
    } else if has(&["information", "version", "banner", "header"]) {
        "low"
    } else {
        "info"
    }
}

fn category(description: &str) -> &'static str {
    let d = description.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| d.contains(w));
    if has(&["sql injection", "database"]) {
        "sql_injection"
    } else if has(&["xss", "cross-site scripting", "script"]) {
        "xss"
    } else if has(&["directory", "path", "traversal"]) {
        "directory_traversal"
    } else if has(&["authentication", "login", "password"]) {
        "authentication"
    } else if has(&["ssl", "tls", "certificate", "https"]) {
        "ssl_tls"
    } else if has(&["server", "version", "banner"]) {
        "information_disclosure"
    } else {
        "other"
    }
}

fn header_value(line: &str, key: &str) -> Option<String> {
    line.strip_prefix(key).map(|rest| rest.trim().to_string())
}

pub fn parse(stdout: &str) -> NiktoReport {
    let mut report = NiktoReport::default();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(v) = header_value(line, "+ Target IP:") {
            report.target_ip = Some(v);
        } else if let Some(v) = header_value(line, "+ Target Hostname:") {
            report.hostname = Some(v);
        } else if let Some(v) = header_value(line, "+ Target Port:") {
            report.port = Some(v);
        } else if let Some(v) = header_value(line, "+ Server:") {
            report.server = Some(v);
        } else if line.starts_with("+ Start Time:")
            || line.starts_with("+ End Time:")
            || line.contains("host(s) tested")
            || line.contains("item(s) reported")
        {
            continue;
        } else if let Some(content) = line.strip_prefix("+ ") {
            let (path, description) = match content.split_once(": ") {
                Some((p, d)) if p.starts_with('/') => (Some(p.to_string()), d.to_string()),
                _ => (None, content.to_string()),
            };
            report.findings.push(NiktoFinding {
                path,
                severity: severity(&description),
                category: category(&description),
                cve: CVE_REGEX.find(&description).map(|m| m.as_str().to_string()),
                description,
            });
        }
    }

    let mut summary = NiktoSummary {
        total_findings: report.findings.len(),
        ..Default::default()
    };
    for level in ["high", "medium", "low", "info"] {
        summary.severity_counts.insert(level, 0);
    }
    for finding in &report.findings {
        *summary.severity_counts.entry(finding.severity).or_default() += 1;
        *summary.category_counts.entry(finding.category).or_default() += 1;
        if finding.cve.is_some() {
            summary.cve_count += 1;
        }
    }

    report.recommendations = recommendations(&summary);
    report.summary = summary;
    report
}

fn recommendations(summary: &NiktoSummary) -> Vec<Recommendation> {
    let mut recs = vec![];
    let high = summary.severity_counts.get("high").copied().unwrap_or(0);
    if high > 0 {
        recs.push(Recommendation::new(
            "critical",
            "High Severity Vulnerabilities Found",
            format!("Found {high} high severity findings that need immediate attention."),
            "Review and patch high severity vulnerabilities immediately",
        ));
    }
    let seen = |c: &str| summary.category_counts.get(c).copied().unwrap_or(0) > 0;
    if seen("sql_injection") {
        recs.push(Recommendation::new(
            "high",
            "SQL Injection Vulnerabilities",
            "SQL injection indicators detected; this can lead to a data breach.",
            "Use parameterized queries and validate input",
        ));
    }
    if seen("xss") {
        recs.push(Recommendation::new(
            "high",
            "Cross-Site Scripting (XSS)",
            "XSS indicators detected; this can lead to session hijacking.",
            "Encode output and deploy a Content Security Policy",
        ));
    }
    if seen("ssl_tls") {
        recs.push(Recommendation::new(
            "medium",
            "SSL/TLS Issues",
            "TLS configuration issues detected.",
            "Update TLS configuration and certificates",
        ));
    }
    if seen("information_disclosure") {
        recs.push(Recommendation::new(
            "low",
            "Information Disclosure",
            "The server discloses version or banner information.",
            "Hide server version and banner information",
        ));
    }
    recs
}

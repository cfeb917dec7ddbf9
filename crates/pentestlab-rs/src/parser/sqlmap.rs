use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::models::Recommendation;

static FIELD_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(Parameter|Type|Title|Payload):\s*(.+?)\s*$")
        .expect("sqlmap field regex should compile")
});

static FACT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(web server operating system|web application technology|back-end DBMS):\s*(.+?)\s*$")
        .expect("sqlmap fact regex should compile")
});

#[derive(Debug, Default, Serialize)]
pub struct SqlmapReport {
    pub tested_url: Option<String>,
    pub injection_points: Vec<InjectionPoint>,
    pub web_server_os: Option<String>,
    pub web_technology: Option<String>,
    pub dbms: Option<String>,
    pub summary: SqlmapSummary,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct InjectionPoint {
    pub parameter: String,
    pub technique: Option<String>,
    pub title: Option<String>,
    pub payload: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct SqlmapSummary {
    pub vulnerable: bool,
    pub injection_count: usize,
    pub techniques: Vec<String>,
    pub risk_level: &'static str,
}

pub fn parse(stdout: &str) -> SqlmapReport {
    let mut report = SqlmapReport::default();
    let mut in_injection_block = false;
    let mut parameter = String::new();
    let mut current: Option<InjectionPoint> = None;

    for line in stdout.lines() {
        if let Some(url) = line.split("testing URL").nth(1) {
            report.tested_url = Some(url.trim_start_matches([':', ' ', '\'']).trim_end_matches('\'').to_string());
            continue;
        }
        if line.contains("identified the following injection point(s)") {
            in_injection_block = true;
            continue;
        }
        if line.trim() == "---" {
            continue;
        }
        if let Some(caps) = FACT_REGEX.captures(line) {
            let value = caps[2].to_string();
            match caps[1].to_lowercase().as_str() {
                "web server operating system" => report.web_server_os = Some(value),
                "web application technology" => report.web_technology = Some(value),
                _ => report.dbms = Some(value),
            }
            in_injection_block = false;
            continue;
        }
        if !in_injection_block {
            continue;
        }
        let Some(caps) = FIELD_REGEX.captures(line) else {
            continue;
        };
        let value = caps[2].to_string();
        match &caps[1] {
            "Parameter" => {
                report.injection_points.extend(current.take());
                parameter = value;
            }
            "Type" => {
                report.injection_points.extend(current.take());
                current = Some(InjectionPoint {
                    parameter: parameter.clone(),
                    technique: Some(value),
                    ..Default::default()
                });
            }
            "Title" => {
                if let Some(point) = current.as_mut() {
                    point.title = Some(value);
                }
            }
            _ => {
                if let Some(point) = current.as_mut() {
                    point.payload = Some(value);
                }
            }
        }
    }
    report.injection_points.extend(current.take());

    let mut techniques: Vec<String> = vec![];
    for technique in report.injection_points.iter().filter_map(|p| p.technique.clone()) {
        if !techniques.contains(&technique) {
            techniques.push(technique);
        }
    }
    let lowered: Vec<String> = techniques.iter().map(|t| t.to_lowercase()).collect();
    let risk_level = if lowered.iter().any(|t| t.contains("union query") || t.contains("stacked")) {
        "critical"
    } else if lowered.iter().any(|t| t.contains("boolean-based blind") || t.contains("error-based")) {
        "high"
    } else if !report.injection_points.is_empty() {
        "medium"
    } else {
        "low"
    };

    report.summary = SqlmapSummary {
        vulnerable: !report.injection_points.is_empty(),
        injection_count: report.injection_points.len(),
        techniques,
        risk_level,
    };
    report.recommendations = recommendations(&report);
    report
}

fn recommendations(report: &SqlmapReport) -> Vec<Recommendation> {
    let mut recs = vec![];
    if report.summary.vulnerable {
        recs.push(Recommendation::new(
            "critical",
            "SQL Injection Vulnerabilities Found",
            format!(
                "{} injection point(s) confirmed.",
                report.summary.injection_count
            ),
            "Use parameterized queries and validate input immediately",
        ));
        for technique in &report.summary.techniques {
            let t = technique.to_lowercase();
            if t.contains("union query") {
                recs.push(Recommendation::new(
                    "critical",
                    "Union Query SQL Injection",
                    "UNION-based injection allows direct data extraction.",
                    "Fix the injectable query and review all database access code",
                ));
            } else if t.contains("boolean-based blind") {
                recs.push(Recommendation::new(
                    "high",
                    "Boolean-Based Blind SQL Injection",
                    "Boolean-based blind injection allows gradual data extraction.",
                    "Fix the injectable parameter and add input validation",
                ));
            } else if t.contains("time-based blind") {
                recs.push(Recommendation::new(
                    "high",
                    "Time-Based Blind SQL Injection",
                    "Time-based blind injection allows gradual data extraction.",
                    "Fix the injectable parameter and add input validation",
                ));
            }
        }
    }
    if let Some(dbms) = &report.dbms {
        recs.push(Recommendation::new(
            "medium",
            "Back-end DBMS Identified",
            format!("The application is backed by {dbms}."),
            "Keep the database patched and run it with least-privilege accounts",
        ));
    }
    recs
}

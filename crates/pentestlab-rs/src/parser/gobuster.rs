use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::models::Recommendation;

// /admin                (Status: 301) [Size: 312] [--> http://lab.local/admin/]
static ENTRY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(/\S*)\s+\(Status:\s*(\d{3})\)(?:\s+\[Size:\s*(\d+)\])?(?:\s+\[-->\s*([^\]]+)\])?")
        .expect("gobuster entry regex should compile")
});

const INTERESTING: &[&str] = &[
    "admin", "login", "dashboard", "config", "backup", "test", "dev", "api", "upload", "phpmyadmin",
    ".git", ".env", "cgi-bin", "server-status",
];

#[derive(Debug, Serialize)]
pub struct GobusterReport {
    pub entries: Vec<PathEntry>,
    pub summary: GobusterSummary,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathEntry {
    pub path: String,
    pub status_code: u16,
    pub size: Option<u64>,
    pub redirect: Option<String>,
    pub keyword: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
pub struct GobusterSummary {
    pub total_found: usize,
    pub status_codes: BTreeMap<u16, usize>,
    pub interesting_paths: Vec<String>,
}

pub fn parse(stdout: &str) -> GobusterReport {
    let mut summary = GobusterSummary::default();
    let entries: Vec<PathEntry> = stdout
        .lines()
        .filter_map(|line| ENTRY_REGEX.captures(line.trim()))
        .map(|caps| {
            let path = caps[1].to_string();
            let lowered = path.to_lowercase();
            PathEntry {
                keyword: INTERESTING.iter().copied().find(|k| lowered.contains(k)),
                status_code: caps[2].parse().unwrap_or_default(),
                size: caps.get(3).and_then(|m| m.as_str().parse().ok()),
                redirect: caps.get(4).map(|m| m.as_str().trim().to_string()),
                path,
            }
        })
        .collect();

    for entry in &entries {
        *summary.status_codes.entry(entry.status_code).or_default() += 1;
        if entry.keyword.is_some() {
            summary.interesting_paths.push(entry.path.clone());
        }
    }
    summary.total_found = entries.len();

    let recommendations = recommendations(&entries);
    GobusterReport {
        entries,
        summary,
        recommendations,
    }
}

fn recommendations(entries: &[PathEntry]) -> Vec<Recommendation> {
    let count = |needles: &[&str]| {
        entries
            .iter()
            .filter(|e| {
                let p = e.path.to_lowercase();
                needles.iter().any(|n| p.contains(n))
            })
            .count()
    };

    let rules: [(&[&str], &str, &str, &str, &str); 6] = [
        (
            &["admin", "dashboard", "phpmyadmin"],
            "high",
            "Admin Panel Found",
            "admin-related",
            "Test admin panels for authentication bypass and weak credentials",
        ),
        (
            &["backup", ".bak", ".old"],
            "high",
            "Backup Files Found",
            "backup-related",
            "Remove backup files from the web root",
        ),
        (
            &["config", ".env", ".git"],
            "high",
            "Configuration Files Found",
            "configuration-related",
            "Block access to configuration and repository files",
        ),
        (
            &["upload"],
            "medium",
            "Upload Directories Found",
            "upload-related",
            "Test upload handlers for unrestricted file upload",
        ),
        (
            &["api"],
            "medium",
            "API Endpoints Found",
            "API-related",
            "Test API endpoints for authentication and authorization issues",
        ),
        (
            &["server-status", "cgi-bin"],
            "medium",
            "Server Internals Exposed",
            "server-internal",
            "Restrict server-status and CGI directories",
        ),
    ];

    let mut recs: Vec<Recommendation> = rules
        .iter()
        .filter_map(|(needles, priority, title, label, action)| {
            let n = count(*needles);
            (n > 0).then(|| {
                Recommendation::new(priority, title, format!("Found {n} {label} path(s)."), action)
            })
        })
        .collect();

    if entries.len() > 50 {
        recs.push(Recommendation::new(
            "low",
            "Many Paths Found",
            format!("Found {} paths; the site may expose more than intended.", entries.len()),
            "Disable directory listing and remove unused content",
        ));
    }
    recs
}

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::models::Recommendation;

// [22][ssh] host: 10.0.0.5   login: admin   password: letmein
static LOGIN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(\d+)\]\[([^\]]+)\]\s+host:\s+(\S+)\s+login:\s+(\S+)\s+password:\s+(.+)")
        .expect("hydra login regex should compile")
});

#[derive(Debug, Serialize)]
pub struct HydraReport {
    pub credentials: Vec<Credential>,
    pub summary: HydraSummary,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Serialize)]
pub struct Credential {
    pub port: u16,
    pub service: String,
    pub host: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Serialize)]
pub struct HydraSummary {
    pub attempts: usize,
    pub successful_logins: usize,
    pub vulnerable_services: Vec<String>,
}

pub fn parse(stdout: &str) -> HydraReport {
    let mut credentials = vec![];
    let mut summary = HydraSummary::default();

    for line in stdout.lines() {
        if line.starts_with("[ATTEMPT]") {
            summary.attempts += 1;
        }
        let Some(caps) = LOGIN_REGEX.captures(line) else {
            continue;
        };
        let service = caps[2].to_string();
        if !summary.vulnerable_services.contains(&service) {
            summary.vulnerable_services.push(service.clone());
        }
        credentials.push(Credential {
            port: caps[1].parse().unwrap_or_default(),
            service,
            host: caps[3].to_string(),
            username: caps[4].to_string(),
            password: caps[5].trim().to_string(),
        });
    }
    summary.successful_logins = credentials.len();

    let recommendations = recommendations(&credentials);
    HydraReport {
        credentials,
        summary,
        recommendations,
    }
}

fn recommendations(credentials: &[Credential]) -> Vec<Recommendation> {
    if credentials.is_empty() {
        return vec![];
    }
    let mut recs = vec![Recommendation::new(
        "critical",
        "Weak Credentials Found",
        format!("{} login(s) succeeded with guessable credentials.", credentials.len()),
        "Change all default or weak passwords immediately",
    )];

    for cred in credentials {
        let specific = match cred.service.as_str() {
            "ssh" => Some((
                "high",
                "SSH Brute Force Successful",
                "Use key-based authentication, disable password auth, deploy fail2ban",
            )),
            "ftp" => Some((
                "high",
                "FTP Brute Force Successful",
                "Disable anonymous FTP, enforce strong passwords, prefer SFTP",
            )),
            "http-post-form" | "http-get-form" => Some((
                "high",
                "Web Login Brute Force Successful",
                "Add account lockout, CAPTCHA and rate limiting",
            )),
            "mysql" | "postgres" | "mssql" => Some((
                "critical",
                "Database Brute Force Successful",
                "Rotate database passwords and restrict network access to the database",
            )),
            _ => None,
        };
        if let Some((priority, title, action)) = specific {
            recs.push(Recommendation::new(
                priority,
                title,
                format!("{} login succeeded for user {}", cred.service, cred.username),
                action,
            ));
        }
    }
    recs
}

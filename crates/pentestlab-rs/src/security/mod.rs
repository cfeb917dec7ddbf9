use std::{net::IpAddr, str::FromStr};

use ipnet::IpNet;
use url::Url;

use crate::{
    error::{LabError, LabResult},
    models::ToolKind,
};

const MAX_TARGET_LEN: usize = 255;

/// An empty allowlist leaves scope unrestricted.
pub fn in_scope(target: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }

    if allowlist
        .iter()
        .any(|item| item.eq_ignore_ascii_case(target))
    {
        return true;
    }

    let nets = || allowlist.iter().filter_map(|entry| IpNet::from_str(entry).ok());
    if let Ok(ip) = IpAddr::from_str(target) {
        return nets().any(|net| net.contains(&ip));
    }
    if let Ok(range) = IpNet::from_str(target) {
        return nets().any(|net| net.contains(&range));
    }

    false
}

/// Syntactic checks applied before any process is spawned.
pub fn validate_target(kind: ToolKind, target: &str) -> LabResult<()> {
    if target.trim().is_empty() {
        return Err(LabError::validation("target is required"));
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(LabError::validation("target is too long"));
    }
    if target.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(LabError::validation("target must not contain whitespace"));
    }
    if target.starts_with('-') {
        return Err(LabError::validation("target must not start with '-'"));
    }

    if kind.is_web() {
        web_url(target).map(|_| ())
    } else if is_host_or_ip(target) || (kind == ToolKind::Nmap && IpNet::from_str(target).is_ok()) {
        Ok(())
    } else {
        Err(LabError::validation(format!(
            "{target} is not a valid host or address for {kind}"
        )))
    }
}

/// Web tools take a URL; bare hosts get an `http://` scheme.
pub fn web_url(target: &str) -> LabResult<Url> {
    let candidate = if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{target}")
    };
    let url = Url::parse(&candidate)
        .map_err(|e| LabError::validation(format!("invalid URL {target}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LabError::validation(format!(
            "unsupported URL scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(LabError::validation(format!("URL {target} has no host")));
    }
    Ok(url)
}

/// Network tools in a mixed plan get the host part of a URL target.
pub fn target_for(kind: ToolKind, target: &str) -> String {
    if !kind.is_web() && target.contains("://") {
        if let Ok(url) = Url::parse(target) {
            if let Some(host) = url.host_str() {
                return host.trim_matches(['[', ']']).to_string();
            }
        }
    }
    target.to_string()
}

/// The part of a target the scope allowlist is matched against.
pub fn scope_host(kind: ToolKind, target: &str) -> String {
    if kind.is_web() {
        if let Ok(url) = web_url(target) {
            if let Some(host) = url.host_str() {
                return host.trim_matches(['[', ']']).to_string();
            }
        }
    }
    target.to_string()
}

pub fn check_scope(kind: ToolKind, target: &str, allowlist: &[String]) -> LabResult<()> {
    let host = scope_host(kind, target);
    if in_scope(&host, allowlist) {
        Ok(())
    } else {
        Err(LabError::validation(format!(
            "target {host} is outside the allowed scope"
        )))
    }
}

fn is_host_or_ip(target: &str) -> bool {
    if IpAddr::from_str(target).is_ok() {
        return true;
    }
    let host = target.strip_suffix('.').unwrap_or(target);
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ToolsConfig,
    error::{LabError, LabResult},
    models::ToolKind,
    security::{validate_target, web_url},
};

/// Builds the argument vector for one external tool. Arguments are never
/// passed through a shell.
pub trait ToolAdapter: Send + Sync {
    fn kind(&self) -> ToolKind;
    fn target(&self) -> &str;

    fn validate(&self) -> LabResult<()> {
        validate_target(self.kind(), self.target())
    }

    fn args(&self, tools: &ToolsConfig) -> LabResult<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmapRequest {
    pub target: String,
    #[serde(default)]
    pub options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NiktoRequest {
    pub target: String,
    #[serde(default)]
    pub options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydraRequest {
    pub target: String,
    pub service: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_list: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlmapRequest {
    pub target: String,
    #[serde(default)]
    pub options: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GobusterRequest {
    pub target: String,
    #[serde(default)]
    pub wordlist: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ToolRequest {
    Nmap(NmapRequest),
    Nikto(NiktoRequest),
    Hydra(HydraRequest),
    Sqlmap(SqlmapRequest),
    Gobuster(GobusterRequest),
}

impl ToolRequest {
    /// Decodes a tool-specific request body.
    pub fn from_json(kind: ToolKind, body: Value) -> LabResult<Self> {
        fn decode<T: serde::de::DeserializeOwned>(kind: ToolKind, body: Value) -> LabResult<T> {
            serde_json::from_value(body)
                .map_err(|e| LabError::validation(format!("invalid {kind} request: {e}")))
        }
        Ok(match kind {
            ToolKind::Nmap => Self::Nmap(decode(kind, body)?),
            ToolKind::Nikto => Self::Nikto(decode(kind, body)?),
            ToolKind::Hydra => Self::Hydra(decode(kind, body)?),
            ToolKind::Sqlmap => Self::Sqlmap(decode(kind, body)?),
            ToolKind::Gobuster => Self::Gobuster(decode(kind, body)?),
        })
    }

    /// Request used for one step of a scan plan; everything beyond the target is defaulted.
    pub fn for_scan(kind: ToolKind, target: &str, tools: &ToolsConfig) -> Self {
        let target = target.to_string();
        match kind {
            ToolKind::Nmap => Self::Nmap(NmapRequest {
                target,
                options: None,
            }),
            ToolKind::Nikto => Self::Nikto(NiktoRequest {
                target,
                options: None,
            }),
            ToolKind::Hydra => Self::Hydra(HydraRequest {
                target,
                service: tools.hydra_default_service.clone(),
                username: None,
                password_list: None,
            }),
            ToolKind::Sqlmap => Self::Sqlmap(SqlmapRequest {
                target,
                options: None,
            }),
            ToolKind::Gobuster => Self::Gobuster(GobusterRequest {
                target,
                wordlist: None,
            }),
        }
    }

    pub fn adapter(&self) -> &dyn ToolAdapter {
        match self {
            Self::Nmap(r) => r,
            Self::Nikto(r) => r,
            Self::Hydra(r) => r,
            Self::Sqlmap(r) => r,
            Self::Gobuster(r) => r,
        }
    }

    pub fn target(&self) -> &str {
        self.adapter().target()
    }
}

fn split_options(options: &str) -> LabResult<Vec<String>> {
    if options.chars().any(|c| c.is_control() && !c.is_whitespace()) {
        return Err(LabError::validation("options contain control characters"));
    }
    Ok(options.split_whitespace().map(str::to_string).collect())
}

fn require_plain(field: &str, value: &str) -> LabResult<()> {
    if value.trim().is_empty() {
        return Err(LabError::validation(format!("{field} is required")));
    }
    if value.starts_with('-') || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(LabError::validation(format!("{field} is malformed")));
    }
    Ok(())
}

// nmap can read targets from and write reports to arbitrary files.
const NMAP_FILE_FLAGS: &[&str] = &[
    "--excludefile",
    "--resume",
    "--stylesheet",
    "--datadir",
    "--script-args-file",
    "--append-output",
];

// nmap flags whose value is the following token. Any other bare word would be
// read as an extra scan target.
const NMAP_VALUE_FLAGS: &[&str] = &[
    "-p",
    "-e",
    "-T",
    "--top-ports",
    "--port-ratio",
    "--exclude-ports",
    "--exclude",
    "--script",
    "--script-args",
    "--version-intensity",
    "--max-retries",
    "--host-timeout",
    "--scan-delay",
    "--max-scan-delay",
    "--min-rate",
    "--max-rate",
    "--min-parallelism",
    "--max-parallelism",
    "--min-hostgroup",
    "--max-hostgroup",
    "--min-rtt-timeout",
    "--max-rtt-timeout",
    "--initial-rtt-timeout",
    "--data-length",
    "--ttl",
    "--source-port",
    "-g",
];

// Interactive sqlmap modes would block on a closed stdin.
const SQLMAP_INTERACTIVE_FLAGS: &[&str] = &["--os-shell", "--sql-shell", "--os-pwn", "--wizard"];

// sqlmap options that choose what gets tested: short letters and long names.
// optparse accepts unambiguous long prefixes, so those are matched by prefix.
const SQLMAP_TARGET_SHORT: &[char] = &['u', 'd', 'l', 'm', 'r', 'g', 'x', 'c'];
const SQLMAP_TARGET_LONG: &[&str] = &["url", "direct", "config"];

impl NmapRequest {
    fn option_tokens(&self, tools: &ToolsConfig) -> LabResult<Vec<String>> {
        let tokens = split_options(self.options.as_deref().unwrap_or(&tools.nmap_default_options))?;
        if let Some(bad) = tokens.iter().find(|t| {
            (t.starts_with("-o") || t.starts_with("-i"))
                || NMAP_FILE_FLAGS.iter().any(|f| t.starts_with(f))
        }) {
            return Err(LabError::validation(format!(
                "nmap option {bad} is not allowed"
            )));
        }

        let mut expects_value = false;
        for token in &tokens {
            if expects_value {
                expects_value = false;
                continue;
            }
            if !token.starts_with('-') {
                return Err(LabError::validation(format!(
                    "nmap option {token} is not a flag; targets belong in the target field"
                )));
            }
            expects_value = NMAP_VALUE_FLAGS.contains(&token.as_str());
        }
        Ok(tokens)
    }
}

/// Nikto reads its target from `-h`/`-host` (and any prefix Getopt accepts) or `-url`.
fn nikto_redirects_target(token: &str) -> bool {
    let name = token.trim_start_matches('-').to_ascii_lowercase();
    token.starts_with('-') && !name.is_empty() && ("host".starts_with(&name) || name == "url")
}

fn sqlmap_redirects_target(token: &str) -> bool {
    if let Some(long) = token.strip_prefix("--") {
        let name = long.split('=').next().unwrap_or_default();
        return !name.is_empty() && SQLMAP_TARGET_LONG.iter().any(|f| f.starts_with(name));
    }
    token
        .strip_prefix('-')
        .and_then(|short| short.chars().next())
        .is_some_and(|c| SQLMAP_TARGET_SHORT.contains(&c))
}

impl ToolAdapter for NmapRequest {
    fn kind(&self) -> ToolKind {
        ToolKind::Nmap
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn args(&self, tools: &ToolsConfig) -> LabResult<Vec<String>> {
        let mut args = self.option_tokens(tools)?;
        args.extend(["-oX".to_string(), "-".to_string(), self.target.clone()]);
        Ok(args)
    }
}

impl ToolAdapter for NiktoRequest {
    fn kind(&self) -> ToolKind {
        ToolKind::Nikto
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn args(&self, _tools: &ToolsConfig) -> LabResult<Vec<String>> {
        let mut args = vec![
            "-h".to_string(),
            self.target.clone(),
            "-nointeractive".to_string(),
        ];
        let options = split_options(self.options.as_deref().unwrap_or(""))?;
        if let Some(bad) = options.iter().find(|t| nikto_redirects_target(t)) {
            return Err(LabError::validation(format!(
                "nikto option {bad} is not allowed; targets belong in the target field"
            )));
        }
        args.extend(options);
        Ok(args)
    }
}

impl ToolAdapter for HydraRequest {
    fn kind(&self) -> ToolKind {
        ToolKind::Hydra
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn validate(&self) -> LabResult<()> {
        validate_target(ToolKind::Hydra, &self.target)?;
        if self.service.is_empty()
            || !self
                .service
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(LabError::validation(format!(
                "invalid hydra service: {:?}",
                self.service
            )));
        }
        if let Some(user) = &self.username {
            require_plain("username", user)?;
        }
        if let Some(list) = &self.password_list {
            require_plain("password_list", list)?;
        }
        Ok(())
    }

    fn args(&self, tools: &ToolsConfig) -> LabResult<Vec<String>> {
        let username = self
            .username
            .clone()
            .unwrap_or_else(|| tools.hydra_default_username.clone());
        let password_list = self
            .password_list
            .clone()
            .unwrap_or_else(|| tools.hydra_password_list.clone());
        Ok(vec![
            "-l".to_string(),
            username,
            "-P".to_string(),
            password_list,
            "-t".to_string(),
            "4".to_string(),
            "-f".to_string(),
            format!("{}://{}", self.service, self.target),
        ])
    }
}

impl ToolAdapter for SqlmapRequest {
    fn kind(&self) -> ToolKind {
        ToolKind::Sqlmap
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn args(&self, tools: &ToolsConfig) -> LabResult<Vec<String>> {
        let url = web_url(&self.target)?;
        let options =
            split_options(self.options.as_deref().unwrap_or(&tools.sqlmap_default_options))?;
        if let Some(bad) = options.iter().find(|t| {
            SQLMAP_INTERACTIVE_FLAGS.contains(&t.as_str()) || sqlmap_redirects_target(t)
        }) {
            return Err(LabError::validation(format!(
                "sqlmap option {bad} is not allowed"
            )));
        }

        let mut args = vec!["-u".to_string(), url.to_string()];
        args.extend(options);
        if !args.iter().any(|a| a == "--batch") {
            args.push("--batch".to_string());
        }
        Ok(args)
    }
}

impl ToolAdapter for GobusterRequest {
    fn kind(&self) -> ToolKind {
        ToolKind::Gobuster
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn validate(&self) -> LabResult<()> {
        validate_target(ToolKind::Gobuster, &self.target)?;
        if let Some(wordlist) = &self.wordlist {
            require_plain("wordlist", wordlist)?;
        }
        Ok(())
    }

    fn args(&self, tools: &ToolsConfig) -> LabResult<Vec<String>> {
        let url = web_url(&self.target)?;
        let wordlist = self
            .wordlist
            .clone()
            .unwrap_or_else(|| tools.gobuster_wordlist.clone());
        Ok(vec![
            "dir".to_string(),
            "-u".to_string(),
            url.to_string(),
            "-w".to_string(),
            wordlist,
            "-t".to_string(),
            "50".to_string(),
            "-q".to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tools() -> ToolsConfig {
        ToolsConfig::default()
    }

    #[test]
    fn nmap_defaults_to_version_scan_with_xml_on_stdout() {
        let req = ToolRequest::for_scan(ToolKind::Nmap, "10.0.0.5", &tools());
        assert_eq!(
            req.adapter().args(&tools()).unwrap(),
            vec!["-sV", "-oX", "-", "10.0.0.5"]
        );
    }

    #[test]
    fn nmap_file_flags_are_rejected() {
        for options in ["-oN /tmp/out", "-iL targets.txt", "--resume x", "-sV -oA base"] {
            let req = ToolRequest::from_json(
                ToolKind::Nmap,
                json!({"target": "10.0.0.5", "options": options}),
            )
            .unwrap();
            assert!(req.adapter().args(&tools()).is_err(), "{options}");
        }
    }

    #[test]
    fn nmap_rejects_bare_words_that_would_become_targets() {
        for options in ["-sV 192.168.1.1", "evil.example", "-p 80 10.0.0.9", "-T4 x -sV"] {
            let req = ToolRequest::from_json(
                ToolKind::Nmap,
                json!({"target": "10.0.0.5", "options": options}),
            )
            .unwrap();
            assert!(
                matches!(req.adapter().args(&tools()), Err(LabError::Validation(_))),
                "{options}"
            );
        }

        let ok = ToolRequest::from_json(
            ToolKind::Nmap,
            json!({"target": "10.0.0.5", "options": "-sS -p 22,80 --top-ports 100 -T4 --script vuln"}),
        )
        .unwrap();
        assert_eq!(
            ok.adapter().args(&tools()).unwrap(),
            vec![
                "-sS", "-p", "22,80", "--top-ports", "100", "-T4", "--script", "vuln", "-oX", "-",
                "10.0.0.5"
            ]
        );
    }

    #[test]
    fn nikto_and_sqlmap_cannot_swap_the_target() {
        for options in ["-h evil.example", "-host evil.example", "-ho x", "-url http://x/"] {
            let req = ToolRequest::from_json(
                ToolKind::Nikto,
                json!({"target": "http://lab.local", "options": options}),
            )
            .unwrap();
            assert!(req.adapter().args(&tools()).is_err(), "{options}");
        }

        for options in [
            "-u http://evil.example/?id=1",
            "-uhttp://evil.example/",
            "--url=http://evil.example/",
            "--ur http://evil.example/",
            "-r req.txt",
            "-m targets.txt",
            "-l burp.log",
            "-g inurl:id",
            "-d mysql://u:p@evil:3306/db",
            "--level 2 -c sqlmap.conf",
        ] {
            let req = ToolRequest::from_json(
                ToolKind::Sqlmap,
                json!({"target": "lab.local/item.php?id=1", "options": options}),
            )
            .unwrap();
            assert!(req.adapter().args(&tools()).is_err(), "{options}");
        }
    }

    #[test]
    fn hydra_builds_service_uri_with_defaults() {
        let req = ToolRequest::from_json(
            ToolKind::Hydra,
            json!({"target": "10.0.0.5", "service": "ftp"}),
        )
        .unwrap();
        req.adapter().validate().unwrap();
        let args = req.adapter().args(&tools()).unwrap();
        assert_eq!(&args[..2], &["-l", "admin"]);
        assert_eq!(args.last().map(String::as_str), Some("ftp://10.0.0.5"));
    }

    #[test]
    fn hydra_requires_a_service() {
        let err = ToolRequest::from_json(ToolKind::Hydra, json!({"target": "10.0.0.5"}));
        assert!(matches!(err, Err(LabError::Validation(_))));

        let req = ToolRequest::from_json(
            ToolKind::Hydra,
            json!({"target": "10.0.0.5", "service": "ssh://x"}),
        )
        .unwrap();
        assert!(req.adapter().validate().is_err());
    }

    #[test]
    fn sqlmap_appends_batch_once() {
        let custom = ToolRequest::from_json(
            ToolKind::Sqlmap,
            json!({"target": "lab.local/item.php?id=1", "options": "--level 2"}),
        )
        .unwrap();
        assert_eq!(
            custom.adapter().args(&tools()).unwrap(),
            vec!["-u", "http://lab.local/item.php?id=1", "--level", "2", "--batch"]
        );

        let default = ToolRequest::for_scan(ToolKind::Sqlmap, "http://lab.local/", &tools());
        let args = default.adapter().args(&tools()).unwrap();
        assert_eq!(args.iter().filter(|a| *a == "--batch").count(), 1);
        assert!(args.contains(&"--forms".to_string()));
    }

    #[test]
    fn gobuster_uses_dir_mode_with_configured_wordlist() {
        let req = ToolRequest::for_scan(ToolKind::Gobuster, "lab.local", &tools());
        assert_eq!(
            req.adapter().args(&tools()).unwrap(),
            vec![
                "dir",
                "-u",
                "http://lab.local/",
                "-w",
                "/usr/share/wordlists/dirb/common.txt",
                "-t",
                "50",
                "-q"
            ]
        );
    }

    #[test]
    fn nikto_passes_target_and_extra_options() {
        let req = ToolRequest::from_json(
            ToolKind::Nikto,
            json!({"target": "http://lab.local", "options": "-Tuning 9"}),
        )
        .unwrap();
        assert_eq!(
            req.adapter().args(&tools()).unwrap(),
            vec!["-h", "http://lab.local", "-nointeractive", "-Tuning", "9"]
        );
    }

    #[test]
    fn unknown_fields_do_not_hide_missing_target() {
        let err = ToolRequest::from_json(ToolKind::Gobuster, json!({"url": "http://lab.local"}));
        assert!(matches!(err, Err(LabError::Validation(_))));
    }
}

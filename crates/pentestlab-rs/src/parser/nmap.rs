use std::collections::BTreeMap;

use anyhow::Context;
use quick_xml::de::from_str;
use serde::Serialize;

use crate::models::Recommendation;

#[derive(Debug, serde::Deserialize)]
struct NmapRun {
    #[serde(rename = "@args", default)]
    args: Option<String>,
    #[serde(rename = "@version", default)]
    version: Option<String>,
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHost {
    #[serde(default)]
    status: Option<NmapStatus>,
    #[serde(rename = "address", default)]
    addresses: Vec<NmapAddress>,
    #[serde(default)]
    hostnames: Option<NmapHostnames>,
    #[serde(default)]
    ports: Option<NmapPorts>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapStatus {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addrtype: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostnames {
    #[serde(rename = "hostname", default)]
    hostnames: Vec<NmapHostname>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHostname {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u16,
    #[serde(rename = "@protocol")]
    protocol: String,
    state: NmapState,
    #[serde(default)]
    service: Option<NmapService>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapService {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@product", default)]
    product: Option<String>,
    #[serde(rename = "@version", default)]
    version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NmapReport {
    pub scanner_version: Option<String>,
    pub command: Option<String>,
    pub hosts: Vec<HostReport>,
    pub summary: NmapSummary,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Serialize)]
pub struct HostReport {
    pub ip: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub state: String,
    pub ports: Vec<PortReport>,
}

#[derive(Debug, Serialize)]
pub struct PortReport {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct NmapSummary {
    pub total_hosts: usize,
    pub up_hosts: usize,
    pub down_hosts: usize,
    pub open_ports: usize,
    pub services: BTreeMap<String, usize>,
}

const SERVICE_ADVICE: &[(&str, &str)] = &[
    ("ssh", "Harden SSH: disable root login, use key-based auth"),
    ("ftp", "FTP is cleartext; prefer SFTP or FTPS and check for anonymous access"),
    ("http", "Web server detected; run web vulnerability scans (nikto, sqlmap)"),
    ("mysql", "Database exposed; check for weak credentials and restrict network access"),
    ("microsoft-ds", "SMB exposed; check for null sessions and missing patches"),
    ("telnet", "Telnet is cleartext; replace it with SSH"),
    ("rpcbind", "RPC service exposed; check for RPC vulnerabilities"),
];

pub fn parse_nmap_xml(xml: &str) -> anyhow::Result<NmapReport> {
    let run: NmapRun = from_str(xml).context("nmap output is not valid XML")?;
    let mut summary = NmapSummary {
        total_hosts: run.hosts.len(),
        ..Default::default()
    };

    let mut hosts = Vec::with_capacity(run.hosts.len());
    for host in run.hosts {
        let state = host
            .status
            .map(|s| s.state)
            .unwrap_or_else(|| "unknown".to_string());
        if state == "up" {
            summary.up_hosts += 1;
        } else {
            summary.down_hosts += 1;
        }

        let ip = host
            .addresses
            .iter()
            .find(|a| a.addrtype.as_deref() != Some("mac"))
            .map(|a| a.addr.clone())
            .unwrap_or_default();
        let mac = host
            .addresses
            .iter()
            .find(|a| a.addrtype.as_deref() == Some("mac"))
            .map(|a| a.addr.clone());
        let hostname = host
            .hostnames
            .and_then(|h| h.hostnames.into_iter().next().map(|e| e.name));

        let ports: Vec<PortReport> = host
            .ports
            .map(|p| p.ports)
            .unwrap_or_default()
            .into_iter()
            .map(|p| PortReport {
                port: p.portid,
                protocol: p.protocol,
                state: p.state.state,
                service: p.service.as_ref().map(|s| s.name.clone()),
                product: p.service.as_ref().and_then(|s| s.product.clone()),
                version: p.service.and_then(|s| s.version),
            })
            .collect();

        for port in ports.iter().filter(|p| p.state == "open") {
            summary.open_ports += 1;
            let name = port.service.clone().unwrap_or_else(|| "unknown".to_string());
            *summary.services.entry(name).or_default() += 1;
        }

        hosts.push(HostReport {
            ip,
            mac,
            hostname,
            state,
            ports,
        });
    }

    let recommendations = SERVICE_ADVICE
        .iter()
        .filter_map(|(service, advice)| {
            summary.services.get(*service).map(|count| {
                Recommendation::new(
                    "medium",
                    &format!("{service} service exposed"),
                    format!("{count} open port(s) running {service}"),
                    advice,
                )
            })
        })
        .collect();

    Ok(NmapReport {
        scanner_version: run.version,
        command: run.args,
        hosts,
        summary,
        recommendations,
    })
}

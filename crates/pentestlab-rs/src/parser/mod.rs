//! Structured parsers for the text and XML each scanning tool prints.
//!
//! Every parser returns a JSON document with a `summary` object and a
//! `recommendations` array so downstream consumers can treat tools uniformly.

mod gobuster;
mod hydra;
mod nikto;
mod nmap;
mod sqlmap;

use serde_json::Value;

use crate::models::ToolKind;

pub fn parse(kind: ToolKind, stdout: &str) -> anyhow::Result<Value> {
    let parsed = match kind {
        ToolKind::Nmap => serde_json::to_value(nmap::parse_nmap_xml(stdout)?)?,
        ToolKind::Nikto => serde_json::to_value(nikto::parse(stdout))?,
        ToolKind::Hydra => serde_json::to_value(hydra::parse(stdout))?,
        ToolKind::Sqlmap => serde_json::to_value(sqlmap::parse(stdout))?,
        ToolKind::Gobuster => serde_json::to_value(gobuster::parse(stdout))?,
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::recommendations_from;

    #[test]
    fn every_tool_document_carries_summary_and_recommendations() {
        let samples = [
            (ToolKind::Nmap, include_str!("../../fixtures/nmap_sample.xml")),
            (ToolKind::Nikto, "+ Target IP: 10.0.0.5\n"),
            (ToolKind::Hydra, ""),
            (ToolKind::Sqlmap, "[INFO] testing URL: http://lab/item?id=1\n"),
            (ToolKind::Gobuster, "/admin (Status: 301) [Size: 312]\n"),
        ];
        for (kind, stdout) in samples {
            let doc = parse(kind, stdout).unwrap();
            assert!(doc.get("summary").is_some_and(Value::is_object), "{kind}");
            assert!(doc.get("recommendations").is_some_and(Value::is_array), "{kind}");
        }
    }

    #[test]
    fn parsed_recommendations_deserialize_as_models() {
        let doc = parse(ToolKind::Gobuster, "/admin (Status: 200) [Size: 10]\n").unwrap();
        let parsed = serde_json::json!({ "gobuster": doc });
        let recs = recommendations_from(Some(&parsed));
        assert_eq!(recs[0].title, "Admin Panel Found");
    }

    #[test]
    fn malformed_nmap_output_is_an_error() {
        assert!(parse(ToolKind::Nmap, "Starting Nmap 7.94 ( https://nmap.org )").is_err());
    }
}

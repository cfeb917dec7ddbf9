//! Fake tool executables shared by the test suite.
//!
//! Scripts are written once per test process; rewriting an executable while
//! another test thread execs it fails with ETXTBSY.

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use once_cell::sync::Lazy;
use tempfile::TempDir;

use crate::config::ToolsConfig;

const NMAP_XML: &str = include_str!("../fixtures/nmap_sample.xml");

const GOBUSTER_LINES: &str = "\
/admin                (Status: 301) [Size: 312] [--> http://lab.local/admin/]
/index.php            (Status: 200) [Size: 4521]
/uploads              (Status: 403) [Size: 277]";

const NIKTO_LINES: &str = "\
+ Target IP:          10.0.0.5
+ Target Port:        80
+ Server: Apache/2.2.8 (Ubuntu)
+ /: The anti-clickjacking X-Frame-Options header is not present.";

pub struct FakeTools {
    dir: TempDir,
}

static FAKE_TOOLS: Lazy<FakeTools> = Lazy::new(FakeTools::install);

pub fn fake_tools() -> &'static FakeTools {
    &FAKE_TOOLS
}

impl FakeTools {
    fn install() -> Self {
        let dir = tempfile::tempdir().expect("temp dir for fake tools");
        let scripts = [
            (
                "nmap-ok",
                format!("echo 'Starting Nmap 7.94' >&2\ncat <<'EOF'\n{NMAP_XML}\nEOF\n"),
            ),
            (
                "nmap-slow",
                format!("echo 'Starting Nmap 7.94' >&2\nsleep 1\ncat <<'EOF'\n{NMAP_XML}\nEOF\n"),
            ),
            ("nmap-hang", "echo 'Starting Nmap 7.94'\nexec sleep 30\n".to_string()),
            (
                "nmap-fail",
                "echo 'Failed to resolve \"nowhere\".' >&2\nexit 3\n".to_string(),
            ),
            (
                "gobuster-ok",
                format!("cat <<'EOF'\n{GOBUSTER_LINES}\nEOF\n"),
            ),
            ("nikto-ok", format!("cat <<'EOF'\n{NIKTO_LINES}\nEOF\n")),
            ("echo-args", "printf '%s\\n' \"$@\"\n".to_string()),
            (
                "chatty",
                "i=0\nwhile [ $i -lt 3000 ]; do echo \"line $i of a very talkative tool\"; i=$((i+1)); done\n"
                    .to_string(),
            ),
        ];
        for (name, body) in scripts {
            write_script(dir.path(), name, &body);
        }
        Self { dir }
    }

    pub fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    /// Every tool resolves to a script that succeeds quickly.
    pub fn config(&self) -> ToolsConfig {
        ToolsConfig {
            nmap_path: self.path("nmap-ok"),
            nikto_path: self.path("nikto-ok"),
            hydra_path: self.path("echo-args"),
            sqlmap_path: self.path("echo-args"),
            gobuster_path: self.path("gobuster-ok"),
            ..ToolsConfig::default()
        }
    }
}

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write fake tool");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
}

use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// A command result that renders as JSON, a table or `key=value` lines.
pub trait Report: Serialize {
    fn header(&self) -> Vec<&'static str>;
    fn rows(&self) -> Vec<Vec<String>>;
}

pub fn print_report<R: Report>(report: &R, format: OutputFormat) {
    println!("{}", render(report, format));
}

pub fn render<R: Report>(report: &R, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(report.header());
            for row in report.rows() {
                table.add_row(row);
            }
            table.to_string()
        }
        OutputFormat::Pretty => {
            let header = report.header();
            report
                .rows()
                .iter()
                .map(|row| {
                    header
                        .iter()
                        .zip(row)
                        .map(|(key, value)| format!("{}={value}", key.to_lowercase()))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

#[derive(Serialize)]
pub struct DeviceRow {
    pub id: u8,
    pub identity: String,
}

/// Summary of a finished `run`.
#[derive(Serialize)]
pub struct SessionReport {
    pub schema_id: &'static str,
    pub link: &'static str,
    pub exit_code: u64,
    pub exchanges: u64,
    pub elided_writes: u64,
    pub devices: Vec<DeviceRow>,
}

impl Report for SessionReport {
    fn header(&self) -> Vec<&'static str> {
        vec!["FIELD", "VALUE"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        let mut rows = vec![
            vec!["link".to_string(), self.link.to_string()],
            vec!["exit_code".to_string(), self.exit_code.to_string()],
            vec!["exchanges".to_string(), self.exchanges.to_string()],
            vec!["elided_writes".to_string(), self.elided_writes.to_string()],
        ];
        rows.extend(
            self.devices
                .iter()
                .map(|d| vec![format!("device {}", d.id), d.identity.clone()]),
        );
        rows
    }
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of `selftest`.
#[derive(Serialize)]
pub struct SelftestReport {
    pub schema_id: &'static str,
    pub alignment: usize,
    pub max_chunk: usize,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
}

impl Report for SelftestReport {
    fn header(&self) -> Vec<&'static str> {
        vec!["CHECK", "RESULT", "DETAIL"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.checks
            .iter()
            .map(|c| {
                vec![
                    c.name.to_string(),
                    if c.passed { "pass" } else { "FAIL" }.to_string(),
                    c.detail.clone(),
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionReport {
        SessionReport {
            schema_id: "test",
            link: "unix",
            exit_code: 3,
            exchanges: 42,
            elided_writes: 0,
            devices: vec![DeviceRow {
                id: 0,
                identity: "syscall_proxy".into(),
            }],
        }
    }

    #[test]
    fn json_carries_every_field() {
        let json: serde_json::Value =
            serde_json::from_str(&render(&sample(), OutputFormat::Json)).unwrap();
        assert_eq!(json["exit_code"], 3);
        assert_eq!(json["devices"][0]["identity"], "syscall_proxy");
    }

    #[test]
    fn pretty_prints_key_value_lines() {
        let text = render(&sample(), OutputFormat::Pretty);
        assert!(text.contains("field=exit_code value=3"));
        assert!(text.contains("field=device 0 value=syscall_proxy"));
    }

    #[test]
    fn table_has_header() {
        let text = render(&sample(), OutputFormat::Table);
        assert!(text.contains("FIELD"));
        assert!(text.contains("exchanges"));
    }
}

//! Report renderings of a validation snapshot.
//!
//! - `text`: a summary line and a table per engine, for terminals
//! - `csv`: one record per issue with columns `Severity, Text, Location, Validator engine`
//! - `markdown`: a table per engine that has finished, locations annotated with positions

use clap::ValueEnum;
use comfy_table::{Table, presets::UTF8_FULL};
use hammer_core::{EngineKind, EnginePhase, EngineSnapshot, Issue, ValidationSnapshot};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Csv,
    Markdown,
}

pub fn render(snapshot: &ValidationSnapshot, format: ReportFormat) -> String {
    match format {
        ReportFormat::Text => text(snapshot),
        ReportFormat::Csv => csv(snapshot),
        ReportFormat::Markdown => markdown(snapshot),
    }
}

/// `"<location> (line L:C)"`, or empty when the position is unresolved.
pub fn positioned_location(issue: &Issue) -> String {
    match issue.position() {
        Some(position) => format!(
            "{} (line {}:{})",
            issue.location(),
            position.line,
            position.column
        ),
        None => String::new(),
    }
}

fn text(snapshot: &ValidationSnapshot) -> String {
    let mut report = String::new();
    for kind in EngineKind::ALL {
        let engine = snapshot.engine(kind);
        report.push_str(&format!("{kind} validator: {}\n", summary(engine)));
        if engine.issues.is_empty() {
            report.push('\n');
            continue;
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Severity", "Message", "Location", "Line"]);
        for issue in &engine.issues {
            table.add_row(vec![
                issue.severity().to_string(),
                issue.message().to_string(),
                issue.location().to_string(),
                issue
                    .position()
                    .map(|position| position.to_string())
                    .unwrap_or_default(),
            ]);
        }
        report.push_str(&format!("{table}\n\n"));
    }
    report
}

fn summary(engine: &EngineSnapshot) -> String {
    let status = match engine.phase {
        EnginePhase::Idle => return "not run".into(),
        EnginePhase::Busy => return "still validating".into(),
        EnginePhase::Canceled => return "canceled".into(),
        EnginePhase::Faulted => "faulted, ",
        EnginePhase::Completed if engine.crashed => "crashed (raw output), ",
        EnginePhase::Completed => "",
    };
    format!(
        "{status}{} error(s), {} warning(s), {} issue(s) total",
        engine.error_count,
        engine.warning_count,
        engine.issues.len()
    )
}

fn csv(snapshot: &ValidationSnapshot) -> String {
    let mut report = String::new();
    push_record(
        &mut report,
        &["Severity", "Text", "Location", "Validator engine"],
    );
    for kind in EngineKind::ALL {
        let engine_name = kind.to_string();
        for issue in &snapshot.engine(kind).issues {
            push_record(
                &mut report,
                &[
                    issue.severity().as_str(),
                    issue.message(),
                    issue.location(),
                    &engine_name,
                ],
            );
        }
    }
    report
}

fn push_record(report: &mut String, fields: &[&str]) {
    let record: Vec<String> = fields.iter().map(|field| csv_field(field)).collect();
    report.push_str(&record.join(","));
    report.push_str("\r\n");
}

/// Quote a field when it holds a separator, quote or line break; inner quotes are doubled.
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn markdown(snapshot: &ValidationSnapshot) -> String {
    let mut report = String::new();
    for kind in EngineKind::ALL {
        let engine = snapshot.engine(kind);
        if engine.busy {
            continue;
        }
        report.push_str(&format!("**{kind} Validator**\n\n"));
        report.push_str("| Severity | Text | Location |\n");
        report.push_str("| --- | --- | --- |\n");
        for issue in &engine.issues {
            report.push_str(&format!(
                "| {} | {} | {} |\n",
                issue.severity(),
                markdown_cell(issue.message()),
                markdown_cell(&positioned_location(issue))
            ));
        }
        report.push('\n');
    }
    report
}

fn markdown_cell(value: &str) -> String {
    value
        .replace('|', "\\|")
        .replace("\r\n", " ")
        .replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::SourcePosition;
    use hammer_core::Severity;
    use hammer_core::issue::{error_count, warning_count};

    fn completed(issues: Vec<Issue>) -> EngineSnapshot {
        EngineSnapshot {
            phase: EnginePhase::Completed,
            busy: false,
            error_count: error_count(&issues),
            warning_count: warning_count(&issues),
            issues,
            crashed: false,
        }
    }

    fn snapshot() -> ValidationSnapshot {
        ValidationSnapshot {
            run: None,
            managed: completed(vec![Issue::new(
                Severity::Error,
                "Encountered unknown element 'colour'",
                "Patient.colour",
                Some(SourcePosition::new(3, 3)),
            )]),
            external: completed(vec![
                Issue::new(
                    Severity::Warning,
                    "Value is \"odd\", check it",
                    "Patient.name[0]",
                    None,
                ),
                Issue::new(Severity::Information, "a | b", "", None),
            ]),
        }
    }

    #[test]
    fn positioned_location_is_empty_when_unresolved() {
        let snapshot = snapshot();
        assert_eq!(
            positioned_location(&snapshot.managed.issues[0]),
            "Patient.colour (line 3:3)"
        );
        assert_eq!(positioned_location(&snapshot.external.issues[0]), "");
    }

    #[test]
    fn csv_quotes_fields_and_names_engines() {
        let report = render(&snapshot(), ReportFormat::Csv);
        let records: Vec<&str> = report.split("\r\n").collect();
        assert_eq!(
            records,
            vec![
                "Severity,Text,Location,Validator engine",
                "error,Encountered unknown element 'colour',Patient.colour,Managed",
                "warning,\"Value is \"\"odd\"\", check it\",Patient.name[0],Java",
                "information,a | b,,Java",
                "",
            ]
        );
    }

    #[test]
    fn markdown_skips_busy_engines() {
        let mut snapshot = snapshot();
        snapshot.external.busy = true;
        let report = render(&snapshot, ReportFormat::Markdown);
        assert!(report.starts_with("**Managed Validator**\n\n"));
        assert!(report.contains(
            "| error | Encountered unknown element 'colour' | Patient.colour (line 3:3) |\n"
        ));
        assert!(!report.contains("Java Validator"));
    }

    #[test]
    fn markdown_escapes_cell_separators() {
        let report = render(&snapshot(), ReportFormat::Markdown);
        assert!(report.contains("**Java Validator**"));
        assert!(report.contains("| information | a \\| b |  |\n"));
    }

    #[test]
    fn text_summarises_each_engine() {
        let mut snapshot = snapshot();
        snapshot.external.crashed = true;
        let report = render(&snapshot, ReportFormat::Text);
        assert!(report.contains("Managed validator: 1 error(s), 0 warning(s), 1 issue(s) total"));
        assert!(report.contains(
            "Java validator: crashed (raw output), 0 error(s), 1 warning(s), 2 issue(s) total"
        ));
        assert!(report.contains("Patient.colour"));
    }
}

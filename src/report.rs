//! TSV report writing for `compare` and `extract-list --report`.

use std::path::Path;

#[derive(Debug, Clone)]
pub struct ReportRow {
    pub status: String,
    pub path: String,
    pub reason: Option<String>,
}

impl ReportRow {
    pub fn ok(path: impl Into<String>) -> Self {
        Self {
            status: "ok".into(),
            path: path.into(),
            reason: None,
        }
    }

    pub fn orphan(path: impl Into<String>) -> Self {
        Self {
            status: "orphan".into(),
            path: path.into(),
            reason: None,
        }
    }

    pub fn absent(path: impl Into<String>) -> Self {
        Self {
            status: "absent".into(),
            path: path.into(),
            reason: None,
        }
    }

    pub fn dt_only(path: impl Into<String>) -> Self {
        Self {
            status: "dt_only".into(),
            path: path.into(),
            reason: None,
        }
    }

    pub fn missing(path: impl Into<String>) -> Self {
        Self {
            status: "missing".into(),
            path: path.into(),
            reason: None,
        }
    }

    pub fn failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: "failed".into(),
            path: path.into(),
            reason: Some(reason.into()),
        }
    }
}

/// Writes `rows` as a tab-delimited report with a `status\tpath` header
/// (plus a trailing reason column for `failed` rows).
pub fn write_tsv(path: &Path, rows: &[ReportRow]) -> std::io::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    writer.write_record(["status", "path"])?;
    for row in rows {
        match &row.reason {
            Some(reason) => writer.write_record([&row.status, &row.path, reason])?,
            None => writer.write_record([&row.status, &row.path])?,
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn writes_tab_delimited_rows() {
        let file = NamedTempFile::new().unwrap();
        let rows = vec![
            ReportRow::ok("a\\b.txt"),
            ReportRow::failed("c\\d.txt", "decode error"),
        ];
        write_tsv(file.path(), &rows).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.starts_with("status\tpath\n"));
        assert!(content.contains("ok\ta\\b.txt\n"));
        assert!(content.contains("failed\tc\\d.txt\tdecode error\n"));
    }
}

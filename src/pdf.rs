//! PDF helpers.

use std::collections::BTreeMap;

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

/// Do these bytes start like a PDF?
pub fn is_pdf(bytes: &[u8]) -> bool {
    infer::get(bytes).is_some_and(|kind| kind.mime_type() == "application/pdf")
}

/// Get the number of pages in a PDF file, using `pdfinfo` from poppler.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_pages(&output).with_context(|| {
        format!(
            "failed to get page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Pull the `Pages:` field out of `pdfinfo` output.
fn parse_pdfinfo_pages(output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key, value);
    }
    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no page count in pdfinfo output"))?;
    pages
        .parse::<usize>()
        .with_context(|| format!("invalid page count {:?}", pages))
}
